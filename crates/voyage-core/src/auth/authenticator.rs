use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::{ApiRequest, ApiResponse, Transport};

use super::client::AuthClient;
use super::credential::DEFAULT_TOKEN_TYPE;
use super::refresh::{wait_for_signal, RefreshSignal, RefreshTicket};
use super::AuthError;

/// Request pipeline stage that attaches the stored credential and recovers from 401s with a
/// single shared refresh.
pub struct RequestAuthenticator<T> {
    auth: Arc<AuthClient<T>>,
    refresh_timeout: Duration,
}

impl<T> Clone for RequestAuthenticator<T> {
    fn clone(&self) -> Self {
        Self {
            auth: self.auth.clone(),
            refresh_timeout: self.refresh_timeout,
        }
    }
}

impl<T: Transport> RequestAuthenticator<T> {
    pub fn new(auth: Arc<AuthClient<T>>, refresh_timeout: Duration) -> Self {
        Self {
            auth,
            refresh_timeout,
        }
    }

    pub fn auth(&self) -> &Arc<AuthClient<T>> {
        &self.auth
    }

    /// Send `request`, replaying it at most once after a refresh if the server answers 401.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, AuthError> {
        if request.skips_auth() {
            return self.auth.transport().send(request).await;
        }

        let (prepared, sent_token) = self.attach(request.clone())?;
        let response = self.auth.transport().send(prepared).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(method = %request.method, path = %request.path, "request rejected with 401");
        let token = self.recover(sent_token.as_deref(), &response).await?;

        let replay = self.with_token(request.clone(), &token)?;
        debug!(method = %request.method, path = %request.path, "replaying request");
        let response = self.auth.transport().send(replay).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            error!(path = %request.path, "replayed request rejected; ending session");
            self.force_logout().await;
            return Err(AuthError::Unauthorized {
                body: response.text(),
            });
        }
        Ok(response)
    }

    /// `GET` and decode a JSON body, failing on non-success statuses.
    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, AuthError> {
        self.send(ApiRequest::get(path))
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, AuthError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send(ApiRequest::post(path).json(body)?)
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), AuthError> {
        self.send(ApiRequest::delete(path))
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn attach(&self, request: ApiRequest) -> Result<(ApiRequest, Option<String>), AuthError> {
        match self.auth.store().valid_credential() {
            Some(credential) => {
                let request = request.with_authorization(&credential.authorization_value())?;
                Ok((request, Some(credential.access_token)))
            }
            None => Ok((request, None)),
        }
    }

    fn with_token(&self, request: ApiRequest, token: &str) -> Result<ApiRequest, AuthError> {
        let token_type = self
            .auth
            .store()
            .token_type()
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_owned());
        request.with_authorization(&format!("{token_type} {token}"))
    }

    /// Obtain a token to replay with: from a refresh this call starts, one already running, or
    /// one that completed after the request went out.
    async fn recover(
        &self,
        sent_token: Option<&str>,
        rejected: &ApiResponse,
    ) -> Result<String, AuthError> {
        let rejection = || AuthError::Unauthorized {
            body: rejected.text(),
        };

        let store = self.auth.store();
        if store.token().is_none() {
            warn!("no token available to refresh; ending session");
            self.force_logout().await;
            return Err(rejection());
        }

        let ticket = self
            .auth
            .session()
            .refresh_latch()
            .enter(sent_token, || {
                store.valid_credential().map(|credential| credential.access_token)
            });
        let receiver = match ticket {
            RefreshTicket::Replay(token) => {
                debug!("credential already refreshed since request was sent");
                return Ok(token);
            }
            RefreshTicket::Follower(receiver) => {
                debug!("waiting for in-flight token refresh");
                receiver
            }
            RefreshTicket::Leader(receiver) => {
                self.spawn_refresh();
                receiver
            }
        };

        match wait_for_signal(receiver).await {
            RefreshSignal::Token(token) => Ok(token),
            RefreshSignal::Failed => Err(rejection()),
            RefreshSignal::TimedOut => Err(AuthError::RefreshTimeout),
        }
    }

    /// Run the refresh detached from the triggering request so that dropping the request
    /// cannot leave the latch closed.
    ///
    /// On failure waiters are released as soon as local state is gone. The server logout
    /// happens afterwards and does not count against the refresh timeout.
    fn spawn_refresh(&self) {
        let auth = self.auth.clone();
        let timeout = self.refresh_timeout;
        info!("starting token refresh");
        tokio::spawn(async move {
            let signal = match tokio::time::timeout(timeout, auth.exchange_token()).await {
                Ok(Ok(credential)) => {
                    info!(expires_at = %credential.expires_at, "token refreshed");
                    auth.session()
                        .refresh_latch()
                        .finish(RefreshSignal::Token(credential.access_token));
                    return;
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "token refresh failed; logging out");
                    RefreshSignal::Failed
                }
                Err(_) => {
                    error!(?timeout, "token refresh timed out; logging out");
                    RefreshSignal::TimedOut
                }
            };

            let header = auth.store().auth_header_value();
            if let Err(err) = auth.end_session(true) {
                error!(error = %err, "failed to clear credentials after refresh failure");
            }
            auth.session().refresh_latch().finish(signal);
            if let Some(header) = header {
                auth.notify_logout(&header).await;
            }
        });
    }

    async fn force_logout(&self) {
        if let Err(err) = self.auth.logout(true).await {
            error!(error = %err, "failed to clear credentials");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HttpTransport;
    use crate::auth::{CredentialStore, SessionEvent, SessionState};
    use crate::config::ClientConfig;
    use httpmock::prelude::*;
    use serde_json::{json, Value};
    use std::time::Instant;
    use tokio::task::JoinSet;
    use url::Url;

    fn authenticator(
        server: &MockServer,
        refresh_timeout: Duration,
    ) -> RequestAuthenticator<HttpTransport> {
        let config = ClientConfig::new(Url::parse(&server.url("/api")).unwrap());
        let auth = AuthClient::new(
            HttpTransport::new(&config).unwrap(),
            Arc::new(CredentialStore::in_memory()),
            Arc::new(SessionState::new()),
        );
        RequestAuthenticator::new(Arc::new(auth), refresh_timeout)
    }

    fn default_authenticator(server: &MockServer) -> RequestAuthenticator<HttpTransport> {
        authenticator(server, Duration::from_secs(5))
    }

    fn no_authorization(request: &HttpMockRequest) -> bool {
        request.headers.as_ref().map_or(true, |headers| {
            !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        })
    }

    #[tokio::test]
    async fn attaches_valid_credential() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/bookings")
                .header("authorization", "Bearer tok1");
            then.status(200).json_body(json!([{ "id": 1 }]));
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();
        let bookings: Vec<Value> = api.get_json("/bookings").await.unwrap();
        mock.assert();
        assert_eq!(bookings.len(), 1);
    }

    #[tokio::test]
    async fn uses_stored_token_type() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/destinations")
                .header("authorization", "Token tok1");
            then.status(200).json_body(json!([]));
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Token", 3600).unwrap();
        let _: Vec<Value> = api.get_json("/destinations").await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn passes_through_without_credential() {
        let server = MockServer::start();
        let with_header = server.mock(|when, then| {
            when.method(GET)
                .path("/api/destinations")
                .header_exists("authorization");
            then.status(500);
        });
        let without_header = server.mock(|when, then| {
            when.method(GET).path("/api/destinations");
            then.status(200).json_body(json!([]));
        });

        let api = default_authenticator(&server);
        let response = api.send(ApiRequest::get("/destinations")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        with_header.assert_hits(0);
        without_header.assert();
    }

    #[tokio::test]
    async fn exempt_requests_skip_credential_and_recovery() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/public");
            then.status(401);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(200);
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();
        let response = api
            .send(ApiRequest::get("/public").without_auth())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        mock.assert_hits(1);
        refresh.assert_hits(0);
        assert!(api.auth().store().has_valid_credential());
    }

    #[tokio::test]
    async fn non_401_errors_pass_through_unchanged() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/bookings/9");
            then.status(404).body("missing");
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();
        let response = api.send(ApiRequest::get("/bookings/9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.text(), "missing");
        assert!(api.auth().store().has_valid_credential());
    }

    #[tokio::test]
    async fn transport_failure_keeps_credential() {
        let config = ClientConfig::new(Url::parse("http://127.0.0.1:1/api").unwrap());
        let auth = AuthClient::new(
            HttpTransport::new(&config).unwrap(),
            Arc::new(CredentialStore::in_memory()),
            Arc::new(SessionState::new()),
        );
        let api = RequestAuthenticator::new(Arc::new(auth), Duration::from_secs(5));
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();
        let err = api.send(ApiRequest::get("/bookings")).await.unwrap_err();
        assert!(err.is_transport());
        assert!(api.auth().store().has_valid_credential());
    }

    #[tokio::test]
    async fn refreshes_expired_token_and_replays_once() {
        let server = MockServer::start();
        let unauthenticated = server.mock(|when, then| {
            when.method(GET)
                .path("/api/bookings")
                .matches(no_authorization);
            then.status(401);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST)
                .path("/api/refresh")
                .header("authorization", "Bearer tok1");
            then.status(200)
                .json_body(json!({ "access_token": "tok2", "expires_in": 3600 }));
        });
        let replay = server.mock(|when, then| {
            when.method(GET)
                .path("/api/bookings")
                .header("authorization", "Bearer tok2");
            then.status(200).json_body(json!([]));
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 0).unwrap();
        let response = api.send(ApiRequest::get("/bookings")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        unauthenticated.assert_hits(1);
        refresh.assert_hits(1);
        replay.assert_hits(1);
        assert!(!api.auth().session().is_refreshing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_401s_share_one_refresh() {
        let server = MockServer::start();
        let stale = server.mock(|when, then| {
            when.method(GET)
                .path_contains("/api/bookings/")
                .header("authorization", "Bearer tok1");
            then.status(401);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({ "access_token": "tok2", "expires_in": 3600 }));
        });
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path_contains("/api/bookings/")
                .header("authorization", "Bearer tok2");
            then.status(200).json_body(json!({ "ok": true }));
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();

        let mut requests = JoinSet::new();
        for id in 0..8 {
            let api = api.clone();
            requests.spawn(async move {
                api.send(ApiRequest::get(format!("/bookings/{id}")))
                    .await
            });
        }
        while let Some(result) = requests.join_next().await {
            let response = result.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        refresh.assert_hits(1);
        stale.assert_hits(8);
        fresh.assert_hits(8);
        assert_eq!(
            api.auth().store().auth_header_value().as_deref(),
            Some("Bearer tok2")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_requests_replayed_with_same_refreshed_token() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).matches(no_authorization);
            then.status(401);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(200)
                .delay(Duration::from_millis(100))
                .json_body(json!({ "access_token": "tok2", "expires_in": 3600 }));
        });
        let a = server.mock(|when, then| {
            when.method(GET)
                .path("/api/a")
                .header("authorization", "Bearer tok2");
            then.status(200);
        });
        let b = server.mock(|when, then| {
            when.method(GET)
                .path("/api/b")
                .header("authorization", "Bearer tok2");
            then.status(200);
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 0).unwrap();
        let (ra, rb) = tokio::join!(
            api.send(ApiRequest::get("/a")),
            api.send(ApiRequest::get("/b"))
        );
        assert_eq!(ra.unwrap().status(), StatusCode::OK);
        assert_eq!(rb.unwrap().status(), StatusCode::OK);
        refresh.assert_hits(1);
        a.assert_hits(1);
        b.assert_hits(1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refresh_failure_fails_all_waiters_and_logs_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path_contains("/api/bookings/");
            then.status(401).body("expired");
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(401).delay(Duration::from_millis(150));
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();
        let mut events = api.auth().session().events();

        let mut requests = JoinSet::new();
        for id in 0..4 {
            let api = api.clone();
            requests.spawn(async move {
                api.send(ApiRequest::get(format!("/bookings/{id}")))
                    .await
            });
        }
        while let Some(result) = requests.join_next().await {
            let err = result.unwrap().unwrap_err();
            assert!(matches!(err, AuthError::Unauthorized { .. }), "{err:?}");
        }

        refresh.assert_hits(1);
        let session = api.auth().session();
        assert!(!session.is_authenticated());
        assert!(session.current_user().is_none());
        assert!(!api.auth().store().has_valid_credential());
        assert!(api.auth().store().token().is_none());
        assert!(!session.is_refreshing());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::NavigateToLogin);
    }

    #[tokio::test]
    async fn second_401_after_refresh_is_fatal() {
        let server = MockServer::start();
        let bookings = server.mock(|when, then| {
            when.method(GET).path("/api/bookings");
            then.status(401);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(200)
                .json_body(json!({ "access_token": "tok2", "expires_in": 3600 }));
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();
        let err = api.send(ApiRequest::get("/bookings")).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized { .. }));
        bookings.assert_hits(2);
        refresh.assert_hits(1);
        assert!(api.auth().store().token().is_none());
    }

    #[tokio::test]
    async fn no_token_to_refresh_logs_out_immediately() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/bookings");
            then.status(401);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(200);
        });

        let api = default_authenticator(&server);
        let mut events = api.auth().session().events();
        let err = api.send(ApiRequest::get("/bookings")).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized { .. }));
        refresh.assert_hits(0);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::NavigateToLogin);
    }

    #[tokio::test]
    async fn stuck_refresh_times_out_and_logs_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/bookings");
            then.status(401);
        });
        server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(200)
                .delay(Duration::from_secs(5))
                .json_body(json!({ "access_token": "tok2", "expires_in": 3600 }));
        });
        let logout = server.mock(|when, then| {
            when.method(POST)
                .path("/api/logout")
                .header("authorization", "Bearer tok1");
            then.status(204).delay(Duration::from_secs(3));
        });

        let api = authenticator(&server, Duration::from_millis(100));
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();
        let mut events = api.auth().session().events();

        let started = Instant::now();
        let err = api.send(ApiRequest::get("/bookings")).await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshTimeout), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(api.auth().store().token().is_none());
        assert!(!api.auth().session().is_refreshing());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::NavigateToLogin);

        // The server is still told, after the waiters were released.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        logout.assert_hits(1);
    }

    #[tokio::test]
    async fn unrepresentable_refresh_lifetime_fails_and_releases_latch() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/bookings");
            then.status(401);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(200)
                .json_body(json!({ "access_token": "tok2", "expires_in": i64::MAX }));
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok1", "Bearer", 3600).unwrap();
        let err = api.send(ApiRequest::get("/bookings")).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized { .. }), "{err:?}");
        refresh.assert_hits(1);
        assert!(!api.auth().session().is_refreshing());
        assert!(api.auth().store().token().is_none());
    }

    #[tokio::test]
    async fn request_after_completed_refresh_replays_without_refreshing() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/bookings")
                .header("authorization", "Bearer tok1");
            then.status(401);
        });
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path("/api/bookings")
                .header("authorization", "Bearer tok2");
            then.status(200);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/refresh");
            then.status(200);
        });

        let api = default_authenticator(&server);
        api.auth().store().set_credential("tok2", "Bearer", 3600).unwrap();
        let token = api
            .recover(Some("tok1"), &ApiResponse::new(StatusCode::UNAUTHORIZED, Vec::new()))
            .await
            .unwrap();
        assert_eq!(token, "tok2");
        let response = api.send(ApiRequest::get("/bookings")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        fresh.assert_hits(1);
        refresh.assert_hits(0);
    }
}
