use std::sync::Arc;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::api::{ApiRequest, ApiResponse, Transport};

use super::credential::{Credential, UserProfile, DEFAULT_TOKEN_TYPE};
use super::{AuthError, CredentialStore, SessionState};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Account creation payload for `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub login: String,
    pub password: String,
    pub role: String,
    pub phone: String,
}

/// Acknowledgement returned by `POST /register`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    expires_in: i64,
}

/// Performs the session network calls and keeps the credential store and session state in
/// step with their outcome.
#[derive(Debug)]
pub struct AuthClient<T> {
    transport: T,
    store: Arc<CredentialStore>,
    session: Arc<SessionState>,
}

impl<T: Transport> AuthClient<T> {
    pub fn new(transport: T, store: Arc<CredentialStore>, session: Arc<SessionState>) -> Self {
        Self {
            transport,
            store,
            session,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// Exchange email and password for a credential and load the matching profile.
    ///
    /// The session only reports authenticated once the profile is in place. Any failure
    /// leaves no credential behind.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        validate_login(email, password)?;
        match self.login_inner(email, password).await {
            Ok(credential) => {
                info!(%email, "login succeeded");
                Ok(credential)
            }
            Err(err) => {
                warn!(%email, error = %err, "login failed");
                self.clear_local();
                Err(err)
            }
        }
    }

    async fn login_inner(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        let request = ApiRequest::post("/login").json(&LoginRequest { email, password })?;
        let response = self.transport.send(request).await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(AuthError::InvalidCredentials),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                return Err(AuthError::Validation(error_message(&response)))
            }
            _ => {}
        }
        let token: TokenResponse = response.error_for_status()?.json()?;
        let credential = self.store.set_credential(
            &token.access_token,
            token.token_type.as_deref().unwrap_or(DEFAULT_TOKEN_TYPE),
            token.expires_in,
        )?;

        self.get_current_user().await?;
        self.establish()?;
        Ok(credential)
    }

    /// Flip the session to authenticated, failing if the profile was cleared in the meantime.
    fn establish(&self) -> Result<(), AuthError> {
        if self.session.mark_authenticated() {
            Ok(())
        } else {
            Err(AuthError::Unauthenticated)
        }
    }

    /// Create an account. Does not log in.
    pub async fn register(&self, payload: &RegisterRequest) -> Result<RegisterResponse, AuthError> {
        validate_login(&payload.email, &payload.password)?;
        let request = ApiRequest::post("/register").json(payload)?;
        let response = self.transport.send(request).await?;
        match response.status() {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let message = error_message(&response);
                warn!(email = %payload.email, %message, "registration rejected");
                return Err(AuthError::Validation(message));
            }
            _ => {}
        }
        let response = response.error_for_status()?;
        if response.body.is_empty() {
            return Ok(RegisterResponse::default());
        }
        let ack: RegisterResponse = response.json()?;
        info!(email = %payload.email, "account registered");
        Ok(ack)
    }

    /// Fetch `GET /me` with the stored credential and publish the profile.
    ///
    /// A 401 ends the session locally (without navigation) and surfaces as
    /// [`AuthError::Unauthorized`].
    pub async fn get_current_user(&self) -> Result<UserProfile, AuthError> {
        let Some(header) = self.store.auth_header_value() else {
            warn!("no valid credential to fetch the current user");
            return Err(AuthError::Unauthenticated);
        };
        let request = ApiRequest::get("/me").with_authorization(&header)?;
        let response = self.transport.send(request).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("server rejected stored credential");
            if let Err(err) = self.logout(false).await {
                error!(error = %err, "failed to clear rejected credential");
            }
            return Err(AuthError::Unauthorized {
                body: response.text(),
            });
        }
        let user: UserProfile = response.error_for_status()?.json()?;
        self.store.set_user(&user)?;
        self.session.set_user(user.clone());
        debug!(email = %user.email, role = %user.role, "current user loaded");
        Ok(user)
    }

    /// Trade the stored token, expired or not, for a new one.
    ///
    /// Failure of any kind ends the session and is returned to the caller.
    pub async fn refresh_token(&self) -> Result<Credential, AuthError> {
        match self.exchange_token().await {
            Ok(credential) => {
                info!(expires_at = %credential.expires_at, "token refreshed");
                Ok(credential)
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed; logging out");
                if let Err(clear_err) = self.logout(true).await {
                    error!(error = %clear_err, "failed to clear credentials after refresh failure");
                }
                Err(err)
            }
        }
    }

    /// `POST /refresh` and store the result. Leaves the session alone on failure.
    pub(crate) async fn exchange_token(&self) -> Result<Credential, AuthError> {
        let token = self.store.token().ok_or(AuthError::Unauthenticated)?;
        let token_type = self
            .store
            .token_type()
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_owned());
        let request = ApiRequest::post("/refresh")
            .json(&Value::Object(Default::default()))?
            .with_authorization(&format!("{token_type} {token}"))?;
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(AuthError::RefreshRejected {
                status: response.status(),
                body: response.text(),
            });
        }
        let payload: TokenResponse = response.json()?;
        match payload.token_type.as_deref() {
            Some(token_type) => {
                self.store
                    .set_credential(&payload.access_token, token_type, payload.expires_in)
            }
            None => self
                .store
                .replace_token(&payload.access_token, payload.expires_in),
        }
    }

    /// Tell the server (best effort), then drop all local credential and session state.
    pub async fn logout(&self, navigate: bool) -> Result<(), AuthError> {
        if let Some(header) = self.store.auth_header_value() {
            self.notify_logout(&header).await;
        }
        self.end_session(navigate)
    }

    /// Local half of logout: wipe the store and session, optionally asking for the login screen.
    pub(crate) fn end_session(&self, navigate: bool) -> Result<(), AuthError> {
        let cleared = self.store.clear();
        self.session.clear();
        if navigate {
            self.session.request_login();
        }
        info!(navigate, "logged out");
        cleared
    }

    /// Server half of logout. Failures are only logged.
    pub(crate) async fn notify_logout(&self, header: &str) {
        match self.send_logout(header).await {
            Ok(response) if response.is_success() => debug!("server acknowledged logout"),
            Ok(response) => warn!(status = %response.status(), "server logout refused"),
            Err(err) => warn!(error = %err, "server logout failed"),
        }
    }

    async fn send_logout(&self, header: &str) -> Result<ApiResponse, AuthError> {
        let request = ApiRequest::post("/logout")
            .json(&Value::Object(Default::default()))?
            .with_authorization(header)?;
        self.transport.send(request).await
    }

    /// Startup reconciliation: validate a locally stored credential against the server, then
    /// publish the initialized signal.
    pub async fn initialize(&self) {
        if self.session.is_initialized() {
            return;
        }
        if !self.store.has_valid_credential() {
            debug!("no valid stored credential at startup");
            self.clear_local();
        } else {
            match self.get_current_user().await {
                Ok(user) => match self.establish() {
                    Ok(()) => info!(email = %user.email, "session restored"),
                    Err(err) => warn!(error = %err, "session cleared while restoring"),
                },
                Err(err) if err.is_transport() => {
                    warn!(error = %err, "could not reach server to validate stored credential");
                }
                Err(err) => {
                    warn!(error = %err, "stored credential rejected");
                    self.clear_local();
                }
            }
        }
        self.session.mark_initialized();
    }

    fn clear_local(&self) {
        if let Err(err) = self.store.clear() {
            error!(error = %err, "failed to clear credential store");
        }
        self.session.clear();
    }
}

fn validate_login(email: &str, password: &str) -> Result<(), AuthError> {
    let email = email.trim();
    let well_formed = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !well_formed {
        return Err(AuthError::Validation(format!("invalid email address '{email}'")));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Pull a human readable message out of an error body.
fn error_message(response: &ApiResponse) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    match response.json::<ErrorBody>() {
        Ok(ErrorBody {
            message: Some(message),
            ..
        })
        | Ok(ErrorBody {
            message: None,
            error: Some(message),
        }) => message,
        _ => response.text(),
    }
}
