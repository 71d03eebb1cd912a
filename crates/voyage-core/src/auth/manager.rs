use std::sync::Arc;

use crate::api::{HttpTransport, Transport};
use crate::config::ClientConfig;

use super::{AuthClient, AuthError, CredentialStore, RequestAuthenticator, SessionState};

/// Owns the credential store, session state, auth client and request authenticator for the
/// lifetime of the application.
pub struct AuthManager<T> {
    auth: Arc<AuthClient<T>>,
    api: RequestAuthenticator<T>,
}

impl AuthManager<HttpTransport> {
    /// Wire everything against the HTTP API described by `config`.
    pub fn connect(config: &ClientConfig, store: CredentialStore) -> Result<Self, AuthError> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(transport, store, config))
    }
}

impl<T: Transport> AuthManager<T> {
    pub fn new(transport: T, store: CredentialStore, config: &ClientConfig) -> Self {
        let auth = Arc::new(AuthClient::new(
            transport,
            Arc::new(store),
            Arc::new(SessionState::new()),
        ));
        let api = RequestAuthenticator::new(auth.clone(), config.refresh_timeout);
        Self { auth, api }
    }

    /// Reconcile any stored credential with the server. Resolves after `initialized` is set.
    pub async fn start(&self) {
        self.auth.initialize().await;
    }

    pub fn auth(&self) -> &AuthClient<T> {
        &self.auth
    }

    /// Authenticated request pipeline for application calls.
    pub fn api(&self) -> &RequestAuthenticator<T> {
        &self.api
    }

    pub fn session(&self) -> &Arc<SessionState> {
        self.auth.session()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.auth.store()
    }
}
