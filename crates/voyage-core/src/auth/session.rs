use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use super::credential::UserProfile;
use super::refresh::RefreshLatch;

const EVENT_CAPACITY: usize = 16;

/// Notifications for the navigation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    LoggedOut,
    /// The user must be sent back to the login surface.
    NavigateToLogin,
}

/// Result of gating a screen on authentication and role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    LoginRequired,
    Forbidden,
}

/// Observable, process-lifetime view of who is logged in.
///
/// New subscribers always receive the latest value. Only the auth client and the request
/// authenticator mutate it.
#[derive(Debug)]
pub struct SessionState {
    authenticated: watch::Sender<bool>,
    current_user: watch::Sender<Option<UserProfile>>,
    initialized: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
    refresh: RefreshLatch,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (authenticated, _) = watch::channel(false);
        let (current_user, _) = watch::channel(None);
        let (initialized, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            authenticated,
            current_user,
            initialized,
            events,
            refresh: RefreshLatch::new(),
        }
    }

    pub fn subscribe_authenticated(&self) -> watch::Receiver<bool> {
        self.authenticated.subscribe()
    }

    pub fn subscribe_user(&self) -> watch::Receiver<Option<UserProfile>> {
        self.current_user.subscribe()
    }

    pub fn subscribe_initialized(&self) -> watch::Receiver<bool> {
        self.initialized.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        *self.authenticated.borrow()
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.current_user.borrow().clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_refreshing()
    }

    pub(crate) fn refresh_latch(&self) -> &RefreshLatch {
        &self.refresh
    }

    /// Resolve once startup reconciliation has finished.
    pub async fn wait_for_initialization(&self) {
        let mut initialized = self.initialized.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = initialized.wait_for(|ready| *ready).await;
    }

    /// Authenticated status as known after initialization.
    pub async fn wait_for_auth(&self) -> bool {
        self.wait_for_initialization().await;
        self.is_authenticated()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.current_user
            .borrow()
            .as_ref()
            .is_some_and(|user| user.has_role(role))
    }

    pub fn is_admin(&self) -> bool {
        self.has_role("admin")
    }

    pub fn is_client(&self) -> bool {
        self.has_role("client")
    }

    /// Gate access on being logged in and, when `required_roles` is non-empty, on holding one
    /// of them.
    pub fn check_access(&self, required_roles: &[&str]) -> Access {
        if !self.is_authenticated() {
            return Access::LoginRequired;
        }
        if required_roles.is_empty() || required_roles.iter().any(|role| self.has_role(role)) {
            Access::Granted
        } else {
            Access::Forbidden
        }
    }

    pub(crate) fn set_user(&self, user: UserProfile) {
        debug!(email = %user.email, "current user updated");
        self.current_user.send_replace(Some(user));
    }

    /// Flip to authenticated. Refused while no current user is known.
    pub(crate) fn mark_authenticated(&self) -> bool {
        if self.current_user.borrow().is_none() {
            error!("refusing to mark session authenticated without a current user");
            return false;
        }
        if !self.authenticated.send_replace(true) {
            info!("session authenticated");
            let _ = self.events.send(SessionEvent::LoggedIn);
        }
        true
    }

    /// Drop identity. Status goes false before the user is removed.
    pub(crate) fn clear(&self) {
        let was_authenticated = self.authenticated.send_replace(false);
        self.current_user.send_replace(None);
        if was_authenticated {
            info!("session cleared");
            let _ = self.events.send(SessionEvent::LoggedOut);
        }
    }

    pub(crate) fn request_login(&self) {
        let _ = self.events.send(SessionEvent::NavigateToLogin);
    }

    /// Publish initialization; only the first call has any effect.
    pub(crate) fn mark_initialized(&self) -> bool {
        let first = self.initialized.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
        if first {
            info!(authenticated = self.is_authenticated(), "session initialized");
        }
        first
    }
}
