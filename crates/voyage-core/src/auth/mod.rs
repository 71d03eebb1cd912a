mod authenticator;
mod client;
mod clock;
mod credential;
mod credential_store;
mod error;
mod manager;
mod refresh;
mod session;

pub use authenticator::RequestAuthenticator;
pub use client::{AuthClient, RegisterRequest, RegisterResponse};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{Credential, UserProfile, DEFAULT_TOKEN_TYPE};
pub use credential_store::{
    AuthSnapshot, CredentialStore, FileStorage, MemoryStorage, StorageBackend,
};
pub use error::AuthError;
pub use manager::AuthManager;
pub use refresh::{RefreshLatch, RefreshSignal};
pub use session::{Access, SessionEvent, SessionState};
