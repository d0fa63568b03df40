// Authentication module
// Credential storage, session lifecycle and single-flight token refresh

mod api;
mod credentials;
mod manager;
mod refresh;
mod session;
mod types;

pub use api::{
    field_messages, AuthApi, LOGIN_PATH, LOGOUT_PATH, PROFILE_PATH, REFRESH_PATH, REGISTER_PATH,
};
pub use credentials::{
    CredentialReader, CredentialStore, KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore,
};
pub use manager::AuthManager;
pub use refresh::RefreshCoordinator;
pub use session::{Session, SessionState, SessionStatus};
pub use types::{
    Credential, LoginRequest, RegisterRequest, User, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
