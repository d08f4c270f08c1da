//! Session credentials for the resilient network layer
//!
//! Holds the single "current" access/refresh credential pair and the
//! capability used to renew it:
//! 1. `credentials::Credential` is the token pair plus advisory expiry
//! 2. `credentials::CredentialStore` persists it (file-backed or in-memory)
//! 3. `token::RefreshTransport` exchanges a refresh token for a new pair
//!
//! Nothing in this crate decides *when* to refresh; that is the refresh
//! coordinator's job in `resilient-client`.

pub mod credentials;
pub mod error;
pub mod token;

pub use credentials::{
    Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore, now_millis,
};
pub use error::{Error, Result};
pub use token::{HttpRefreshTransport, RefreshTransport, TokenResponse};
