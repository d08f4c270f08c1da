//! Common types shared by the resilient network layer crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
