//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for bearer tokens so callers do not
//! need a direct dependency on secrecy.

pub use secrecy::{ExposeSecret, SecretString};
