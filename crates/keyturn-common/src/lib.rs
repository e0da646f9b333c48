//! Shared plumbing for the keyturn crates: wire error codes, the JSON error
//! body, atomic persistence helpers and data-directory paths.

pub mod api;
pub mod error;
pub mod http;
pub mod paths;
pub mod persist;
