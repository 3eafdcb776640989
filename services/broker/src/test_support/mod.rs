// Shared helpers for unit tests in this crate.
pub mod env;
