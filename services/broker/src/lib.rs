//! Broker service library crate.
//!
//! Exposes the service config and the TCP transport for use by the broker
//! binary and integration tests.
pub mod config;
pub mod transport;

#[cfg(test)]
mod test_support;
