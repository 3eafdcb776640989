//! TCP transport: length-prefixed frames carrying JSON envelopes, one reader
//! and one writer task per connection.
pub mod codec;
pub mod conn;

pub use conn::{ChannelTransport, serve};
