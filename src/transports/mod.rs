//! Concrete `Transport` backends: the signed HTTP request channel and the
//! WebSocket streaming channel.
pub mod rest;
pub mod stream;

pub use rest::RestTransport;
pub use stream::StreamTransport;
