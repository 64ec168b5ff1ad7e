mod error;
mod stream_layer;
mod tls;

pub use error::TransportError;
pub use stream_layer::ServerPeerStream;
pub use stream_layer::StreamLayer;
pub use tls::TlsConfig;

#[cfg(test)]
pub(crate) use tls::tests::peer_tls;
