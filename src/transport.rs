//! Transport abstraction for protocol traffic.

use tokio::io::{AsyncRead, AsyncWrite};

/// A reliable, ordered byte stream carrying frames in both directions.
///
/// Anything tokio can read and write qualifies: TCP and Unix streams,
/// `tokio::io::duplex` pipes, virtio channels wrapped by the caller.
pub trait Transport: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + 'static {}
