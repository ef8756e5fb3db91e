// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

pub mod connection;
pub mod tls;

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub use connection::{ConnectionEvent, LeapConnection};
pub use tls::TlsConnector;

/// Any duplex byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedStream>> + Send + 'a>>;

/// Opens a fresh stream to one controller.
///
/// A `LeapConnection` calls this on first use and again whenever the
/// previous stream has died, so implementations must be repeatable.
pub trait Connector: Send + Sync {
    fn connect(&self) -> ConnectFuture<'_>;

    /// Human-readable target for log lines.
    fn describe(&self) -> String;
}
