//! Contracts consumed from transport implementations.
//!
//! Concrete byte streams (TCP, Unix-domain, WebSocket, raw-socket framing)
//! live outside this crate; the router drives them through [`Transport`] and
//! obtains new ones from a [`TransportAcceptor`].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use wamp_proto::CodecId;

/// Whether the handshake should complete normally or advertise refusal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmitMode {
    Accept,
    /// The connection limit is reached; finish the handshake by telling the
    /// peer it is being shed, without allocating a session.
    Shed,
}

/// Outcome of a transport's connection-specific handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A WAMP session was negotiated with the given codec.
    Wamp(CodecId),
    /// The connection was refused due to connection limits.
    Shedded,
    /// The peer requested something the transport refuses to serve.
    Rejected(String),
    /// The handshake itself failed.
    Failed(String),
    /// The transport already answered a non-WAMP request; nothing to serve.
    Responded,
}

/// Transport-level failure categories surfaced in ABORT details and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    Shedded,
    ReadTimeout,
    SilenceTimeout,
    LoiterTimeout,
    OverstayTimeout,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::Shedded => "shedded",
            TransportErrorKind::ReadTimeout => "read_timeout",
            TransportErrorKind::SilenceTimeout => "silence_timeout",
            TransportErrorKind::LoiterTimeout => "loiter_timeout",
            TransportErrorKind::OverstayTimeout => "overstay_timeout",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Eof,
    #[error("framing error: {0}")]
    Framing(String),
    #[error("i/o failure: {0}")]
    Io(String),
}

/// One accepted byte-stream connection.
#[async_trait]
pub trait Transport: Send {
    /// Peer description for logging (address, socket path, …).
    fn peer(&self) -> String;

    /// Completes the connection-specific handshake, negotiating a codec.
    async fn admit(&mut self, mode: AdmitMode) -> Result<AdmitOutcome, TransportError>;

    /// Sends one encoded message frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Receives one message frame.
    ///
    /// Must be cancel-safe: the session task races this against its
    /// outbound queue and control signals, and a dropped `receive` future
    /// must not lose or tear a frame.
    async fn receive(&mut self) -> Result<Bytes, TransportError>;

    /// Sends a final ABORT frame, then closes.
    async fn abort(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Flushes and closes gracefully after a GOODBYE exchange.
    async fn shutdown(&mut self) -> Result<(), TransportError>;

    /// Tears the connection down immediately.
    fn close(&mut self);
}

/// Source of newly accepted transports; one per server.
#[async_trait]
pub trait TransportAcceptor: Send {
    async fn accept(&mut self) -> Result<Box<dyn Transport>, TransportError>;

    /// Listener description for logging.
    fn local_endpoint(&self) -> String;
}
