use std::io;

use thiserror::Error;

use crate::node::Addr;
use crate::protocol::Session;
use crate::socket::SocketId;

/// All errors that can occur during the use of may_service.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error.
    #[error("IO err: {0}")]
    Io(#[from] io::Error),
    /// Error in serializing message arguments.
    ///
    /// Typically this indicates a faulty implementation of `serde::Serialize`.
    #[error("serializing message err: {0}")]
    Serialize(String),
    /// Error in deserializing message arguments.
    ///
    /// Typically this indicates a faulty implementation of `serde::Deserialize`
    /// or a payload produced by a different codec.
    #[error("deserializing message err: {0}")]
    Deserialize(String),
    /// A protocol with the same name or id is already registered.
    #[error("protocol already registered: name={name} id={id}")]
    DuplicateProtocol {
        /// name of the rejected protocol
        name: String,
        /// id of the rejected protocol
        id: u8,
    },
    /// No protocol is registered under this name.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    /// A response arrived for a session nobody is waiting on.
    #[error("unknown session: {session} from {from}")]
    UnknownSession {
        /// the stale or duplicated session
        session: Session,
        /// sender of the response
        from: Addr,
    },
    /// A request arrived for a protocol without dispatch handler.
    #[error("unknown request ({proto}): session {session} from {from}")]
    UnknownRequest {
        /// protocol id of the request
        proto: u8,
        /// session of the request
        session: Session,
        /// sender of the request
        from: Addr,
    },
    /// The message could not be routed.
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    /// The call was answered with an error, or the callee went away.
    #[error("call failed: session {session} to {dest}")]
    CallFailed {
        /// session of the failed call
        session: Session,
        /// destination of the failed call
        dest: Addr,
    },
    /// The socket id is not (or no longer) known to the socket layer.
    #[error("invalid socket: {0}")]
    InvalidSocket(SocketId),
    /// Another read is already pending on this socket.
    #[error("socket {0} already has a pending read")]
    ReadPending(SocketId),
    /// The transport reported a connection failure.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The socket failed or was closed while in use.
    #[error("socket error: {0}")]
    Socket(String),
    /// The channel was closed by its owner.
    #[error("channel closed")]
    ChannelClosed,
    /// The peer answered, but reported the request as failed.
    ///
    /// Unlike other errors this does not invalidate the connection.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// An environment key can only be set once.
    #[error("environment key already set: {0}")]
    EnvExists(String),
    /// The server was unable to process the request.
    #[error("server status: {0}")]
    Status(String),
}

impl Error {
    /// errors that leave the underlying connection usable
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }
}

/// Outcome of a failed `send`, replacing sentinel return values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No live service has this address.
    #[error("no destination {0}")]
    NoDestination(Addr),
    /// The encoded payload exceeds the envelope limit.
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
    /// The destination stopped receiving before the message was queued.
    #[error("destination {0} closed")]
    Closed(Addr),
}
