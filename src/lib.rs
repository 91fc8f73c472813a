//! may_service is an actor-style service runtime for rust based on coroutines.
//!
//! A [`Node`] hosts many services. Each service owns a mailbox and a session
//! table; a coroutine that sends a request is suspended on its session and
//! resumed when the matching response arrives, so request/response code reads
//! like plain blocking code while thousands of calls are in flight.
//!
//! The crate has three parts:
//!
//! - [`service`]: protocols, sessions, call/ret, sleep/wakeup and the
//!   per-service dispatch loop.
//! - [`socket`]: pooled receive buffers and read requests that suspend the
//!   caller until enough bytes, a line or the close of the peer arrived.
//! - [`channel`]: a request channel over one socket that reconnects to the
//!   primary or a backup host and fans failures out to all waiting callers.
//!
//! Example usage:
//!
//! ```rust,no_run
//! use may_service::{Node, Value};
//!
//! let node = Node::new();
//! let echo = node
//!     .launch(Some("echo"), |svc| {
//!         svc.dispatch("lua", |svc, ctx, args| svc.ret(ctx, &args).map(|_| ()))?;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let client = node.launch(None, |_| Ok(())).unwrap();
//! let rsp = client.call(echo.addr(), "lua", &[Value::from("hi")]).unwrap();
//! assert_eq!(rsp[0].as_str(), Some("hi"));
//! ```

#[macro_use]
extern crate log;

pub extern crate bincode;
#[doc(hidden)]
pub extern crate may;
pub extern crate serde;

pub use may_service_derive::{derive_serde, service, Server};

pub use channel::{Address, Channel, ChannelConfig, ChannelIo, SessionReply};
pub use codec::{BincodeCodec, Codec, RawCodec, TextCodec, Value};
pub use envelope::Envelope;
pub use errors::{Error, SendError};
pub use node::{Addr, Node};
pub use protocol::{Context, Protocol, Session};
pub use service::{Responder, Service, Token};
pub use socket::{ReadResult, SocketId, SocketLayer};

/// must impl this trait for a service served through [`Service::serve`]
pub trait Server: Send + Sync + 'static {
    /// the real request should be deserialized from the input and the real
    /// response serialized into the return value. Application errors belong
    /// into the response, an `Err` fails the caller's session.
    fn service(&self, req: &[u8]) -> Result<Vec<u8>, Error>;
}

pub mod channel;
mod codec;
mod envelope;
/// Provides the error types
mod errors;
mod node;
pub mod protocol;
pub mod service;
pub mod socket;
