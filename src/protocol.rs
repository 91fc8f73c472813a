//! protocol registry
//!
//! a protocol is a named, numbered message kind with its own codec and an
//! optional dispatch handler. Both the name and the id are unique within a
//! registry; codecs are added by independent modules at runtime, so the
//! registry is open rather than a closed enum.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::codec::{BincodeCodec, Codec, RawCodec, TextCodec, Value};
use crate::node::Addr;
use crate::service::Service;
use crate::Error;

/// correlation id of a request and its eventual response
pub type Session = u32;

/// protocol id of responses, handled by the dispatcher itself
pub const PTYPE_RESPONSE: u8 = 0;
/// plain text messages
pub const PTYPE_TEXT: u8 = 1;
/// reserved for multicast
pub const PTYPE_MULTICAST: u8 = 2;
/// reserved for client connections
pub const PTYPE_CLIENT: u8 = 3;
/// reserved for system messages
pub const PTYPE_SYSTEM: u8 = 4;
/// reserved for cross node messages
pub const PTYPE_HARBOR: u8 = 5;
/// reserved for socket notifications
pub const PTYPE_SOCKET: u8 = 6;
/// error replies and peer-down notifications
pub const PTYPE_ERROR: u8 = 7;
/// reserved for debug consoles
pub const PTYPE_DEBUG: u8 = 9;
/// general argument list protocol
pub const PTYPE_LUA: u8 = 10;

/// name of the response protocol
pub const PTYPE_NAME_RESPONSE: &str = "response";
/// name of the text protocol
pub const PTYPE_NAME_TEXT: &str = "text";
/// name of the error protocol
pub const PTYPE_NAME_ERROR: &str = "error";
/// name of the general argument list protocol
pub const PTYPE_NAME_LUA: &str = "lua";

/// handler invoked for every inbound request of a protocol
pub type DispatchFn = Arc<dyn Fn(&Service, &Context, Vec<Value>) -> Result<(), Error> + Send + Sync>;

/// one registered protocol
pub struct Protocol {
    name: String,
    id: u8,
    codec: Box<dyn Codec>,
    dispatch: RwLock<Option<DispatchFn>>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl Protocol {
    /// create a protocol entry using the general purpose codec
    pub fn new(name: impl Into<String>, id: u8) -> Self {
        Protocol {
            name: name.into(),
            id,
            codec: Box::new(BincodeCodec),
            dispatch: RwLock::new(None),
        }
    }

    /// replace the codec
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// install the dispatch handler
    pub fn dispatch<F>(self, f: F) -> Self
    where
        F: Fn(&Service, &Context, Vec<Value>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.set_dispatch(Some(Arc::new(f)));
        self
    }

    /// protocol name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// protocol id
    pub fn id(&self) -> u8 {
        self.id
    }

    /// pack arguments with this protocol's codec
    pub fn pack(&self, args: &[Value]) -> Result<Bytes, Error> {
        self.codec.pack(args)
    }

    /// unpack a payload with this protocol's codec
    pub fn unpack(&self, msg: &[u8]) -> Result<Vec<Value>, Error> {
        self.codec.unpack(msg)
    }

    pub(crate) fn handler(&self) -> Option<DispatchFn> {
        match self.dispatch.read() {
            Ok(d) => d.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_dispatch(&self, f: Option<DispatchFn>) -> Option<DispatchFn> {
        let mut d = match self.dispatch.write() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *d, f)
    }
}

/// per message dispatch context, lives for exactly one inbound request
#[derive(Debug, Clone)]
pub struct Context {
    /// the protocol the request arrived on
    pub proto: Arc<Protocol>,
    /// session of the request, 0 for fire-and-forget
    pub session: Session,
    /// sender of the request
    pub source: Addr,
    /// unique id of this dispatch
    pub dispatch_id: u32,
}

/// lookup table by name and by id
#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<String, Arc<Protocol>>,
    by_id: HashMap<u8, Arc<Protocol>>,
}

impl Registry {
    /// registry holding the built-in protocols
    pub fn with_builtin() -> Self {
        let mut reg = Registry::default();
        let builtin = [
            Protocol::new(PTYPE_NAME_RESPONSE, PTYPE_RESPONSE).codec(RawCodec),
            Protocol::new(PTYPE_NAME_ERROR, PTYPE_ERROR).codec(RawCodec),
            Protocol::new(PTYPE_NAME_TEXT, PTYPE_TEXT).codec(TextCodec),
            Protocol::new(PTYPE_NAME_LUA, PTYPE_LUA),
        ];
        for p in builtin {
            // the builtin set is unique
            reg.register(p).ok();
        }
        reg
    }

    /// add a protocol, name and id must both be unused
    pub fn register(&mut self, p: Protocol) -> Result<Arc<Protocol>, Error> {
        if self.by_name.contains_key(p.name()) || self.by_id.contains_key(&p.id()) {
            return Err(Error::DuplicateProtocol {
                name: p.name,
                id: p.id,
            });
        }
        let p = Arc::new(p);
        self.by_name.insert(p.name.clone(), p.clone());
        self.by_id.insert(p.id, p.clone());
        Ok(p)
    }

    /// find by name
    pub fn get(&self, name: &str) -> Option<&Arc<Protocol>> {
        self.by_name.get(name)
    }

    /// find by id
    pub fn get_id(&self, id: u8) -> Option<&Arc<Protocol>> {
        self.by_id.get(&id)
    }

    /// number of registered protocols
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// true when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_protocols_are_present() {
        let reg = Registry::with_builtin();
        assert_eq!(reg.get(PTYPE_NAME_LUA).unwrap().id(), PTYPE_LUA);
        assert_eq!(reg.get_id(PTYPE_RESPONSE).unwrap().name(), PTYPE_NAME_RESPONSE);
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn name_and_id_are_unique() {
        let mut reg = Registry::with_builtin();
        let err = reg.register(Protocol::new("lua", 42)).unwrap_err();
        assert!(matches!(err, Error::DuplicateProtocol { id: 42, .. }));
        let err = reg.register(Protocol::new("other", PTYPE_LUA)).unwrap_err();
        assert!(matches!(err, Error::DuplicateProtocol { .. }));
        reg.register(Protocol::new("other", 42)).unwrap();
        assert_eq!(reg.get_id(42).unwrap().name(), "other");
    }

    #[test]
    fn dispatch_can_be_replaced() {
        let p = Protocol::new("x", 100).dispatch(|_, _, _| Ok(()));
        assert!(p.handler().is_some());
        let old = p.set_dispatch(None);
        assert!(old.is_some());
        assert!(p.handler().is_none());
    }
}
