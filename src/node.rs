//! the process-wide router
//!
//! a `Node` owns the inbox of every live service, the name registry and the
//! write-once environment store. Messages travel between services as encoded
//! [`Envelope`] frames.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use may::sync::mpsc::{channel, Sender};
use may::{coroutine, go};
use may_waiter::Waiter;

use crate::envelope::Envelope;
use crate::service::Service;
use crate::socket::SocketLayer;
use crate::{Error, SendError};

/// address of a service inside one node, 0 is never assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Addr(pub u32);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

struct Mailbox {
    tx: Mutex<Sender<Bytes>>,
}

struct NodeInner {
    services: RwLock<HashMap<Addr, Mailbox>>,
    names: RwLock<HashMap<String, Addr>>,
    env: Mutex<HashMap<String, String>>,
    next_addr: AtomicU32,
    sockets: SocketLayer,
}

/// handle of the router, cheap to clone
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("services", &self.services().len())
            .finish()
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::new()
    }
}

impl Node {
    /// create an empty node
    pub fn new() -> Self {
        Node {
            inner: Arc::new(NodeInner {
                services: RwLock::new(HashMap::new()),
                names: RwLock::new(HashMap::new()),
                env: Mutex::new(HashMap::new()),
                next_addr: AtomicU32::new(1),
                sockets: SocketLayer::new(),
            }),
        }
    }

    /// the socket layer shared by every service of this node
    pub fn sockets(&self) -> &SocketLayer {
        &self.inner.sockets
    }

    /// start a new service
    ///
    /// `init` runs inside the service before any message is dispatched, and
    /// this returns once it finished. A failing `init` stops the service and
    /// its error is returned here.
    pub fn launch<F>(&self, name: Option<&str>, init: F) -> Result<Service, Error>
    where
        F: FnOnce(&Service) -> Result<(), Error> + Send + 'static,
    {
        let addr = Addr(self.inner.next_addr.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = channel();
        {
            let mut services = match self.inner.services.write() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            services.insert(addr, Mailbox { tx: Mutex::new(tx) });
        }
        if let Some(name) = name {
            self.register_name(name, addr);
        }

        let service = Service::new(self.clone(), addr);
        let ready = Arc::new(Waiter::new());
        let (s, r) = (service.clone(), ready.clone());
        let spawned = go!(
            coroutine::Builder::new().name(format!("service{addr}")),
            move || s.run(rx, init, r)
        );
        if let Err(e) = spawned {
            self.remove(addr);
            return Err(e.into());
        }

        ready.wait_rsp(None::<Duration>)??;
        info!("launch service {addr}");
        Ok(service)
    }

    /// route an envelope to `dest`
    pub fn send(&self, dest: Addr, env: Envelope) -> Result<(), SendError> {
        let frame = env.encode()?;
        let services = match self.inner.services.read() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mailbox = services.get(&dest).ok_or(SendError::NoDestination(dest))?;
        let tx = match mailbox.tx.lock() {
            Ok(tx) => tx,
            Err(poisoned) => poisoned.into_inner(),
        };
        tx.send(frame).map_err(|_| SendError::Closed(dest))
    }

    /// bind a name to an address, replacing any previous binding
    pub fn register_name(&self, name: &str, addr: Addr) {
        let mut names = match self.inner.names.write() {
            Ok(n) => n,
            Err(poisoned) => poisoned.into_inner(),
        };
        names.insert(name.to_owned(), addr);
    }

    /// look up a service by name
    pub fn query(&self, name: &str) -> Option<Addr> {
        let names = match self.inner.names.read() {
            Ok(n) => n,
            Err(poisoned) => poisoned.into_inner(),
        };
        names.get(name).copied()
    }

    /// stop a service, returns false if it is not alive
    ///
    /// the service finishes the messages already queued, answering requests
    /// among them with errors, and then runs its exit sweep.
    pub fn kill(&self, addr: Addr) -> bool {
        self.remove(addr)
    }

    /// addresses of every live service
    pub fn services(&self) -> Vec<Addr> {
        let services = match self.inner.services.read() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut v: Vec<Addr> = services.keys().copied().collect();
        v.sort();
        v
    }

    /// read an environment value, or `default` when unset
    pub fn get_env(&self, name: &str, default: Option<&str>) -> Option<String> {
        let env = match self.inner.env.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        env.get(name)
            .cloned()
            .or_else(|| default.map(str::to_owned))
    }

    /// set an environment value, each key can only be set once
    pub fn set_env(&self, name: &str, value: &str) -> Result<(), Error> {
        let mut env = match self.inner.env.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        if env.contains_key(name) {
            return Err(Error::EnvExists(name.to_owned()));
        }
        env.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    // drop the inbox, the service loop ends once it drained the queue
    pub(crate) fn remove(&self, addr: Addr) -> bool {
        let removed = {
            let mut services = match self.inner.services.write() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            services.remove(&addr).is_some()
        };
        if removed {
            let mut names = match self.inner.names.write() {
                Ok(n) => n,
                Err(poisoned) => poisoned.into_inner(),
            };
            names.retain(|_, a| *a != addr);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_display() {
        assert_eq!(Addr(10).to_string(), ":0000000a");
    }

    #[test]
    fn env_is_write_once() {
        let node = Node::new();
        assert_eq!(node.get_env("harbor", Some("0")).as_deref(), Some("0"));
        node.set_env("harbor", "1").unwrap();
        assert!(matches!(node.set_env("harbor", "2"), Err(Error::EnvExists(_))));
        assert_eq!(node.get_env("harbor", None).as_deref(), Some("1"));
    }

    #[test]
    fn send_to_unknown_address() {
        let node = Node::new();
        let env = Envelope {
            proto: 1,
            session: 0,
            source: Addr(1),
            payload: Bytes::new(),
        };
        assert_eq!(node.send(Addr(99), env), Err(SendError::NoDestination(Addr(99))));
    }

    #[test]
    fn names_follow_the_service() {
        let node = Node::new();
        let svc = node.launch(Some("echo"), |_| Ok(())).unwrap();
        assert_eq!(node.query("echo"), Some(svc.addr()));
        assert!(node.kill(svc.addr()));
        assert_eq!(node.query("echo"), None);
        assert!(!node.kill(svc.addr()));
    }

    #[test]
    fn failed_init_is_reported() {
        let node = Node::new();
        let ret = node.launch(None, |_| Err(Error::Status("boom".into())));
        assert!(matches!(ret, Err(Error::Status(_))));
        assert!(node.services().is_empty());
    }
}
