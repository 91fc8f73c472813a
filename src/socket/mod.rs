//! socket buffering and suspension layer
//!
//! every socket has an owned [`Buffer`] fed by the transport through
//! [`SocketLayer::deliver`], and at most one pending read. A read that can't
//! be satisfied from the buffer records what it needs and parks; the
//! delivery that satisfies it clears the record and wakes the reader.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use may::go;
use may::net::{TcpListener, TcpStream, UdpSocket};
use may_waiter::Waiter;

use crate::Error;

mod buffer;
mod pool;
mod queued_writer;
mod stream_ext;
mod transport;

pub use buffer::Buffer;
pub use pool::NodePool;
pub use stream_ext::StreamExt;
use transport::{StreamTransport, Task, Transport, UdpTransport};

/// socket handle inside one layer, 0 is never assigned
pub type SocketId = u32;
/// called with every connection accepted by a listener
pub type AcceptFn = Arc<dyn Fn(SocketId, SocketAddr) + Send + Sync>;
/// called with every datagram received by an udp socket
pub type UdpFn = Arc<dyn Fn(SocketId, &[u8], SocketAddr) + Send + Sync>;
/// called when a write flushed more than the warning threshold
pub type WarningFn = Arc<dyn Fn(SocketId, usize) + Send + Sync>;

const DEFAULT_SEND_WARNING: usize = 1024 * 1024;

/// what a transport reports about a socket
#[derive(Debug)]
pub enum SocketEvent<'a> {
    /// the connect attempt succeeded
    Connect,
    /// bytes received
    Data(&'a [u8]),
    /// the peer closed the connection
    Close,
    /// connect or transfer failure
    Error(String),
    /// a listener accepted a new, not yet started socket
    Accept(SocketId, SocketAddr),
    /// a datagram received
    Udp(&'a [u8], SocketAddr),
    /// this many bytes went out in one batch
    Warning(usize),
}

/// outcome of a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// the request was satisfied
    Data(Bytes),
    /// the socket closed first, carries whatever was left
    Closed(Bytes),
}

impl ReadResult {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReadResult::Closed(_))
    }

    /// the bytes, regardless of the outcome
    pub fn into_bytes(self) -> Bytes {
        match self {
            ReadResult::Data(b) | ReadResult::Closed(b) => b,
        }
    }

    /// the bytes of a satisfied read
    pub fn ok(self) -> Option<Bytes> {
        match self {
            ReadResult::Data(b) => Some(b),
            ReadResult::Closed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Tcp,
    Udp,
    Listener,
}

#[derive(Debug)]
enum ReadRequired {
    Any,
    Bytes(usize),
    Line(Vec<u8>),
    Close,
}

struct Socket {
    kind: Kind,
    connected: bool,
    connecting: bool,
    // the connect attempt succeeded, even if the peer left right after
    opened: bool,
    error: Option<String>,
    read_required: Option<ReadRequired>,
    suspend: Option<Arc<Waiter<()>>>,
    closing: Vec<Arc<Waiter<()>>>,
    buffer: Buffer,
    limit: Option<usize>,
    transport: Option<Arc<dyn Transport>>,
    listener: Option<TcpListener>,
    task: Option<Task>,
    connector: Option<Task>,
    on_accept: Option<AcceptFn>,
    on_udp: Option<UdpFn>,
    on_warning: Option<WarningFn>,
    locked: bool,
    lock_waiters: VecDeque<Arc<Waiter<bool>>>,
}

impl Socket {
    fn new(kind: Kind, pool: Arc<NodePool>) -> Self {
        Socket {
            kind,
            connected: false,
            connecting: false,
            opened: false,
            error: None,
            read_required: None,
            suspend: None,
            closing: Vec::new(),
            buffer: Buffer::new(pool),
            limit: None,
            transport: None,
            listener: None,
            task: None,
            connector: None,
            on_accept: None,
            on_udp: None,
            on_warning: None,
            locked: false,
            lock_waiters: VecDeque::new(),
        }
    }

    fn satisfied(&mut self) -> bool {
        match &self.read_required {
            None | Some(ReadRequired::Close) => false,
            Some(ReadRequired::Any) => !self.buffer.is_empty(),
            Some(ReadRequired::Bytes(n)) => self.buffer.len() >= *n,
            Some(ReadRequired::Line(sep)) => self.buffer.find(sep).is_some(),
        }
    }

    fn wake_reader(&mut self, wakes: &mut Vec<Arc<Waiter<()>>>) {
        self.read_required = None;
        wakes.extend(self.suspend.take());
    }

    fn wake_all(&mut self, wakes: &mut Vec<Arc<Waiter<()>>>) {
        self.wake_reader(wakes);
        wakes.append(&mut self.closing);
    }

    fn spawn_reader(&mut self, layer: Weak<LayerInner>, id: SocketId) -> Result<(), Error> {
        if self.task.is_some() {
            return Ok(());
        }
        let transport = self.transport.clone().ok_or(Error::InvalidSocket(id))?;
        self.task = Some(transport.spawn_reader(layer, id)?);
        Ok(())
    }
}

#[derive(Default)]
struct Slots {
    sockets: HashMap<SocketId, Socket>,
    next_id: SocketId,
}

impl Slots {
    fn get(&mut self, id: SocketId) -> Result<&mut Socket, Error> {
        self.sockets.get_mut(&id).ok_or(Error::InvalidSocket(id))
    }
}

pub(crate) struct LayerInner {
    slots: Mutex<Slots>,
    pool: Arc<NodePool>,
    send_warning: AtomicUsize,
}

/// the socket table, cheap to clone
#[derive(Clone)]
pub struct SocketLayer {
    inner: Arc<LayerInner>,
}

impl fmt::Debug for SocketLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketLayer")
            .field("sockets", &self.slots().sockets.len())
            .finish()
    }
}

impl Default for SocketLayer {
    fn default() -> Self {
        SocketLayer::new()
    }
}

/// split `host:port` or `[ipv6]:port`
pub fn parse_addr(addr: &str) -> Result<(String, u16), Error> {
    let bad = || Error::Connect(format!("invalid address {addr}"));
    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => {
            let (host, port) = rest.split_once("]:").ok_or_else(bad)?;
            (host, port)
        }
        None => addr.rsplit_once(':').ok_or_else(bad)?,
    };
    let port = port.parse().map_err(|_| bad())?;
    Ok((host.to_owned(), port))
}

impl SocketLayer {
    /// a layer drawing buffer nodes from the process wide pool
    pub fn new() -> Self {
        SocketLayer::with_pool(NodePool::global())
    }

    pub fn with_pool(pool: Arc<NodePool>) -> Self {
        SocketLayer {
            inner: Arc::new(LayerInner {
                slots: Mutex::new(Slots::default()),
                pool,
                send_warning: AtomicUsize::new(DEFAULT_SEND_WARNING),
            }),
        }
    }

    pub(crate) fn upgrade(weak: &Weak<LayerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| SocketLayer { inner })
    }

    fn weak(&self) -> Weak<LayerInner> {
        Arc::downgrade(&self.inner)
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        match self.inner.slots.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// the node pool backing every buffer of this layer
    pub fn pool(&self) -> &Arc<NodePool> {
        &self.inner.pool
    }

    /// flushed batches above `bytes` trigger the socket's warning
    pub fn set_send_warning(&self, bytes: usize) {
        self.inner.send_warning.store(bytes, Ordering::Relaxed);
    }

    fn insert(&self, f: impl FnOnce(&mut Socket)) -> SocketId {
        let mut slots = self.slots();
        loop {
            slots.next_id = slots.next_id.wrapping_add(1);
            let id = slots.next_id;
            if id != 0 && !slots.sockets.contains_key(&id) {
                let mut s = Socket::new(Kind::Tcp, self.inner.pool.clone());
                f(&mut s);
                slots.sockets.insert(id, s);
                return id;
            }
        }
    }

    // give the socket its stream, reading starts separately
    fn attach<S: StreamExt>(&self, id: SocketId, stream: S) -> Result<(), Error> {
        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::new(stream)?);
        let mut slots = self.slots();
        match slots.sockets.get_mut(&id) {
            Some(s) => {
                s.transport = Some(transport);
                Ok(())
            }
            None => {
                transport.shutdown();
                Err(Error::InvalidSocket(id))
            }
        }
    }

    // register an accepted stream, it stays silent until `start`
    pub(crate) fn adopt<S: StreamExt>(&self, stream: S) -> Result<SocketId, Error> {
        let id = self.insert(|_| {});
        if let Err(e) = self.attach(id, stream) {
            self.slots().sockets.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// connect to `host:port`, suspends until the connection is established
    ///
    /// the socket counts as connected before its first byte is read, so a
    /// peer that greets and hangs up right away still yields an open socket
    /// with the greeting buffered.
    pub fn open(&self, host: &str, port: u16) -> Result<SocketId, Error> {
        let waiter = Arc::new(Waiter::new());
        let id = self.insert(|s| {
            s.connecting = true;
            s.suspend = Some(waiter.clone());
        });

        let layer = self.weak();
        let host = host.to_owned();
        let spawned = Task::spawn(format!("connect{id}"), move || {
            let ret = TcpStream::connect((host.as_str(), port));
            let layer = match SocketLayer::upgrade(&layer) {
                Some(l) => l,
                None => return,
            };
            let ret = ret
                .map_err(Error::from)
                .and_then(|stream| layer.attach(id, stream));
            if let Err(e) = ret {
                layer.deliver(id, SocketEvent::Error(e.to_string()));
                return;
            }
            if layer.deliver(id, SocketEvent::Connect) {
                if let Err(e) = layer.start_reader(id) {
                    layer.deliver(id, SocketEvent::Error(e.to_string()));
                }
            }
        });
        match spawned {
            Ok(task) => {
                if let Some(s) = self.slots().sockets.get_mut(&id) {
                    // a quick attempt may be over already
                    if s.connecting {
                        s.connector = Some(task);
                    }
                }
            }
            Err(e) => {
                self.slots().sockets.remove(&id);
                return Err(e.into());
            }
        }

        let ret = waiter.wait_rsp(None::<Duration>);
        let err = {
            let slots = self.slots();
            match slots.sockets.get(&id) {
                Some(s) if ret.is_ok() && s.opened => return Ok(id),
                Some(s) => s.error.clone(),
                None => None,
            }
        };
        self.close(id);
        ret?;
        Err(Error::Connect(
            err.unwrap_or_else(|| "closed while connecting".to_owned()),
        ))
    }

    /// connect to an address given as `host:port` or `[ipv6]:port`
    pub fn open_addr(&self, addr: &str) -> Result<SocketId, Error> {
        let (host, port) = parse_addr(addr)?;
        self.open(&host, port)
    }

    /// bind a listener, accepting starts with `start`
    pub fn listen(&self, host: &str, port: u16) -> Result<SocketId, Error> {
        let listener = TcpListener::bind((host, port))?;
        Ok(self.insert(|s| {
            s.kind = Kind::Listener;
            s.listener = Some(listener);
        }))
    }

    /// local address of a listener or udp socket
    pub fn local_addr(&self, id: SocketId) -> Result<SocketAddr, Error> {
        let mut slots = self.slots();
        let s = slots.get(id)?;
        match (&s.listener, &s.transport) {
            (Some(l), _) => Ok(l.local_addr()?),
            (None, Some(t)) => Ok(t.local_addr()?),
            (None, None) => Err(Error::InvalidSocket(id)),
        }
    }

    /// start delivery on a socket
    ///
    /// for a listener this runs the accept loop, every accepted socket is
    /// handed to `on_accept` and stays silent until started itself. For an
    /// accepted or abandoned stream it resumes reading.
    pub fn start(&self, id: SocketId, on_accept: Option<AcceptFn>) -> Result<(), Error> {
        let mut slots = self.slots();
        let s = slots.get(id)?;
        match s.kind {
            Kind::Listener => {
                let listener = match s.listener.as_ref() {
                    Some(l) if s.task.is_none() => l.try_clone()?,
                    _ => return Ok(()),
                };
                s.on_accept = on_accept;
                s.connected = true;
                let task = transport::spawn_acceptor(listener, self.weak(), id)?;
                s.task = Some(task);
                Ok(())
            }
            Kind::Tcp => {
                if s.task.is_none() && s.transport.is_some() {
                    s.connected = true;
                }
                s.spawn_reader(self.weak(), id)
            }
            Kind::Udp => Ok(()),
        }
    }

    // resume reading on a socket the connect coroutine just opened
    fn start_reader(&self, id: SocketId) -> Result<(), Error> {
        let mut slots = self.slots();
        let s = slots.get(id)?;
        if !s.connected {
            return Ok(());
        }
        s.spawn_reader(self.weak(), id)
    }

    /// adopt a connected stream, reading starts right away
    pub fn bind<S: StreamExt>(&self, stream: S) -> Result<SocketId, Error> {
        let id = self.adopt(stream)?;
        self.start(id, None)?;
        Ok(id)
    }

    fn wait_read<T>(
        &self,
        id: SocketId,
        required: ReadRequired,
        mut ready: impl FnMut(&mut Socket) -> Option<T>,
        closed: impl FnOnce(Option<&mut Socket>) -> T,
    ) -> Result<T, Error> {
        let waiter = {
            let mut slots = self.slots();
            let s = slots.get(id)?;
            if s.read_required.is_some() {
                return Err(Error::ReadPending(id));
            }
            if let Some(v) = ready(s) {
                return Ok(v);
            }
            if !s.connected {
                return Ok(closed(Some(s)));
            }
            let waiter = Arc::new(Waiter::new());
            s.read_required = Some(required);
            s.suspend = Some(waiter.clone());
            waiter
        };

        let ret = waiter.wait_rsp(None::<Duration>);
        let mut slots = self.slots();
        let s = slots.sockets.get_mut(&id);
        if let Err(e) = ret {
            if let Some(s) = s {
                s.read_required = None;
                s.suspend = None;
            }
            return Err(e.into());
        }
        match s {
            Some(s) => Ok(ready(s).unwrap_or_else(|| closed(Some(s)))),
            None => Ok(closed(None)),
        }
    }

    /// read `n` bytes, or whatever is buffered when `n` is `None`
    ///
    /// suspends until enough bytes arrived. A socket that closes first
    /// yields `ReadResult::Closed` with the remaining bytes.
    pub fn read(&self, id: SocketId, n: Option<usize>) -> Result<ReadResult, Error> {
        let rest = |s: Option<&mut Socket>| {
            ReadResult::Closed(s.map(|s| s.buffer.read_all()).unwrap_or_default())
        };
        match n {
            None => self.wait_read(
                id,
                ReadRequired::Any,
                |s| (!s.buffer.is_empty()).then(|| ReadResult::Data(s.buffer.read_all())),
                rest,
            ),
            Some(n) => self.wait_read(
                id,
                ReadRequired::Bytes(n),
                |s| s.buffer.pop(n).map(ReadResult::Data),
                rest,
            ),
        }
    }

    /// read up to `sep`, the separator is consumed but not returned
    pub fn readline(&self, id: SocketId, sep: &[u8]) -> Result<ReadResult, Error> {
        self.wait_read(
            id,
            ReadRequired::Line(sep.to_vec()),
            |s| {
                let pos = s.buffer.find(sep)?;
                let line = s.buffer.pop(pos)?;
                s.buffer.discard(sep.len());
                Some(ReadResult::Data(line))
            },
            |s| ReadResult::Closed(s.map(|s| s.buffer.read_all()).unwrap_or_default()),
        )
    }

    /// everything received until the socket closes
    pub fn readall(&self, id: SocketId) -> Result<Bytes, Error> {
        self.wait_read(
            id,
            ReadRequired::Close,
            |s| (!s.connected).then(|| s.buffer.read_all()),
            |s| s.map(|s| s.buffer.read_all()).unwrap_or_default(),
        )
    }

    /// suspend until new data or a close, returns whether still connected
    pub fn block(&self, id: SocketId) -> Result<bool, Error> {
        let mut first = true;
        self.wait_read(
            id,
            ReadRequired::Any,
            |s| {
                if std::mem::take(&mut first) {
                    None
                } else {
                    Some(s.connected)
                }
            },
            |s| s.map(|s| s.connected).unwrap_or(false),
        )
    }

    /// queue data for sending
    pub fn write(&self, id: SocketId, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        let transport = {
            let mut slots = self.slots();
            let s = slots.get(id)?;
            if !s.connected && s.kind != Kind::Udp {
                return Err(Error::Socket(format!("socket {id} is disconnected")));
            }
            s.transport.clone().ok_or(Error::InvalidSocket(id))?
        };
        let flushed = transport
            .write(data.into())
            .map_err(|e| Error::Socket(e.to_string()))?;
        if flushed > self.inner.send_warning.load(Ordering::Relaxed) {
            self.deliver(id, SocketEvent::Warning(flushed));
        }
        Ok(())
    }

    /// low priority write, shares the socket's write queue
    pub fn lwrite(&self, id: SocketId, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.write(id, data)
    }

    /// close and forget the socket
    ///
    /// a socket that is still connecting has its attempt aborted first. A
    /// pending reader gets `ReadResult::Closed`.
    pub fn close(&self, id: SocketId) {
        let (connector, waiter) = {
            let mut slots = self.slots();
            match slots.sockets.get_mut(&id) {
                Some(s) if s.connecting => match s.connector.take() {
                    Some(task) => (Some(task), None),
                    // the attempt isn't registered yet, wait for its outcome
                    None => {
                        let w = Arc::new(Waiter::new());
                        s.closing.push(w.clone());
                        (None, Some(w))
                    }
                },
                Some(_) => (None, None),
                None => return,
            }
        };
        if let Some(task) = connector {
            task.abort();
        }
        if let Some(w) = waiter {
            w.wait_rsp(None::<Duration>).ok();
        }

        let s = self.slots().sockets.remove(&id);
        if let Some(mut s) = s {
            if let Some(t) = &s.transport {
                t.shutdown();
            }
            if let Some(task) = s.task.take() {
                task.stop();
            }
            let mut wakes = Vec::new();
            s.wake_all(&mut wakes);
            wakes.into_iter().for_each(|w| w.set_rsp(()));
            s.lock_waiters.drain(..).for_each(|w| w.set_rsp(false));
            debug!("socket: close {id}");
        }
    }

    /// force the connection down, the socket stays until `close`
    pub fn shutdown(&self, id: SocketId) {
        let mut slots = self.slots();
        if let Some(s) = slots.sockets.get_mut(&id) {
            if let Some(t) = &s.transport {
                t.shutdown();
            }
            if s.kind == Kind::Listener {
                s.connected = false;
                if let Some(task) = s.task.take() {
                    task.stop();
                }
            }
        }
    }

    /// stop reading and drop the buffered bytes, `start` resumes the socket
    pub fn abandon(&self, id: SocketId) {
        let mut wakes = Vec::new();
        let task = {
            let mut slots = self.slots();
            match slots.sockets.get_mut(&id) {
                Some(s) => {
                    s.buffer.clear();
                    s.connected = false;
                    s.wake_reader(&mut wakes);
                    s.task.take()
                }
                None => None,
            }
        };
        if let Some(task) = task {
            task.stop();
        }
        wakes.into_iter().for_each(|w| w.set_rsp(()));
    }

    /// true if the id names no socket
    pub fn invalid(&self, id: SocketId) -> bool {
        !self.slots().sockets.contains_key(&id)
    }

    /// true for a known socket that is neither connected nor connecting
    pub fn disconnected(&self, id: SocketId) -> bool {
        match self.slots().sockets.get(&id) {
            Some(s) => !(s.connected || s.connecting),
            None => false,
        }
    }

    /// force close the socket once more than `limit` bytes are unread
    pub fn limit(&self, id: SocketId, limit: usize) -> Result<(), Error> {
        self.slots().get(id)?.limit = Some(limit);
        Ok(())
    }

    /// replace the send warning callback
    pub fn warning<F>(&self, id: SocketId, f: F) -> Result<(), Error>
    where
        F: Fn(SocketId, usize) + Send + Sync + 'static,
    {
        self.slots().get(id)?.on_warning = Some(Arc::new(f));
        Ok(())
    }

    /// disable nagle
    pub fn nodelay(&self, id: SocketId) -> Result<(), Error> {
        let transport = self.slots().get(id)?.transport.clone();
        match transport {
            Some(t) => Ok(t.set_nodelay(true)?),
            None => Err(Error::InvalidSocket(id)),
        }
    }

    /// exclusive access among cooperating callers, granted in FIFO order
    pub fn lock(&self, id: SocketId) -> Result<(), Error> {
        let waiter = {
            let mut slots = self.slots();
            let s = slots.get(id)?;
            if !s.locked {
                s.locked = true;
                return Ok(());
            }
            let w = Arc::new(Waiter::new());
            s.lock_waiters.push_back(w.clone());
            w
        };
        if waiter.wait_rsp(None::<Duration>)? {
            Ok(())
        } else {
            Err(Error::InvalidSocket(id))
        }
    }

    /// hand the lock to the next waiter
    pub fn unlock(&self, id: SocketId) {
        let next = {
            let mut slots = self.slots();
            let s = match slots.sockets.get_mut(&id) {
                Some(s) => s,
                None => return,
            };
            let next = s.lock_waiters.pop_front();
            if next.is_none() {
                s.locked = false;
            }
            next
        };
        if let Some(w) = next {
            w.set_rsp(true);
        }
    }

    /// bind an udp socket, every datagram is handed to `on_recv`
    pub fn udp<F>(&self, host: &str, port: u16, on_recv: F) -> Result<SocketId, Error>
    where
        F: Fn(SocketId, &[u8], SocketAddr) + Send + Sync + 'static,
    {
        let sock = UdpSocket::bind((host, port))?;
        let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new(sock));
        let id = self.insert(|s| {
            s.kind = Kind::Udp;
            s.connected = true;
            s.on_udp = Some(Arc::new(on_recv));
            s.transport = Some(transport.clone());
        });
        match transport.spawn_reader(self.weak(), id) {
            Ok(task) => {
                if let Ok(s) = self.slots().get(id) {
                    s.task = Some(task);
                }
                Ok(id)
            }
            Err(e) => {
                self.slots().sockets.remove(&id);
                Err(e.into())
            }
        }
    }

    /// set the default peer of an udp socket, used by `write`
    pub fn udp_connect(&self, id: SocketId, host: &str, port: u16) -> Result<(), Error> {
        let peer = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Connect(format!("can't resolve {host}")))?;
        let transport = self.slots().get(id)?.transport.clone();
        match transport {
            Some(t) => Ok(t.connect_peer(peer)?),
            None => Err(Error::InvalidSocket(id)),
        }
    }

    /// send one datagram
    pub fn sendto(&self, id: SocketId, peer: SocketAddr, data: &[u8]) -> Result<(), Error> {
        let transport = self.slots().get(id)?.transport.clone();
        match transport {
            Some(t) => Ok(t.send_to(data, peer)?),
            None => Err(Error::InvalidSocket(id)),
        }
    }

    /// feed a transport event into the socket, returns false if the socket
    /// is unknown
    pub fn deliver(&self, id: SocketId, ev: SocketEvent<'_>) -> bool {
        match ev {
            SocketEvent::Accept(new_id, peer) => {
                let cb = self.slots().sockets.get(&id).map(|s| s.on_accept.clone());
                match cb {
                    Some(Some(cb)) => {
                        go!(move || cb(new_id, peer));
                    }
                    Some(None) => {
                        warn!("socket: no accept handler on {id}, drop {peer}");
                        self.close(new_id);
                    }
                    None => return false,
                }
                return true;
            }
            SocketEvent::Udp(data, from) => {
                let cb = self.slots().sockets.get(&id).map(|s| s.on_udp.clone());
                match cb {
                    Some(Some(cb)) => cb(id, data, from),
                    Some(None) => {}
                    None => return false,
                }
                return true;
            }
            SocketEvent::Warning(size) => {
                let cb = self.slots().sockets.get(&id).map(|s| s.on_warning.clone());
                match cb {
                    Some(Some(cb)) => cb(id, size),
                    Some(None) => warn!("WARNING: {} K bytes need to send out (fd = {id})", size / 1024),
                    None => return false,
                }
                return true;
            }
            _ => {}
        }

        let mut wakes = Vec::new();
        {
            let mut slots = self.slots();
            let s = match slots.sockets.get_mut(&id) {
                Some(s) => s,
                None => {
                    debug!("socket: drop package from {id}");
                    return false;
                }
            };
            match ev {
                SocketEvent::Connect => {
                    if s.connecting {
                        s.connecting = false;
                        s.connected = true;
                        s.opened = true;
                    }
                    s.connector = None;
                    s.wake_all(&mut wakes);
                }
                SocketEvent::Data(data) => {
                    let size = s.buffer.push(data);
                    match s.limit {
                        Some(limit) if size > limit => {
                            error!("socket: buffer overflow fd={id} size={size}");
                            s.buffer.clear();
                            s.connected = false;
                            if let Some(t) = &s.transport {
                                t.shutdown();
                            }
                            s.wake_reader(&mut wakes);
                        }
                        _ => {
                            if s.satisfied() {
                                s.wake_reader(&mut wakes);
                            }
                        }
                    }
                }
                SocketEvent::Close => {
                    s.connected = false;
                    s.connecting = false;
                    s.wake_all(&mut wakes);
                }
                SocketEvent::Error(msg) => {
                    if s.connected {
                        error!("socket: error on {id} {msg}");
                    }
                    s.connected = false;
                    s.connecting = false;
                    s.connector = None;
                    s.error = Some(msg);
                    s.wake_all(&mut wakes);
                }
                _ => {}
            }
        }
        wakes.into_iter().for_each(|w| w.set_rsp(()));
        true
    }

    #[cfg(test)]
    fn insert_virtual(&self) -> SocketId {
        self.insert(|s| s.connected = true)
    }
}
