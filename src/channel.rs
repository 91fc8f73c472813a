//! reconnecting request channel
//!
//! a `Channel` multiplexes the requests of many callers onto one physical
//! socket. In order mode every request enqueues a response parser and the
//! dispatch loop runs the parsers strictly in FIFO order against the socket.
//! In session mode a reader decodes `(session, reply)` pairs and the reply
//! goes to whoever registered that session.
//!
//! Connection is lazy. The first operation connects, concurrent operations
//! share that attempt, and a dropped connection is re-established against
//! the primary address and then each backup in turn.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use may::{coroutine, go};
use may_waiter::Waiter;

use crate::socket::{parse_addr, ReadResult, SocketId, SocketLayer};
use crate::Error;

/// authenticate a fresh connection, runs before anybody else may use it
pub type AuthFn = Arc<dyn Fn(&Channel) -> Result<(), Error> + Send + Sync>;
/// decode the next reply of a session mode channel
pub type SessionReader = Arc<dyn Fn(&ChannelIo) -> Result<SessionReply, Error> + Send + Sync>;

type Job = Box<dyn FnOnce(Result<&ChannelIo, Error>) -> Result<(), String> + Send>;
type SessionWaiter = Arc<Waiter<Result<Bytes, Error>>>;

/// one reply decoded by a [`SessionReader`]
#[derive(Debug, Clone)]
pub struct SessionReply {
    /// the session given to `request_session`
    pub session: u64,
    /// false turns the reply into `Error::Rejected`
    pub ok: bool,
    pub data: Bytes,
}

/// a backup target, the port defaults to the primary port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: Option<u16>,
}

impl Address {
    /// `host`, `host:port` or `[ipv6]:port`
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.starts_with('[') || s.matches(':').count() == 1 {
            let (host, port) = parse_addr(s)?;
            return Ok(Address {
                host,
                port: Some(port),
            });
        }
        Ok(Address {
            host: s.to_owned(),
            port: None,
        })
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Address {
            host: host.to_owned(),
            port: Some(port),
        }
    }
}

/// Channel configuration
#[derive(Clone)]
pub struct ChannelConfig {
    host: String,
    port: u16,
    backup: Vec<Address>,
    nodelay: bool,
    auth: Option<AuthFn>,
    session_reader: Option<SessionReader>,
    retry_step: Duration,
    retry_ceiling: Duration,
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backup", &self.backup)
            .field("nodelay", &self.nodelay)
            .field("auth", &self.auth.is_some())
            .field("session_mode", &self.session_reader.is_some())
            .finish()
    }
}

impl ChannelConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ChannelConfig {
            host: host.into(),
            port,
            backup: Vec::new(),
            nodelay: false,
            auth: None,
            session_reader: None,
            retry_step: Duration::from_secs(1),
            retry_ceiling: Duration::from_secs(10),
        }
    }

    /// backups tried in order after the primary
    pub fn backup(mut self, backup: Vec<Address>) -> Self {
        self.backup = backup;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn auth<F>(mut self, f: F) -> Self
    where
        F: Fn(&Channel) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(f));
        self
    }

    /// switch the channel to session mode
    pub fn session_reader<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChannelIo) -> Result<SessionReply, Error> + Send + Sync + 'static,
    {
        self.session_reader = Some(Arc::new(f));
        self
    }

    /// linear backoff between reconnect rounds, reset once above `ceiling`
    pub fn retry(mut self, step: Duration, ceiling: Duration) -> Self {
        self.retry_step = step;
        self.retry_ceiling = ceiling;
        self
    }
}

/// the socket as seen by response parsers
#[derive(Debug, Clone)]
pub struct ChannelIo {
    layer: SocketLayer,
    id: SocketId,
}

impl ChannelIo {
    fn closed(&self) -> Error {
        Error::Socket(format!("socket {} closed", self.id))
    }

    fn data(&self, ret: ReadResult) -> Result<Bytes, Error> {
        ret.ok().ok_or_else(|| self.closed())
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// exactly `n` bytes
    pub fn read(&self, n: usize) -> Result<Bytes, Error> {
        self.data(self.layer.read(self.id, Some(n))?)
    }

    /// whatever is buffered, at least one byte
    pub fn read_some(&self) -> Result<Bytes, Error> {
        self.data(self.layer.read(self.id, None)?)
    }

    /// up to `sep`, without it
    pub fn readline(&self, sep: &[u8]) -> Result<Bytes, Error> {
        self.data(self.layer.readline(self.id, sep)?)
    }

    /// everything until the peer closes
    pub fn readall(&self) -> Result<Bytes, Error> {
        self.layer.readall(self.id)
    }

    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.layer.write(self.id, data)
    }
}

// what callers sharing a connect attempt learn about its outcome
#[derive(Debug, Clone)]
enum Attempt {
    Connected(SocketId),
    Closed,
    Failed(String),
}

impl Attempt {
    fn of(ret: &Result<SocketId, Error>) -> Self {
        match ret {
            Ok(id) => Attempt::Connected(*id),
            Err(Error::ChannelClosed) => Attempt::Closed,
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }
}

struct Dropped {
    id: SocketId,
    jobs: Vec<Job>,
    sessions: Vec<SessionWaiter>,
    wake: Option<Arc<Waiter<()>>>,
}

#[derive(Default)]
struct State {
    closed: bool,
    host: String,
    port: u16,
    backup: Vec<Address>,
    socket: Option<SocketId>,
    // callers waiting on the connect attempt in progress
    connecting: Option<Vec<Arc<Waiter<Attempt>>>>,
    // None is the stop sentinel
    queue: VecDeque<Option<Job>>,
    sessions: HashMap<u64, SessionWaiter>,
    loop_waiter: Option<Arc<Waiter<()>>>,
    dispatch: Option<coroutine::JoinHandle<()>>,
}

impl State {
    fn drop_socket(&mut self) -> Option<Dropped> {
        let id = self.socket.take()?;
        // the loop notices the missing socket and ends
        self.dispatch = None;
        Some(Dropped {
            id,
            jobs: self.queue.drain(..).flatten().collect(),
            sessions: self.sessions.drain().map(|(_, w)| w).collect(),
            wake: self.loop_waiter.take(),
        })
    }

    fn wake_loop(&mut self) {
        if let Some(w) = self.loop_waiter.take() {
            w.set_rsp(());
        }
    }

    // primary first, then every distinct backup
    fn targets(&self) -> Vec<(String, u16)> {
        let mut targets = vec![(self.host.clone(), self.port)];
        for b in &self.backup {
            let t = (b.host.clone(), b.port.unwrap_or(self.port));
            if !targets.contains(&t) {
                targets.push(t);
            }
        }
        targets
    }
}

struct ChannelInner {
    layer: SocketLayer,
    config: ChannelConfig,
    state: Mutex<State>,
    // keeps write order equal to queue order
    write_lock: may::sync::Mutex<()>,
}

/// reconnecting request channel, cheap to clone
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
    // the handle given to the auth callback skips the connect wait
    authing: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Channel")
            .field("host", &st.host)
            .field("port", &st.port)
            .field("socket", &st.socket)
            .field("dispatching", &st.dispatch.is_some())
            .field("closed", &st.closed)
            .finish()
    }
}

fn job<T, F>(parser: F, waiter: Arc<Waiter<Result<T, Error>>>) -> Job
where
    T: Send + 'static,
    F: FnOnce(&ChannelIo) -> Result<T, Error> + Send + 'static,
{
    Box::new(move |io| {
        let io = match io {
            Ok(io) => io,
            Err(e) => {
                waiter.set_rsp(Err(e));
                return Ok(());
            }
        };
        match parser(io) {
            Ok(v) => {
                waiter.set_rsp(Ok(v));
                Ok(())
            }
            Err(e) if e.is_rejected() => {
                waiter.set_rsp(Err(e));
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                waiter.set_rsp(Err(e));
                Err(msg)
            }
        }
    })
}

impl Channel {
    /// create a channel, nothing is connected until the first operation
    pub fn new(layer: &SocketLayer, config: ChannelConfig) -> Self {
        let state = State {
            host: config.host.clone(),
            port: config.port,
            backup: config.backup.clone(),
            ..State::default()
        };
        Channel {
            inner: Arc::new(ChannelInner {
                layer: layer.clone(),
                config,
                state: Mutex::new(state),
                write_lock: may::sync::Mutex::new(()),
            }),
            authing: false,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.inner.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// current primary target
    pub fn host(&self) -> (String, u16) {
        let st = self.state();
        (st.host.clone(), st.port)
    }

    /// the physical socket, if any
    pub fn socket(&self) -> Option<SocketId> {
        self.state().socket
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn is_session_mode(&self) -> bool {
        self.inner.config.session_reader.is_some()
    }

    /// connect unless connected, `once` returns the first failure instead
    /// of retrying
    pub fn connect(&self, once: bool) -> Result<(), Error> {
        self.ensure(once).map(|_| ())
    }

    fn ensure(&self, once: bool) -> Result<SocketId, Error> {
        loop {
            let mut dropped = None;
            let waiter = {
                let mut guard = self.state();
                let st = &mut *guard;
                if st.closed {
                    return Err(Error::ChannelClosed);
                }
                if self.authing {
                    return st
                        .socket
                        .ok_or_else(|| Error::Socket("disconnected during auth".to_owned()));
                }
                match &mut st.connecting {
                    Some(waiters) => {
                        let w = Arc::new(Waiter::new());
                        waiters.push(w.clone());
                        Some(w)
                    }
                    None => {
                        if let Some(id) = st.socket {
                            let layer = &self.inner.layer;
                            if !layer.invalid(id) && !layer.disconnected(id) {
                                return Ok(id);
                            }
                            info!("channel: {}:{} disconnected", st.host, st.port);
                            dropped = st.drop_socket();
                        }
                        st.connecting = Some(Vec::new());
                        None
                    }
                }
            };
            if let Some(d) = dropped {
                self.finish_drop(d, false, "disconnected");
            }

            let w = match waiter {
                Some(w) => w,
                None => {
                    let ret = self.reconnect(once);
                    let waiters = self.state().connecting.take().unwrap_or_default();
                    let shared = Attempt::of(&ret);
                    for w in waiters {
                        w.set_rsp(shared.clone());
                    }
                    return ret;
                }
            };
            match w.wait_rsp(None::<Duration>)? {
                Attempt::Connected(id) => return Ok(id),
                Attempt::Closed => return Err(Error::ChannelClosed),
                Attempt::Failed(msg) if once => return Err(Error::Connect(msg)),
                // a one pass attempt gave up, retrying is up to us now
                Attempt::Failed(_) => continue,
            }
        }
    }

    fn reconnect(&self, once: bool) -> Result<SocketId, Error> {
        let config = &self.inner.config;
        let mut t = Duration::ZERO;
        loop {
            match self.connect_once() {
                Ok(id) => return Ok(id),
                Err(Error::ChannelClosed) => return Err(Error::ChannelClosed),
                Err(e) if once => return Err(e),
                Err(e) => error!("channel: connect failed, {e}"),
            }
            if t > config.retry_ceiling {
                let (host, port) = self.host();
                error!("channel: try to reconnect {host}:{port}");
                may::coroutine::sleep(t);
                t = Duration::ZERO;
            } else {
                may::coroutine::sleep(t);
            }
            t += config.retry_step;
            if self.is_closed() {
                return Err(Error::ChannelClosed);
            }
        }
    }

    fn connect_once(&self) -> Result<SocketId, Error> {
        'restart: loop {
            let targets = {
                let st = self.state();
                if st.closed {
                    return Err(Error::ChannelClosed);
                }
                st.targets()
            };
            let mut last = Error::Connect("no address to connect".to_owned());
            for (i, (host, port)) in targets.iter().enumerate() {
                if i > 0 {
                    info!("channel: connect to backup host {host}:{port}");
                }
                match self.try_target(host, *port) {
                    Ok(Some(id)) => return Ok(id),
                    // the auth step moved the channel to another host
                    Ok(None) => continue 'restart,
                    Err(Error::ChannelClosed) => return Err(Error::ChannelClosed),
                    Err(e) => last = e,
                }
            }
            return Err(last);
        }
    }

    fn try_target(&self, host: &str, port: u16) -> Result<Option<SocketId>, Error> {
        let layer = &self.inner.layer;
        let id = layer.open(host, port)?;
        if self.inner.config.nodelay {
            layer.nodelay(id).ok();
        }
        {
            let mut st = self.state();
            if st.closed {
                drop(st);
                layer.close(id);
                return Err(Error::ChannelClosed);
            }
            st.socket = Some(id);
        }
        if let Err(e) = self.spawn_dispatch(id) {
            if let Some(d) = self.state().drop_socket() {
                self.finish_drop(d, false, "dispatch failed");
            }
            return Err(e);
        }

        let auth = match &self.inner.config.auth {
            Some(auth) => auth,
            None => return Ok(Some(id)),
        };
        let handle = Channel {
            inner: self.inner.clone(),
            authing: true,
        };
        let ret = auth(&handle);
        if self.state().socket != Some(id) {
            layer.close(id);
            return Ok(None);
        }
        match ret {
            Ok(()) => Ok(Some(id)),
            Err(e) => {
                error!("channel: auth {host}:{port} failed, {e}");
                if let Some(d) = self.state().drop_socket() {
                    self.finish_drop(d, false, "auth failed");
                }
                Err(e)
            }
        }
    }

    fn spawn_dispatch(&self, id: SocketId) -> Result<(), Error> {
        let ch = Channel {
            inner: self.inner.clone(),
            authing: false,
        };
        let reader = self.inner.config.session_reader.clone();
        let h = go!(
            coroutine::Builder::new().name(format!("channel{id}")),
            move || match reader {
                Some(reader) => ch.dispatch_by_session(id, reader),
                None => ch.dispatch_by_order(id),
            }
        )?;
        let mut st = self.state();
        if st.socket == Some(id) {
            st.dispatch = Some(h);
        }
        Ok(())
    }

    fn dispatch_by_order(&self, id: SocketId) {
        let io = ChannelIo {
            layer: self.inner.layer.clone(),
            id,
        };
        loop {
            let job = {
                let mut st = self.state();
                if st.socket != Some(id) {
                    return;
                }
                match st.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        let w = Arc::new(Waiter::new());
                        st.loop_waiter = Some(w.clone());
                        drop(st);
                        if w.wait_rsp(None::<Duration>).is_err() {
                            return;
                        }
                        continue;
                    }
                }
            };
            match job {
                Some(job) => {
                    if let Err(msg) = job(Ok(&io)) {
                        self.teardown(id, &msg);
                        return;
                    }
                }
                None => {
                    self.teardown(id, "channel closed");
                    return;
                }
            }
        }
    }

    fn dispatch_by_session(&self, id: SocketId, reader: SessionReader) {
        let io = ChannelIo {
            layer: self.inner.layer.clone(),
            id,
        };
        loop {
            let reply = match reader(&io) {
                Ok(reply) => reply,
                Err(e) => {
                    self.teardown(id, &e.to_string());
                    return;
                }
            };
            let w = {
                let mut st = self.state();
                if st.socket != Some(id) {
                    return;
                }
                st.sessions.remove(&reply.session)
            };
            match w {
                Some(w) if reply.ok => w.set_rsp(Ok(reply.data)),
                Some(w) => {
                    let msg = String::from_utf8_lossy(&reply.data).into_owned();
                    w.set_rsp(Err(Error::Rejected(msg)));
                }
                None => warn!("channel: unknown session {}", reply.session),
            }
        }
    }

    // the socket `id` failed, every caller still waiting on it fails too
    fn teardown(&self, id: SocketId, msg: &str) {
        let (dropped, closed) = {
            let mut st = self.state();
            if st.socket != Some(id) {
                return;
            }
            (st.drop_socket(), st.closed)
        };
        if let Some(d) = dropped {
            if !closed {
                error!("channel: socket {id} dropped, {msg}");
            }
            self.finish_drop(d, closed, msg);
        }
    }

    fn finish_drop(&self, d: Dropped, closed: bool, msg: &str) {
        self.inner.layer.close(d.id);
        if let Some(w) = d.wake {
            w.set_rsp(());
        }
        let err = || {
            if closed {
                Error::ChannelClosed
            } else {
                Error::Socket(msg.to_owned())
            }
        };
        for job in d.jobs {
            job(Err(err())).ok();
        }
        for w in d.sessions {
            w.set_rsp(Err(err()));
        }
    }

    fn submit<T, F>(&self, data: &[u8], parts: &[&[u8]], parser: Option<F>) -> Result<Option<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce(&ChannelIo) -> Result<T, Error> + Send + 'static,
    {
        if parser.is_some() && self.is_session_mode() {
            return Err(Error::Status("channel is in session mode".to_owned()));
        }
        let id = self.ensure(false)?;
        let layer = &self.inner.layer;

        let guard = match self.inner.write_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !data.is_empty() {
            layer.write(id, data)?;
        }
        for part in parts {
            layer.lwrite(id, *part)?;
        }
        let parser = match parser {
            Some(p) => p,
            None => return Ok(None),
        };
        let waiter = Arc::new(Waiter::new());
        {
            let mut st = self.state();
            if st.socket != Some(id) {
                return Err(Error::Socket(format!("socket {id} dropped after write")));
            }
            st.queue.push_back(Some(job(parser, waiter.clone())));
            st.wake_loop();
        }
        drop(guard);

        waiter.wait_rsp(None::<Duration>)?.map(Some)
    }

    /// write `data` and suspend until `parser` consumed its response
    pub fn request<T, F>(&self, data: &[u8], parser: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&ChannelIo) -> Result<T, Error> + Send + 'static,
    {
        self.request_parts(data, &[], parser)
    }

    /// like `request`, large payloads follow as low priority parts
    pub fn request_parts<T, F>(&self, data: &[u8], parts: &[&[u8]], parser: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&ChannelIo) -> Result<T, Error> + Send + 'static,
    {
        self.submit(data, parts, Some(parser))?
            .ok_or_else(|| Error::Status("missing response".to_owned()))
    }

    /// write without expecting a response
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        self.submit::<(), fn(&ChannelIo) -> Result<(), Error>>(data, &[], None)
            .map(|_| ())
    }

    /// consume the next inbound message without sending anything
    pub fn response<T, F>(&self, parser: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&ChannelIo) -> Result<T, Error> + Send + 'static,
    {
        self.request_parts(&[], &[], parser)
    }

    /// session mode request, resolved by the reply carrying `session`
    pub fn request_session(&self, data: &[u8], session: u64) -> Result<Bytes, Error> {
        if !self.is_session_mode() {
            return Err(Error::Status("channel is in order mode".to_owned()));
        }
        let id = self.ensure(false)?;
        let waiter = Arc::new(Waiter::new());
        {
            let mut st = self.state();
            if st.socket != Some(id) {
                return Err(Error::Socket(format!("socket {id} dropped")));
            }
            st.sessions.insert(session, waiter.clone());
        }
        if let Err(e) = self.inner.layer.write(id, data) {
            self.state().sessions.remove(&session);
            return Err(e);
        }
        waiter.wait_rsp(None::<Duration>)?
    }

    /// move to another primary, the current connection is dropped
    pub fn change_host(&self, host: &str, port: Option<u16>) {
        let dropped = {
            let mut st = self.state();
            st.host = host.to_owned();
            if let Some(port) = port {
                st.port = port;
            }
            st.drop_socket()
        };
        if let Some(d) = dropped {
            self.finish_drop(d, false, "host changed");
        }
    }

    /// replace the backups, the current connection is dropped
    pub fn change_backup(&self, backup: Vec<Address>) {
        let dropped = {
            let mut st = self.state();
            st.backup = backup;
            st.drop_socket()
        };
        if let Some(d) = dropped {
            self.finish_drop(d, false, "backup changed");
        }
    }

    /// stop the dispatch loop and drop the connection for good
    pub fn close(&self) {
        let id = {
            let mut st = self.state();
            if st.closed {
                return;
            }
            st.closed = true;
            st.queue.push_back(None);
            st.wake_loop();
            st.socket
        };
        if let Some(id) = id {
            self.inner.layer.close(id);
        }
    }
}
