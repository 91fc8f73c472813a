//! session dispatcher
//!
//! every service owns the set of sessions it is waiting on, the set of
//! requests it still owes a reply to, and the protocol registry used to
//! pack, unpack and dispatch messages. Suspension is a parked
//! `may_waiter::Waiter` keyed by session; resolving a session removes it
//! from the table under the lock, so each waiter is resumed at most once.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use bytes::Bytes;
use co_managed::Manager;
use may::go;
use may::sync::mpsc::Receiver;
use may_waiter::Waiter;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Value;
use crate::envelope::Envelope;
use crate::node::{Addr, Node};
use crate::protocol::{
    Context, DispatchFn, Protocol, Registry, Session, PTYPE_ERROR, PTYPE_NAME_LUA, PTYPE_RESPONSE,
};
use crate::{Error, SendError, Server};

mod responder;
mod session;

pub use responder::Responder;
use session::{Pending, Reply, SessionTable};

/// suspension token handed to `wait`/`wakeup`
pub type Token = u32;

/// hook for responses that match no live session
pub type UnknownResponseFn = Arc<dyn Fn(&Service, Session, Addr, Bytes) -> Result<(), Error> + Send + Sync>;
/// hook for requests that match no dispatchable protocol
pub type UnknownRequestFn =
    Arc<dyn Fn(&Service, Session, Addr, Bytes, u8) -> Result<(), Error> + Send + Sync>;

fn default_unknown_response() -> UnknownResponseFn {
    Arc::new(|_, session, source, msg| {
        error!("Response message : {}", msg.len());
        Err(Error::UnknownSession {
            session,
            from: source,
        })
    })
}

fn default_unknown_request() -> UnknownRequestFn {
    Arc::new(|_, session, source, msg, proto| {
        error!("Unknown request ({proto}): {}", msg.len());
        Err(Error::UnknownRequest {
            proto,
            session,
            from: source,
        })
    })
}

#[derive(Debug, Default)]
struct State {
    sessions: SessionTable,
    // sessions I'm waiting on -> callee
    watching_request: HashMap<Session, Addr>,
    // requests I owe a reply to
    watching_response: HashSet<(Addr, Session)>,
    // responder id -> the request it answers
    unresponse: HashMap<u64, (Addr, Session)>,
    // token -> (session, armed with a timer)
    sleeping: HashMap<Token, (Session, bool)>,
    next_responder: u64,
}

struct Hooks {
    unknown_response: UnknownResponseFn,
    unknown_request: UnknownRequestFn,
}

struct Inner {
    addr: Addr,
    node: Node,
    registry: RwLock<Registry>,
    state: Mutex<State>,
    hooks: RwLock<Hooks>,
    exited: AtomicBool,
    next_dispatch_id: AtomicU32,
    next_token: AtomicU32,
}

/// handle of one service, cheap to clone
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("addr", &self.inner.addr)
            .field("exited", &self.inner.exited.load(Ordering::Relaxed))
            .finish()
    }
}

impl Service {
    pub(crate) fn new(node: Node, addr: Addr) -> Self {
        Service {
            inner: Arc::new(Inner {
                addr,
                node,
                registry: RwLock::new(Registry::with_builtin()),
                state: Mutex::new(State::default()),
                hooks: RwLock::new(Hooks {
                    unknown_response: default_unknown_response(),
                    unknown_request: default_unknown_request(),
                }),
                exited: AtomicBool::new(false),
                next_dispatch_id: AtomicU32::new(1),
                next_token: AtomicU32::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.inner.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// address of this service
    pub fn addr(&self) -> Addr {
        self.inner.addr
    }

    /// the node this service lives in
    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    /// true once the service exited
    pub fn is_exited(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire)
    }

    /// register a protocol, fails if its name or id is taken
    pub fn register_protocol(&self, p: Protocol) -> Result<(), Error> {
        let mut reg = match self.inner.registry.write() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.register(p).map(|_| ())
    }

    /// look up a protocol by name
    pub fn protocol(&self, name: &str) -> Result<Arc<Protocol>, Error> {
        let reg = match self.inner.registry.read() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProtocol(name.to_owned()))
    }

    fn protocol_id(&self, id: u8) -> Option<Arc<Protocol>> {
        let reg = match self.inner.registry.read() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.get_id(id).cloned()
    }

    /// set the dispatch handler of a protocol, returns the previous one
    pub fn dispatch<F>(&self, name: &str, f: F) -> Result<Option<DispatchFn>, Error>
    where
        F: Fn(&Service, &Context, Vec<Value>) -> Result<(), Error> + Send + Sync + 'static,
    {
        let p = self.protocol(name)?;
        Ok(p.set_dispatch(Some(Arc::new(f))))
    }

    /// install a `Server` as the handler of a protocol
    ///
    /// the request is the first argument as bytes, the response is sent back
    /// as a single bytes argument.
    pub fn serve<S: Server>(&self, name: &str, server: S) -> Result<(), Error> {
        let server = Arc::new(server);
        self.dispatch(name, move |svc, ctx, args| {
            let req = args
                .first()
                .and_then(Value::as_bytes)
                .ok_or_else(|| Error::Deserialize("expect a bytes request".to_owned()))?;
            let rsp = server.service(req)?;
            svc.ret(ctx, &[Value::Bytes(rsp)]).map(|_| ())
        })?;
        Ok(())
    }

    /// replace the unknown response hook, returns the previous one
    pub fn dispatch_unknown_response<F>(&self, f: F) -> UnknownResponseFn
    where
        F: Fn(&Service, Session, Addr, Bytes) -> Result<(), Error> + Send + Sync + 'static,
    {
        let mut hooks = match self.inner.hooks.write() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut hooks.unknown_response, Arc::new(f))
    }

    /// replace the unknown request hook, returns the previous one
    pub fn dispatch_unknown_request<F>(&self, f: F) -> UnknownRequestFn
    where
        F: Fn(&Service, Session, Addr, Bytes, u8) -> Result<(), Error> + Send + Sync + 'static,
    {
        let mut hooks = match self.inner.hooks.write() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut hooks.unknown_request, Arc::new(f))
    }

    fn unknown_response(&self) -> UnknownResponseFn {
        match self.inner.hooks.read() {
            Ok(h) => h.unknown_response.clone(),
            Err(poisoned) => poisoned.into_inner().unknown_response.clone(),
        }
    }

    fn unknown_request(&self) -> UnknownRequestFn {
        match self.inner.hooks.read() {
            Ok(h) => h.unknown_request.clone(),
            Err(poisoned) => poisoned.into_inner().unknown_request.clone(),
        }
    }

    fn post(&self, dest: Addr, proto: u8, session: Session, payload: Bytes) -> Result<(), SendError> {
        let env = Envelope {
            proto,
            session,
            source: self.inner.addr,
            payload,
        };
        self.inner.node.send(dest, env)
    }

    /// send without expecting a reply
    pub fn send(&self, dest: Addr, proto: &str, args: &[Value]) -> Result<(), Error> {
        let p = self.protocol(proto)?;
        let payload = p.pack(args)?;
        Ok(self.post(dest, p.id(), 0, payload)?)
    }

    /// send an already packed payload without expecting a reply
    pub fn rawsend(&self, dest: Addr, proto: &str, payload: Bytes) -> Result<(), Error> {
        let p = self.protocol(proto)?;
        Ok(self.post(dest, p.id(), 0, payload)?)
    }

    /// call `dest` and suspend until it replies
    pub fn call(&self, dest: Addr, proto: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        let p = self.protocol(proto)?;
        let payload = p.pack(args)?;
        let rsp = self.call_id(dest, p.id(), payload)?;
        p.unpack(&rsp)
    }

    /// call with an already packed payload, returns the raw reply
    pub fn rawcall(&self, dest: Addr, proto: &str, payload: Bytes) -> Result<Bytes, Error> {
        let p = self.protocol(proto)?;
        self.call_id(dest, p.id(), payload)
    }

    /// call through the `lua` protocol with a serde request and response
    pub fn call_serde<Req, Rsp>(&self, dest: Addr, req: &Req) -> Result<Rsp, Error>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let req = bincode::serialize(req).map_err(|e| Error::Serialize(e.to_string()))?;
        let rsp = self.call(dest, PTYPE_NAME_LUA, &[Value::Bytes(req)])?;
        let rsp = rsp
            .first()
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::Deserialize("expect a bytes response".to_owned()))?;
        bincode::deserialize(rsp).map_err(|e| Error::Deserialize(e.to_string()))
    }

    fn call_id(&self, dest: Addr, proto: u8, payload: Bytes) -> Result<Bytes, Error> {
        let waiter = Arc::new(Waiter::new());
        let session = {
            let mut st = self.state();
            let session = st.sessions.insert(Pending::Wait(waiter.clone()));
            st.watching_request.insert(session, dest);
            session
        };
        debug!("call {dest} session={session}");

        if let Err(e) = self.post(dest, proto, session, payload) {
            let mut st = self.state();
            st.sessions.take(session);
            st.watching_request.remove(&session);
            return Err(e.into());
        }

        let ret = waiter.wait_rsp(None::<Duration>);
        let mut st = self.state();
        st.watching_request.remove(&session);
        match ret {
            Ok(Reply::Response(rsp)) => Ok(rsp),
            Ok(_) => Err(Error::CallFailed { session, dest }),
            Err(e) => {
                st.sessions.take(session);
                Err(e.into())
            }
        }
    }

    /// reply to `ctx` right away, returns false for fire-and-forget requests
    pub fn ret(&self, ctx: &Context, args: &[Value]) -> Result<bool, Error> {
        if ctx.session == 0 {
            // send don't need ret
            return Ok(false);
        }
        let payload = ctx.proto.pack(args)?;
        if !self.state().watching_response.remove(&(ctx.source, ctx.session)) {
            // already answered, or handed to a responder
            return Ok(false);
        }
        Ok(self.reply(ctx, payload))
    }

    /// take over the reply of `ctx` for a later, deferred answer
    pub fn response(&self, ctx: &Context) -> Responder {
        if ctx.session == 0 {
            return Responder::new(None, ctx.clone());
        }
        let id = {
            let mut st = self.state();
            st.watching_response.remove(&(ctx.source, ctx.session));
            let id = st.next_responder;
            st.next_responder += 1;
            st.unresponse.insert(id, (ctx.source, ctx.session));
            id
        };
        Responder::new(Some((self.clone(), id)), ctx.clone())
    }

    /// stop tracking the reply owed for `session` from `source`
    pub fn ignore_ret(&self, source: Addr, session: Session) {
        self.state().watching_response.remove(&(source, session));
    }

    pub(crate) fn claim_responder(&self, id: u64) -> bool {
        self.state().unresponse.remove(&id).is_some()
    }

    pub(crate) fn responder_pending(&self, id: u64) -> bool {
        self.state().unresponse.contains_key(&id)
    }

    pub(crate) fn reply(&self, ctx: &Context, payload: Bytes) -> bool {
        match self.post(ctx.source, PTYPE_RESPONSE, ctx.session, payload) {
            Ok(()) => true,
            Err(SendError::TooLarge(len)) => {
                // report the failure back instead of leaving the caller blocked
                error!("response too large: {len} bytes, session={}", ctx.session);
                self.reply_error(ctx.source, ctx.session);
                false
            }
            Err(e) => {
                debug!("response session={} dropped: {e}", ctx.session);
                false
            }
        }
    }

    pub(crate) fn reply_error(&self, dest: Addr, session: Session) {
        if let Err(e) = self.post(dest, PTYPE_ERROR, session, Bytes::new()) {
            debug!("error reply session={session} to {dest} dropped: {e}");
        }
    }

    /// a fresh suspension token
    pub fn gen_token(&self) -> Token {
        loop {
            let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
            if token != 0 && token != u32::MAX {
                return token;
            }
            self.inner.next_token.store(1, Ordering::Relaxed);
        }
    }

    fn park(&self, token: Token, timed: bool) -> (Session, Arc<Waiter<Reply>>) {
        let waiter = Arc::new(Waiter::new());
        let mut st = self.state();
        let session = st.sessions.insert(Pending::Wait(waiter.clone()));
        st.sleeping.insert(token, (session, timed));
        (session, waiter)
    }

    fn unpark(&self, token: Token, session: Session, ret: &std::io::Result<Reply>) {
        let mut st = self.state();
        if st.sleeping.get(&token).map(|(s, _)| *s) == Some(session) {
            st.sleeping.remove(&token);
        }
        if ret.is_err() && st.sessions.is_waiting(session) {
            st.sessions.take(session);
        }
    }

    /// suspend until `wakeup(token)` is called
    pub fn wait(&self, token: Token) -> Result<(), Error> {
        let (session, waiter) = self.park(token, false);
        let ret = waiter.wait_rsp(None::<Duration>);
        self.unpark(token, session, &ret);
        match ret? {
            Reply::Error => Err(Error::CallFailed {
                session,
                dest: self.inner.addr,
            }),
            _ => Ok(()),
        }
    }

    /// resume the call site parked on `token`
    ///
    /// returns false, and does nothing, when nobody waits on the token.
    pub fn wakeup(&self, token: Token) -> bool {
        let waiter = {
            let mut st = self.state();
            let (session, timed) = match st.sleeping.remove(&token) {
                Some(s) => s,
                None => return false,
            };
            match st.sessions.take(session) {
                Some(Pending::Wait(w)) => {
                    if timed {
                        // swallow the timer response that is still on its way
                        st.sessions.restore(session, Pending::Broken);
                    }
                    w
                }
                Some(other) => {
                    st.sessions.restore(session, other);
                    return false;
                }
                None => return false,
            }
        };
        waiter.set_rsp(Reply::Wakeup);
        true
    }

    fn arm_timer(&self, session: Session, ti: Duration) {
        let node = self.inner.node.clone();
        let addr = self.inner.addr;
        go!(move || {
            may::coroutine::sleep(ti);
            let env = Envelope {
                proto: PTYPE_RESPONSE,
                session,
                source: addr,
                payload: Bytes::new(),
            };
            // the service may be gone already
            node.send(addr, env).ok();
        });
    }

    /// suspend for `ti`
    pub fn sleep(&self, ti: Duration) -> Result<(), Error> {
        let token = self.gen_token();
        self.sleep_with(ti, token).map(|_| ())
    }

    /// suspend for `ti`, `wakeup(token)` ends the sleep early
    ///
    /// returns true when woken before the timer fired.
    pub fn sleep_with(&self, ti: Duration, token: Token) -> Result<bool, Error> {
        let (session, waiter) = self.park(token, true);
        self.arm_timer(session, ti);
        let ret = waiter.wait_rsp(None::<Duration>);
        self.unpark(token, session, &ret);
        match ret? {
            Reply::Wakeup => Ok(true),
            Reply::Response(_) => Ok(false),
            Reply::Error => Err(Error::CallFailed {
                session,
                dest: self.inner.addr,
            }),
        }
    }

    /// run `f` inside this service after `ti`
    pub fn timeout<F>(&self, ti: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let session = self.state().sessions.insert(Pending::Timer(Box::new(f)));
        self.arm_timer(session, ti);
    }

    /// number of live sessions (calls, sleeps, waits and timers)
    pub fn task_count(&self) -> usize {
        self.state().sessions.len()
    }

    /// number of requests this service still owes a reply to
    pub fn pending_replies(&self) -> usize {
        let st = self.state();
        st.watching_response.len() + st.unresponse.len()
    }

    fn fail_session(&self, session: Session) {
        let pending = {
            let mut st = self.state();
            st.watching_request.remove(&session);
            match st.sessions.take(session) {
                Some(Pending::Wait(w)) => Some(w),
                Some(other) => {
                    st.sessions.restore(session, other);
                    None
                }
                None => None,
            }
        };
        if let Some(w) = pending {
            w.set_rsp(Reply::Error);
        }
    }

    // an error reply for `session`, or with session 0 the news that `source` is down
    fn error_dispatch(&self, session: Session, source: Addr) {
        if session != 0 {
            self.fail_session(session);
            return;
        }
        let failed: Vec<Session> = {
            let mut st = self.state();
            st.unresponse.retain(|_, (addr, _)| *addr != source);
            st.watching_response.retain(|(addr, _)| *addr != source);
            st.watching_request
                .iter()
                .filter(|(_, addr)| **addr == source)
                .map(|(s, _)| *s)
                .collect()
        };
        for session in failed {
            self.fail_session(session);
        }
    }

    fn dispatch_response(&self, env: Envelope, manager: &Manager) -> Result<(), Error> {
        let pending = self.state().sessions.take(env.session);
        match pending {
            Some(Pending::Wait(w)) => w.set_rsp(Reply::Response(env.payload)),
            Some(Pending::Timer(f)) => manager.add(move || f()),
            Some(Pending::Broken) => {}
            None if self.is_exited() => {}
            None => {
                let hook = self.unknown_response();
                return hook(self, env.session, env.source, env.payload);
            }
        }
        Ok(())
    }

    fn dispatch_request(&self, env: Envelope, manager: &Manager) -> Result<(), Error> {
        let p = self.protocol_id(env.proto);
        let handler = p.as_ref().and_then(|p| p.handler());
        let (p, handler) = match (p, handler) {
            (Some(p), Some(h)) if !self.is_exited() => (p, h),
            _ => {
                if env.session != 0 {
                    self.reply_error(env.source, env.session);
                    return Ok(());
                }
                let hook = self.unknown_request();
                return hook(self, env.session, env.source, env.payload, env.proto);
            }
        };

        let ctx = Context {
            proto: p.clone(),
            session: env.session,
            source: env.source,
            dispatch_id: self.inner.next_dispatch_id.fetch_add(1, Ordering::Relaxed),
        };
        if ctx.session != 0 {
            self.state().watching_response.insert((ctx.source, ctx.session));
        }

        let service = self.clone();
        let payload = env.payload;
        manager.add(move || {
            let ret = p.unpack(&payload).and_then(|args| handler(&service, &ctx, args));
            if let Err(e) = &ret {
                error!(
                    "dispatch {} session={} source={} err={e}",
                    p.name(),
                    ctx.session,
                    ctx.source
                );
            }
            if ctx.session != 0
                && service
                    .state()
                    .watching_response
                    .remove(&(ctx.source, ctx.session))
            {
                if ret.is_ok() {
                    error!(
                        "Maybe forgot response session:{} proto:{} source:{}",
                        ctx.session,
                        p.name(),
                        ctx.source
                    );
                }
                service.reply_error(ctx.source, ctx.session);
            }
        });
        Ok(())
    }

    fn dispatch_message(&self, frame: Bytes, manager: &Manager) -> Result<(), Error> {
        let env = Envelope::decode(frame)?;
        match env.proto {
            PTYPE_RESPONSE => self.dispatch_response(env, manager),
            PTYPE_ERROR => {
                self.error_dispatch(env.session, env.source);
                Ok(())
            }
            _ => self.dispatch_request(env, manager),
        }
    }

    /// stop the service
    ///
    /// every call this service waits on fails, every request it owes a reply
    /// to gets an error reply, and the services it was calling learn that it
    /// is gone. Calling it again does nothing.
    pub fn exit(&self) {
        if self.inner.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.node.remove(self.inner.addr);

        let (owed, callees, pending) = {
            let mut st = self.state();
            let mut owed: Vec<(Addr, Session)> = st.watching_response.drain().collect();
            owed.extend(st.unresponse.drain().map(|(_, v)| v));
            let callees: HashSet<Addr> = st.watching_request.drain().map(|(_, a)| a).collect();
            st.sleeping.clear();
            (owed, callees, st.sessions.drain())
        };

        // report the sources that call me
        for (source, session) in owed {
            self.reply_error(source, session);
        }
        // report the services I call but haven't returned
        for addr in callees {
            self.reply_error(addr, 0);
        }
        for (_, p) in pending {
            if let Pending::Wait(w) = p {
                w.set_rsp(Reply::Error);
            }
        }
        info!("service {} exit", self.inner.addr);
    }

    /// the service loop, runs `init` first and then dispatches the inbox
    pub(crate) fn run<F>(self, rx: Receiver<Bytes>, init: F, ready: Arc<Waiter<Result<(), Error>>>)
    where
        F: FnOnce(&Service) -> Result<(), Error> + Send + 'static,
    {
        let manager = Manager::new();
        let service = self.clone();
        manager.add(move || {
            let ret = init(&service);
            if let Err(e) = &ret {
                error!("init service {} failed: {e}", service.addr());
                service.exit();
            }
            ready.set_rsp(ret);
        });

        while let Ok(frame) = rx.recv() {
            if let Err(e) = self.dispatch_message(frame, &manager) {
                error!("service {} dispatch err: {e}", self.inner.addr);
            }
        }
        self.exit();
    }
}

#[cfg(test)]
mod tests;
