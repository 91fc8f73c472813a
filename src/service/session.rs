use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use may_waiter::Waiter;

use crate::protocol::Session;

// sessions wrap back to 1 after this value
pub(crate) const SESSION_CEILING: Session = 0x7fff_ffff;

/// how a parked call site was resumed
#[derive(Debug)]
pub(crate) enum Reply {
    Response(Bytes),
    Error,
    Wakeup,
}

pub(crate) enum Pending {
    /// a parked call site
    Wait(Arc<Waiter<Reply>>),
    /// a timer callback, run when the timer response arrives
    Timer(Box<dyn FnOnce() + Send>),
    /// a sleep that was woken early, its timer response is still in flight
    Broken,
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pending::Wait(_) => write!(f, "Wait"),
            Pending::Timer(_) => write!(f, "Timer"),
            Pending::Broken => write!(f, "Broken"),
        }
    }
}

/// live sessions of one service
///
/// ids grow monotonically, wrap at `SESSION_CEILING` and skip every id that
/// is still live, so two outstanding sessions never share an id.
#[derive(Debug)]
pub(crate) struct SessionTable {
    next: Session,
    ceiling: Session,
    live: HashMap<Session, Pending>,
}

impl Default for SessionTable {
    fn default() -> Self {
        SessionTable::with_ceiling(SESSION_CEILING)
    }
}

impl SessionTable {
    pub fn with_ceiling(ceiling: Session) -> Self {
        SessionTable {
            next: 1,
            ceiling,
            live: HashMap::new(),
        }
    }

    fn alloc(&mut self) -> Session {
        // the live set is always far smaller than the id space
        loop {
            let session = self.next;
            self.next = if session >= self.ceiling { 1 } else { session + 1 };
            if !self.live.contains_key(&session) {
                return session;
            }
        }
    }

    /// allocate a fresh session and park `pending` under it
    pub fn insert(&mut self, pending: Pending) -> Session {
        let session = self.alloc();
        self.live.insert(session, pending);
        session
    }

    /// put an entry back under a known session
    pub fn restore(&mut self, session: Session, pending: Pending) {
        self.live.insert(session, pending);
    }

    /// remove the entry, at most one caller ever gets it
    pub fn take(&mut self, session: Session) -> Option<Pending> {
        self.live.remove(&session)
    }

    pub fn is_waiting(&self, session: Session) -> bool {
        matches!(self.live.get(&session), Some(Pending::Wait(_)))
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn drain(&mut self) -> Vec<(Session, Pending)> {
        self.live.drain().collect()
    }
}
