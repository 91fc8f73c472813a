use std::cell::Cell;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;

use may::net::{TcpListener, UdpSocket};
use may::{coroutine, go};

use super::queued_writer::QueuedWriter;
use super::stream_ext::StreamExt;
use super::{LayerInner, SocketEvent, SocketId, SocketLayer};

const READ_CHUNK: usize = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);
may::coroutine_local!(static TASK_SERIAL: Cell<u64> = Cell::new(0));

/// a coroutine driving one socket, identified by a process wide serial
pub(crate) struct Task {
    serial: u64,
    handle: coroutine::JoinHandle<()>,
}

impl Task {
    pub fn spawn<F>(name: String, f: F) -> io::Result<Task>
    where
        F: FnOnce() + Send + 'static,
    {
        let serial = NEXT_TASK.fetch_add(1, Ordering::Relaxed);
        let handle = go!(coroutine::Builder::new().name(name), move || {
            TASK_SERIAL.with(|s| s.set(serial));
            f()
        })?;
        Ok(Task { serial, handle })
    }

    fn is_current(&self) -> bool {
        coroutine::is_coroutine() && TASK_SERIAL.with(|s| s.get()) == self.serial
    }

    /// cancel the coroutine, a task stopping itself ends on its next event
    pub fn stop(self) {
        if !self.is_current() {
            unsafe { self.handle.coroutine().cancel() };
        }
    }

    /// cancel the coroutine and wait until it is gone
    pub fn abort(self) {
        if self.is_current() {
            return;
        }
        unsafe { self.handle.coroutine().cancel() };
        // a cancelled coroutine joins with an error
        self.handle.join().ok();
    }
}

/// the os side of one socket
pub(crate) trait Transport: Send + Sync {
    /// queue data, returns the size of the batch flushed by this call
    fn write(&self, data: Vec<u8>) -> io::Result<usize>;
    fn shutdown(&self);
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;
    /// start the coroutine that feeds received data into the layer
    fn spawn_reader(&self, layer: Weak<LayerInner>, id: SocketId) -> io::Result<Task>;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(ErrorKind::Unsupported.into())
    }

    fn connect_peer(&self, _peer: SocketAddr) -> io::Result<()> {
        Err(ErrorKind::Unsupported.into())
    }

    fn send_to(&self, _data: &[u8], _peer: SocketAddr) -> io::Result<()> {
        Err(ErrorKind::Unsupported.into())
    }
}

pub(crate) struct StreamTransport<S: StreamExt> {
    writer: QueuedWriter<S>,
    ctrl: Mutex<S>,
}

impl<S: StreamExt> StreamTransport<S> {
    pub fn new(stream: S) -> io::Result<Self> {
        Ok(StreamTransport {
            writer: QueuedWriter::new(stream.try_clone()?),
            ctrl: Mutex::new(stream),
        })
    }

    fn ctrl<R>(&self, f: impl FnOnce(&S) -> io::Result<R>) -> io::Result<R> {
        match self.ctrl.lock() {
            Ok(s) => f(&s),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl<S: StreamExt> Transport for StreamTransport<S> {
    fn write(&self, data: Vec<u8>) -> io::Result<usize> {
        self.writer.write(data)
    }

    fn shutdown(&self) {
        // already closed by the peer is fine
        self.ctrl(|s| s.shutdown()).ok();
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.ctrl(|s| s.set_nodelay(nodelay))
    }

    fn spawn_reader(&self, layer: Weak<LayerInner>, id: SocketId) -> io::Result<Task> {
        let mut rs = self.ctrl(|s| s.try_clone())?;
        Task::spawn(format!("socket{id}"), move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let ev = match rs.read(&mut buf) {
                    Ok(0) => SocketEvent::Close,
                    Ok(n) => SocketEvent::Data(&buf[..n]),
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => SocketEvent::Error(e.to_string()),
                };
                let more = matches!(ev, SocketEvent::Data(_));
                let alive = SocketLayer::upgrade(&layer).map(|l| l.deliver(id, ev));
                if !more || alive != Some(true) {
                    break;
                }
            }
        })
    }
}

pub(crate) struct UdpTransport {
    // coroutine io objects can't be shared without a lock
    sock: may::sync::Mutex<UdpSocket>,
    peer: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    pub fn new(sock: UdpSocket) -> Self {
        UdpTransport {
            sock: may::sync::Mutex::new(sock),
            peer: Mutex::new(None),
        }
    }

    fn sock<R>(&self, f: impl FnOnce(&UdpSocket) -> io::Result<R>) -> io::Result<R> {
        match self.sock.lock() {
            Ok(s) => f(&s),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl Transport for UdpTransport {
    fn write(&self, data: Vec<u8>) -> io::Result<usize> {
        let peer = match self.peer.lock() {
            Ok(p) => *p,
            Err(poisoned) => *poisoned.into_inner(),
        };
        let peer = peer.ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        self.send_to(&data, peer)?;
        Ok(data.len())
    }

    fn shutdown(&self) {}

    fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
        Ok(())
    }

    fn spawn_reader(&self, layer: Weak<LayerInner>, id: SocketId) -> io::Result<Task> {
        let rs = self.sock(|s| s.try_clone())?;
        Task::spawn(format!("socket{id}"), move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let ev = match rs.recv_from(&mut buf) {
                    Ok((n, from)) => SocketEvent::Udp(&buf[..n], from),
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => SocketEvent::Error(e.to_string()),
                };
                let more = matches!(ev, SocketEvent::Udp(..));
                let alive = SocketLayer::upgrade(&layer).map(|l| l.deliver(id, ev));
                if !more || alive != Some(true) {
                    break;
                }
            }
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock(|s| s.local_addr())
    }

    fn connect_peer(&self, peer: SocketAddr) -> io::Result<()> {
        match self.peer.lock() {
            Ok(mut p) => *p = Some(peer),
            Err(poisoned) => *poisoned.into_inner() = Some(peer),
        }
        Ok(())
    }

    fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<()> {
        self.sock(|s| s.send_to(data, peer)).map(|_| ())
    }
}

pub(crate) fn spawn_acceptor(
    listener: TcpListener,
    layer: Weak<LayerInner>,
    id: SocketId,
) -> io::Result<Task> {
    Task::spawn(format!("socket{id}"), move || loop {
        let (stream, peer) = match listener.accept() {
            Ok(s) => s,
            Err(e) => {
                // a persistent failure (out of fds) must not spin
                error!("socket: accept on {id} failed, err={e}");
                coroutine::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };
        let layer = match SocketLayer::upgrade(&layer) {
            Some(l) => l,
            None => break,
        };
        let new_id = match layer.adopt(stream) {
            Ok(new_id) => new_id,
            Err(e) => {
                error!("socket: adopt accepted stream failed, err={e}");
                continue;
            }
        };
        if !layer.deliver(id, SocketEvent::Accept(new_id, peer)) {
            layer.close(new_id);
            break;
        }
    })
}
