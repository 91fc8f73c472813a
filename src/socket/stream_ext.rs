use std::io::{self, Read, Write};
use std::net::Shutdown;

/// Stream Extension
///
/// what the socket layer needs from a connected stream it adopts
pub trait StreamExt: Sized + Read + Write + Send + 'static {
    /// try clone the stream
    fn try_clone(&self) -> io::Result<Self>;
    /// close both directions, a blocked reader sees the end of stream
    fn shutdown(&self) -> io::Result<()>;
    /// disable nagle where the stream supports it
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;
}

impl StreamExt for may::net::TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        (*self).try_clone()
    }
    fn shutdown(&self) -> io::Result<()> {
        (*self).shutdown(Shutdown::Both)
    }
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        (*self).set_nodelay(nodelay)
    }
}

#[cfg(unix)]
impl StreamExt for may::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        (*self).try_clone()
    }
    fn shutdown(&self) -> io::Result<()> {
        (*self).shutdown(Shutdown::Both)
    }
    fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
        Ok(())
    }
}
