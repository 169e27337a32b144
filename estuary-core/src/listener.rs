//! Listener plumbing: binding configuration, the unified listener, and the
//! accepted-stream wrapper handed to the service stack.
use std::{io, net::SocketAddr};

use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{stream::Stream, AsyncReadRent, AsyncWriteRent, Split},
    net::{ListenerOpts, TcpListener, TcpStream},
    BufResult,
};
use service_async::MakeService;

/// Deferred bind: carries everything needed to (re)create a listener, so a
/// worker can build its own instance per reactor thread.
pub enum ListenerBuilder {
    Tcp {
        addr: SocketAddr,
        opts: ListenerOpts,
    },
    #[cfg(unix)]
    Unix {
        listener: std::os::unix::net::UnixListener,
    },
}

impl ListenerBuilder {
    pub fn bind_tcp(addr: SocketAddr, opts: ListenerOpts) -> io::Result<Self> {
        Ok(Self::Tcp { addr, opts })
    }

    #[cfg(unix)]
    pub fn bind_unix<P: AsRef<std::path::Path>>(path: P) -> io::Result<Self> {
        // a previous run may have left the socket file behind
        let _ = std::fs::remove_file(path.as_ref());
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        // the async UnixListener is built from this fd; the legacy driver
        // needs it non-blocking
        if monoio::utils::is_legacy() {
            listener.set_nonblocking(true)?;
        }
        Ok(Self::Unix { listener })
    }

    pub fn build(&self) -> io::Result<Listener> {
        match self {
            Self::Tcp { addr, opts } => {
                TcpListener::bind_with_config(addr, opts).map(Listener::Tcp)
            }
            #[cfg(unix)]
            Self::Unix { listener } => {
                let fd = listener.try_clone()?;
                monoio::net::UnixListener::from_std(fd).map(Listener::Unix)
            }
        }
    }
}

impl MakeService for ListenerBuilder {
    type Service = Listener;
    type Error = io::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}

/// Unified listener over the supported transports.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(monoio::net::UnixListener),
}

impl Listener {
    pub async fn accept(&mut self) -> io::Result<(AcceptedStream, AcceptedAddr)> {
        match self {
            Listener::Tcp(inner) => {
                let (stream, addr) = inner.accept().await?;
                Ok((AcceptedStream::Tcp(stream), AcceptedAddr::Tcp(addr)))
            }
            #[cfg(unix)]
            Listener::Unix(inner) => {
                let (stream, addr) = inner.accept().await?;
                Ok((AcceptedStream::Unix(stream), AcceptedAddr::Unix(addr)))
            }
        }
    }
}

impl Stream for Listener {
    type Item = io::Result<(AcceptedStream, AcceptedAddr)>;

    async fn next(&mut self) -> Option<Self::Item> {
        Some(self.accept().await)
    }
}

pub enum AcceptedStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}

#[derive(Debug, Clone)]
pub enum AcceptedAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(monoio::net::unix::SocketAddr),
}

impl From<SocketAddr> for AcceptedAddr {
    fn from(value: SocketAddr) -> Self {
        Self::Tcp(value)
    }
}

#[cfg(unix)]
impl From<monoio::net::unix::SocketAddr> for AcceptedAddr {
    fn from(value: monoio::net::unix::SocketAddr) -> Self {
        Self::Unix(value)
    }
}

unsafe impl Split for AcceptedStream {}

/// Forward an I/O call to whichever transport the stream wraps.
macro_rules! with_stream {
    ($self:expr, $io:ident => $call:expr) => {
        match $self {
            AcceptedStream::Tcp($io) => $call,
            #[cfg(unix)]
            AcceptedStream::Unix($io) => $call,
        }
    };
}

impl AsyncReadRent for AcceptedStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        with_stream!(self, io => io.read(buf).await)
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        with_stream!(self, io => io.readv(buf).await)
    }
}

impl AsyncWriteRent for AcceptedStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        with_stream!(self, io => io.write(buf).await)
    }

    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        with_stream!(self, io => io.writev(buf_vec).await)
    }

    async fn flush(&mut self) -> io::Result<()> {
        with_stream!(self, io => io.flush().await)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        with_stream!(self, io => io.shutdown().await)
    }
}
