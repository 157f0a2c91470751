//! Stream Channel
//!
//! One connected stream socket (TCP between machines, Unix socket pair for
//! the rope) carrying whole frames. Sends are a single vectored `sendmsg`
//! under the channel's write lock; receives peek the head, read the length
//! words, then pull every segment with one vectored `recvmsg`. Partial
//! transfers are errors, never silent truncation.

use std::io::{IoSlice, IoSliceMut};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codec::{decode_lengths, Head, Message, HEAD_SIZE};
use nix::errno::Errno;
use nix::sys::socket::{recv, recvmsg, sendmsg, MsgFlags};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{Result, TransportError};

/// Shared handle to a channel
pub type Channel = Arc<Socket>;

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(stream) => stream.as_fd(),
            Stream::Unix(stream) => stream.as_fd(),
        }
    }

    fn set_timeouts(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
            Stream::Unix(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
        }
    }

    fn shutdown(&self, how: Shutdown) -> std::io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.shutdown(how),
            Stream::Unix(stream) => stream.shutdown(how),
        }
    }
}

/// One connection plus the rank of the peer on the other end
pub struct Socket {
    stream: Stream,
    address: Option<SocketAddr>,
    rank: AtomicU8,
    closed: AtomicBool,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl Socket {
    /// Wrap a connected TCP stream, applying the I/O timeout
    pub fn from_tcp(stream: TcpStream, timeout: Option<Duration>) -> Result<Self> {
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::from_io("set TCP_NODELAY", e))?;
        let address = stream.peer_addr().ok();
        let socket = Self::new(Stream::Tcp(stream), address);
        socket.set_timeout(timeout)?;
        Ok(socket)
    }

    /// Wrap one end of a local socket pair
    pub fn from_unix(stream: UnixStream, timeout: Option<Duration>) -> Result<Self> {
        let socket = Self::new(Stream::Unix(stream), None);
        socket.set_timeout(timeout)?;
        Ok(socket)
    }

    fn new(stream: Stream, address: Option<SocketAddr>) -> Self {
        Self {
            stream,
            address,
            rank: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    /// Resolve `address` and connect to the first candidate that answers
    ///
    /// Each candidate gets the full `connect_timeout`; the resulting socket is
    /// blocking with `io_timeout` applied to sends and receives.
    pub fn connect(
        address: &str,
        connect_timeout: Duration,
        io_timeout: Option<Duration>,
    ) -> Result<Self> {
        let candidates = address
            .to_socket_addrs()
            .map_err(|e| TransportError::system(format!("resolve {}", address), e))?;

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, connect_timeout) {
                Ok(stream) => {
                    debug!(peer = %candidate, "Connected");
                    return Self::from_tcp(stream, io_timeout);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    last_error = Some(TransportError::timeout(
                        candidate.to_string(),
                        connect_timeout.as_millis() as u64,
                    ));
                }
                Err(e) => {
                    last_error = Some(TransportError::from_io(format!("connect {}", candidate), e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::system(
                format!("resolve {}", address),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address candidates"),
            )
        }))
    }

    fn raw(&self) -> RawFd {
        self.stream.as_fd().as_raw_fd()
    }

    pub fn rank(&self) -> u8 {
        self.rank.load(Ordering::Relaxed)
    }

    pub fn set_rank(&self, rank: u8) {
        self.rank.store(rank, Ordering::Relaxed);
    }

    /// Remote address for TCP channels
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream
            .set_timeouts(timeout)
            .map_err(|e| TransportError::from_io("set socket timeout", e))
    }

    /// Held by the dispatcher while it decides how to consume this channel
    pub fn read_lock(&self) -> MutexGuard<'_, ()> {
        self.read_lock.lock()
    }

    fn recv(&self, buffer: &mut [u8], flags: MsgFlags, operation: &str) -> Result<usize> {
        loop {
            match recv(self.raw(), buffer, flags) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(TransportError::from_errno(operation, errno)),
            }
        }
    }

    /// Read the fixed head without consuming it
    pub fn peek(&self) -> Result<Head> {
        let mut head = [0u8; HEAD_SIZE];
        let n = self.recv(
            &mut head,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_WAITALL,
            "peek head",
        )?;
        if n == 0 {
            return Err(TransportError::aborted("peek head: peer closed the connection"));
        }
        if n != HEAD_SIZE {
            return Err(TransportError::transfer("peek head", HEAD_SIZE, n));
        }
        Ok(Head::decode(&head)?)
    }

    /// Receive one whole frame into freshly allocated, exactly sized buffers
    pub fn receive(&self) -> Result<Message> {
        let head = self.peek()?;

        let mut header = vec![0u8; head.header_size()];
        let n = self.recv(&mut header, MsgFlags::MSG_WAITALL, "receive header")?;
        if n != header.len() {
            return Err(TransportError::transfer("receive header", header.len(), n));
        }

        let lengths = decode_lengths(&header[HEAD_SIZE..], head.segment_count())?;
        let expected: usize = lengths.iter().map(|&len| len as usize).sum();
        let mut segments: Vec<Vec<u8>> = lengths
            .iter()
            .map(|&len| vec![0u8; len as usize])
            .collect();

        if expected > 0 {
            let received = {
                let mut slices: Vec<IoSliceMut<'_>> = segments
                    .iter_mut()
                    .map(|segment| IoSliceMut::new(segment))
                    .collect();
                self.recvmsg_all(&mut slices)?
            };
            if received != expected {
                return Err(TransportError::transfer("receive segments", expected, received));
            }
        }

        trace!(
            rank = self.rank(),
            segments = head.segment_count(),
            bytes = expected,
            "Received frame"
        );
        Ok(Message::from_parts(head, segments))
    }

    fn recvmsg_all(&self, slices: &mut [IoSliceMut<'_>]) -> Result<usize> {
        loop {
            match recvmsg::<()>(self.raw(), slices, None, MsgFlags::MSG_WAITALL) {
                Ok(received) => return Ok(received.bytes),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(TransportError::from_errno("receive segments", errno)),
            }
        }
    }

    /// Receive a frame and drop it
    pub fn discard(&self) -> Result<()> {
        let message = self.receive()?;
        debug!(
            rank = self.rank(),
            category = message.raw_category(),
            tag = message.tag(),
            "Discarded frame"
        );
        Ok(())
    }

    /// Send one whole frame; a short write is an error
    pub fn send(&self, message: &Message) -> Result<()> {
        let header = message.encode_header()?;
        let mut slices = Vec::with_capacity(message.count() + 1);
        slices.push(IoSlice::new(&header));
        slices.extend(message.segments().iter().map(|segment| IoSlice::new(segment)));
        let expected = message.encoded_size();

        let _guard = self.write_lock.lock();
        let sent = loop {
            match sendmsg::<()>(self.raw(), &slices, &[], MsgFlags::MSG_NOSIGNAL, None) {
                Ok(sent) => break sent,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(TransportError::from_errno("send frame", errno)),
            }
        };
        if sent != expected {
            return Err(TransportError::transfer("send frame", expected, sent));
        }

        trace!(rank = self.rank(), bytes = sent, "Sent frame");
        Ok(())
    }

    /// Best-effort send for notifications whose failure changes nothing
    pub fn send_quiet(&self, message: &Message) -> bool {
        match self.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(rank = self.rank(), error = %e, "Best-effort send failed");
                false
            }
        }
    }

    /// Peer has closed its end (or the socket is unusable)
    pub fn closed(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        let mut probe = [0u8; 1];
        match recv(
            self.raw(),
            &mut probe,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(0) => true,
            Ok(_) => false,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => false,
            Err(_) => true,
        }
    }

    /// Shut the connection down in both directions; repeated calls are no-ops
    ///
    /// After a fork the socket is shared with the other process, so code that
    /// only wants to release its own copy drops the channel instead.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                debug!(rank = self.rank(), error = %e, "Shutdown of closing channel failed");
            }
        }
    }

    /// Shut down one direction of the connection
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.stream
            .shutdown(how)
            .map_err(|e| TransportError::from_io("shutdown", e))
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.raw())
            .field("rank", &self.rank())
            .field("address", &self.address)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Create a connected local pair of channels
pub fn socket_pair(timeout: Option<Duration>) -> Result<(Socket, Socket)> {
    let (left, right) =
        UnixStream::pair().map_err(|e| TransportError::from_io("create socket pair", e))?;
    Ok((
        Socket::from_unix(left, timeout)?,
        Socket::from_unix(right, timeout)?,
    ))
}

/// Append the default port to a bare host
pub fn with_default_port(host: &str, port: u16) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match host.rsplit_once(':') {
        Some((name, service)) if !name.contains(':') && service.parse::<u16>().is_ok() => {
            host.to_string()
        }
        _ => format!("{}:{}", host, port),
    }
}
