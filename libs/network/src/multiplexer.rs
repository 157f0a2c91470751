//! Readiness Multiplexer
//!
//! Owns the optional listening socket of a process and polls it together with
//! a set of channels. A wake-up is classified as [`Wakeup::Timeout`],
//! [`Wakeup::Incoming`] or [`Wakeup::Ready`]; incoming connections take
//! precedence and readable channels stay readable for the next poll.

use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::channel::{socket_pair, with_default_port, Channel, Socket};
use crate::{Result, TransportError};

/// Outcome of one [`Network::poll`]
#[derive(Debug)]
pub enum Wakeup {
    Timeout,
    Incoming,
    Ready(Vec<Channel>),
}

/// Timeouts applied to channels this network creates
#[derive(Debug, Clone, Copy)]
pub struct NetworkTimeouts {
    pub connect: Duration,
    pub io: Option<Duration>,
}

impl Default for NetworkTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(crate::DEFAULT_CONNECTION_TIMEOUT_SECS),
            io: Some(Duration::from_secs(crate::DEFAULT_IO_TIMEOUT_SECS)),
        }
    }
}

pub struct Network {
    port: u16,
    listener: Mutex<Option<TcpListener>>,
    timeouts: NetworkTimeouts,
}

impl Network {
    /// Bind a listener on all interfaces; port 0 picks an ephemeral port
    pub fn bind(port: u16, timeouts: NetworkTimeouts) -> Result<Self> {
        // std sets SO_REUSEADDR on Unix listeners.
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| TransportError::system(format!("bind port {}", port), e))?;
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::system("query bound address", e))?
            .port();

        info!(port, "Listening for group members");
        Ok(Self {
            port,
            listener: Mutex::new(Some(listener)),
            timeouts,
        })
    }

    /// A network that only makes outbound connections
    pub fn unbound(port: u16, timeouts: NetworkTimeouts) -> Self {
        Self {
            port,
            listener: Mutex::new(None),
            timeouts,
        }
    }

    /// Bound port, or the default port used for outbound connects
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeouts(&self) -> NetworkTimeouts {
        self.timeouts
    }

    pub fn is_listening(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Stop accepting connections; the descriptor is released, not shut down
    pub fn unbind(&self) {
        if self.listener.lock().take().is_some() {
            debug!(port = self.port, "Listener released");
        }
    }

    pub fn self_address(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Wait until a channel is readable, a connection is pending, or `timeout`
    ///
    /// `None` waits without bound. Hang-ups and errors count as readable so
    /// the caller can notice closed channels.
    pub fn poll(
        &self,
        channels: &[Channel],
        listen: bool,
        timeout: Option<Duration>,
    ) -> Result<Wakeup> {
        let guard = self.listener.lock();
        let listener = guard.as_ref().filter(|_| listen);

        let mut fds = Vec::with_capacity(channels.len() + 1);
        if let Some(listener) = listener {
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        }
        fds.extend(
            channels
                .iter()
                .map(|channel| PollFd::new(channel.as_fd(), PollFlags::POLLIN)),
        );

        let ready = loop {
            match poll(&mut fds, poll_timeout(timeout)) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(TransportError::from_errno("poll", errno)),
            }
        };
        if ready == 0 {
            return Ok(Wakeup::Timeout);
        }

        let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let is_ready = |fd: &PollFd<'_>| fd.revents().map_or(false, |r| r.intersects(wake));

        let offset = usize::from(listener.is_some());
        if listener.is_some() && is_ready(&fds[0]) {
            return Ok(Wakeup::Incoming);
        }

        let ready = fds[offset..]
            .iter()
            .zip(channels)
            .filter(|(fd, _)| is_ready(fd))
            .map(|(_, channel)| channel.clone())
            .collect::<Vec<_>>();
        if ready.is_empty() {
            Ok(Wakeup::Timeout)
        } else {
            Ok(Wakeup::Ready(ready))
        }
    }

    /// Accept the next pending connection
    pub fn accept(&self) -> Result<Channel> {
        let guard = self.listener.lock();
        let listener = guard
            .as_ref()
            .ok_or_else(|| TransportError::protocol("accept on a network without listener"))?;
        let (stream, peer) = listener
            .accept()
            .map_err(|e| TransportError::from_io("accept", e))?;

        debug!(%peer, "Accepted connection");
        Ok(Channel::new(Socket::from_tcp(stream, self.timeouts.io)?))
    }

    /// Connect to `host`, appending this network's port when none is given
    pub fn connect(&self, host: &str) -> Result<Channel> {
        let address = with_default_port(host, self.port);
        Ok(Channel::new(Socket::connect(
            &address,
            self.timeouts.connect,
            self.timeouts.io,
        )?))
    }

    /// Local duplex channel pair
    pub fn socket_pair(&self) -> Result<(Channel, Channel)> {
        let (left, right) = socket_pair(self.timeouts.io)?;
        Ok((Channel::new(left), Channel::new(right)))
    }
}

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(timeout) => {
            let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Message;

    fn timeouts() -> NetworkTimeouts {
        NetworkTimeouts {
            connect: Duration::from_secs(2),
            io: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_poll_times_out_without_activity() {
        let network = Network::unbound(0, timeouts());
        let (left, _right) = network.socket_pair().unwrap();
        let wakeup = network
            .poll(&[left], false, Some(Duration::from_millis(20)))
            .unwrap();
        assert!(matches!(wakeup, Wakeup::Timeout));
    }

    #[test]
    fn test_poll_reports_ready_channels() {
        let network = Network::unbound(0, timeouts());
        let (a, a_peer) = network.socket_pair().unwrap();
        let (b, _b_peer) = network.socket_pair().unwrap();
        a_peer.send(&Message::data(1)).unwrap();

        match network
            .poll(&[a.clone(), b], false, Some(Duration::from_secs(1)))
            .unwrap()
        {
            Wakeup::Ready(ready) => {
                assert_eq!(ready.len(), 1);
                assert!(Channel::ptr_eq(&ready[0], &a));
            }
            other => panic!("expected ready channel, got {:?}", other),
        }
    }

    #[test]
    fn test_hangup_wakes_poll() {
        let network = Network::unbound(0, timeouts());
        let (left, right) = network.socket_pair().unwrap();
        drop(right);
        match network
            .poll(&[left.clone()], false, Some(Duration::from_secs(1)))
            .unwrap()
        {
            Wakeup::Ready(ready) => assert!(ready[0].closed()),
            other => panic!("expected hang-up, got {:?}", other),
        }
    }

    #[test]
    fn test_incoming_connection_and_accept() {
        let server = Network::bind(0, timeouts()).unwrap();
        assert!(server.is_listening());
        let client = Network::unbound(server.port(), timeouts());
        let outbound = client.connect("127.0.0.1").unwrap();

        let wakeup = server.poll(&[], true, Some(Duration::from_secs(2))).unwrap();
        assert!(matches!(wakeup, Wakeup::Incoming));

        let inbound = server.accept().unwrap();
        outbound.send(&Message::data(42)).unwrap();
        assert_eq!(inbound.receive().unwrap().tag(), 42);
        assert!(inbound.peer_address().is_some());
    }

    #[test]
    fn test_unbind_stops_listening() {
        let server = Network::bind(0, timeouts()).unwrap();
        assert!(server.self_address().is_some());
        server.unbind();
        assert!(!server.is_listening());
        assert!(server.self_address().is_none());
        assert!(server.accept().is_err());
    }

    #[test]
    fn test_connect_refused_is_reported() {
        let server = Network::bind(0, timeouts()).unwrap();
        let port = server.port();
        drop(server);
        let client = Network::unbound(port, timeouts());
        assert!(client.connect("127.0.0.1").is_err());
    }
}
