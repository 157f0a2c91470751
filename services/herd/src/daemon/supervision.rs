//! Fork and rope handling
//!
//! A grouped daemon splits in two. The child keeps the group connections and
//! runs workloads; the parent keeps only its end of the rope, a local socket
//! pair, and returns to Free once the rope closes or is cut.

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use codec::Code;
use network::{Channel, Communicator, Result, TransportError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info, warn};

use super::context::ChannelCache;
use super::Machine;
use crate::exchange::reply;
use crate::logging;
use crate::status::DaemonState;

const REAP_INTERVAL: Duration = Duration::from_millis(10);

impl Machine {
    /// Acknowledge Grouped, then fork into supervisor and worker
    pub(super) fn fork_group(&mut self, comm: &Communicator, channel: &Channel) -> Result<()> {
        let (parent_end, child_end) = comm.network().socket_pair()?;
        reply(channel, Code::Ok)?;

        // Buffered output would otherwise be written by both processes.
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        // SAFETY: the event loop thread is the only one touching daemon state;
        // the child continues on that thread alone.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(parent_end);
                self.become_child(comm, child_end);
                Ok(())
            }
            Ok(ForkResult::Parent { child }) => {
                drop(child_end);
                self.become_parent(comm, parent_end, child);
                Ok(())
            }
            Err(errno) => Err(TransportError::from_errno("fork", errno)),
        }
    }

    fn become_child(&mut self, comm: &Communicator, rope: Channel) {
        comm.network().unbind();
        rope.set_rank(comm.rank());
        self.rope = Some(rope);
        self.forked = true;
        self.state = DaemonState::Grouped;
        self.cache = Some(ChannelCache::build(comm));
        self.span = logging::child_span(comm.rank());

        let _entered = self.span.enter();
        info!(peers = comm.connections().len(), "Child born");
    }

    fn become_parent(&mut self, comm: &Communicator, rope: Channel, child: Pid) {
        // Dropping releases this process' descriptors; the child's stay open.
        comm.connections().clear();
        rope.set_rank(comm.rank());
        self.rope = Some(rope);
        self.child = Some(child);
        self.state = DaemonState::Supervising;
        info!(%child, "Supervising child");
    }

    /// The child is leaving: acknowledge, let go of the rope, wait for it
    pub(super) fn cut_rope(&mut self, comm: &Communicator, channel: &Channel) -> Result<()> {
        if self.state != DaemonState::Supervising || !self.is_rope(channel) {
            warn!(state = %self.state, "CutRope from a bad source or at a bad moment");
            return reply(channel, Code::Refuse);
        }
        reply(channel, Code::Ok)?;
        self.rope = None;

        if let Some(child) = self.child.take() {
            wait(child);
        }
        info!("Rope cut, child gone");
        self.set_default(comm);
        Ok(())
    }

    /// A watched channel hung up
    pub(super) fn lost(&mut self, comm: &Communicator, channel: &Channel) -> Result<()> {
        match self.state {
            DaemonState::Leaving => {
                if self.is_rope(channel) {
                    self.rope = None;
                } else if let Some(peer) = comm.connections().owner_of(channel) {
                    debug!(peer = %peer.describe(), "Peer left first");
                    comm.connections().erase(peer.rank());
                }
                Ok(())
            }
            DaemonState::Supervising => {
                if self.is_rope(channel) {
                    warn!("Working child died");
                } else {
                    warn!("Connection other than the rope died while supervising");
                }
                self.set_default(comm);
                Ok(())
            }
            _ => {
                let who = comm
                    .connections()
                    .owner_of(channel)
                    .map(|peer| peer.describe())
                    .unwrap_or_else(|| "the rope".to_string());
                Err(TransportError::aborted(format!("connection to {} closed", who)))
            }
        }
    }
}

/// Collect a child that should be gone; SIGTERM, then SIGKILL after `grace`
pub(super) fn reap(child: Pid, grace: Duration) {
    if exited(child) {
        return;
    }

    debug!(%child, "Terminating child");
    if let Err(e) = kill(child, Signal::SIGTERM) {
        debug!(%child, error = %e, "SIGTERM failed");
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if exited(child) {
            return;
        }
        thread::sleep(REAP_INTERVAL);
    }

    warn!(%child, "Child ignored SIGTERM, killing");
    let _ = kill(child, Signal::SIGKILL);
    wait(child);
}

/// True once `child` has been collected (or is not ours to collect)
fn exited(child: Pid) -> bool {
    match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(status) => {
            debug!(?status, "Child collected");
            true
        }
        Err(Errno::EINTR) => false,
        Err(e) => {
            debug!(%child, error = %e, "waitpid failed");
            true
        }
    }
}

/// Block until `child` exits
fn wait(child: Pid) {
    loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => continue,
            Ok(status) => {
                debug!(?status, "Child collected");
                return;
            }
            Err(e) => {
                debug!(%child, error = %e, "waitpid failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_reap_terminates_lingering_child() {
        let sleeper = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(sleeper.id() as i32);

        let started = Instant::now();
        reap(pid, Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(exited(pid));
    }

    #[test]
    fn test_reap_collects_finished_child() {
        let quick = Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(quick.id() as i32);
        thread::sleep(Duration::from_millis(100));

        reap(pid, Duration::from_millis(100));
        assert!(exited(pid));
    }
}
