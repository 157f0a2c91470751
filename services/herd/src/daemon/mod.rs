//! # Daemon
//!
//! One per machine. Waits in a single-threaded event loop for a client to
//! enslave it, joins the full mesh the client orchestrates, forks into a
//! supervising parent and a grouped child, and runs the workload in the child
//! with its output shipped to the client.
//!
//! ```text
//! Free ─Enslave─> Enslaved ─Peers─> FormingGroup ─Grouped─┬─> Supervising (parent)
//!  ^                 │                   │                └─> Grouped (child) ─Run/Start─> Running
//!  └───Disconnect────┘           PrepareToLeave ──> Leaving ─Leave─> Free / exit
//! ```
//!
//! Any transport failure or protocol violation inside the loop resets the
//! daemon to Free after a best-effort notification of every known peer.

mod context;
mod handlers;
mod supervision;

use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use codec::{Code, Message, OutputStream, MASTER};
use herd_config::{HerdConfig, WorkloadConfig};
use network::{
    Channel, ChannelSelector, Communicator, Network, NetworkTimeouts, Redirector, Result,
    TransportError,
};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn, Span};

use crate::status::{DaemonState, DaemonStatus};

pub use context::Context;
use context::ChannelCache;

/// Program a grouped child runs: receives the worker context and the argument
/// vector from the Run request, returns the exit code reported in Done
pub type Entry = Box<dyn FnMut(&Context<'_>, &[String]) -> i32 + Send>;

pub struct Daemon {
    comm: Communicator,
    machine: Machine,
}

/// State and process bookkeeping of a daemon, separate from its communicator
/// so the event loop can lend both out at once
pub(crate) struct Machine {
    state: DaemonState,
    rope: Option<Channel>,
    child: Option<Pid>,
    forked: bool,
    cache: Option<ChannelCache>,
    initial_data: Vec<Vec<u8>>,
    pending: Option<Vec<String>>,
    exit: Option<i32>,
    span: Span,
    poll: Duration,
    child_grace: Duration,
    workload: WorkloadConfig,
    entry: Entry,
}

impl Daemon {
    /// Bind the configured port and prepare to be enslaved
    pub fn new(config: &HerdConfig, entry: Entry) -> Result<Self> {
        let timeouts = NetworkTimeouts {
            connect: config.timeouts.connect(),
            io: config.timeouts.io(),
        };
        let network = Network::bind(config.port, timeouts)?;
        let name = config.name.clone().unwrap_or_else(host_name);

        Ok(Self {
            comm: Communicator::new(name, network),
            machine: Machine {
                state: DaemonState::Free,
                rope: None,
                child: None,
                forked: false,
                cache: None,
                initial_data: Vec::new(),
                pending: None,
                exit: None,
                span: Span::none(),
                poll: config.timeouts.poll(),
                child_grace: config.timeouts.child_grace(),
                workload: config.workload.clone(),
                entry,
            },
        })
    }

    /// Port the daemon listens on
    pub fn port(&self) -> u16 {
        self.comm.network().port()
    }

    pub fn state(&self) -> DaemonState {
        self.machine.state
    }

    /// Serve until asked to shut down; returns the process exit code
    ///
    /// A forked child never returns: it exits the process when it leaves the
    /// group or fails.
    pub fn run(&mut self) -> i32 {
        info!(
            port = self.port(),
            name = %self.comm.name(),
            "Daemon waiting for a master"
        );

        loop {
            let span = self.machine.span.clone();
            let _entered = span.enter();

            if let Some(code) = self.machine.exit {
                if self.machine.forked {
                    info!(code, "Child exiting");
                    let _ = std::io::stdout().flush();
                    std::process::exit(code);
                }
                info!(code, "Daemon shutting down");
                return code;
            }

            let channels = self.machine.watched(&self.comm);
            let listen = self.comm.network().is_listening();
            let poll = self.machine.poll;
            let outcome = self.comm.probe(
                &mut self.machine,
                &channels,
                |channel: Channel| {
                    warn!(rank = channel.rank(), "Dropping data frame outside a run");
                    channel.discard().is_ok()
                },
                Some(poll),
                listen,
            );
            drop(channels);

            if let Err(e) = outcome {
                error!(
                    error = %e,
                    state = %self.machine.state,
                    "Event loop failed, resetting"
                );
                self.machine.reset(&self.comm, None);
            }

            if let Some(argv) = self.machine.pending.take() {
                self.machine.run_main(&self.comm, argv);
            }
        }
    }
}

impl Machine {
    /// Channels the event loop waits on: the rope and every master channel
    fn watched(&self, comm: &Communicator) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.rope.iter().cloned().collect();
        channels.extend(comm.connections().channels(ChannelSelector::Master, None));
        channels
    }

    fn is_rope(&self, channel: &Channel) -> bool {
        self.rope
            .as_ref()
            .map_or(false, |rope| std::sync::Arc::ptr_eq(rope, channel))
    }

    pub(crate) fn status(&self, comm: &Communicator) -> DaemonStatus {
        DaemonStatus {
            state: self.state,
            rank: i32::from(comm.rank()),
            world_size: comm.world_size() as i32,
            peers: comm.connections().len() as i32,
            data_lines: comm.connections().open_data_lines() as i32,
            child: self.child.map(Pid::as_raw),
        }
    }

    /// Tell every peer about the failure, then fall back to Free
    ///
    /// With a culprit the notice is Renegade naming it, otherwise Error.
    pub(crate) fn reset(&mut self, comm: &Communicator, culprit: Option<String>) {
        let mut notice = match &culprit {
            Some(address) => {
                warn!(culprit = %address, state = %self.state, "Reset caused by peer");
                let mut notice = Message::control(Code::Renegade);
                notice.add(address.as_bytes().to_vec());
                notice
            }
            None => {
                warn!(state = %self.state, "Reset");
                Message::control(Code::Error)
            }
        };
        comm.send_all(&mut notice, ChannelSelector::Master);

        if self.forked {
            self.exit = self.exit.or(Some(1));
        }
        self.set_default(comm);
    }

    /// Forget the group and return to Free
    pub(crate) fn set_default(&mut self, comm: &Communicator) {
        comm.connections().clear();
        self.rope = None;
        self.cache = None;
        self.initial_data.clear();
        self.pending = None;
        if self.forked {
            self.exit = self.exit.or(Some(0));
        }
        self.state = DaemonState::Free;
        if let Some(child) = self.child.take() {
            supervision::reap(child, self.child_grace);
        }
        comm.set_rank(0);
        comm.set_world_size(0);
        comm.set_data_channels(0);
        debug!("Back to free");
    }

    /// Execute the entry with redirected output and report Done to the master
    fn run_main(&mut self, comm: &Communicator, argv: Vec<String>) {
        info!(argv = ?argv, "Starting workload");
        self.state = DaemonState::Running;

        let code = match self.execute(comm, &argv) {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Workload could not run");
                self.reset(comm, None);
                return;
            }
        };

        self.state = DaemonState::Grouped;
        info!(code, "Workload finished");
        let mut done = Message::control(Code::Done);
        let outcome = done
            .push_i32(code)
            .map_err(TransportError::from)
            .and_then(|done| comm.send_to(MASTER, done, ChannelSelector::Master));
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                error!("Master vanished before Done");
                self.reset(comm, None);
            }
            Err(e) => {
                error!(error = %e, "Reporting Done failed");
                self.reset(comm, None);
            }
        }
    }

    fn execute(&mut self, comm: &Communicator, argv: &[String]) -> Result<i32> {
        let master = comm
            .connections()
            .find(MASTER)
            .and_then(|peer| peer.master())
            .ok_or_else(|| TransportError::protocol("no master to report to"))?;
        let cache = self
            .cache
            .get_or_insert_with(|| ChannelCache::build(comm))
            .clone();

        let mut stdout = Redirector::new(
            OutputStream::Standard.fd(),
            forward(master.clone(), OutputStream::Standard),
        )?;
        let mut stderr = Redirector::new(
            OutputStream::Error.fd(),
            forward(master, OutputStream::Error),
        )?;

        let context = Context::new(comm, cache, &self.initial_data, &self.workload, self.poll);
        let entry = &mut self.entry;
        let code = catch_unwind(AssertUnwindSafe(|| (entry)(&context, argv))).unwrap_or(101);

        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        stdout.stop()?;
        stderr.stop()?;
        Ok(code)
    }
}

/// Output handler shipping captured bytes to the master
fn forward(master: Channel, stream: OutputStream) -> impl FnMut(&[u8]) + Send + 'static {
    move |bytes: &[u8]| {
        let mut message = Message::output(stream);
        message.add(bytes.to_vec());
        // Not logged: stderr may be the pipe feeding this handler.
        let _ = master.send(&message);
    }
}

fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
