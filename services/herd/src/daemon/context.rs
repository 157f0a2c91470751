//! Worker context
//!
//! What a workload sees of the group while it runs in the grouped child:
//! its rank, the world size, the initial data and the three communication
//! primitives. Channel lists are cached by role when the child is born, the
//! registry does not change while grouped.

use std::time::Duration;

use codec::{Code, Message, MASTER};
use herd_config::WorkloadConfig;
use network::{
    Channel, ChannelSelector, Communicator, Dispatch, Proceed, Rank, Result, TransportError, Wakeup,
};
use tracing::{debug, warn};

/// Channels of the other workers grouped by role; the master is kept apart
#[derive(Clone, Default)]
pub(crate) struct ChannelCache {
    master: Option<Channel>,
    control: Vec<Channel>,
    data: Vec<Vec<Channel>>,
    all_data: Vec<Channel>,
}

impl ChannelCache {
    pub(crate) fn build(comm: &Communicator) -> Self {
        let peers = comm
            .connections()
            .values()
            .into_iter()
            .filter(|peer| peer.rank() != MASTER && peer.rank() != comm.rank())
            .collect::<Vec<_>>();

        let data = (0..comm.data_channels())
            .map(|index| peers.iter().filter_map(|peer| peer.data(index)).collect())
            .collect();

        Self {
            master: comm.connections().find(MASTER).and_then(|peer| peer.master()),
            control: peers.iter().filter_map(|peer| peer.master()).collect(),
            data,
            all_data: peers.iter().flat_map(|peer| peer.data_channels()).collect(),
        }
    }

    fn get(&self, selector: ChannelSelector) -> &[Channel] {
        match selector {
            ChannelSelector::Master => &self.control,
            ChannelSelector::Data(index) => self.data.get(index).map(Vec::as_slice).unwrap_or(&[]),
            ChannelSelector::AllData => &self.all_data,
        }
    }

    /// Channels a worker probe waits on: the selection plus every control
    /// channel, so group failures interrupt the wait
    fn probed(&self, selector: ChannelSelector) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.master.iter().cloned().collect();
        channels.extend(self.control.iter().cloned());
        if selector != ChannelSelector::Master {
            channels.extend(self.get(selector).iter().cloned());
        }
        channels
    }
}

pub struct Context<'a> {
    comm: &'a Communicator,
    cache: ChannelCache,
    initial_data: &'a [Vec<u8>],
    workload: &'a WorkloadConfig,
    poll: Duration,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        comm: &'a Communicator,
        cache: ChannelCache,
        initial_data: &'a [Vec<u8>],
        workload: &'a WorkloadConfig,
        poll: Duration,
    ) -> Self {
        Self {
            comm,
            cache,
            initial_data,
            workload,
            poll,
        }
    }

    /// Rank of this worker, 1..=world_size
    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    /// Number of workers in the group
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// Data channels between every pair of workers
    pub fn data_channels(&self) -> usize {
        self.comm.data_channels()
    }

    pub fn name(&self) -> String {
        self.comm.name()
    }

    /// Segments of the InitialData broadcast, empty when none was sent
    pub fn initial_data(&self) -> &[Vec<u8>] {
        self.initial_data
    }

    pub fn workload(&self) -> &WorkloadConfig {
        self.workload
    }

    /// Default wait of one probe round
    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    pub fn send_to(
        &self,
        rank: Rank,
        message: &mut Message,
        selector: ChannelSelector,
    ) -> Result<bool> {
        self.comm.send_to(rank, message, selector)
    }

    /// Send to every other worker; true only if every send succeeded
    pub fn send_all(&self, message: &mut Message, selector: ChannelSelector) -> bool {
        match self.comm.send_all_to(message, self.cache.get(selector)) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Worker broadcast incomplete");
                false
            }
        }
    }

    /// Wait up to `timeout` for the next frame from `rank` on one line
    ///
    /// Returns `None` when nothing arrived in time. Only for lines no probe
    /// of this worker is watching.
    pub fn receive_from(
        &self,
        rank: Rank,
        selector: ChannelSelector,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        let channel = self
            .comm
            .connections()
            .find(rank)
            .and_then(|peer| peer.channels(selector).into_iter().next())
            .ok_or_else(|| {
                TransportError::protocol(format!("no {:?} line to rank {}", selector, rank))
            })?;

        let _reading = channel.read_lock();
        match self
            .comm
            .network()
            .poll(std::slice::from_ref(&channel), false, Some(timeout))?
        {
            Wakeup::Ready(_) if channel.closed() => Err(TransportError::aborted(format!(
                "rank {} hung up during the run",
                rank
            ))),
            Wakeup::Ready(_) => channel.receive().map(Some),
            Wakeup::Timeout | Wakeup::Incoming => Ok(None),
        }
    }

    /// Wait for Data frames on the selected channels and hand them to `on_data`
    ///
    /// Control frames that arrive meanwhile are consumed; Error and Renegade
    /// abort with an error, as does a worker hanging up.
    pub fn probe<F, R>(
        &self,
        selector: ChannelSelector,
        on_data: F,
        timeout: Option<Duration>,
    ) -> Result<usize>
    where
        F: FnMut(Channel) -> R,
        R: Proceed,
    {
        let channels = self.cache.probed(selector);
        self.comm
            .probe(&mut WorkerDispatch, &channels, on_data, timeout, false)
    }
}

/// Event hooks while a workload owns the event loop
struct WorkerDispatch;

impl Dispatch for WorkerDispatch {
    fn process_control(&mut self, _comm: &Communicator, channel: Channel) -> Result<bool> {
        let message = channel.receive()?;
        match message.code()? {
            Code::Error => Err(TransportError::protocol(format!(
                "rank {} failed during the run",
                channel.rank()
            ))),
            Code::Renegade => {
                let culprit = message.reader().read_str().unwrap_or("unknown").to_string();
                Err(TransportError::protocol(format!(
                    "peer {} failed during the run",
                    culprit
                )))
            }
            code => {
                debug!(%code, rank = channel.rank(), "Control frame consumed during run");
                Ok(true)
            }
        }
    }

    fn process_disconnected(&mut self, _comm: &Communicator, channel: Channel) -> Result<()> {
        Err(TransportError::aborted(format!(
            "rank {} hung up during the run",
            channel.rank()
        )))
    }
}

impl std::fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCache")
            .field("master", &self.master.is_some())
            .field("control", &self.control.len())
            .field("data", &self.data.iter().map(Vec::len).collect::<Vec<_>>())
            .field("all_data", &self.all_data.len())
            .finish()
    }
}
