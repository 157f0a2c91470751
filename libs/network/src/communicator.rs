//! Communicator
//!
//! Identity of one group member (rank, name, world size, data channel count)
//! together with its peer registry and multiplexer. Exposes the three
//! primitives everything above is written in terms of:
//!
//! - [`Communicator::send_to`]: one peer, one channel
//! - [`Communicator::send_all`]: every peer, one send thread per channel
//! - [`Communicator::probe`]: one round of the event loop, dispatching
//!   frames by category to a [`Dispatch`] implementation

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use codec::{Category, Message, ALL};
use parking_lot::{MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::multiplexer::{Network, Wakeup};
use crate::registry::{ChannelSelector, Connections, Rank};
use crate::{Result, TransportError};

/// Return value of a data callback: `false` stops the current probe round
pub trait Proceed {
    fn proceed(self) -> bool;
}

impl Proceed for () {
    fn proceed(self) -> bool {
        true
    }
}

impl Proceed for bool {
    fn proceed(self) -> bool {
        self
    }
}

/// Hooks invoked by [`Communicator::probe`]
///
/// Only control frames must be handled; the other hooks default to refusing
/// unsolicited connections, dropping output and forgetting dead peers.
pub trait Dispatch {
    /// A Control frame is waiting on `channel`; `Ok(false)` ends the round
    fn process_control(&mut self, comm: &Communicator, channel: Channel) -> Result<bool>;

    /// A new inbound connection was accepted
    fn process_incoming(&mut self, _comm: &Communicator, channel: Channel) -> Result<()> {
        channel.close();
        Err(TransportError::protocol(
            "inbound connection where none was expected",
        ))
    }

    /// An Output frame is waiting on `channel`
    fn process_output(&mut self, _comm: &Communicator, channel: Channel) -> Result<()> {
        channel.discard()
    }

    /// The peer on the other end of `channel` has gone away
    fn process_disconnected(&mut self, comm: &Communicator, channel: Channel) -> Result<()> {
        if let Some(peer) = comm.connections().owner_of(&channel) {
            debug!(peer = %peer.describe(), "Forgetting disconnected peer");
            comm.connections().erase(peer.rank());
        }
        Ok(())
    }
}

pub struct Communicator {
    rank: AtomicU8,
    world_size: AtomicUsize,
    data_channels: AtomicUsize,
    name: RwLock<String>,
    connections: Connections,
    network: Network,
}

impl Communicator {
    pub fn new(name: impl Into<String>, network: Network) -> Self {
        Self {
            rank: AtomicU8::new(0),
            world_size: AtomicUsize::new(0),
            data_channels: AtomicUsize::new(0),
            name: RwLock::new(name.into()),
            connections: Connections::new(),
            network,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank.load(Ordering::Relaxed)
    }

    pub fn set_rank(&self, rank: Rank) {
        self.rank.store(rank, Ordering::Relaxed);
    }

    /// Number of group members, the master excluded
    pub fn world_size(&self) -> usize {
        self.world_size.load(Ordering::Relaxed)
    }

    pub fn set_world_size(&self, size: usize) {
        self.world_size.store(size, Ordering::Relaxed);
    }

    /// Data channels opened between every pair of peers
    pub fn data_channels(&self) -> usize {
        self.data_channels.load(Ordering::Relaxed)
    }

    pub fn set_data_channels(&self, count: usize) {
        self.data_channels.store(count, Ordering::Relaxed);
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Send to one peer; `Ok(false)` when the peer or channel is unknown
    pub fn send_to(
        &self,
        rank: Rank,
        message: &mut Message,
        selector: ChannelSelector,
    ) -> Result<bool> {
        let Some(peer) = self.connections.find(rank) else {
            return Ok(false);
        };
        let channels = peer.channels(selector);
        if channels.is_empty() {
            return Ok(false);
        }

        message.set_from(self.rank());
        message.set_to(rank);
        for channel in &channels {
            channel.send(message)?;
        }
        Ok(true)
    }

    /// Broadcast to every other peer; true only if every send succeeded
    pub fn send_all(&self, message: &mut Message, selector: ChannelSelector) -> bool {
        match self.try_send_all(message, selector) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Broadcast incomplete");
                false
            }
        }
    }

    /// Broadcast to every other peer, reporting how many sends failed
    pub fn try_send_all(&self, message: &mut Message, selector: ChannelSelector) -> Result<()> {
        let channels = self.connections.channels(selector, Some(self.rank()));
        self.send_all_to(message, &channels)
    }

    /// Broadcast to a prebuilt channel list, one scoped thread per channel
    pub fn send_all_to(&self, message: &mut Message, channels: &[Channel]) -> Result<()> {
        message.set_from(self.rank());
        message.set_to(ALL);
        let message: &Message = message;

        let failed = match channels {
            [] => 0,
            [channel] => usize::from(report(channel, channel.send(message))),
            _ => std::thread::scope(|scope| {
                let sends = channels
                    .iter()
                    .map(|channel| (channel, scope.spawn(move || channel.send(message))))
                    .collect::<Vec<_>>();
                sends
                    .into_iter()
                    .map(|(channel, send)| {
                        let outcome = send.join().unwrap_or_else(|_| {
                            Err(TransportError::protocol("broadcast sender panicked"))
                        });
                        report(channel, outcome)
                    })
                    .filter(|&failed| failed)
                    .count()
            }),
        };

        if failed == 0 {
            Ok(())
        } else {
            Err(TransportError::Broadcast {
                failed,
                total: channels.len(),
            })
        }
    }

    /// One round of the event loop
    ///
    /// Waits up to `timeout` for activity on `channels` (and on the listener
    /// when `listen` is set), then routes every ready channel: closed ones to
    /// [`Dispatch::process_disconnected`], Data frames to `on_data`, Control
    /// and Output frames to their hooks. Returns the number of Data frames
    /// handed to `on_data`.
    pub fn probe<D, F, R>(
        &self,
        dispatch: &mut D,
        channels: &[Channel],
        mut on_data: F,
        timeout: Option<Duration>,
        listen: bool,
    ) -> Result<usize>
    where
        D: Dispatch + ?Sized,
        F: FnMut(Channel) -> R,
        R: Proceed,
    {
        let _reading: Vec<MutexGuard<'_, ()>> =
            channels.iter().map(|channel| channel.read_lock()).collect();

        let mut delivered = 0;
        match self.network.poll(channels, listen, timeout)? {
            Wakeup::Timeout => {}
            Wakeup::Incoming => {
                let channel = self.network.accept()?;
                dispatch.process_incoming(self, channel)?;
            }
            Wakeup::Ready(ready) => {
                for channel in ready {
                    if channel.closed() {
                        dispatch.process_disconnected(self, channel)?;
                        continue;
                    }

                    let head = channel.peek()?;
                    let proceed = match Category::from_byte(head.category) {
                        Ok(Category::Data) => {
                            delivered += 1;
                            on_data(channel).proceed()
                        }
                        Ok(Category::Control) => dispatch.process_control(self, channel)?,
                        Ok(Category::Output) => {
                            dispatch.process_output(self, channel)?;
                            true
                        }
                        Err(e) => {
                            warn!(rank = channel.rank(), error = %e, "Dropping frame");
                            channel.discard()?;
                            true
                        }
                    };
                    if !proceed {
                        break;
                    }
                }
            }
        }
        Ok(delivered)
    }
}

fn report(channel: &Channel, outcome: Result<()>) -> bool {
    match outcome {
        Ok(()) => false,
        Err(e) => {
            warn!(rank = channel.rank(), error = %e, "Broadcast send failed");
            true
        }
    }
}
