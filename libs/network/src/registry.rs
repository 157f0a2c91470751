//! Peer Registry
//!
//! Rank-keyed table of known peers. The event loop, broadcast helper threads
//! and the output redirection thread all read it, so every access goes through
//! one mutex. Iteration is in rank order, which the formation handshake relies
//! on when it pairs peers.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::channel::Channel;

/// Peer rank within a group; 0 is the master
pub type Rank = u8;

/// Shared handle to a registered peer
pub type Line = Arc<Peer>;

/// Which of a peer's channels an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelSelector {
    /// The control connection
    #[default]
    Master,
    /// One numbered data connection
    Data(usize),
    /// Every data connection of the peer
    AllData,
}

/// A known group member
pub struct Peer {
    rank: Rank,
    name: String,
    address: Option<SocketAddr>,
    master: Option<Channel>,
    data: RwLock<Vec<Option<Channel>>>,
}

impl Peer {
    /// Create a peer with `data_channels` empty data slots
    pub fn new(
        rank: Rank,
        name: impl Into<String>,
        address: Option<SocketAddr>,
        master: Option<Channel>,
        data_channels: usize,
    ) -> Self {
        if let Some(master) = &master {
            master.set_rank(rank);
        }
        Self {
            rank,
            name: name.into(),
            address,
            master,
            data: RwLock::new(vec![None; data_channels]),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn master(&self) -> Option<Channel> {
        self.master.clone()
    }

    pub fn data_slots(&self) -> usize {
        self.data.read().len()
    }

    pub fn data(&self, index: usize) -> Option<Channel> {
        self.data.read().get(index).cloned().flatten()
    }

    /// Attach a data channel to an empty slot; fails for a bad or taken slot
    pub fn open_data_channel(&self, channel: Channel, index: usize) -> bool {
        let mut slots = self.data.write();
        match slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                channel.set_rank(self.rank);
                *slot = Some(channel);
                true
            }
            _ => false,
        }
    }

    pub fn data_channels(&self) -> Vec<Channel> {
        self.data.read().iter().flatten().cloned().collect()
    }

    pub fn open_data_count(&self) -> usize {
        self.data.read().iter().filter(|slot| slot.is_some()).count()
    }

    /// Channels of this peer matching `selector`
    pub fn channels(&self, selector: ChannelSelector) -> Vec<Channel> {
        match selector {
            ChannelSelector::Master => self.master().into_iter().collect(),
            ChannelSelector::Data(index) => self.data(index).into_iter().collect(),
            ChannelSelector::AllData => self.data_channels(),
        }
    }

    /// Address rendered for logs and protocol messages
    pub fn describe(&self) -> String {
        match self.address {
            Some(address) => format!("{} ({}) at {}", self.name, self.rank, address),
            None => format!("{} ({})", self.name, self.rank),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("rank", &self.rank)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("master", &self.master.is_some())
            .field("data", &self.open_data_count())
            .finish()
    }
}

/// Rank to peer table guarded by a mutex
#[derive(Default)]
pub struct Connections {
    table: Mutex<BTreeMap<Rank, Line>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the table for a batch of operations
    pub fn lock(&self) -> MutexGuard<'_, BTreeMap<Rank, Line>> {
        self.table.lock()
    }

    /// Register `peer`; fails without touching the table when the rank is taken
    pub fn insert(&self, peer: Peer) -> bool {
        let mut table = self.table.lock();
        if table.contains_key(&peer.rank()) {
            return false;
        }
        table.insert(peer.rank(), Arc::new(peer));
        true
    }

    pub fn find(&self, rank: Rank) -> Option<Line> {
        self.table.lock().get(&rank).cloned()
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.table.lock().contains_key(&rank)
    }

    pub fn erase(&self, rank: Rank) -> Option<Line> {
        self.table.lock().remove(&rank)
    }

    /// Remove every peer for which `predicate` holds; returns how many went
    pub fn erase_if(&self, mut predicate: impl FnMut(&Peer) -> bool) -> usize {
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, peer| !predicate(peer));
        before - table.len()
    }

    /// Forget every peer; channels close once the last handle drops
    pub fn clear(&self) {
        self.table.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Snapshot of the registered peers in rank order
    pub fn values(&self) -> Vec<Line> {
        self.table.lock().values().cloned().collect()
    }

    /// Snapshot of the channels matching `selector`, skipping rank `except`
    pub fn channels(&self, selector: ChannelSelector, except: Option<Rank>) -> Vec<Channel> {
        self.table
            .lock()
            .values()
            .filter(|peer| Some(peer.rank()) != except)
            .flat_map(|peer| peer.channels(selector))
            .collect()
    }

    /// Peer owning `channel` as its master or one of its data channels
    pub fn owner_of(&self, channel: &Channel) -> Option<Line> {
        self.table
            .lock()
            .values()
            .find(|peer| {
                peer.master()
                    .map_or(false, |master| Arc::ptr_eq(&master, channel))
                    || peer
                        .data_channels()
                        .iter()
                        .any(|data| Arc::ptr_eq(data, channel))
            })
            .cloned()
    }

    /// Total number of open data channels across all peers
    pub fn open_data_lines(&self) -> usize {
        self.table
            .lock()
            .values()
            .map(|peer| peer.open_data_count())
            .sum()
    }
}

impl fmt::Debug for Connections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values()).finish()
    }
}
