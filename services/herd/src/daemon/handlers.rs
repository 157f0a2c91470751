//! Control message handlers
//!
//! Every request is checked against the current state before anything
//! changes. A known code at the wrong moment gets Refuse and leaves state
//! and registry untouched; a code the daemon never accepts is a protocol
//! error and resets it.

use codec::{Category, Code, Message, ALL, MASTER};
use herd_config::constants::daemon::MAX_DATA_CHANNELS;
use network::{Channel, Communicator, Dispatch, Peer, Rank, Result, TransportError};
use tracing::{debug, info, warn};

use super::Machine;
use crate::exchange::{ask, reply, request};
use crate::status::DaemonState;

/// Codes this daemon acts on
const ACCEPTED: &[Code] = &[
    Code::Enslave,
    Code::Peers,
    Code::ConnectTo,
    Code::Join,
    Code::DataLine,
    Code::Grouped,
    Code::PrepareToLeave,
    Code::Leave,
    Code::Disconnect,
    Code::CutRope,
    Code::Shutdown,
    Code::ForceShutdown,
    Code::ForceReset,
    Code::Status,
    Code::Error,
    Code::Renegade,
    Code::Table,
    Code::InitialData,
    Code::Run,
    Code::Noop,
];

impl Dispatch for Machine {
    fn process_control(&mut self, comm: &Communicator, channel: Channel) -> Result<bool> {
        let message = channel.receive()?;
        let code = message.code()?;
        debug!(%code, from = message.from(), state = %self.state, "Control message");

        match code {
            Code::Enslave => self.enslave(comm, channel, &message)?,
            Code::Peers => self.start_grouping(comm, &channel, &message)?,
            Code::ConnectTo => self.connect_to(comm, &channel, &message)?,
            Code::Join => self.join(comm, channel, &message)?,
            Code::DataLine => self.add_data_line(comm, channel, &message)?,
            Code::Grouped => return self.grouped(comm, &channel),
            Code::PrepareToLeave => self.prepare(&channel)?,
            Code::Leave => self.leave(comm, &channel)?,
            Code::Disconnect => self.release(comm, &channel)?,
            Code::CutRope => self.cut_rope(comm, &channel)?,
            Code::Shutdown => self.shutdown(&channel)?,
            Code::ForceShutdown => {
                info!("Forced shutdown");
                self.reset(comm, None);
                self.exit = self.exit.or(Some(0));
            }
            Code::ForceReset => {
                reply(&channel, Code::Ok)?;
                info!("Forced reset");
                self.reset(comm, None);
            }
            Code::Status => channel.send(&self.status(comm).to_message()?)?,
            Code::Table => self.table(comm),
            Code::Error => {
                let culprit = comm
                    .connections()
                    .owner_of(&channel)
                    .and_then(|peer| peer.address())
                    .map(|address| address.to_string());
                warn!(rank = channel.rank(), "Peer got itself into error state");
                self.reset(comm, culprit);
            }
            Code::Renegade => {
                let culprit = message.reader().read_str()?.to_string();
                warn!(%culprit, "Peer reported a renegade");
                self.reset(comm, Some(culprit));
            }
            Code::InitialData => self.initial_data(message),
            Code::Run => {
                self.run(&channel, &message)?;
                // Hand the loop back so the workload runs outside this probe.
                return Ok(self.pending.is_none());
            }
            Code::Noop => {}
            Code::Ok
            | Code::Success
            | Code::Failed
            | Code::Refuse
            | Code::Start
            | Code::Done => {
                return Err(TransportError::unexpected(ACCEPTED, code.tag()));
            }
        }
        Ok(true)
    }

    /// The first frame on a new connection says what it is for
    fn process_incoming(&mut self, comm: &Communicator, channel: Channel) -> Result<()> {
        let head = match channel.peek() {
            Ok(head) => head,
            Err(e) => {
                debug!(error = %e, "Inbound connection closed before a request");
                return Ok(());
            }
        };
        if !matches!(Category::from_byte(head.category), Ok(Category::Control)) {
            warn!(category = head.category, "Inbound connection opened without a request");
            return Ok(());
        }
        // Failures on a fresh connection concern only its requester.
        if let Err(e) = self.process_control(comm, channel) {
            warn!(error = %e, "Inbound request failed");
        }
        Ok(())
    }

    fn process_disconnected(&mut self, comm: &Communicator, channel: Channel) -> Result<()> {
        self.lost(comm, &channel)
    }
}

/// Group ranks exclude the master and the broadcast address
fn group_rank(raw: i32) -> Option<Rank> {
    Rank::try_from(raw)
        .ok()
        .filter(|&rank| rank != MASTER && rank != ALL)
}

fn channel_count(raw: i32) -> Option<usize> {
    usize::try_from(raw)
        .ok()
        .filter(|&count| count <= MAX_DATA_CHANNELS)
}

impl Machine {
    fn enslave(&mut self, comm: &Communicator, channel: Channel, message: &Message) -> Result<()> {
        let mut reader = message.reader();
        let rank = group_rank(reader.read_i32()?);
        let name = reader.read_str()?.to_string();
        let channels = channel_count(reader.read_i32()?);

        let (Some(rank), Some(channels)) = (rank, channels) else {
            warn!("Enslave with an invalid rank or channel count");
            return reply(&channel, Code::Refuse);
        };
        if self.state != DaemonState::Free {
            warn!(state = %self.state, "Already serving a master");
            reply(&channel, Code::Refuse)?;
            // Only a stranger's connection is dropped; the master line stays.
            if comm.connections().owner_of(&channel).is_none() {
                channel.close();
            }
            return Ok(());
        }
        reply(&channel, Code::Ok)?;

        comm.set_rank(rank);
        comm.set_name(name.as_str());
        comm.set_data_channels(channels);
        let address = channel.peer_address();
        comm.connections()
            .insert(Peer::new(MASTER, "master", address, Some(channel), 0));
        self.state = DaemonState::Enslaved;
        info!(rank, %name, channels, "Enslaved");
        Ok(())
    }

    fn start_grouping(
        &mut self,
        comm: &Communicator,
        channel: &Channel,
        message: &Message,
    ) -> Result<()> {
        let size = message.reader().read_i32()?;
        let size = usize::try_from(size)
            .ok()
            .filter(|&size| size >= 1 && size < usize::from(ALL));

        match size {
            Some(size) if self.state == DaemonState::Enslaved => {
                reply(channel, Code::Ok)?;
                comm.set_world_size(size);
                self.state = DaemonState::FormingGroup;
                info!(world = size, "Forming group");
                Ok(())
            }
            _ => reply(channel, Code::Refuse),
        }
    }

    fn connect_to(&mut self, comm: &Communicator, channel: &Channel, message: &Message) -> Result<()> {
        let mut reader = message.reader();
        let rank = group_rank(reader.read_i32()?);
        let name = reader.read_str()?.to_string();
        let address = reader.read_str()?.to_string();
        let channels = channel_count(reader.read_i32()?);

        let (Some(rank), Some(channels)) = (rank, channels) else {
            return reply(channel, Code::Refuse);
        };
        if self.state != DaemonState::FormingGroup
            || rank == comm.rank()
            || comm.connections().contains(rank)
        {
            return reply(channel, Code::Refuse);
        }

        let answer = match self.connect_peer(comm, rank, &name, &address, channels) {
            Ok(peer) => {
                if comm.connections().insert(peer) {
                    info!(rank, %name, %address, "Connected to peer");
                    Code::Success
                } else {
                    Code::Refuse
                }
            }
            Err(e) => {
                warn!(rank, %address, error = %e, "Could not connect to peer");
                Code::Refuse
            }
        };
        reply(channel, answer)
    }

    /// Open the master line and every data line to a peer
    fn connect_peer(
        &self,
        comm: &Communicator,
        rank: Rank,
        name: &str,
        address: &str,
        channels: usize,
    ) -> Result<Peer> {
        let own = i32::from(comm.rank());

        let master = comm.network().connect(address)?;
        let mut join = Message::control(Code::Join);
        join.push_i32(own)?.push_str(&comm.name())?;
        if !ask(&master, &join)? {
            return Err(TransportError::protocol(format!("{} refused Join", address)));
        }

        let peer = Peer::new(rank, name, master.peer_address(), Some(master), channels);
        for index in 0..channels {
            let line = comm.network().connect(address)?;
            let mut request = Message::control(Code::DataLine);
            request.push_i32(own)?.push_i32(index as i32)?;
            if !ask(&line, &request)? {
                return Err(TransportError::protocol(format!(
                    "{} refused data line {}",
                    address, index
                )));
            }
            peer.open_data_channel(line, index);
        }
        Ok(peer)
    }

    fn join(&mut self, comm: &Communicator, channel: Channel, message: &Message) -> Result<()> {
        let mut reader = message.reader();
        let rank = group_rank(reader.read_i32()?);
        let name = reader.read_str()?.to_string();

        let Some(rank) = rank else {
            return reply(&channel, Code::Refuse);
        };
        if self.state != DaemonState::FormingGroup
            || rank == comm.rank()
            || comm.connections().contains(rank)
        {
            return reply(&channel, Code::Refuse);
        }
        reply(&channel, Code::Ok)?;

        let address = channel.peer_address();
        comm.connections().insert(Peer::new(
            rank,
            name.as_str(),
            address,
            Some(channel),
            comm.data_channels(),
        ));
        info!(rank, %name, "Peer joined");
        Ok(())
    }

    fn add_data_line(
        &mut self,
        comm: &Communicator,
        channel: Channel,
        message: &Message,
    ) -> Result<()> {
        let mut reader = message.reader();
        let rank = group_rank(reader.read_i32()?);
        let index = usize::try_from(reader.read_i32()?).ok();

        let peer = match (rank, index) {
            (Some(rank), Some(index)) if self.state == DaemonState::FormingGroup => comm
                .connections()
                .find(rank)
                .filter(|peer| index < peer.data_slots() && peer.data(index).is_none())
                .map(|peer| (peer, index)),
            _ => None,
        };
        let Some((peer, index)) = peer else {
            return reply(&channel, Code::Refuse);
        };
        reply(&channel, Code::Ok)?;

        peer.open_data_channel(channel, index);
        debug!(rank = peer.rank(), index, "Data line attached");
        Ok(())
    }

    /// Fork the group; false afterwards so both processes start a fresh
    /// round instead of reading channels that now belong to the other one
    fn grouped(&mut self, comm: &Communicator, channel: &Channel) -> Result<bool> {
        if self.state != DaemonState::FormingGroup {
            reply(channel, Code::Refuse)?;
            return Ok(true);
        }
        info!(
            peers = comm.connections().len(),
            lines = comm.connections().open_data_lines(),
            "Group formed"
        );
        self.fork_group(comm, channel)?;
        Ok(false)
    }

    fn prepare(&mut self, channel: &Channel) -> Result<()> {
        if !matches!(
            self.state,
            DaemonState::Grouped | DaemonState::FormingGroup
        ) {
            return reply(channel, Code::Refuse);
        }
        reply(channel, Code::Ok)?;
        self.state = DaemonState::Leaving;
        Ok(())
    }

    fn leave(&mut self, comm: &Communicator, channel: &Channel) -> Result<()> {
        if self.state != DaemonState::Leaving {
            return reply(channel, Code::Refuse);
        }

        if let Some(rope) = self.rope.take() {
            let cut = Message::control(Code::CutRope);
            let answer = request(&rope, &cut)?;
            if answer.code()? != Code::Ok {
                return Err(TransportError::unexpected(&[Code::Ok], answer.tag()));
            }
        }
        reply(channel, Code::Ok)?;

        info!("Left the group");
        self.set_default(comm);
        Ok(())
    }

    fn release(&mut self, comm: &Communicator, channel: &Channel) -> Result<()> {
        if self.state != DaemonState::Enslaved {
            return reply(channel, Code::Refuse);
        }
        reply(channel, Code::Ok)?;
        info!("Released by master");
        self.set_default(comm);
        Ok(())
    }

    fn shutdown(&mut self, channel: &Channel) -> Result<()> {
        if self.state != DaemonState::Free {
            return reply(channel, Code::Refuse);
        }
        reply(channel, Code::Ok)?;
        self.exit = Some(0);
        Ok(())
    }

    fn table(&self, comm: &Communicator) {
        info!(
            rank = comm.rank(),
            world = comm.world_size(),
            state = %self.state,
            "-- table begin --"
        );
        for peer in comm.connections().values() {
            info!(
                peer = %peer.describe(),
                lines = peer.open_data_count(),
                master = peer.rank() == MASTER,
                "peer"
            );
        }
        info!("-- table end --");
    }

    fn initial_data(&mut self, message: Message) {
        if self.state != DaemonState::Grouped {
            warn!(state = %self.state, "InitialData at a bad moment, ignored");
            return;
        }
        self.initial_data = message.into_segments();
        debug!(segments = self.initial_data.len(), "Initial data stored");
    }

    /// Acknowledge Run, wait for Start and queue the workload
    fn run(&mut self, channel: &Channel, message: &Message) -> Result<()> {
        if self.state != DaemonState::Grouped {
            return reply(channel, Code::Refuse);
        }
        let argv = message.reader().rest_lossy();
        reply(channel, Code::Ok)?;

        let start = channel.receive()?;
        if start.code()? != Code::Start {
            return Err(TransportError::unexpected(&[Code::Start], start.tag()));
        }
        self.pending = Some(argv);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_rank_bounds() {
        assert_eq!(group_rank(1), Some(1));
        assert_eq!(group_rank(254), Some(254));
        assert_eq!(group_rank(0), None);
        assert_eq!(group_rank(255), None);
        assert_eq!(group_rank(-3), None);
        assert_eq!(group_rank(1000), None);
    }

    #[test]
    fn test_channel_count_bounds() {
        assert_eq!(channel_count(0), Some(0));
        assert_eq!(channel_count(MAX_DATA_CHANNELS as i32), Some(MAX_DATA_CHANNELS));
        assert_eq!(channel_count(-1), None);
        assert_eq!(channel_count(MAX_DATA_CHANNELS as i32 + 1), None);
    }
}
