//! # Client
//!
//! The master side of the protocol. Rank 0, no listener: it enslaves daemons
//! one by one, drives them through formation, starts the workload, relays the
//! workload's output and dissolves the group again.
//!
//! Formation is all or nothing. Any refusal or transport failure on the way
//! resets the group: every daemon gets a best-effort Error and the registry
//! is cleared.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;

use codec::{Code, Message, OutputStream, MASTER};
use herd_config::HerdConfig;
use network::{
    with_default_port, Channel, ChannelSelector, Communicator, Dispatch, Line, Network,
    NetworkTimeouts, Peer, Rank, Result, TransportError,
};
use tracing::{debug, info, warn};

use crate::exchange::{ask, request};
use crate::status::DaemonStatus;

/// Receiver of the workload output relayed by the daemons
pub type OutputSink = Box<dyn FnMut(OutputStream, &[u8]) + Send>;

pub struct Client {
    comm: Communicator,
    next_rank: Rank,
    sink: OutputSink,
    poll: Duration,
}

impl Client {
    /// Client talking to daemons on `port`, opening `data_channels` lines per pair
    pub fn new(port: u16, data_channels: usize, timeouts: NetworkTimeouts, poll: Duration) -> Self {
        let comm = Communicator::new("master", Network::unbound(port, timeouts));
        comm.set_rank(MASTER);
        comm.set_data_channels(data_channels);
        Self {
            comm,
            next_rank: 1,
            sink: Box::new(print_output),
            poll,
        }
    }

    pub fn from_config(config: &HerdConfig) -> Self {
        let timeouts = NetworkTimeouts {
            connect: config.timeouts.connect(),
            io: config.timeouts.io(),
        };
        Self::new(config.port, config.channels, timeouts, config.timeouts.poll())
    }

    /// Replace the default sink, which copies output to this process' stdout/stderr
    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn data_channels(&self) -> usize {
        self.comm.data_channels()
    }

    /// Enslave the daemon at `host`; `Ok(false)` when it refuses or is known already
    pub fn add(&mut self, host: &str) -> Result<bool> {
        if self
            .comm
            .connections()
            .values()
            .iter()
            .any(|peer| peer.name() == host)
        {
            warn!(%host, "Daemon already enslaved");
            return Ok(false);
        }
        let rank = self.next_rank;
        if rank == codec::ALL {
            return Err(TransportError::protocol("no ranks left for another daemon"));
        }

        let channel = self.comm.network().connect(host)?;
        let mut enslave = Message::control(Code::Enslave);
        enslave
            .push_i32(i32::from(rank))?
            .push_str(host)?
            .push_i32(self.comm.data_channels() as i32)?;
        if !ask(&channel, &enslave)? {
            warn!(%host, "Daemon refused to be enslaved");
            return Ok(false);
        }

        let address = channel.peer_address();
        self.comm
            .connections()
            .insert(Peer::new(rank, host, address, Some(channel), 0));
        self.next_rank += 1;
        info!(rank, %host, "Enslaved daemon");
        Ok(true)
    }

    /// Release every enslaved daemon before a group is formed
    pub fn remove_all(&mut self) -> Result<()> {
        let disconnect = Message::control(Code::Disconnect);
        let mut outcome = Ok(());
        for peer in self.comm.connections().values() {
            if let Err(e) = expect_ok(&peer, &disconnect) {
                warn!(peer = %peer.describe(), error = %e, "Disconnect failed");
                outcome = Err(e);
            }
        }
        self.forget();
        outcome
    }

    /// Enslaved daemons as (rank, name, address)
    pub fn list(&self) -> Vec<(Rank, String, Option<SocketAddr>)> {
        self.comm
            .connections()
            .values()
            .iter()
            .map(|peer| (peer.rank(), peer.name().to_string(), peer.address()))
            .collect()
    }

    /// Form the group and start `argv`, resetting everything on failure
    pub fn establish(&mut self, argv: &[String], init_data: &[Vec<u8>]) -> Result<()> {
        let outcome = self
            .init_world()
            .and_then(|()| self.connect_all())
            .and_then(|()| self.group())
            .and_then(|()| self.start(argv, init_data));
        if let Err(e) = &outcome {
            warn!(error = %e, "Group formation failed");
            self.reset();
        }
        outcome
    }

    /// Run `argv` on every enslaved daemon; exit codes in rank order
    ///
    /// The group is dissolved afterwards, successfully or not.
    pub fn run(&mut self, argv: &[String], init_data: &[Vec<u8>]) -> Result<Vec<i32>> {
        self.establish(argv, init_data)?;

        let outcome = self.collect().and_then(|codes| {
            self.dissolve()?;
            Ok(codes)
        });
        if let Err(e) = &outcome {
            warn!(error = %e, "Run failed");
            self.reset();
        }
        outcome
    }

    /// Tell every daemon the size of the group about to form
    pub fn init_world(&mut self) -> Result<()> {
        let size = self.comm.connections().len();
        if size == 0 {
            return Err(TransportError::protocol("no daemons enslaved"));
        }
        self.comm.set_world_size(size);

        let mut peers = Message::control(Code::Peers);
        peers.push_i32(size as i32)?;
        for peer in self.comm.connections().values() {
            expect_ok(&peer, &peers)?;
        }
        debug!(world = size, "World initialised");
        Ok(())
    }

    /// Build the full mesh: for every pair i < j, daemon i connects to j
    pub fn connect_all(&mut self) -> Result<()> {
        let peers = self.comm.connections().values();
        let channels = self.comm.data_channels();

        for (i, from) in peers.iter().enumerate() {
            for to in &peers[i + 1..] {
                let mut connect = Message::control(Code::ConnectTo);
                connect
                    .push_i32(i32::from(to.rank()))?
                    .push_str(to.name())?
                    .push_str(&self.address_of(to))?
                    .push_i32(channels as i32)?;

                let answer = request(&master_of(from)?, &connect)?;
                match answer.code() {
                    Ok(Code::Success) => {
                        debug!(from = from.rank(), to = to.rank(), "Pair connected");
                    }
                    Ok(Code::Refuse) => {
                        return Err(TransportError::protocol(format!(
                            "{} could not connect to {}",
                            from.describe(),
                            to.describe()
                        )));
                    }
                    _ => {
                        return Err(TransportError::unexpected(
                            &[Code::Success, Code::Refuse],
                            answer.tag(),
                        ))
                    }
                }
            }
        }
        info!(peers = peers.len(), lines = channels, "Mesh complete");
        Ok(())
    }

    /// Make every daemon fork into supervisor and grouped child
    pub fn group(&mut self) -> Result<()> {
        let grouped = Message::control(Code::Grouped);
        for peer in self.comm.connections().values() {
            expect_ok(&peer, &grouped)?;
        }
        Ok(())
    }

    /// Ship the initial data, queue `argv` on every child, then release them
    pub fn start(&mut self, argv: &[String], init_data: &[Vec<u8>]) -> Result<()> {
        if !init_data.is_empty() {
            let mut initial = Message::control(Code::InitialData);
            for segment in init_data {
                initial.push_bytes(segment)?;
            }
            self.comm.try_send_all(&mut initial, ChannelSelector::Master)?;
        }

        let mut run = Message::control(Code::Run);
        for arg in argv {
            run.push_str(arg)?;
        }
        let peers = self.comm.connections().values();
        for peer in &peers {
            expect_ok(peer, &run)?;
        }

        let start = Message::control(Code::Start);
        for peer in &peers {
            master_of(peer)?.send(&start)?;
        }
        info!(argv = ?argv, daemons = peers.len(), "Workload started");
        Ok(())
    }

    /// Relay output until every daemon reported Done
    fn collect(&mut self) -> Result<Vec<i32>> {
        let expected = self.comm.connections().len();
        let channels = self.comm.connections().channels(ChannelSelector::Master, None);
        let mut relay = Relay {
            sink: &mut self.sink,
            done: BTreeMap::new(),
        };

        while relay.done.len() < expected {
            self.comm.probe(
                &mut relay,
                &channels,
                |channel: Channel| {
                    warn!(rank = channel.rank(), "Data frame sent to the master, dropped");
                    channel.discard().is_ok()
                },
                Some(self.poll),
                false,
            )?;
        }
        Ok(relay.done.into_values().collect())
    }

    /// Walk every daemon through PrepareToLeave and Leave
    pub fn dissolve(&mut self) -> Result<()> {
        let peers = self.comm.connections().values();
        let prepare = Message::control(Code::PrepareToLeave);
        for peer in &peers {
            expect_ok(peer, &prepare)?;
        }
        let leave = Message::control(Code::Leave);
        for peer in &peers {
            expect_ok(peer, &leave)?;
        }

        self.forget();
        info!("Group dissolved");
        Ok(())
    }

    /// Best-effort Error to every daemon, then forget them
    pub fn reset(&mut self) {
        if !self.comm.connections().is_empty() {
            self.comm
                .send_all(&mut Message::control(Code::Error), ChannelSelector::Master);
        }
        self.forget();
    }

    /// Ask every daemon to log its registry
    pub fn table(&self) -> bool {
        self.comm
            .send_all(&mut Message::control(Code::Table), ChannelSelector::Master)
    }

    /// Query a daemon over a fresh connection
    pub fn status(&self, host: &str) -> Result<DaemonStatus> {
        let answer = request(&self.comm.network().connect(host)?, &Message::control(Code::Status))?;
        DaemonStatus::from_message(&answer)
    }

    /// Ask a free daemon to exit; `Ok(false)` when it is busy
    pub fn shutdown(&self, host: &str) -> Result<bool> {
        ask(
            &self.comm.network().connect(host)?,
            &Message::control(Code::Shutdown),
        )
    }

    /// Make a daemon exit whatever it is doing; no reply is sent
    pub fn force_shutdown(&self, host: &str) -> Result<()> {
        self.comm
            .network()
            .connect(host)?
            .send(&Message::control(Code::ForceShutdown))
    }

    /// Throw a daemon back to Free
    pub fn force_reset(&self, host: &str) -> Result<bool> {
        ask(
            &self.comm.network().connect(host)?,
            &Message::control(Code::ForceReset),
        )
    }

    fn forget(&mut self) {
        self.comm.connections().clear();
        self.comm.set_world_size(0);
        self.next_rank = 1;
    }

    /// Address another daemon reaches `peer` at
    fn address_of(&self, peer: &Peer) -> String {
        peer.address()
            .map(|address| address.to_string())
            .unwrap_or_else(|| with_default_port(peer.name(), self.comm.network().port()))
    }
}

impl Drop for Client {
    /// Leave no daemon bound to a master that is gone: merely enslaved
    /// daemons are released, anything further along is reset
    fn drop(&mut self) {
        if self.comm.connections().is_empty() {
            return;
        }
        if self.comm.world_size() == 0 {
            if let Err(e) = self.remove_all() {
                warn!(error = %e, "Releasing daemons on drop failed");
            }
        } else {
            debug!("Client dropped with a group in progress, resetting it");
            self.reset();
        }
    }
}

fn master_of(peer: &Line) -> Result<Channel> {
    peer.master()
        .ok_or_else(|| TransportError::protocol(format!("no channel to {}", peer.describe())))
}

/// Send a request that must be answered with OK
fn expect_ok(peer: &Line, message: &Message) -> Result<()> {
    if ask(&master_of(peer)?, message)? {
        Ok(())
    } else {
        Err(TransportError::protocol(format!(
            "{} refused {}",
            peer.describe(),
            message.code()?
        )))
    }
}

fn print_output(stream: OutputStream, bytes: &[u8]) {
    let outcome = match stream {
        OutputStream::Standard => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(bytes).and_then(|()| stdout.flush())
        }
        OutputStream::Error => io::stderr().write_all(bytes),
    };
    if let Err(e) = outcome {
        debug!(error = %e, "Output could not be relayed");
    }
}

/// Dispatch used while a workload runs
struct Relay<'a> {
    sink: &'a mut OutputSink,
    done: BTreeMap<Rank, i32>,
}

impl Dispatch for Relay<'_> {
    fn process_control(&mut self, _comm: &Communicator, channel: Channel) -> Result<bool> {
        let message = channel.receive()?;
        match message.code()? {
            Code::Done => {
                let code = message.reader().read_i32()?;
                info!(rank = channel.rank(), code, "Daemon done");
                self.done.insert(channel.rank(), code);
                Ok(true)
            }
            Code::Error => Err(TransportError::protocol(format!(
                "daemon {} failed",
                channel.rank()
            ))),
            Code::Renegade => {
                let culprit = message.reader().read_str()?.to_string();
                Err(TransportError::protocol(format!(
                    "daemon {} reported {} as renegade",
                    channel.rank(),
                    culprit
                )))
            }
            Code::Noop => Ok(true),
            other => Err(TransportError::unexpected(
                &[Code::Done, Code::Error, Code::Renegade],
                other.tag(),
            )),
        }
    }

    fn process_output(&mut self, _comm: &Communicator, channel: Channel) -> Result<()> {
        let message = channel.receive()?;
        let stream = message.stream()?;
        for segment in message.segments() {
            (self.sink)(stream, segment);
        }
        Ok(())
    }

    fn process_disconnected(&mut self, _comm: &Communicator, channel: Channel) -> Result<()> {
        Err(TransportError::aborted(format!(
            "daemon {} hung up during the run",
            channel.rank()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::reply;
    use std::net::TcpListener;
    use std::thread;

    fn client() -> Client {
        Client::new(
            0,
            1,
            NetworkTimeouts::default(),
            Duration::from_millis(50),
        )
    }

    /// Accepts one connection and answers its first request with `code`
    fn fake_daemon(code: Code) -> (String, thread::JoinHandle<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let channel = Channel::new(network::Socket::from_tcp(stream, None).unwrap());
            let message = channel.receive().unwrap();
            reply(&channel, code).unwrap();
            message
        });
        (host, handle)
    }

    /// Accepts one connection and answers its requests with `answers`, in order
    fn scripted_daemon(answers: Vec<Code>) -> (String, thread::JoinHandle<Vec<Message>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let channel = Channel::new(network::Socket::from_tcp(stream, None).unwrap());
            let mut seen = Vec::new();
            for code in answers {
                seen.push(channel.receive().unwrap());
                reply(&channel, code).unwrap();
            }
            seen
        });
        (host, handle)
    }

    #[test]
    fn test_dropped_client_releases_enslaved_daemons() {
        let (host, daemon) = scripted_daemon(vec![Code::Ok, Code::Ok]);
        let mut client = client();
        assert!(client.add(&host).unwrap());
        drop(client);

        let codes: Vec<Code> = daemon
            .join()
            .unwrap()
            .iter()
            .map(|message| message.code().unwrap())
            .collect();
        assert_eq!(codes, vec![Code::Enslave, Code::Disconnect]);
    }

    #[test]
    fn test_dropped_client_resets_a_forming_group() {
        let client = client();
        let (local, remote) = client.comm.network().socket_pair().unwrap();
        client
            .comm
            .connections()
            .insert(Peer::new(1, "node", None, Some(local), 0));
        client.comm.set_world_size(1);
        drop(client);

        assert_eq!(remote.receive().unwrap().code().unwrap(), Code::Error);
    }

    #[test]
    fn test_add_sends_enslave_with_rank_and_channels() {
        let mut client = client();
        let (host, daemon) = fake_daemon(Code::Ok);

        assert!(client.add(&host).unwrap());
        let enslave = daemon.join().unwrap();
        assert_eq!(enslave.code().unwrap(), Code::Enslave);
        let mut reader = enslave.reader();
        assert_eq!(reader.read_i32().unwrap(), 1);
        assert_eq!(reader.read_str().unwrap(), host);
        assert_eq!(reader.read_i32().unwrap(), 1);

        let listed = client.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, 1);
        assert_eq!(listed[0].1, host);
        // Known names are refused without a round trip.
        assert!(!client.add(&host).unwrap());
    }

    #[test]
    fn test_refused_enslave_registers_nothing() {
        let mut client = client();
        let (host, daemon) = fake_daemon(Code::Refuse);

        assert!(!client.add(&host).unwrap());
        daemon.join().unwrap();
        assert!(client.list().is_empty());
    }

    #[test]
    fn test_init_world_without_daemons_fails() {
        let mut client = client();
        assert!(matches!(
            client.init_world(),
            Err(TransportError::Protocol { .. })
        ));
    }

    #[test]
    fn test_relay_collects_done_and_output() {
        let comm = Communicator::new("master", Network::unbound(0, NetworkTimeouts::default()));
        let (local, remote) = comm.network().socket_pair().unwrap();
        comm.connections()
            .insert(Peer::new(3, "node", None, Some(local.clone()), 0));

        let mut output = Message::output(OutputStream::Standard);
        output.push_str("hi\n").unwrap();
        remote.send(&output).unwrap();
        let mut done = Message::control(Code::Done);
        done.push_i32(7).unwrap();
        remote.send(&done).unwrap();

        let captured = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink_copy = captured.clone();
        let mut sink: OutputSink = Box::new(move |stream, bytes| {
            sink_copy.lock().push((stream, bytes.to_vec()));
        });
        let mut relay = Relay {
            sink: &mut sink,
            done: BTreeMap::new(),
        };
        for _ in 0..2 {
            comm.probe(
                &mut relay,
                &[local.clone()],
                |_channel: Channel| (),
                Some(Duration::from_secs(1)),
                false,
            )
            .unwrap();
        }

        assert_eq!(relay.done.get(&3), Some(&7));
        assert_eq!(
            *captured.lock(),
            vec![(OutputStream::Standard, b"hi\n".to_vec())]
        );
    }

    #[test]
    fn test_relay_fails_on_error_and_hang_up() {
        let comm = Communicator::new("master", Network::unbound(0, NetworkTimeouts::default()));
        let (local, remote) = comm.network().socket_pair().unwrap();
        let mut sink: OutputSink = Box::new(|_, _| {});
        let mut relay = Relay {
            sink: &mut sink,
            done: BTreeMap::new(),
        };

        remote.send(&Message::control(Code::Error)).unwrap();
        let failed = comm.probe(
            &mut relay,
            &[local.clone()],
            |_channel: Channel| (),
            Some(Duration::from_secs(1)),
            false,
        );
        assert!(failed.is_err());

        drop(remote);
        let hung_up = comm.probe(
            &mut relay,
            &[local],
            |_channel: Channel| (),
            Some(Duration::from_secs(1)),
            false,
        );
        assert!(matches!(hung_up, Err(TransportError::ConnectionAborted { .. })));
    }
}
