//! Integration Tests for the Network Crate
//!
//! Exercises the public surface the daemon is built on:
//! - frames survive a trip over a local channel pair unchanged
//! - broadcasts report partial failure without starving live recipients
//! - TCP channels created by `Network` carry frames between listeners

use std::sync::Arc;
use std::time::Duration;

use codec::{Category, Code, Message, MAX_SEGMENTS};
use network::{
    ChannelSelector, Communicator, Network, NetworkTimeouts, Peer, TransportError, Wakeup,
};
use proptest::prelude::*;

fn timeouts() -> NetworkTimeouts {
    NetworkTimeouts {
        connect: Duration::from_secs(2),
        io: Some(Duration::from_secs(5)),
    }
}

fn category() -> impl Strategy<Value = Category> {
    prop_oneof![
        Just(Category::Data),
        Just(Category::Control),
        Just(Category::Output)
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn frames_round_trip_over_channel_pair(
        category in category(),
        tag in any::<i32>(),
        from in any::<u8>(),
        to in any::<u8>(),
        segments in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 0..=MAX_SEGMENTS),
    ) {
        let (left, right) = network::socket_pair(Some(Duration::from_secs(5))).unwrap();

        let mut message = Message::new(category).with_tag(tag);
        message.set_from(from);
        message.set_to(to);
        for segment in &segments {
            prop_assert!(message.add(segment.clone()));
        }

        // Large frames exceed the socket buffer, so the sender needs its own thread.
        let sender = std::thread::spawn(move || left.send(&message).map(|()| message));
        let received = right.receive().unwrap();
        let sent = sender.join().unwrap().unwrap();

        prop_assert_eq!(received.category().unwrap(), category);
        prop_assert_eq!(received.tag(), tag);
        prop_assert_eq!(received.from(), from);
        prop_assert_eq!(received.to(), to);
        prop_assert_eq!(received.segments(), sent.segments());
    }
}

fn group_of(size: u8) -> (Communicator, Vec<network::Channel>) {
    let comm = Communicator::new("origin", Network::unbound(0, timeouts()));
    comm.set_rank(1);
    let mut remotes = Vec::new();
    for rank in 2..2 + size {
        let (local, remote) = comm.network().socket_pair().unwrap();
        comm.connections()
            .insert(Peer::new(rank, format!("n{}", rank), None, Some(local), 0));
        remotes.push(remote);
    }
    (comm, remotes)
}

#[test]
fn test_broadcast_reaches_every_live_channel() {
    let (comm, remotes) = group_of(4);
    let mut message = Message::control(Code::Table);

    assert!(comm.send_all(&mut message, ChannelSelector::Master));
    for remote in &remotes {
        let received = remote.receive().unwrap();
        assert_eq!(received.code().unwrap(), Code::Table);
        assert_eq!(received.from(), 1);
        assert_eq!(received.to(), codec::ALL);
    }
}

#[test]
fn test_broadcast_reports_dead_recipient() {
    let (comm, mut remotes) = group_of(3);
    drop(remotes.remove(1));

    let mut message = Message::data(11);
    message.add(b"payload".to_vec());
    let outcome = comm.try_send_all(&mut message, ChannelSelector::Master);
    assert!(matches!(
        outcome,
        Err(TransportError::Broadcast { failed: 1, total: 3 })
    ));

    for remote in &remotes {
        let received = remote.receive().unwrap();
        assert_eq!(received.tag(), 11);
        assert_eq!(received.segments()[0], b"payload");
    }
}

#[test]
fn test_broadcast_skips_own_rank() {
    let (comm, remotes) = group_of(2);
    let (own, own_remote) = comm.network().socket_pair().unwrap();
    comm.connections()
        .insert(Peer::new(1, "origin", None, Some(own), 0));

    assert!(comm.send_all(&mut Message::data(3), ChannelSelector::Master));
    for remote in &remotes {
        assert_eq!(remote.receive().unwrap().tag(), 3);
    }
    assert!(!own_remote.closed());
    let idle = comm
        .network()
        .poll(&[own_remote], false, Some(Duration::from_millis(50)))
        .unwrap();
    assert!(matches!(idle, Wakeup::Timeout));
}

#[test]
fn test_tcp_listener_to_listener_exchange() {
    let server = Network::bind(0, timeouts()).unwrap();
    let client = Network::bind(0, timeouts()).unwrap();

    let outbound = client
        .connect(&format!("127.0.0.1:{}", server.port()))
        .unwrap();
    match server.poll(&[], true, Some(Duration::from_secs(2))).unwrap() {
        Wakeup::Incoming => {}
        other => panic!("expected incoming connection, got {:?}", other),
    }
    let inbound = server.accept().unwrap();

    let mut request = Message::control(Code::Join);
    request.push_i32(1).unwrap().push_str("client").unwrap();
    outbound.send(&request).unwrap();

    let received = inbound.receive().unwrap();
    let mut reader = received.reader();
    assert_eq!(reader.read_i32().unwrap(), 1);
    assert_eq!(reader.read_str().unwrap(), "client");

    inbound.send(&Message::control(Code::Ok)).unwrap();
    assert_eq!(outbound.receive().unwrap().code().unwrap(), Code::Ok);

    let shared = Arc::clone(&outbound);
    shared.close();
    assert!(inbound.closed() || inbound.receive().is_err());
}
