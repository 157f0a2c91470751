//! Request/reply helpers shared by the daemon and the client

use codec::{Code, Message};
use network::{Channel, Result, TransportError};

/// Answer a request with a bare control code
pub fn reply(channel: &Channel, code: Code) -> Result<()> {
    channel.send(&Message::control(code))
}

/// Send `message` and wait for the next frame on the same channel
pub fn request(channel: &Channel, message: &Message) -> Result<Message> {
    channel.send(message)?;
    channel.receive()
}

/// Send `message` and read an OK (`true`) or Refuse (`false`) reply
pub fn ask(channel: &Channel, message: &Message) -> Result<bool> {
    let answer = request(channel, message)?;
    match answer.code() {
        Ok(Code::Ok) => Ok(true),
        Ok(Code::Refuse) => Ok(false),
        _ => Err(TransportError::unexpected(
            &[Code::Ok, Code::Refuse],
            answer.tag(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::NetworkTimeouts;

    #[test]
    fn test_ask_maps_replies() {
        let network = network::Network::unbound(0, NetworkTimeouts::default());
        let (left, right) = network.socket_pair().unwrap();

        let server = std::thread::spawn(move || {
            for code in [Code::Ok, Code::Refuse, Code::Done] {
                right.receive().unwrap();
                reply(&right, code).unwrap();
            }
        });

        let question = Message::control(Code::Status);
        assert!(ask(&left, &question).unwrap());
        assert!(!ask(&left, &question).unwrap());
        assert!(matches!(
            ask(&left, &question),
            Err(TransportError::UnexpectedResponse { .. })
        ));
        server.join().unwrap();
    }
}
