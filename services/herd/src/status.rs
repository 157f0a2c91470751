//! Daemon states and the Status reply
//!
//! A Status request is answered with an OK frame carrying six segments:
//! state name, rank, world size, registered peers, open data lines and the
//! pid of the forked child (-1 when there is none).

use std::fmt;
use std::str::FromStr;

use codec::{Code, Message};
use network::{Result, TransportError};

/// Position of a daemon in the group life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DaemonState {
    #[default]
    Free,
    Enslaved,
    FormingGroup,
    Grouped,
    Supervising,
    Running,
    Leaving,
}

impl DaemonState {
    pub fn as_str(self) -> &'static str {
        match self {
            DaemonState::Free => "free",
            DaemonState::Enslaved => "enslaved",
            DaemonState::FormingGroup => "forming-group",
            DaemonState::Grouped => "grouped",
            DaemonState::Supervising => "supervising",
            DaemonState::Running => "running",
            DaemonState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DaemonState {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "free" => DaemonState::Free,
            "enslaved" => DaemonState::Enslaved,
            "forming-group" => DaemonState::FormingGroup,
            "grouped" => DaemonState::Grouped,
            "supervising" => DaemonState::Supervising,
            "running" => DaemonState::Running,
            "leaving" => DaemonState::Leaving,
            other => {
                return Err(TransportError::protocol(format!(
                    "unknown daemon state '{}'",
                    other
                )))
            }
        })
    }
}

/// Snapshot reported by a daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub rank: i32,
    pub world_size: i32,
    pub peers: i32,
    pub data_lines: i32,
    pub child: Option<i32>,
}

impl DaemonStatus {
    pub fn to_message(&self) -> Result<Message> {
        let mut message = Message::control(Code::Ok);
        message
            .push_str(self.state.as_str())?
            .push_i32(self.rank)?
            .push_i32(self.world_size)?
            .push_i32(self.peers)?
            .push_i32(self.data_lines)?
            .push_i32(self.child.unwrap_or(-1))?;
        Ok(message)
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        if message.code()? != Code::Ok {
            return Err(TransportError::unexpected(&[Code::Ok], message.tag()));
        }
        let mut reader = message.reader();
        let state = reader.read_str()?.parse()?;
        let rank = reader.read_i32()?;
        let world_size = reader.read_i32()?;
        let peers = reader.read_i32()?;
        let data_lines = reader.read_i32()?;
        let child = Some(reader.read_i32()?).filter(|&pid| pid > 0);
        Ok(Self {
            state,
            rank,
            world_size,
            peers,
            data_lines,
            child,
        })
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<13} rank={} world={} peers={} lines={}",
            self.state.as_str(),
            self.rank,
            self.world_size,
            self.peers,
            self.data_lines
        )?;
        match self.child {
            Some(pid) => write!(f, " child={}", pid),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_parse_back() {
        for state in [
            DaemonState::Free,
            DaemonState::Enslaved,
            DaemonState::FormingGroup,
            DaemonState::Grouped,
            DaemonState::Supervising,
            DaemonState::Running,
            DaemonState::Leaving,
        ] {
            assert_eq!(state.as_str().parse::<DaemonState>().unwrap(), state);
        }
        assert!("over-watching".parse::<DaemonState>().is_err());
    }

    #[test]
    fn test_status_message_layout() {
        let status = DaemonStatus {
            state: DaemonState::Supervising,
            rank: 2,
            world_size: 3,
            peers: 0,
            data_lines: 0,
            child: Some(4242),
        };
        let message = status.to_message().unwrap();
        assert_eq!(message.count(), 6);
        assert_eq!(message.segments()[0], b"supervising");
        assert_eq!(DaemonStatus::from_message(&message).unwrap(), status);
    }

    #[test]
    fn test_missing_child_encodes_negative() {
        let status = DaemonStatus {
            state: DaemonState::Free,
            rank: 0,
            world_size: 0,
            peers: 0,
            data_lines: 0,
            child: None,
        };
        let message = status.to_message().unwrap();
        assert_eq!(message.segments()[5], (-1i32).to_le_bytes());
        assert_eq!(DaemonStatus::from_message(&message).unwrap().child, None);
        assert_eq!(status.to_string(), "free          rank=0 world=0 peers=0 lines=0");
    }

    #[test]
    fn test_refusal_is_not_a_status() {
        let refusal = Message::control(Code::Refuse);
        assert!(DaemonStatus::from_message(&refusal).is_err());
    }
}
