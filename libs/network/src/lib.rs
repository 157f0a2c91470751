//! Network Infrastructure
//!
//! Stream channels carrying codec frames, the readiness multiplexer, the peer
//! registry and the communicator that ties them into an event loop. Also
//! home of the descriptor redirection used to ship a workload's output back
//! to the master.

pub mod channel;
pub mod communicator;
pub mod error;
pub mod multiplexer;
pub mod redirect;
pub mod registry;

// Re-export commonly used types
pub use channel::{socket_pair, with_default_port, Channel, Socket};
pub use communicator::{Communicator, Dispatch, Proceed};
pub use error::{NetworkError, Result, TransportError};
pub use multiplexer::{Network, NetworkTimeouts, Wakeup};
pub use redirect::Redirector;
pub use registry::{ChannelSelector, Connections, Line, Peer, Rank};

// Constants for configuration
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 8 * 60;
