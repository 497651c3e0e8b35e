//! Stampede Environment Abstraction Layer
//!
//! Everything a Stampede component needs from the outside world, behind
//! small traits:
//! - Identity: [`SimulatorAddress`] names every endpoint in the
//!   coordinator / agent / worker / test tree
//! - Time, spawning and seeded randomness: [`RuntimeContext`]
//! - Transport: [`Link`] carries encoded frames to one neighbour
//!
//! # Example
//!
//! ```ignore
//! use stampede_env::{inbox, ChannelLink, Link, SimulatorAddress};
//!
//! let (agent_tx, mut agent_rx) = inbox(64);
//! let to_agent = ChannelLink::new(SimulatorAddress::agent(1), agent_tx);
//! to_agent.send(frame).await?;
//! ```

mod address;
mod context;
mod error;
mod network;
mod tcp;
mod tokio_impl;

pub use address::{AddressLevel, AddressParseError, SimulatorAddress, ALL};
pub use context::{mix_seed, RuntimeContext};
pub use error::EnvError;
pub use network::{
    inbox, ChannelLink, Frame, InboxReceiver, InboxSender, Link, LinkController,
    DEFAULT_INBOX_CAPACITY,
};
pub use tcp::{TcpLink, MAX_FRAME_SIZE};
pub use tokio_impl::TokioContext;
