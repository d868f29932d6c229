//! murmur — epidemic state dissemination
//!
//! Every node in a murmur fleet holds a single timestamped datum and pushes
//! any newer value it learns of to a random subset of its peers until the
//! whole fleet converges on the latest state.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────┐  state    ┌──────┐  state    ┌──────┐
//!  │Node A│◄─────────►│Node B│◄─────────►│Node C│
//!  └──────┘           └──────┘           └──────┘
//!     ▲                  ▲                  ▲
//!     └───────── scan / repair ─────────────┘
//!                  ┌──────────┐
//!                  │Controller│
//!                  └──────────┘
//! ```
//!
//! ## Gossip
//! - Each node keeps a list of peer records and its current state
//! - A new state (local POST or remote push) replaces the current one when
//!   its timestamp is strictly newer, then fans out to at most
//!   `max_recipients` random peers
//! - Peers are pinged periodically; a peer advertising a newer state is
//!   pulled from, and a peer silent for too long is dropped
//!
//! ## Topology control
//! - A singleton controller walks the peering graph, finds disconnected
//!   clusters, merges them in a ring, and raises every node to a minimum
//!   peer degree by issuing peering requests
//! - The controller is an optimiser, not an authority: nodes keep gossiping
//!   without it

pub mod config;
pub mod controller;
pub mod node;
pub mod peer;
pub mod routes;
#[cfg(test)]
pub(crate) mod testutil;
pub mod types;

pub use config::Config;
pub use controller::Controller;
pub use node::Node;
pub use peer::Peer;
pub use types::{Addr, State};
