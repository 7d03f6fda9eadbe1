// canpong/src/lib.rs
//
// The main lib file for the CAN ping/pong node.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN ping/pong integrity testing.
//!
//! This crate implements one end of a bidirectional ping/pong exchange
//! over a two-endpoint CAN bus. It proves, continuously, that frames cross
//! the link in both directions without a single bit changed, and keeps the
//! link alive on its own through bus-off, error-passive episodes, receive
//! overflows and stalled transmitters.
//!
//! # The exchange
//!
//! Each side sends a ping once a second and echoes back every ping the
//! other side sends. A ping carries a rolling counter, its complement, and
//! a fixed six-byte tail:
//!
//! ```text
//!   0x123  07 F8 55 AA C3 3C 5A A5    ping from this node
//!   0x124  07 F8 55 AA C3 3C 5A A5    pong from the peer, same payload
//!   0x223  ...                        ping from the peer
//!   0x224  ...                        pong from this node
//! ```
//!
//! The peer runs the same protocol with the roles swapped, see
//! [`PingPongIds::peer`].
//!
//! # Layers
//!
//! - [`codec`] builds and checks the test pattern.
//! - [`Controller`] is what the node needs from a bus controller, with
//!   [`SocketController`] as the Linux SocketCAN implementation.
//! - [`Link`] owns the controller and its lifecycle: initialization, send
//!   error accounting and stall recovery.
//! - [`HealthMonitor`] inspects the controller error flags.
//! - [`ProtocolEngine`] originates pings and answers the peer.
//! - [`Node`] runs all of the above from a single cooperative loop.
//!
//! # Logging
//!
//! Everything is reported through the [`log`] facade: each frame sent or
//! received and every verdict at `info`, faults and recoveries at `warn`
//! and `error`. The application picks the backend.

pub mod codec;
pub mod config;
pub mod controller;
pub mod errors;
pub mod flags;
pub mod frame;
pub mod health;
pub mod irq;
pub mod link;
pub mod node;
pub mod protocol;
pub mod socket;
pub mod timing;

#[cfg(feature = "netlink")]
pub mod nl;

#[cfg(test)]
mod mocks;


pub use codec::{build_pattern, frames_equal, pattern_matches, PATTERN_TAIL};
pub use config::{ConfigError, LinkConfig, PingPongIds};
pub use controller::Controller;
pub use errors::{
    BusFault, CanError, CanErrorDecodingFailure, ConstructionError, ControllerError,
    ControllerProblem, LinkError,
};
pub use flags::ErrorFlags;
pub use frame::CanFrame;
pub use health::{HealthMonitor, HealthReport};
pub use irq::IrqLine;
pub use link::{Link, LinkState, ReinitReason, Session};
pub use node::{Clock, MonotonicClock, Node, Stats, TickReport};
pub use protocol::{Dispatch, Origination, ProtocolEngine, Verdict};
pub use socket::SocketController;
pub use timing::BitTiming;

#[cfg(feature = "netlink")]
pub use nl::CanInterface;
