// canpong/src/config.rs
//
// Timing constants and runtime configuration for the ping/pong node.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Link configuration.
//!
//! All of the thresholds that drive the protocol and the recovery policy
//! are collected here as named constants. A [`LinkConfig`] carries a copy
//! of them so that tests can shrink the intervals and limits without
//! touching the code that consumes them.
//!
//! All times are in milliseconds of the node's monotonic [`Clock`](crate::Clock).

use embedded_can::StandardId;
use std::fmt;
use thiserror::Error;

/// Period between self-originated pings.
pub const PING_PERIOD_MS: u32 = 1000;

/// Quiet time after which an outstanding send error forces a reinit.
pub const ACTIVITY_TIMEOUT_MS: u32 = 5000;

/// Consecutive send failures that force an immediate reinit.
pub const ERROR_REINIT_LIMIT: u8 = 5;

/// Minimum time between two reads of the controller error flags.
pub const HEALTH_CHECK_INTERVAL_MS: u32 = 200;

/// Consecutive error-passive health polls that force a reinit.
pub const PASSIVE_REINIT_STREAK: u8 = 3;

/// Sleep between loop ticks that did not drain any frame.
pub const IDLE_BACKOFF_MS: u32 = 5;

/// Bus bitrate, in bit/s.
pub const BITRATE: u32 = 125_000;

/// Controller input clock, in Hz.
pub const CLOCK_HZ: u32 = 8_000_000;

/// Self-originated ping (this node -> peer).
pub const SELF_PING_ID: u16 = 0x123;

/// Peer's reply to a self-originated ping (peer -> this node).
pub const PEER_PONG_ID: u16 = 0x124;

/// Peer-originated ping (peer -> this node).
pub const PEER_PING_ID: u16 = 0x223;

/// This node's reply to a peer-originated ping (this node -> peer).
pub const SELF_PONG_ID: u16 = 0x224;

/// Errors found while validating a configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An identifier does not fit in 11 bits.
    #[error("CAN ID 0x{0:X} is not a standard 11-bit identifier")]
    IdTooLarge(u16),
    /// Two protocol roles share one identifier.
    #[error("CAN ID 0x{0:X} is used for more than one role")]
    DuplicateId(u16),
    /// A period, timeout or limit was set to zero.
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),
}

// ===== PingPongIds =====

/// The four fixed identifiers of the ping/pong exchange.
///
/// Both endpoints must agree on these. The peer uses the same four values
/// with the roles swapped, see [`PingPongIds::peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPongIds {
    /// Ping sent by this node
    pub self_ping: u16,
    /// Pong the peer returns for our ping
    pub peer_pong: u16,
    /// Ping sent by the peer
    pub peer_ping: u16,
    /// Pong we return for the peer's ping
    pub self_pong: u16,
}

impl PingPongIds {
    /// The identifiers as seen from the embedded node.
    pub const fn node() -> Self {
        Self {
            self_ping: SELF_PING_ID,
            peer_pong: PEER_PONG_ID,
            peer_ping: PEER_PING_ID,
            self_pong: SELF_PONG_ID,
        }
    }

    /// The identifiers as seen from the peer (host) end of the link.
    pub const fn peer() -> Self {
        Self {
            self_ping: PEER_PING_ID,
            peer_pong: SELF_PONG_ID,
            peer_ping: SELF_PING_ID,
            self_pong: PEER_PONG_ID,
        }
    }

    /// Gets the four identifiers in role order.
    pub fn as_array(&self) -> [u16; 4] {
        [self.self_ping, self.peer_pong, self.peer_ping, self.self_pong]
    }

    /// Checks that all four identifiers are distinct standard IDs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ids = self.as_array();
        for (i, id) in ids.iter().enumerate() {
            if StandardId::new(*id).is_none() {
                return Err(ConfigError::IdTooLarge(*id));
            }
            if ids[..i].contains(id) {
                return Err(ConfigError::DuplicateId(*id));
            }
        }
        Ok(())
    }
}

impl Default for PingPongIds {
    fn default() -> Self {
        Self::node()
    }
}

impl fmt::Display for PingPongIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ping 0x{:03X}/pong 0x{:03X}, peer ping 0x{:03X}/pong 0x{:03X}",
            self.self_ping, self.peer_pong, self.peer_ping, self.self_pong
        )
    }
}

// ===== LinkConfig =====

/// Runtime configuration of a ping/pong node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Protocol identifiers
    pub ids: PingPongIds,
    /// Bus bitrate, in bit/s
    pub bitrate: u32,
    /// Controller input clock, in Hz
    pub clock_hz: u32,
    /// Period between self-originated pings
    pub ping_period_ms: u32,
    /// Quiet time that, with an outstanding send error, forces a reinit
    pub activity_timeout_ms: u32,
    /// Consecutive send errors that force a reinit
    pub error_reinit_limit: u8,
    /// Minimum time between error-flag reads
    pub health_interval_ms: u32,
    /// Consecutive error-passive polls that force a reinit
    pub passive_reinit_streak: u8,
    /// Sleep after a tick that drained nothing
    pub idle_backoff_ms: u32,
}

impl LinkConfig {
    /// Creates the default configuration with the given identifiers.
    pub fn with_ids(ids: PingPongIds) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    /// Checks the configuration for values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ids.validate()?;

        let checks = [
            ("bitrate", self.bitrate),
            ("clock", self.clock_hz),
            ("ping period", self.ping_period_ms),
            ("activity timeout", self.activity_timeout_ms),
            ("error reinit limit", self.error_reinit_limit as u32),
            ("health interval", self.health_interval_ms),
            ("passive reinit streak", self.passive_reinit_streak as u32),
        ];
        match checks.iter().find(|(_, val)| *val == 0) {
            Some((name, _)) => Err(ConfigError::Zero(name)),
            None => Ok(()),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ids: PingPongIds::node(),
            bitrate: BITRATE,
            clock_hz: CLOCK_HZ,
            ping_period_ms: PING_PERIOD_MS,
            activity_timeout_ms: ACTIVITY_TIMEOUT_MS,
            error_reinit_limit: ERROR_REINIT_LIMIT,
            health_interval_ms: HEALTH_CHECK_INTERVAL_MS,
            passive_reinit_streak: PASSIVE_REINIT_STREAK,
            idle_backoff_ms: IDLE_BACKOFF_MS,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
