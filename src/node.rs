// canpong/src/node.rs
//
// The cooperative scheduler of a ping/pong node.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The node main loop.
//!
//! A [`Node`] ties the link, the protocol engine and the health monitor
//! together and runs them from a single thread. Each tick does, in order:
//!
//! 1. send a ping if one is due,
//! 2. drain and dispatch received frames if the interrupt line fired or
//!    the controller reports pending data,
//! 3. run a health check if one is due,
//! 4. evaluate the link for a stall.
//!
//! A tick that received nothing is followed by a short sleep so an idle
//! node does not spin.

use crate::{
    Controller, Dispatch, HealthMonitor, HealthReport, Link, LinkConfig, LinkError, LinkState,
    Origination, ProtocolEngine, ReinitReason,
};
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

// ===== Clock =====

/// A millisecond time source.
///
/// Readings wrap around at `u32::MAX`; every consumer compares times with
/// `wrapping_sub`.
pub trait Clock {
    /// Milliseconds since some fixed starting point.
    fn now_ms(&self) -> u32;

    /// Blocks the calling thread for a while.
    fn sleep_ms(&self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }
}

/// The system monotonic clock, counted from its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    /// Creates a clock reading zero now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        // Truncation gives the wrapping millisecond counter.
        self.start.elapsed().as_millis() as u32
    }
}

// ===== Stats =====

/// Running totals over the life of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Pings accepted by the controller
    pub pings_sent: u64,
    /// Pings the controller refused
    pub ping_failures: u64,
    /// Pongs that echoed our ping
    pub pongs_matched: u64,
    /// Pongs that did not
    pub pongs_mismatched: u64,
    /// Peer pings with an intact pattern
    pub peer_pings_matched: u64,
    /// Peer pings with a broken pattern
    pub peer_pings_mismatched: u64,
    /// Pongs sent back to the peer
    pub echoes_sent: u64,
    /// Pongs the controller refused
    pub echo_failures: u64,
    /// Frames with an identifier of no interest
    pub ignored: u64,
    /// Receive overflows cleared
    pub overflows: u64,
    /// Controller reinitializations
    pub reinits: u32,
}

impl Stats {
    fn record_ping(&mut self, ping: &Origination) {
        if ping.sent {
            self.pings_sent += 1;
        } else {
            self.ping_failures += 1;
        }
    }

    fn record_dispatch(&mut self, dispatch: &Dispatch) {
        match *dispatch {
            Dispatch::Pong(verdict) if verdict.is_match() => self.pongs_matched += 1,
            Dispatch::Pong(_) => self.pongs_mismatched += 1,
            Dispatch::Ping { verdict, echoed } => {
                if verdict.is_match() {
                    self.peer_pings_matched += 1;
                } else {
                    self.peer_pings_mismatched += 1;
                }
                if echoed {
                    self.echoes_sent += 1;
                } else {
                    self.echo_failures += 1;
                }
            }
            Dispatch::Ignored => self.ignored += 1,
        }
    }

    /// Total number of mismatches in both directions.
    pub fn mismatches(&self) -> u64 {
        self.pongs_mismatched + self.peer_pings_mismatched
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "pings:      {} sent, {} failed",
            self.pings_sent, self.ping_failures
        )?;
        writeln!(
            f,
            "pongs:      {} matched, {} mismatched",
            self.pongs_matched, self.pongs_mismatched
        )?;
        writeln!(
            f,
            "peer pings: {} matched, {} mismatched",
            self.peer_pings_matched, self.peer_pings_mismatched
        )?;
        writeln!(
            f,
            "echoes:     {} sent, {} failed",
            self.echoes_sent, self.echo_failures
        )?;
        write!(
            f,
            "link:       {} reinits, {} overflows, {} ignored frames",
            self.reinits, self.overflows, self.ignored
        )
    }
}

// ===== Node =====

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The ping sent this tick, if one was due
    pub ping: Option<Origination>,
    /// Every received frame, as dispatched
    pub received: Vec<Dispatch>,
    /// The health check, if one was due
    pub health: Option<HealthReport>,
    /// A reinit started by the stall check
    pub stall: Option<ReinitReason>,
}

impl TickReport {
    /// Whether the tick found nothing to receive.
    pub fn is_idle(&self) -> bool {
        self.received.is_empty()
    }
}

/// A ping/pong node: one link, one engine, one loop.
#[derive(Debug)]
pub struct Node<C, K = MonotonicClock> {
    link: Link<C>,
    engine: ProtocolEngine,
    health: HealthMonitor,
    clock: K,
    stats: Stats,
}

impl<C: Controller, K: Clock> Node<C, K> {
    /// Validates the configuration and performs the boot initialization.
    ///
    /// If the controller can not be brought up the node never starts and
    /// the error is `LinkError::Halted`.
    pub fn start(ctrl: C, config: LinkConfig, clock: K) -> Result<Self, LinkError> {
        config.validate()?;

        let mut link = Link::new(ctrl, config);
        link.boot(clock.now_ms())?;

        Ok(Self {
            link,
            engine: ProtocolEngine::new(&config),
            health: HealthMonitor::new(&config),
            clock,
            stats: Stats::default(),
        })
    }

    /// Gets the link.
    pub fn link(&self) -> &Link<C> {
        &self.link
    }

    /// Gets the link, mutably.
    pub fn link_mut(&mut self) -> &mut Link<C> {
        &mut self.link
    }

    /// Gets the protocol engine.
    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Gets the clock driving this node.
    pub fn clock(&self) -> &K {
        &self.clock
    }

    /// Gets the running totals.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Runs one pass of the main loop at time `now`.
    pub fn tick(&mut self, now: u32) -> TickReport {
        let mut report = TickReport::default();
        if self.link.state() == LinkState::Halted {
            return report;
        }

        report.ping = self.engine.originate(&mut self.link, now);
        if let Some(ping) = &report.ping {
            self.stats.record_ping(ping);
        }

        if self.link.is_operational()
            && (self.link.irq().take() || self.link.controller_mut().poll_receive())
        {
            while let Some(frame) = self.link.controller_mut().receive() {
                self.link.mark_activity(now);
                let dispatch = self.engine.dispatch(&mut self.link, &frame, now);
                self.stats.record_dispatch(&dispatch);
                report.received.push(dispatch);
            }
        }

        report.health = self.health.poll(&mut self.link, now);
        if report.health.map_or(false, |h| h.overflow_cleared) {
            self.stats.overflows += 1;
        }

        report.stall = self.link.evaluate_stall(now);
        self.stats.reinits = self.link.reinit_count();
        report
    }

    /// Runs the loop until `stop` is set.
    pub fn run_until(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.step();
        }
    }

    /// Runs the loop forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.step();
        }
    }

    fn step(&mut self) {
        let report = self.tick(self.clock.now_ms());
        if report.is_idle() {
            self.clock.sleep_ms(self.link.config().idle_backoff_ms);
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
