// canpong/src/health.rs
//
// Periodic inspection of the controller error flags.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Bus health monitoring.
//!
//! The error flags are read at most once per health interval. Depending
//! on what they show the monitor clears a receive overflow, reinitializes
//! the link on bus-off or on a persistent error-passive condition, or
//! just logs a warning.

use crate::{BusFault, Controller, ErrorFlags, Link, LinkConfig, ReinitReason};
use log::{debug, warn};

/// What a single health check saw and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// The flags as read from the controller
    pub flags: ErrorFlags,
    /// A receive overflow was found and cleared
    pub overflow_cleared: bool,
    /// A reinitialization was started
    pub reinit: Option<ReinitReason>,
}

impl HealthReport {
    /// The fault conditions behind this report, most severe first.
    pub fn faults(&self) -> Vec<BusFault> {
        BusFault::from_flags(self.flags)
    }
}

/// Rate-limited error-flag supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitor {
    interval_ms: u32,
    passive_limit: u8,
}

impl HealthMonitor {
    /// Creates a monitor using the health settings of a link configuration.
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            interval_ms: config.health_interval_ms,
            passive_limit: config.passive_reinit_streak,
        }
    }

    /// Runs a health check if one is due.
    ///
    /// Returns `None` when the link is not operational or the last check
    /// was less than one interval ago.
    pub fn poll<C: Controller>(&self, link: &mut Link<C>, now: u32) -> Option<HealthReport> {
        if !link.is_operational()
            || now.wrapping_sub(link.session().last_health_check_ms) < self.interval_ms
        {
            return None;
        }
        link.session_mut().last_health_check_ms = now;

        let flags = link.controller_mut().read_error_flags();
        let mut report = HealthReport {
            flags,
            ..HealthReport::default()
        };
        debug!("Error flags: {}", flags);

        if flags.is_overflow() {
            warn!("Receive overflow ({}), frames were lost", flags);
            link.controller_mut().clear_receive_overflow();
            report.overflow_cleared = true;
        }

        if flags.is_bus_off() {
            warn!("Controller is bus-off");
            link.reinitialize(ReinitReason::BusOff, now);
            report.reinit = Some(ReinitReason::BusOff);
            return Some(report);
        }

        if flags.is_error_passive() {
            let session = link.session_mut();
            session.passive_streak = session.passive_streak.saturating_add(1);
            let streak = session.passive_streak;
            warn!(
                "Controller is error-passive ({}/{})",
                streak, self.passive_limit
            );
            if streak >= self.passive_limit {
                link.reinitialize(ReinitReason::ErrorPassive, now);
                report.reinit = Some(ReinitReason::ErrorPassive);
                return Some(report);
            }
        } else {
            link.session_mut().passive_streak = 0;
        }

        if flags.is_warning() {
            warn!("Controller error warning ({})", flags);
        }

        Some(report)
    }
}

/////////////////////////////////////////////////////////////////////////////
