// canpong/src/link.rs
//
// Link session state and the controller lifecycle.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The link state machine.
//!
//! A [`Link`] owns the controller together with the per-session counters
//! that decide when it has to be torn down and brought up again:
//!
//! ```text
//!   Uninitialized --init ok--> Operational --fault--> Faulted
//!        ^    |                     ^                    |
//!        |    +--first init fails--> Halted              |
//!        |                          |                    |
//!        +------ reinit fails ------+---- reinit ok -----+
//! ```
//!
//! Every successful initialization starts a fresh [`Session`]. A failed
//! recovery leaves the link `Uninitialized` with the old counters in
//! place, so the next stall check tries again.

use crate::{CanFrame, Controller, ControllerError, IrqLine, LinkConfig, LinkError};
use log::{error, info, warn};
use std::{fmt, sync::Arc};

/// The lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not (or no longer) configured.
    Uninitialized,
    /// Configured and participating on the bus.
    Operational,
    /// A fault was detected and a reinit is under way.
    Faulted,
    /// The first initialization failed. Terminal.
    Halted,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use LinkState::*;
        let s = match *self {
            Uninitialized => "uninitialized",
            Operational => "operational",
            Faulted => "faulted",
            Halted => "halted",
        };
        f.write_str(s)
    }
}

/// Why a reinitialization was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinitReason {
    /// Too many consecutive send failures.
    SendErrors,
    /// No activity for too long while a send error is outstanding.
    ActivityTimeout,
    /// The controller reported bus-off.
    BusOff,
    /// The controller stayed error-passive for too many health checks.
    ErrorPassive,
}

impl fmt::Display for ReinitReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ReinitReason::*;
        let s = match *self {
            SendErrors => "too many send errors",
            ActivityTimeout => "no bus activity",
            BusOff => "bus-off",
            ErrorPassive => "persistent error-passive",
        };
        f.write_str(s)
    }
}

/// Counters and timestamps for one initialized session.
///
/// All times are wrapping milliseconds from the node's clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Session {
    /// The last self-originated ping, if any was sent this session
    pub last_ping: Option<CanFrame>,
    /// Consecutive send failures
    pub send_errors: u8,
    /// Consecutive error-passive health checks
    pub passive_streak: u8,
    /// Last successful send or received frame
    pub last_activity_ms: u32,
    /// Last error-flag read
    pub last_health_check_ms: u32,
}

impl Session {
    fn fresh(now: u32) -> Self {
        Self {
            last_activity_ms: now,
            last_health_check_ms: now,
            ..Self::default()
        }
    }
}

/// A controller plus the state that governs its lifecycle.
#[derive(Debug)]
pub struct Link<C> {
    ctrl: C,
    config: LinkConfig,
    state: LinkState,
    session: Session,
    irq: Arc<IrqLine>,
    reinits: u32,
}

impl<C: Controller> Link<C> {
    /// Wraps a controller and connects its interrupt source.
    ///
    /// The controller is not touched otherwise; call [`Link::boot`] or
    /// [`Link::initialize`] to bring it up.
    pub fn new(mut ctrl: C, config: LinkConfig) -> Self {
        let irq = Arc::new(IrqLine::new());
        ctrl.attach_irq(Arc::clone(&irq));
        Self {
            ctrl,
            config,
            state: LinkState::Uninitialized,
            session: Session::default(),
            irq,
            reinits: 0,
        }
    }

    /// Gets the current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Determines if the link is ready for bus traffic.
    pub fn is_operational(&self) -> bool {
        self.state == LinkState::Operational
    }

    /// Gets the current session counters.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Gets the configuration the link was created with.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Gets a reference to the underlying controller.
    pub fn controller(&self) -> &C {
        &self.ctrl
    }

    /// Gets a mutable reference to the underlying controller.
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    /// The receive interrupt line of this link.
    pub fn irq(&self) -> &Arc<IrqLine> {
        &self.irq
    }

    /// Number of reinitializations attempted so far.
    pub fn reinit_count(&self) -> u32 {
        self.reinits
    }

    /// Runs the controller initialization sequence.
    ///
    /// On success the session starts over: counters are zeroed, the
    /// timestamps are set to `now`, any stale interrupt is discarded and
    /// the outstanding ping is forgotten. On failure the session is left
    /// alone and the link is `Uninitialized`.
    pub fn initialize(&mut self, now: u32) -> Result<(), LinkError> {
        self.ctrl.reset();

        let LinkConfig {
            bitrate, clock_hz, ..
        } = self.config;

        let res = self
            .ctrl
            .configure(bitrate, clock_hz)
            .and_then(|_| self.ctrl.enter_operating_mode());

        match res {
            Ok(()) => {
                self.session = Session::fresh(now);
                self.irq.take();
                self.state = LinkState::Operational;
                info!(
                    "Controller initialized: {} bit/s, {} Hz clock",
                    bitrate, clock_hz
                );
                Ok(())
            }
            Err(err) => {
                self.state = LinkState::Uninitialized;
                error!("Controller initialization failed: {}", err);
                Err(err.into())
            }
        }
    }

    /// Performs the first initialization.
    ///
    /// A failure here is fatal: the link goes to `Halted` and stays there.
    pub fn boot(&mut self, now: u32) -> Result<(), LinkError> {
        match self.initialize(now) {
            Err(LinkError::Controller(err)) => {
                self.state = LinkState::Halted;
                error!("Initial controller setup failed, halting");
                Err(LinkError::Halted(err))
            }
            res => res,
        }
    }

    /// Tears the controller down and brings it back up.
    ///
    /// Returns `true` if the link is operational afterwards.
    pub fn reinitialize(&mut self, reason: ReinitReason, now: u32) -> bool {
        if self.state == LinkState::Halted {
            return false;
        }
        self.state = LinkState::Faulted;
        self.reinits = self.reinits.wrapping_add(1);
        warn!("Reinitializing controller: {}", reason);
        self.initialize(now).is_ok()
    }

    /// Sends a frame, keeping the consecutive error count up to date.
    ///
    /// A success clears the count and counts as bus activity. A link that
    /// is not operational refuses the frame without touching the
    /// controller, and the refusal counts as a send error, so a failed
    /// recovery is retried by the stall check.
    pub fn send(&mut self, frame: &CanFrame, now: u32) -> Result<(), ControllerError> {
        let res = if self.is_operational() {
            self.ctrl.send(frame)
        } else {
            Err(ControllerError::Transmit(format!("link is {}", self.state)))
        };
        match res {
            Ok(()) => {
                self.session.send_errors = 0;
                self.session.last_activity_ms = now;
                Ok(())
            }
            Err(err) => {
                self.session.send_errors = self.session.send_errors.saturating_add(1);
                warn!(
                    "Send failed ({}/{}): {}",
                    self.session.send_errors, self.config.error_reinit_limit, err
                );
                Err(err)
            }
        }
    }

    /// Records bus activity, as for a received frame.
    pub fn mark_activity(&mut self, now: u32) {
        self.session.last_activity_ms = now;
    }

    /// Checks the session for a stalled link and recovers if needed.
    ///
    /// Two independent triggers, the first one found wins:
    /// - the consecutive send error count reached its limit, or
    /// - nothing happened for longer than the activity timeout while at
    ///   least one send error is outstanding.
    ///
    /// A quiet bus alone never forces a reinit.
    pub fn evaluate_stall(&mut self, now: u32) -> Option<ReinitReason> {
        if self.state == LinkState::Halted {
            return None;
        }

        let Session {
            send_errors,
            last_activity_ms,
            ..
        } = self.session;

        let reason = if send_errors >= self.config.error_reinit_limit {
            ReinitReason::SendErrors
        } else if send_errors > 0
            && now.wrapping_sub(last_activity_ms) > self.config.activity_timeout_ms
        {
            ReinitReason::ActivityTimeout
        } else {
            return None;
        };

        self.reinitialize(reason, now);
        Some(reason)
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_pattern, mocks::MockController, ErrorFlags};

    fn link() -> Link<MockController> {
        Link::new(MockController::new(), LinkConfig::default())
    }

    fn failing_link() -> Link<MockController> {
        let mut link = link();
        link.initialize(0).unwrap();
        link.controller_mut().fail_send = true;
        link
    }

    #[test]
    fn test_new_attaches_irq() {
        let link = link();
        assert_eq!(LinkState::Uninitialized, link.state());
        assert!(link.controller().irq.is_some());
        assert_eq!(0, link.controller().resets);
    }

    #[test]
    fn test_initialize() {
        let mut link = link();
        link.controller_mut().irq.as_ref().unwrap().raise();

        link.initialize(1234).unwrap();
        assert!(link.is_operational());
        assert_eq!(1, link.controller().resets);
        assert_eq!(vec![(125_000, 8_000_000)], link.controller().configured);

        let session = link.session();
        assert_eq!(0, session.send_errors);
        assert_eq!(0, session.passive_streak);
        assert_eq!(1234, session.last_activity_ms);
        assert_eq!(1234, session.last_health_check_ms);
        assert!(session.last_ping.is_none());
        assert!(!link.irq().is_pending());
    }

    #[test]
    fn test_initialize_failure() {
        let mut link = link();
        link.controller_mut().fail_mode = true;

        let err = link.initialize(0).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Controller(ControllerError::ModeTransition(_))
        ));
        assert_eq!(LinkState::Uninitialized, link.state());
    }

    #[test]
    fn test_boot_failure_halts() {
        let mut link = link();
        link.controller_mut().fail_configure = true;

        let err = link.boot(0).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Halted(ControllerError::Configuration(_))
        ));
        assert_eq!(LinkState::Halted, link.state());

        // Nothing brings a halted link back on its own
        assert!(!link.reinitialize(ReinitReason::BusOff, 10));
        assert_eq!(None, link.evaluate_stall(100_000));
        assert_eq!(1, link.controller().resets);
    }

    #[test]
    fn test_send_counts_errors() {
        let mut link = failing_link();
        let frame = build_pattern(0x123, 0);

        assert!(link.send(&frame, 10).unwrap_err().is_transmit());
        assert!(link.send(&frame, 20).is_err());
        assert_eq!(2, link.session().send_errors);
        assert_eq!(0, link.session().last_activity_ms);

        link.controller_mut().fail_send = false;
        link.send(&frame, 30).unwrap();
        assert_eq!(0, link.session().send_errors);
        assert_eq!(30, link.session().last_activity_ms);
        assert_eq!(vec![frame], link.controller().sent);
    }

    #[test]
    fn test_stall_send_error_limit() {
        let mut link = failing_link();
        let frame = build_pattern(0x123, 0);

        for i in 1..5 {
            let _ = link.send(&frame, i);
            assert_eq!(None, link.evaluate_stall(i));
        }
        let _ = link.send(&frame, 5);
        assert_eq!(5, link.session().send_errors);

        assert_eq!(Some(ReinitReason::SendErrors), link.evaluate_stall(5));
        assert!(link.is_operational());
        assert_eq!(0, link.session().send_errors);
        assert_eq!(2, link.controller().resets);
        assert_eq!(1, link.reinit_count());
    }

    #[test]
    fn test_stall_timeout_needs_send_error() {
        let mut link = link();
        link.initialize(0).unwrap();

        // A quiet bus with no errors is left alone
        assert_eq!(None, link.evaluate_stall(60_000));

        link.mark_activity(60_000);
        link.controller_mut().fail_send = true;
        let _ = link.send(&build_pattern(0x123, 0), 61_000);
        assert_eq!(None, link.evaluate_stall(65_000));
        assert_eq!(
            Some(ReinitReason::ActivityTimeout),
            link.evaluate_stall(65_001)
        );
        assert_eq!(0, link.session().send_errors);
        assert_eq!(65_001, link.session().last_activity_ms);
    }

    #[test]
    fn test_stall_timeout_wraps() {
        let mut link = link();
        let start = u32::MAX - 1000;
        link.initialize(start).unwrap();
        link.controller_mut().fail_send = true;
        let _ = link.send(&build_pattern(0x123, 0), start);

        // 4999 ms later, across the wrap
        assert_eq!(None, link.evaluate_stall(start.wrapping_add(4999)));
        assert_eq!(
            Some(ReinitReason::ActivityTimeout),
            link.evaluate_stall(start.wrapping_add(5001))
        );
    }

    #[test]
    fn test_failed_recovery_retries() {
        let mut link = failing_link();
        for i in 0..5 {
            let _ = link.send(&build_pattern(0x123, 0), i);
        }

        link.controller_mut().fail_configure = true;
        assert_eq!(Some(ReinitReason::SendErrors), link.evaluate_stall(10));
        assert_eq!(LinkState::Uninitialized, link.state());
        assert_eq!(5, link.session().send_errors);

        // Still stalled, so the next check tries again
        link.controller_mut().fail_configure = false;
        assert_eq!(Some(ReinitReason::SendErrors), link.evaluate_stall(20));
        assert!(link.is_operational());
        assert_eq!(3, link.controller().resets);
    }

    #[test]
    fn test_send_refused_when_not_operational() {
        let mut link = link();
        link.controller_mut().fail_mode = true;
        let _ = link.initialize(0);

        // The controller would take it, the link does not
        let err = link.send(&build_pattern(0x123, 0), 10).unwrap_err();
        assert!(err.is_transmit());
        assert!(link.controller().sent.is_empty());
        assert_eq!(1, link.session().send_errors);
    }

    #[test]
    fn test_reinit_forgets_ping() {
        let mut link = link();
        link.initialize(0).unwrap();
        link.session_mut().last_ping = Some(build_pattern(0x123, 9));
        link.session_mut().passive_streak = 2;
        link.controller_mut().flags = ErrorFlags::TXBO;

        assert!(link.reinitialize(ReinitReason::BusOff, 50));
        assert!(link.session().last_ping.is_none());
        assert_eq!(0, link.session().passive_streak);
    }
}
