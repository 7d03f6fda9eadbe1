// canpong/src/protocol.rs
//
// The bidirectional ping/pong exchange.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Ping/pong protocol engine.
//!
//! Two exchanges run over the bus at the same time:
//!
//! ```text
//!   self  --ping (self_ping)-->  peer      peer  --ping (peer_ping)-->  self
//!   self  <--pong (peer_pong)--  peer      peer  <--pong (self_pong)--  self
//! ```
//!
//! A pong must echo the ping payload byte for byte. The engine sends a
//! ping every period, compares answering pongs against the last one, and
//! echoes every ping it gets from the peer whether or not the payload is
//! intact, so the peer gets to see the corruption as well.

use crate::{
    build_pattern, frames_equal, pattern_matches, CanFrame, Controller, Link, LinkConfig,
    PingPongIds,
};
use log::{debug, info, warn};
use std::fmt;

/// Result of checking a frame against what was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The payload is exactly what was expected.
    Match,
    /// The payload differs, or there was nothing to compare against.
    Mismatch,
}

impl Verdict {
    fn from_bool(ok: bool) -> Self {
        if ok {
            Verdict::Match
        } else {
            Verdict::Mismatch
        }
    }

    /// Whether this is a match.
    pub fn is_match(&self) -> bool {
        *self == Verdict::Match
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Verdict::Match => f.write_str("MATCHED"),
            Verdict::Mismatch => f.write_str("MISMATCH"),
        }
    }
}

/// A self-originated ping, as handed to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origination {
    /// The ping frame
    pub frame: CanFrame,
    /// Whether the controller accepted it
    pub sent: bool,
}

/// What the engine made of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A pong answering one of our pings.
    Pong(Verdict),
    /// A ping from the peer, and whether the echo went out.
    Ping { verdict: Verdict, echoed: bool },
    /// Some other identifier.
    Ignored,
}

/// The protocol state carried across sessions.
///
/// The rolling counter and the ping schedule live here rather than in the
/// link session, so they are not reset when the controller is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEngine {
    ids: PingPongIds,
    period_ms: u32,
    counter: u8,
    last_ping_ms: u32,
}

impl ProtocolEngine {
    /// Creates an engine for the identifiers and period in `config`.
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            ids: config.ids,
            period_ms: config.ping_period_ms,
            counter: 0,
            last_ping_ms: 0,
        }
    }

    /// The counter value the next ping will carry.
    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// The identifiers this engine uses.
    pub fn ids(&self) -> &PingPongIds {
        &self.ids
    }

    /// Sends a ping if one is due.
    ///
    /// The ping becomes the outstanding one even if the send failed.
    pub fn originate<C: Controller>(
        &mut self,
        link: &mut Link<C>,
        now: u32,
    ) -> Option<Origination> {
        if now.wrapping_sub(self.last_ping_ms) < self.period_ms {
            return None;
        }
        self.last_ping_ms = now;

        let frame = build_pattern(self.ids.self_ping, self.counter);
        info!("TX PING {}", frame);
        let sent = link.send(&frame, now).is_ok();

        link.session_mut().last_ping = Some(frame);
        self.counter = self.counter.wrapping_add(1);
        Some(Origination { frame, sent })
    }

    /// Handles a single received frame.
    pub fn dispatch<C: Controller>(
        &mut self,
        link: &mut Link<C>,
        frame: &CanFrame,
        now: u32,
    ) -> Dispatch {
        let id = frame.raw_id();

        if id == self.ids.peer_pong {
            let verdict = match link.session().last_ping {
                Some(ping) => Verdict::from_bool(frames_equal(frame, &ping)),
                None => Verdict::Mismatch,
            };
            info!("RX PONG {}", frame);
            match verdict {
                Verdict::Match => info!("{} (self-initiated)", verdict),
                Verdict::Mismatch => warn!("{} (self-initiated)", verdict),
            }
            Dispatch::Pong(verdict)
        } else if id == self.ids.peer_ping {
            let verdict = Verdict::from_bool(pattern_matches(frame));
            info!("RX PING {}", frame);
            match verdict {
                Verdict::Match => info!("{} (peer-initiated)", verdict),
                Verdict::Mismatch => warn!("{} (peer-initiated)", verdict),
            }

            let pong = frame.with_id(self.ids.self_pong);
            info!("TX PONG {}", pong);
            let echoed = link.send(&pong, now).is_ok();
            Dispatch::Ping { verdict, echoed }
        } else {
            debug!("Ignoring {}", frame);
            Dispatch::Ignored
        }
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockController;

    fn setup() -> (ProtocolEngine, Link<MockController>) {
        let config = LinkConfig::default();
        let mut link = Link::new(MockController::new(), config);
        link.initialize(0).unwrap();
        (ProtocolEngine::new(&config), link)
    }

    #[test]
    fn test_ping_schedule() {
        let (mut engine, mut link) = setup();

        assert_eq!(None, engine.originate(&mut link, 999));
        let ping = engine.originate(&mut link, 1000).unwrap();
        assert!(ping.sent);
        assert_eq!(0x123, ping.frame.raw_id());
        assert_eq!(&[0x00, 0xFF], &ping.frame.data()[..2]);
        assert_eq!(1, engine.counter());

        assert_eq!(None, engine.originate(&mut link, 1999));
        let ping = engine.originate(&mut link, 2000).unwrap();
        assert_eq!(&[0x01, 0xFE], &ping.frame.data()[..2]);
        assert_eq!(Some(ping.frame), link.session().last_ping);
        assert_eq!(2, link.controller().sent.len());
    }

    #[test]
    fn test_counter_wraps() {
        let (mut engine, mut link) = setup();
        engine.counter = 0xFF;

        let ping = engine.originate(&mut link, 1000).unwrap();
        assert_eq!(&[0xFF, 0x00], &ping.frame.data()[..2]);
        assert_eq!(0, engine.counter());
    }

    #[test]
    fn test_failed_ping_is_outstanding() {
        let (mut engine, mut link) = setup();
        link.controller_mut().fail_send = true;

        let ping = engine.originate(&mut link, 1000).unwrap();
        assert!(!ping.sent);
        assert_eq!(Some(ping.frame), link.session().last_ping);
        assert_eq!(1, link.session().send_errors);
        assert_eq!(1, engine.counter());
    }

    #[test]
    fn test_pong_match() {
        let (mut engine, mut link) = setup();
        engine.counter = 7;
        let ping = engine.originate(&mut link, 1000).unwrap().frame;
        assert_eq!(
            &[0x07, 0xF8, 0x55, 0xAA, 0xC3, 0x3C, 0x5A, 0xA5],
            ping.data()
        );

        let pong = ping.with_id(0x124);
        assert_eq!(
            Dispatch::Pong(Verdict::Match),
            engine.dispatch(&mut link, &pong, 1010)
        );
        // The ping stays outstanding
        assert_eq!(Some(ping), link.session().last_ping);
        assert_eq!(
            Dispatch::Pong(Verdict::Match),
            engine.dispatch(&mut link, &pong, 1020)
        );
    }

    #[test]
    fn test_pong_mismatch() {
        let (mut engine, mut link) = setup();
        engine.counter = 7;
        engine.originate(&mut link, 1000);

        let pong = CanFrame::from_array(0x124, [0x07, 0xF8, 0x44, 0xAA, 0xC3, 0x3C, 0x5A, 0xA5]);
        assert_eq!(
            Dispatch::Pong(Verdict::Mismatch),
            engine.dispatch(&mut link, &pong, 1010)
        );
    }

    #[test]
    fn test_pong_without_ping() {
        let (mut engine, mut link) = setup();
        let pong = build_pattern(0x124, 0);
        assert_eq!(
            Dispatch::Pong(Verdict::Mismatch),
            engine.dispatch(&mut link, &pong, 10)
        );
        assert!(link.controller().sent.is_empty());
    }

    #[test]
    fn test_peer_ping_echoed() {
        let (mut engine, mut link) = setup();
        let ping = build_pattern(0x223, 0x42);

        assert_eq!(
            Dispatch::Ping {
                verdict: Verdict::Match,
                echoed: true
            },
            engine.dispatch(&mut link, &ping, 10)
        );
        let sent = link.controller().sent[0];
        assert_eq!(0x224, sent.raw_id());
        assert_eq!(ping.data(), sent.data());
        assert_eq!(10, link.session().last_activity_ms);
    }

    #[test]
    fn test_corrupt_ping_echoed_anyway() {
        let (mut engine, mut link) = setup();
        let ping = CanFrame::from_array(0x223, [0x05, 0x00, 0x55, 0xAA, 0xC3, 0x3C, 0x5A, 0xA5]);

        assert_eq!(
            Dispatch::Ping {
                verdict: Verdict::Mismatch,
                echoed: true
            },
            engine.dispatch(&mut link, &ping, 10)
        );
        let sent = link.controller().sent[0];
        assert_eq!(0x224, sent.raw_id());
        assert_eq!(ping.data(), sent.data());
    }

    #[test]
    fn test_short_ping_echoed_with_its_length() {
        let (mut engine, mut link) = setup();
        let ping = CanFrame::new(0x223, &[1, 2, 3]).unwrap();

        let res = engine.dispatch(&mut link, &ping, 10);
        assert_eq!(
            Dispatch::Ping {
                verdict: Verdict::Mismatch,
                echoed: true
            },
            res
        );
        assert_eq!(&[1, 2, 3], link.controller().sent[0].data());
    }

    #[test]
    fn test_echo_failure() {
        let (mut engine, mut link) = setup();
        link.controller_mut().fail_send = true;

        let res = engine.dispatch(&mut link, &build_pattern(0x223, 1), 10);
        assert_eq!(
            Dispatch::Ping {
                verdict: Verdict::Match,
                echoed: false
            },
            res
        );
        assert_eq!(1, link.session().send_errors);
    }

    #[test]
    fn test_other_ids_ignored() {
        let (mut engine, mut link) = setup();
        for id in [0x000, 0x123, 0x224, 0x7FF] {
            let frame = build_pattern(id, 0);
            assert_eq!(Dispatch::Ignored, engine.dispatch(&mut link, &frame, 10));
        }
        assert!(link.controller().sent.is_empty());
    }

    #[test]
    fn test_peer_role() {
        let config = LinkConfig::with_ids(PingPongIds::peer());
        let mut link = Link::new(MockController::new(), config);
        link.initialize(0).unwrap();
        let mut engine = ProtocolEngine::new(&config);

        let ping = engine.originate(&mut link, 1000).unwrap().frame;
        assert_eq!(0x223, ping.raw_id());

        let res = engine.dispatch(&mut link, &build_pattern(0x123, 4), 1001);
        assert!(matches!(res, Dispatch::Ping { verdict: Verdict::Match, .. }));
        assert_eq!(0x124, link.controller().sent[1].raw_id());

        let res = engine.dispatch(&mut link, &ping.with_id(0x224), 1002);
        assert_eq!(Dispatch::Pong(Verdict::Match), res);
    }
}
