// canpong/src/timing.rs
//
// Bit-timing derivation for the bus controller.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN bit timing.
//!
//! A bit is divided into time quanta (TQ). On MCP2515-class controllers
//! one TQ is `2 * BRP / Fosc`, and a bit is built from
//!
//! ```text
//!   | SYNC (1) | PROP (1-8) | PS1 (1-8) | PS2 (2-8) |
//!                                       ^ sample point
//! ```
//!
//! for a total of 8 to 25 TQ. A bitrate can only be programmed if it
//! divides the oscillator into a whole number of quanta within those
//! limits; otherwise the pair is rejected.
//!
//! For further information, please read chapter "8 BIT TIMING
//! REQUIREMENTS" of the "Bosch CAN Specification version 2.0".

use crate::ControllerError;

/// Smallest number of time quanta per bit.
const TQ_MIN: u32 = 8;
/// Largest number of time quanta per bit.
const TQ_MAX: u32 = 25;
/// Largest baud-rate prescaler.
const BRP_MAX: u32 = 64;
/// Longest propagation or phase segment.
const SEG_MAX: u32 = 8;
/// Sample point that the derivation aims for, in tenths of a percent.
const SAMPLE_POINT_TARGET: u32 = 750;

/// Bit-timing parameters for one bitrate/clock pair.
///
/// The fields follow the Linux `can_bittiming` structure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    /// Bit-rate in bits/second
    pub bitrate: u32,
    /// Sample point in one-tenth of a percent
    pub sample_point: u32,
    /// Time quanta (TQ) in nanoseconds
    pub tq: u32,
    /// Propagation segment in TQs
    pub prop_seg: u32,
    /// Phase buffer segment 1 in TQs
    pub phase_seg1: u32,
    /// Phase buffer segment 2 in TQs
    pub phase_seg2: u32,
    /// Synchronisation jump width in TQs
    pub sjw: u32,
    /// Bit-rate prescaler
    pub brp: u32,
}

impl BitTiming {
    /// Derives the timing for a bitrate on a controller clocked at `clock_hz`.
    ///
    /// Prefers the most quanta per bit (finest sample point resolution).
    pub fn calc(bitrate: u32, clock_hz: u32) -> Result<Self, ControllerError> {
        if bitrate == 0 || clock_hz == 0 {
            return Err(ControllerError::Configuration(format!(
                "bitrate {} bit/s with a {} Hz clock",
                bitrate, clock_hz
            )));
        }

        // Fosc / (2 * bitrate) must equal BRP * quanta-per-bit.
        let double_rate = 2 * bitrate as u64;
        if clock_hz as u64 % double_rate != 0 {
            return Err(unsupported(bitrate, clock_hz));
        }
        let product = (clock_hz as u64 / double_rate) as u32;

        (TQ_MIN..=TQ_MAX)
            .rev()
            .filter(|n| product % n == 0)
            .map(|n| (n, product / n))
            .find(|(_, brp)| (1..=BRP_MAX).contains(brp))
            .map(|(n, brp)| Self::split(bitrate, clock_hz, n, brp))
            .ok_or_else(|| unsupported(bitrate, clock_hz))
    }

    /// Splits `n` quanta into segments around the target sample point.
    fn split(bitrate: u32, clock_hz: u32, n: u32, brp: u32) -> Self {
        // PS2 is 2..=8 quanta, and SYNC + PROP + PS1 is 3..=17.
        let lo = (n - SEG_MAX).max(3);
        let hi = (n - 2).min(1 + 2 * SEG_MAX);
        let before_sample = ((n * SAMPLE_POINT_TARGET + 500) / 1000).clamp(lo, hi);
        let phase_seg2 = n - before_sample;
        // SYNC takes one quantum; the rest before the sample point is
        // shared by PROP and PS1.
        let rest = before_sample - 1;
        let phase_seg1 = (rest / 2).clamp(1, SEG_MAX).max(rest.saturating_sub(SEG_MAX));
        let prop_seg = rest - phase_seg1;

        Self {
            bitrate,
            sample_point: 1000 * before_sample / n,
            tq: (2_000_000_000u64 * brp as u64 / clock_hz as u64) as u32,
            prop_seg,
            phase_seg1,
            phase_seg2,
            sjw: 1,
            brp,
        }
    }

    /// Total number of time quanta in one bit.
    pub fn quanta(&self) -> u32 {
        1 + self.prop_seg + self.phase_seg1 + self.phase_seg2
    }

    /// Register values (CNF1, CNF2, CNF3) for an MCP2515.
    pub fn mcp2515_cnf(&self) -> [u8; 3] {
        let cnf1 = (((self.sjw - 1) << 6) | (self.brp - 1)) as u8;
        // BTLMODE set: PS2 comes from CNF3.
        let cnf2 = (0x80 | ((self.phase_seg1 - 1) << 3) | (self.prop_seg - 1)) as u8;
        let cnf3 = (self.phase_seg2 - 1) as u8;
        [cnf1, cnf2, cnf3]
    }
}

fn unsupported(bitrate: u32, clock_hz: u32) -> ControllerError {
    ControllerError::Configuration(format!(
        "bitrate {} bit/s is not reachable with a {} Hz clock",
        bitrate, clock_hz
    ))
}

/////////////////////////////////////////////////////////////////////////////
