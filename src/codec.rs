// canpong/src/codec.rs
//
// The ping/pong test pattern.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Test pattern codec.
//!
//! Every ping carries the same 8-byte shape:
//!
//! ```text
//!   byte:  0        1         2    3    4    5    6    7
//!          counter  !counter  55   AA   C3   3C   5A   A5
//! ```
//!
//! The counter and its complement catch stuck or swapped bits in the
//! first two bytes; the fixed tail catches everything else.

use crate::{frame::CAN_MAX_DLEN, CanFrame};

/// The fixed bytes 2..8 of the test pattern.
pub const PATTERN_TAIL: [u8; 6] = [0x55, 0xAA, 0xC3, 0x3C, 0x5A, 0xA5];

/// Builds the test pattern frame for a rolling counter value.
pub fn build_pattern(id: u16, counter: u8) -> CanFrame {
    let mut data = [0u8; CAN_MAX_DLEN];
    data[0] = counter;
    data[1] = !counter;
    data[2..].copy_from_slice(&PATTERN_TAIL);
    CanFrame::from_array(id, data)
}

/// Checks a frame against the test pattern shape.
///
/// This does not look at the identifier, nor does it care which counter
/// value is carried, only that the frame is internally consistent.
pub fn pattern_matches(frame: &CanFrame) -> bool {
    match frame.data() {
        [c, nc, tail @ ..] if frame.len() == CAN_MAX_DLEN => *nc == !*c && tail == PATTERN_TAIL,
        _ => false,
    }
}

/// Compares two frames by payload only.
///
/// Identifiers are ignored: a pong legitimately carries a different ID
/// than the ping it answers.
pub fn frames_equal(a: &CanFrame, b: &CanFrame) -> bool {
    a.data() == b.data()
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_layout() {
        let frame = build_pattern(0x123, 7);
        assert_eq!(0x123, frame.raw_id());
        assert_eq!(
            &[0x07, 0xF8, 0x55, 0xAA, 0xC3, 0x3C, 0x5A, 0xA5],
            frame.data()
        );
    }

    #[test]
    fn test_every_counter_matches() {
        for counter in 0..=u8::MAX {
            assert!(pattern_matches(&build_pattern(0x223, counter)));
        }
    }

    #[test]
    fn test_wrong_length() {
        let frame = build_pattern(0x223, 3);
        let short = CanFrame::new(0x223, &frame.data()[..7]).unwrap();
        assert!(!pattern_matches(&short));
        assert!(!pattern_matches(&CanFrame::new(0x223, &[]).unwrap()));
    }

    #[test]
    fn test_bad_complement() {
        let mut data = [0x03, 0xFC, 0x55, 0xAA, 0xC3, 0x3C, 0x5A, 0xA5];
        assert!(pattern_matches(&CanFrame::from_array(0x223, data)));

        data[1] = 0xFD;
        assert!(!pattern_matches(&CanFrame::from_array(0x223, data)));
    }

    #[test]
    fn test_any_tail_byte_altered() {
        let good = build_pattern(0x223, 0x42);
        for idx in 2..CAN_MAX_DLEN {
            let mut data = [0u8; CAN_MAX_DLEN];
            data.copy_from_slice(good.data());
            data[idx] ^= 0x01;
            assert!(
                !pattern_matches(&CanFrame::from_array(0x223, data)),
                "byte {} altered",
                idx
            );
        }
    }

    #[test]
    fn test_frames_equal_ignores_id() {
        let ping = build_pattern(0x123, 7);
        let pong = ping.with_id(0x124);

        assert!(frames_equal(&ping, &ping));
        assert!(frames_equal(&ping, &pong));
        assert!(frames_equal(&pong, &ping));
    }

    #[test]
    fn test_frames_equal_payload() {
        let a = CanFrame::new(0x124, &[1, 2, 3]).unwrap();
        let b = CanFrame::new(0x124, &[1, 2, 3, 0]).unwrap();
        let c = CanFrame::new(0x124, &[1, 2, 4]).unwrap();

        assert!(!frames_equal(&a, &b));
        assert!(!frames_equal(&a, &c));
        assert!(frames_equal(
            &CanFrame::new(0x1, &[]).unwrap(),
            &CanFrame::new(0x2, &[]).unwrap()
        ));
    }
}
