// canpong/src/flags.rs
//
// Controller error-flag telemetry.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Controller error flags.
//!
//! The bit layout follows the error flag register (EFLG) of the MCP2515
//! family of stand-alone CAN controllers:
//!
//! ```text
//!   bit 7    bit 6    bit 5  bit 4  bit 3  bit 2  bit 1  bit 0
//!   RX1OVR   RX0OVR   TXBO   TXEP   RXEP   TXWAR  RXWAR  EWARN
//! ```
//!
//! Other back ends translate their own fault telemetry into this set.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Live fault telemetry read from the bus controller.
    #[repr(transparent)]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ErrorFlags: u8 {
        /// Receive buffer 1 overflowed
        const RX1OVR = 0x80;
        /// Receive buffer 0 overflowed
        const RX0OVR = 0x40;
        /// Bus-off: the transmit error counter reached 255
        const TXBO = 0x20;
        /// Transmit error-passive: TEC >= 128
        const TXEP = 0x10;
        /// Receive error-passive: REC >= 128
        const RXEP = 0x08;
        /// Transmit error warning: TEC >= 96
        const TXWAR = 0x04;
        /// Receive error warning: REC >= 96
        const RXWAR = 0x02;
        /// Error warning: TXWAR or RXWAR
        const EWARN = 0x01;

        /// Either receive buffer overflowed
        const RX_OVERFLOW = Self::RX0OVR.bits() | Self::RX1OVR.bits();
        /// Either error counter is error-passive
        const ERROR_PASSIVE = Self::TXEP.bits() | Self::RXEP.bits();
    }
}

impl ErrorFlags {
    /// Derives the flags from the transmit/receive error counters.
    ///
    /// This uses the thresholds of ISO 11898-1: warning at 96, passive at
    /// 128, and bus-off once the transmit counter passes 255.
    pub fn from_counters(txerr: u16, rxerr: u16) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::TXBO, txerr > 255);
        flags.set(Self::TXEP, txerr >= 128);
        flags.set(Self::RXEP, rxerr >= 128);
        flags.set(Self::TXWAR, txerr >= 96);
        flags.set(Self::RXWAR, rxerr >= 96);
        flags.set(Self::EWARN, txerr >= 96 || rxerr >= 96);
        flags
    }

    /// Whether any receive buffer overflowed.
    pub fn is_overflow(&self) -> bool {
        self.intersects(Self::RX_OVERFLOW)
    }

    /// Whether the controller is bus-off.
    pub fn is_bus_off(&self) -> bool {
        self.contains(Self::TXBO)
    }

    /// Whether either error counter is in the passive range.
    pub fn is_error_passive(&self) -> bool {
        self.intersects(Self::ERROR_PASSIVE)
    }

    /// Whether the general error-warning bit is set.
    pub fn is_warning(&self) -> bool {
        self.contains(Self::EWARN)
    }
}

impl fmt::Display for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_layout() {
        assert_eq!(0xC0, ErrorFlags::RX_OVERFLOW.bits());
        assert_eq!(0x18, ErrorFlags::ERROR_PASSIVE.bits());
        assert_eq!(
            ErrorFlags::TXBO | ErrorFlags::EWARN,
            ErrorFlags::from_bits_truncate(0x21)
        );
    }

    #[test]
    fn test_predicates() {
        let flags = ErrorFlags::RX1OVR | ErrorFlags::RXEP;
        assert!(flags.is_overflow());
        assert!(flags.is_error_passive());
        assert!(!flags.is_bus_off());
        assert!(!flags.is_warning());

        assert!(!ErrorFlags::empty().is_overflow());
        assert!(ErrorFlags::TXBO.is_bus_off());
    }

    #[test]
    fn test_from_counters() {
        assert_eq!(ErrorFlags::empty(), ErrorFlags::from_counters(0, 95));

        let flags = ErrorFlags::from_counters(96, 0);
        assert_eq!(ErrorFlags::TXWAR | ErrorFlags::EWARN, flags);

        let flags = ErrorFlags::from_counters(0, 130);
        assert!(flags.contains(ErrorFlags::RXEP | ErrorFlags::RXWAR | ErrorFlags::EWARN));
        assert!(!flags.is_bus_off());

        assert!(ErrorFlags::from_counters(256, 0).is_bus_off());
    }

    #[test]
    fn test_display() {
        assert_eq!("none", ErrorFlags::empty().to_string());
        assert_eq!("TXBO", ErrorFlags::TXBO.to_string());
    }
}
