// canpong/src/errors.rs
//
// Implements errors for the canpong library.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Errors and bus faults.
//!
//! There are two kinds of trouble on the link:
//!
//! - Operation errors, returned by a single controller call
//!   ([`ControllerError`]) or by a (re)initialization ([`LinkError`]).
//! - Bus faults ([`BusFault`]), which are not returned by anything but are
//!   derived from the controller's error-flag telemetry and handled by the
//!   health monitor.
//!
//! On SocketCAN, fault telemetry arrives partly as error frames. Their
//! general class is encoded in the error bits of the CAN ID, with details in
//! the data bytes; see
//! [linux/can/error.h](https://raw.githubusercontent.com/torvalds/linux/master/include/uapi/linux/can/error.h).
//! [`CanError`] decodes the classes the node cares about and folds them
//! into [`ErrorFlags`].
//!
//! ```text
//! Controller Problem (0x04) => data[1]
//! Bus Off            (0x40)
//! Restarted          (0x100)
//! Error Counters     (0x200) => data[6] (TX), data[7] (RX)
//! ```

use crate::{ConfigError, ErrorFlags};
use std::{fmt, io};
use thiserror::Error;

// ===== ConstructionError =====

/// Error that occurs when creating CAN frames
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// Trying to create a frame from an incompatible frame type
    #[error("Incompatible frame type")]
    WrongFrameType,
    /// CAN ID was outside the range of standard IDs
    #[error("CAN ID too large")]
    IDTooLarge,
    /// More than 8 bytes of payload
    #[error("Payload is too large")]
    TooMuchData,
    /// Text could not be parsed as a frame
    #[error("Malformed frame text")]
    Malformed,
}

// ===== ControllerError =====

/// Errors returned by the operations of a bus controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The bitrate/clock pair can not be programmed into the controller.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The controller did not acknowledge the switch to normal operation.
    #[error("mode transition error: {0}")]
    ModeTransition(String),
    /// The frame could not be queued for transmission.
    #[error("transmit error: {0}")]
    Transmit(String),
    /// Low-level I/O failure talking to the controller.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ControllerError {
    /// Whether this is a per-send error, recovered by counting and reinit.
    pub fn is_transmit(&self) -> bool {
        matches!(self, ControllerError::Transmit(_))
    }
}

impl embedded_can::Error for ControllerError {
    fn kind(&self) -> embedded_can::ErrorKind {
        embedded_can::ErrorKind::Other
    }
}

// ===== LinkError =====

/// Errors from bringing the link into operation.
#[derive(Error, Debug)]
pub enum LinkError {
    /// A controller step of the initialization sequence failed.
    #[error(transparent)]
    Controller(#[from] ControllerError),
    /// The first initialization failed; the node will not touch the bus.
    #[error("link halted: {0}")]
    Halted(#[source] ControllerError),
    /// The node was given a configuration it cannot run with.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ===== BusFault =====

/// A fault condition derived from the controller error flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFault {
    /// A receive buffer overflowed. Frames were lost; clearing is enough.
    Overflow,
    /// The controller left the bus. Needs a full reinitialization.
    BusOff,
    /// Error-passive. Reinit once it persists.
    ErrorPassive,
    /// Error counters reached the warning level. Informational.
    Warning,
}

impl BusFault {
    /// Lists the faults present in a flag set, most severe first.
    pub fn from_flags(flags: ErrorFlags) -> Vec<BusFault> {
        let mut faults = Vec::new();
        if flags.is_bus_off() {
            faults.push(BusFault::BusOff);
        }
        if flags.is_error_passive() {
            faults.push(BusFault::ErrorPassive);
        }
        if flags.is_overflow() {
            faults.push(BusFault::Overflow);
        }
        if flags.is_warning() {
            faults.push(BusFault::Warning);
        }
        faults
    }
}

impl fmt::Display for BusFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use BusFault::*;
        let msg = match *self {
            Overflow => "receive buffer overflow",
            BusOff => "bus off",
            ErrorPassive => "error passive",
            Warning => "error warning",
        };
        f.write_str(msg)
    }
}

// ===== CanError =====

/// Error decoding a [`CanError`] from an error frame.
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanErrorDecodingFailure {
    /// The error class is not one the node decodes.
    #[error("unknown error type: 0x{0:X}")]
    UnknownErrorType(u32),
    /// The error class needs data bytes that the frame does not carry.
    #[error("not enough data")]
    NotEnoughData(u8),
    /// The controller problem byte was not recognized.
    #[error("not a valid controller problem")]
    InvalidControllerProblem,
}

/// The CAN bus error carried by a SocketCAN error frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanError {
    /// Controller problem
    ControllerProblem(ControllerProblem),
    /// Bus off (due to too many detected errors)
    BusOff,
    /// The bus has been restarted
    Restarted,
    /// Current error counters
    Counters {
        /// Transmit error counter
        txerr: u8,
        /// Receive error counter
        rxerr: u8,
    },
}

/// Error class bits in the ID word of an error frame.
const CAN_ERR_CRTL: u32 = 0x0000_0004;
const CAN_ERR_BUSOFF: u32 = 0x0000_0040;
const CAN_ERR_RESTARTED: u32 = 0x0000_0100;
const CAN_ERR_CNT: u32 = 0x0000_0200;

#[inline]
fn get_data(data: &[u8], idx: u8) -> Result<u8, CanErrorDecodingFailure> {
    data.get(idx as usize)
        .copied()
        .ok_or(CanErrorDecodingFailure::NotEnoughData(idx))
}

impl CanError {
    /// Decodes all the error classes reported by a single error frame.
    ///
    /// An error frame can carry several classes at once. Classes the node
    /// does not care about (arbitration, protocol violations, transceiver
    /// status, ...) are skipped, but a frame carrying nothing else is
    /// reported as `UnknownErrorType`.
    pub fn decode(err: u32, data: &[u8]) -> Result<Vec<CanError>, CanErrorDecodingFailure> {
        let mut errors = Vec::new();

        if err & CAN_ERR_CRTL != 0 {
            let problem = ControllerProblem::try_from(get_data(data, 1)?)?;
            errors.push(CanError::ControllerProblem(problem));
        }
        if err & CAN_ERR_BUSOFF != 0 {
            errors.push(CanError::BusOff);
        }
        if err & CAN_ERR_RESTARTED != 0 {
            errors.push(CanError::Restarted);
        }
        if err & CAN_ERR_CNT != 0 {
            errors.push(CanError::Counters {
                txerr: get_data(data, 6)?,
                rxerr: get_data(data, 7)?,
            });
        }

        if errors.is_empty() && err != 0 {
            return Err(CanErrorDecodingFailure::UnknownErrorType(err));
        }
        Ok(errors)
    }

    /// Folds this error into the tracked controller flags.
    pub fn apply(&self, flags: &mut ErrorFlags) {
        type Cp = ControllerProblem;
        match *self {
            CanError::ControllerProblem(problem) => {
                // A frame reports one transition; the set of problem bits
                // may contain several.
                if problem.contains(Cp::ReceiveBufferOverflow) {
                    flags.insert(ErrorFlags::RX0OVR);
                }
                if problem.contains(Cp::ReceiveErrorWarning) {
                    flags.insert(ErrorFlags::RXWAR | ErrorFlags::EWARN);
                }
                if problem.contains(Cp::TransmitErrorWarning) {
                    flags.insert(ErrorFlags::TXWAR | ErrorFlags::EWARN);
                }
                if problem.contains(Cp::ReceiveErrorPassive) {
                    flags.insert(ErrorFlags::RXEP);
                }
                if problem.contains(Cp::TransmitErrorPassive) {
                    flags.insert(ErrorFlags::TXEP);
                }
                if problem.contains(Cp::Active) {
                    flags.remove(
                        ErrorFlags::ERROR_PASSIVE
                            | ErrorFlags::TXWAR
                            | ErrorFlags::RXWAR
                            | ErrorFlags::EWARN,
                    );
                }
            }
            CanError::BusOff => flags.insert(ErrorFlags::TXBO),
            CanError::Restarted => flags.remove(ErrorFlags::TXBO),
            CanError::Counters { txerr, rxerr } => {
                let overflow = *flags & ErrorFlags::RX_OVERFLOW;
                let bus_off = *flags & ErrorFlags::TXBO;
                *flags = ErrorFlags::from_counters(txerr as u16, rxerr as u16) | overflow | bus_off;
            }
        }
    }
}

impl fmt::Display for CanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CanError::*;
        match *self {
            ControllerProblem(e) => write!(f, "controller problem: {}", e),
            BusOff => write!(f, "bus off"),
            Restarted => write!(f, "restarted"),
            Counters { txerr, rxerr } => write!(f, "error counters tx={} rx={}", txerr, rxerr),
        }
    }
}

impl std::error::Error for CanError {}

impl embedded_can::Error for CanError {
    fn kind(&self) -> embedded_can::ErrorKind {
        match *self {
            CanError::ControllerProblem(cp)
                if cp.contains(ControllerProblem::ReceiveBufferOverflow) =>
            {
                embedded_can::ErrorKind::Overrun
            }
            _ => embedded_can::ErrorKind::Other,
        }
    }
}

// ===== ControllerProblem =====

/// Error status of the CAN controller.
///
/// This is derived from `data[1]` of an error frame. The kernel may report
/// several of these at once, so it is kept as the raw bit set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControllerProblem(u8);

#[allow(non_upper_case_globals)]
impl ControllerProblem {
    /// unspecified
    pub const Unspecified: u8 = 0x00;
    /// RX buffer overflow
    pub const ReceiveBufferOverflow: u8 = 0x01;
    /// TX buffer overflow
    pub const TransmitBufferOverflow: u8 = 0x02;
    /// reached warning level for RX errors
    pub const ReceiveErrorWarning: u8 = 0x04;
    /// reached warning level for TX errors
    pub const TransmitErrorWarning: u8 = 0x08;
    /// reached error passive status RX
    pub const ReceiveErrorPassive: u8 = 0x10;
    /// reached error passive status TX
    pub const TransmitErrorPassive: u8 = 0x20;
    /// recovered to error active state
    pub const Active: u8 = 0x40;

    /// Whether the given problem bit is reported.
    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    /// The raw problem byte.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ControllerProblem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(u8, &str); 7] = [
            (ControllerProblem::ReceiveBufferOverflow, "receive buffer overflow"),
            (ControllerProblem::TransmitBufferOverflow, "transmit buffer overflow"),
            (ControllerProblem::ReceiveErrorWarning, "ERROR WARNING (receive)"),
            (ControllerProblem::TransmitErrorWarning, "ERROR WARNING (transmit)"),
            (ControllerProblem::ReceiveErrorPassive, "ERROR PASSIVE (receive)"),
            (ControllerProblem::TransmitErrorPassive, "ERROR PASSIVE (transmit)"),
            (ControllerProblem::Active, "ERROR ACTIVE"),
        ];
        if self.0 == Self::Unspecified {
            return f.write_str("unspecified controller problem");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(", "))
    }
}

impl TryFrom<u8> for ControllerProblem {
    type Error = CanErrorDecodingFailure;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0x80..=0xFF => Err(CanErrorDecodingFailure::InvalidControllerProblem),
            _ => Ok(ControllerProblem(val)),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bus_off() {
        let errs = CanError::decode(CAN_ERR_BUSOFF, &[0; 8]).unwrap();
        assert_eq!(vec![CanError::BusOff], errs);

        let mut flags = ErrorFlags::empty();
        errs[0].apply(&mut flags);
        assert!(flags.is_bus_off());

        CanError::Restarted.apply(&mut flags);
        assert!(!flags.is_bus_off());
    }

    #[test]
    fn test_decode_controller_problem() {
        let data = [0, 0x21, 0, 0, 0, 0, 0, 0];
        let errs = CanError::decode(CAN_ERR_CRTL, &data).unwrap();

        let mut flags = ErrorFlags::empty();
        for e in &errs {
            e.apply(&mut flags);
        }
        assert_eq!(ErrorFlags::RX0OVR | ErrorFlags::TXEP, flags);

        CanError::ControllerProblem(ControllerProblem(ControllerProblem::Active)).apply(&mut flags);
        assert_eq!(ErrorFlags::RX0OVR, flags);
    }

    #[test]
    fn test_decode_counters() {
        let data = [0, 0, 0, 0, 0, 0, 130, 10];
        let errs = CanError::decode(CAN_ERR_CNT, &data).unwrap();
        assert_eq!(vec![CanError::Counters { txerr: 130, rxerr: 10 }], errs);

        let mut flags = ErrorFlags::RX1OVR;
        errs[0].apply(&mut flags);
        assert!(flags.contains(ErrorFlags::TXEP | ErrorFlags::RX1OVR));
        assert!(!flags.contains(ErrorFlags::RXEP));
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(
            Err(CanErrorDecodingFailure::NotEnoughData(1)),
            CanError::decode(CAN_ERR_CRTL, &[0])
        );
        assert_eq!(
            Err(CanErrorDecodingFailure::UnknownErrorType(0x01)),
            CanError::decode(0x01, &[0; 8])
        );
        assert!(ControllerProblem::try_from(0x80).is_err());
    }

    #[test]
    fn test_bus_fault_from_flags() {
        let faults = BusFault::from_flags(ErrorFlags::TXBO | ErrorFlags::RX0OVR | ErrorFlags::EWARN);
        assert_eq!(
            vec![BusFault::BusOff, BusFault::Overflow, BusFault::Warning],
            faults
        );
        assert!(BusFault::from_flags(ErrorFlags::empty()).is_empty());
    }

    #[test]
    fn test_problem_display() {
        let cp = ControllerProblem(ControllerProblem::ReceiveBufferOverflow);
        assert_eq!("receive buffer overflow", cp.to_string());
        assert_eq!(
            "unspecified controller problem",
            ControllerProblem(0).to_string()
        );
    }
}
