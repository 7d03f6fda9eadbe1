// canpong/src/nl/rt.rs
//
// Low-level Netlink SocketCAN data structs and constants.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Netlink CAN structures from `linux/can/netlink.h`.
//!
//! These are missing from the `libc` and `neli` crates.

#![allow(non_camel_case_types)]

use libc::c_uint;
use neli::{consts::rtnl::RtaType, neli_enum, FromBytes, Size, ToBytes};
use std::{fmt, io, mem};

/// Ask the kernel to skip the per-VF info in link dumps.
pub const EXT_FILTER_VF: c_uint = 1 << 0;

/// The attributes nested in `IFLA_INFO_DATA` for the "can" link kind.
#[neli_enum(serialized_type = "u16")]
pub enum IflaCan {
    Unspec = 0,
    BitTiming = 1,
    BitTimingConst = 2,
    Clock = 3,
    State = 4,
    CtrlMode = 5,
    RestartMs = 6,
    Restart = 7,
    BerrCounter = 8,
    DataBitTiming = 9,
    DataBitTimingConst = 10,
    Termination = 11,
    TerminationConst = 12,
    BitRateConst = 13,
    DataBitRateConst = 14,
    BitRateMax = 15,
}

impl RtaType for IflaCan {}

/// `IFLA_CAN_BITTIMING`
///
/// Setting only `bitrate` (and optionally `sample_point`) asks the driver
/// to work out the rest.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, ToBytes)]
pub struct can_bittiming {
    pub bitrate: u32,
    /// Tenths of a percent of the bit time
    pub sample_point: u32,
    /// ns
    pub tq: u32,
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
    pub sjw: u32,
    pub brp: u32,
}

impl Size for can_bittiming {
    fn unpadded_size(&self) -> usize {
        mem::size_of::<can_bittiming>()
    }
}

/// `IFLA_CAN_CLOCK`, in Hz.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, ToBytes)]
pub struct can_clock {
    pub freq: u32,
}

impl Size for can_clock {
    fn unpadded_size(&self) -> usize {
        mem::size_of::<can_clock>()
    }
}

/// `IFLA_CAN_BERR_COUNTER`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, ToBytes)]
pub struct can_berr_counter {
    pub txerr: u16,
    pub rxerr: u16,
}

impl Size for can_berr_counter {
    fn unpadded_size(&self) -> usize {
        mem::size_of::<can_berr_counter>()
    }
}

/// `IFLA_CAN_CTRLMODE`
///
/// Only the bits in `mask` are changed, to their value in `flags`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, ToBytes)]
pub struct can_ctrlmode {
    pub mask: u32,
    pub flags: u32,
}

impl Size for can_ctrlmode {
    fn unpadded_size(&self) -> usize {
        mem::size_of::<can_ctrlmode>()
    }
}

/// `IFLA_CAN_STATE`, the `enum can_state` of the kernel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CanState {
    ErrorActive,
    /// An error counter reached 96
    ErrorWarning,
    /// An error counter reached 128
    ErrorPassive,
    /// The transmit error counter passed 255
    BusOff,
    Stopped,
    Sleeping,
}

impl TryFrom<u32> for CanState {
    type Error = io::Error;

    fn try_from(val: u32) -> Result<Self, Self::Error> {
        use CanState::*;

        match val {
            0 => Ok(ErrorActive),
            1 => Ok(ErrorWarning),
            2 => Ok(ErrorPassive),
            3 => Ok(BusOff),
            4 => Ok(Stopped),
            5 => Ok(Sleeping),
            _ => Err(io::Error::from(io::ErrorKind::InvalidData)),
        }
    }
}

impl fmt::Display for CanState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CanState::*;
        let s = match *self {
            ErrorActive => "ERROR-ACTIVE",
            ErrorWarning => "ERROR-WARNING",
            ErrorPassive => "ERROR-PASSIVE",
            BusOff => "BUS-OFF",
            Stopped => "STOPPED",
            Sleeping => "SLEEPING",
        };
        f.write_str(s)
    }
}
