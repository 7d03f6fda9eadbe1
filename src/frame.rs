// canpong/src/frame.rs
//
// Implements the classic CAN 2.0 data frame used by the ping/pong node.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN bus frames.
//!
//! The node only ever exchanges classic data frames with 11-bit
//! identifiers, so [`CanFrame`] is a small `Copy` value: an identifier,
//! a length, and an 8-byte buffer of which only the first `len` bytes
//! are meaningful.
//!
//! Frames render in two text forms:
//!
//! ```text
//! ID=0x123 DLC=8 DATA=07 F8 55 AA C3 3C 5A A5     (Display, the trace line)
//! 123#07F855AAC33C5AA5                            (UpperHex, candump style)
//! ```
//!
//! The candump form can be parsed back with [`str::parse`].

use crate::ConstructionError;
use embedded_can::{Frame as EmbeddedFrame, Id, StandardId};
use hex::FromHex;
use itertools::Itertools;
use libc::{can_frame, canid_t, CAN_EFF_FLAG, CAN_ERR_FLAG, CAN_RTR_FLAG, CAN_SFF_MASK};
use std::{fmt, mem, str::FromStr};

pub use libc::CAN_MAX_DLEN;

/// A classic CAN data frame with a standard identifier.
///
/// Invariant: `len <= 8` and `id <= 0x7FF`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CanFrame {
    id: u16,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl CanFrame {
    /// Creates a data frame from a raw 11-bit identifier and a payload.
    pub fn new(id: u16, data: &[u8]) -> Result<Self, ConstructionError> {
        if id as canid_t > CAN_SFF_MASK {
            return Err(ConstructionError::IDTooLarge);
        }
        if data.len() > CAN_MAX_DLEN {
            return Err(ConstructionError::TooMuchData);
        }
        let mut frame = Self {
            id,
            len: data.len() as u8,
            ..Self::default()
        };
        frame.data[..data.len()].copy_from_slice(data);
        Ok(frame)
    }

    /// Creates a full, 8-byte frame.
    ///
    /// The identifier is masked down to 11 bits.
    pub const fn from_array(id: u16, data: [u8; CAN_MAX_DLEN]) -> Self {
        Self {
            id: id & CAN_SFF_MASK as u16,
            len: CAN_MAX_DLEN as u8,
            data,
        }
    }

    /// Gets the raw 11-bit identifier.
    pub fn raw_id(&self) -> u16 {
        self.id
    }

    /// Replaces the identifier, keeping the payload.
    ///
    /// The identifier is masked down to 11 bits.
    pub fn set_id(&mut self, id: u16) {
        self.id = id & CAN_SFF_MASK as u16;
    }

    /// Returns a copy of the frame carrying a different identifier.
    pub fn with_id(mut self, id: u16) -> Self {
        self.set_id(id);
        self
    }

    /// Number of meaningful payload bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the frame carries no data.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The meaningful part of the payload.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

impl EmbeddedFrame for CanFrame {
    /// Creates a data frame. Only standard identifiers are accepted.
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        match id.into() {
            Id::Standard(id) => CanFrame::new(id.as_raw(), data).ok(),
            Id::Extended(_) => None,
        }
    }

    /// Remote frames are not used by the node.
    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        false
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        StandardId::new(self.id)
            .unwrap_or(StandardId::ZERO)
            .into()
    }

    fn dlc(&self) -> usize {
        self.len()
    }

    fn data(&self) -> &[u8] {
        CanFrame::data(self)
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame {{ {} }}", self)
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID=0x{:X} DLC={} DATA=", self.id, self.len)?;
        let mut parts = self.data().iter().map(|v| format!("{:02X}", v));
        f.write_str(&parts.join(" "))
    }
}

impl fmt::UpperHex for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#{}", self.id, hex::encode_upper(self.data()))
    }
}

impl FromStr for CanFrame {
    type Err = ConstructionError;

    /// Parses a frame in candump notation, like "123#07F855AAC33C5AA5".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, data) = s.trim().split_once('#').ok_or(ConstructionError::Malformed)?;

        let id = u16::from_str_radix(id, 16).map_err(|_| ConstructionError::Malformed)?;
        let data = Vec::<u8>::from_hex(data).map_err(|_| ConstructionError::Malformed)?;
        Self::new(id, &data)
    }
}

// ===== libc can_frame conversions =====

impl From<CanFrame> for can_frame {
    fn from(frame: CanFrame) -> Self {
        // Zeroing also clears the padding and reserved bytes.
        let mut raw: can_frame = unsafe { mem::zeroed() };
        raw.can_id = frame.id as canid_t;
        raw.can_dlc = frame.len;
        raw.data = frame.data;
        raw
    }
}

impl TryFrom<can_frame> for CanFrame {
    type Error = ConstructionError;

    /// Converts a frame read from the kernel.
    ///
    /// Extended, remote and error frames are not data frames of this node
    /// and are rejected with `WrongFrameType`.
    fn try_from(raw: can_frame) -> Result<Self, Self::Error> {
        if raw.can_id & (CAN_EFF_FLAG | CAN_RTR_FLAG | CAN_ERR_FLAG) != 0 {
            return Err(ConstructionError::WrongFrameType);
        }
        let len = (raw.can_dlc as usize).min(CAN_MAX_DLEN);
        Self::new((raw.can_id & CAN_SFF_MASK) as u16, &raw.data[..len])
    }
}

/////////////////////////////////////////////////////////////////////////////
