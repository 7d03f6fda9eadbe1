// canpong/src/nl/mod.rs
//
// Netlink access to the SocketCAN interfaces.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN Netlink access
//!
//! For SocketCAN, netlink is the way for a user-space application to query
//! or set the parameters of a CAN interface: the bitrate, the control mode
//! bits, the automatic restart time, and whether the interface is up. The
//! socket controller uses it to run the reset/configure/operate sequence
//! against a kernel CAN device, and to read the bus state and error
//! counters that make up part of the error flags.
//!
//! The SocketCAN netlink API is barely documented. The CAN netlink header
//! for the Linux kernel has the definitions of the structures exchanged
//! with the kernel:
//!
//! <https://github.com/torvalds/linux/blob/master/include/uapi/linux/can/netlink.h>
//!
//! and _iproute2_ shows how a client is expected to use them:
//!
//! <https://github.com/iproute2/iproute2/blob/main/ip/iplink_can.c>

use neli::{
    attr::Attribute,
    consts::{
        nl::{NlType, NlmF, NlmFFlags},
        rtnl::{Arphrd, RtAddrFamily, Rtm},
        rtnl::{Iff, IffFlags, Ifla, IflaInfo},
        socket::NlFamily,
    },
    err::NlError,
    nl::{NlPayload, Nlmsghdr},
    rtnl::{Ifinfomsg, Rtattr},
    socket::NlSocketHandle,
    types::{Buffer, RtBuffer},
    ToBytes,
};
use nix::{net::if_::if_nametoindex, unistd};
use std::{
    ffi::CStr,
    fmt::{self, Debug},
    os::raw::{c_int, c_uint},
};

mod rt;

pub use rt::CanState;
use rt::{can_ctrlmode, IflaCan};

/// The result of a netlink request that expects an ACK.
pub type NlResult<T> = Result<T, NlError>;

/// The error of a link query.
pub type NlInfoError = NlError<Rtm, Ifinfomsg>;

pub type CanBitTiming = rt::can_bittiming;
pub type CanClock = rt::can_clock;
pub type CanBerrCounter = rt::can_berr_counter;

// ===== CanCtrlMode =====

/// The CAN control modes this crate switches.
///
/// The values are the bit _numbers_ of the modes in the kernel mask.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanCtrlMode {
    /// Sample each bit three times
    TripleSampling = 2,
    /// Deliver bus errors as error frames
    BerrReporting = 4,
}

impl CanCtrlMode {
    /// The bit of this mode in `can_ctrlmode::mask`/`flags`.
    pub fn mask(&self) -> u32 {
        1u32 << (*self as u32)
    }
}

// ===== InterfaceDetails =====

/// What `CanInterface::details()` reports.
#[derive(Debug, Default, Clone)]
pub struct InterfaceDetails {
    /// Interface name, as the kernel reports it
    pub name: Option<String>,
    /// Kernel interface index
    pub index: c_uint,
    /// `IFF_UP` is set
    pub is_up: bool,
    /// The transmit queue length
    pub txqueuelen: Option<u32>,
    /// The bit timing
    pub bit_timing: Option<CanBitTiming>,
    /// The controller clock
    pub clock: Option<u32>,
    /// The CAN bus state
    pub state: Option<CanState>,
    /// The automatic restart time, in ms. Zero means disabled.
    pub restart_ms: u32,
    /// The bus error counters
    pub berr_counter: Option<CanBerrCounter>,
    /// The control mode bits that are set
    pub ctrl_mode: u32,
}

impl InterfaceDetails {
    /// Empty details for the interface at `index`.
    pub fn new(index: c_uint) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Whether the triple sampling mode is on.
    pub fn triple_sampling(&self) -> bool {
        self.ctrl_mode & CanCtrlMode::TripleSampling.mask() != 0
    }

    /// Picks the CAN-specific attributes out of a link info attribute.
    fn parse_link_info(&mut self, link_info: &Rtattr<Ifla, Buffer>) -> Result<(), NlInfoError> {
        for info in link_info.get_attr_handle::<IflaInfo>()?.get_attrs() {
            if info.rta_type != IflaInfo::Data {
                continue;
            }
            for attr in info.get_attr_handle::<IflaCan>()?.get_attrs() {
                match attr.rta_type {
                    IflaCan::BitTiming => {
                        self.bit_timing = Some(attr.get_payload_as::<CanBitTiming>()?);
                    }
                    IflaCan::Clock => {
                        self.clock = Some(attr.get_payload_as::<CanClock>()?.freq);
                    }
                    IflaCan::State => {
                        self.state = CanState::try_from(attr.get_payload_as::<u32>()?).ok();
                    }
                    IflaCan::CtrlMode => {
                        self.ctrl_mode = attr.get_payload_as::<can_ctrlmode>()?.flags;
                    }
                    IflaCan::RestartMs => {
                        self.restart_ms = attr.get_payload_as::<u32>()?;
                    }
                    IflaCan::BerrCounter => {
                        self.berr_counter = Some(attr.get_payload_as::<CanBerrCounter>()?);
                    }
                    _ => (),
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for InterfaceDetails {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self.name.as_deref().unwrap_or("?");
        let updown = if self.is_up { "UP" } else { "DOWN" };
        writeln!(f, "{} (index {}): {}", name, self.index, updown)?;

        if let Some(state) = self.state {
            writeln!(f, "  state: {}", state)?;
        }
        if let Some(timing) = &self.bit_timing {
            writeln!(
                f,
                "  bitrate: {} sample-point: {}.{:03}",
                timing.bitrate,
                timing.sample_point / 1000,
                timing.sample_point % 1000
            )?;
        }
        if let Some(clock) = self.clock {
            writeln!(f, "  clock: {}", clock)?;
        }
        if let Some(berr) = &self.berr_counter {
            writeln!(f, "  berr-counter: tx {} rx {}", berr.txerr, berr.rxerr)?;
        }
        if let Some(qlen) = self.txqueuelen {
            writeln!(f, "  txqueuelen: {}", qlen)?;
        }
        write!(
            f,
            "  restart-ms: {} triple-sampling: {}",
            self.restart_ms,
            if self.triple_sampling() { "on" } else { "off" }
        )
    }
}

// ===== CanInterface =====

/// A kernel CAN network interface, addressed by index.
///
/// Each call opens its own route socket, so the handle itself is just the
/// index. Calls that change the interface need `CAP_NET_ADMIN` and say so
/// with "PRIVILEGED:".
#[derive(Debug, Clone, Copy)]
pub struct CanInterface {
    if_index: c_uint,
}

impl CanInterface {
    /// Looks the interface up by name.
    pub fn open(ifname: &str) -> Result<Self, nix::Error> {
        if_nametoindex(ifname).map(Self::open_iface)
    }

    /// Wraps an interface index without checking that it exists.
    pub fn open_iface(if_index: u32) -> Self {
        Self {
            if_index: if_index as c_uint,
        }
    }

    /// An `RTM_NEWLINK`/`RTM_GETLINK` body for this interface.
    fn info_msg(&self, buf: RtBuffer<Ifla, Buffer>) -> Ifinfomsg {
        Ifinfomsg::new(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.if_index as c_int,
            IffFlags::empty(),
            IffFlags::empty(),
            buf,
        )
    }

    /// Sends a link request and waits for the kernel's ACK.
    fn send_info_msg(msg_type: Rtm, info: Ifinfomsg) -> NlResult<()> {
        let mut sock = Self::open_route_socket()?;

        let hdr = Nlmsghdr::new(
            None,
            msg_type,
            NlmFFlags::new(&[NlmF::Request, NlmF::Ack]),
            None,
            None,
            NlPayload::Payload(info),
        );
        Self::send_and_read_ack(&mut sock, hdr)
    }

    /// Sends one message and expects an ACK back.
    fn send_and_read_ack<T, P>(sock: &mut NlSocketHandle, msg: Nlmsghdr<T, P>) -> NlResult<()>
    where
        T: NlType + Debug,
        P: ToBytes + Debug,
    {
        sock.send(msg)?;

        // A netlink error response comes back as an Err from recv()
        if let Some(Nlmsghdr {
            nl_payload: NlPayload::Ack(_),
            ..
        }) = sock.recv()?
        {
            Ok(())
        } else {
            Err(NlError::NoAck)
        }
    }

    /// A route socket with no multicast groups.
    fn open_route_socket<T, P>() -> Result<NlSocketHandle, NlError<T, P>> {
        let pid = unistd::getpid().as_raw() as u32;
        Ok(NlSocketHandle::connect(NlFamily::Route, Some(pid), &[])?)
    }

    /// `RTM_GETLINK` for this interface, without the per-VF info.
    fn query_details(&self) -> Result<Option<Nlmsghdr<Rtm, Ifinfomsg>>, NlInfoError> {
        let mut sock = Self::open_route_socket()?;

        let mut attrs = RtBuffer::new();
        attrs.push(Rtattr::new(None, Ifla::ExtMask, rt::EXT_FILTER_VF)?);
        let info = self.info_msg(attrs);

        let hdr = Nlmsghdr::new(
            None,
            Rtm::Getlink,
            NlmFFlags::new(&[NlmF::Request]),
            None,
            None,
            NlPayload::Payload(info),
        );

        sock.send(hdr)?;
        sock.recv()
    }

    /// Sets or clears the `IFF_UP` flag of the interface.
    fn set_up(&self, up: bool) -> NlResult<()> {
        let (family, arphrd, index) = (
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.if_index as c_int,
        );
        let info = if up {
            Ifinfomsg::up(family, arphrd, index, RtBuffer::new())
        } else {
            Ifinfomsg::down(family, arphrd, index, RtBuffer::new())
        };
        Self::send_info_msg(Rtm::Newlink, info)
    }

    /// Takes the interface down. Timing changes are only accepted while
    /// it is down.
    ///
    /// PRIVILEGED: This requires root privilege.
    pub fn bring_down(&self) -> NlResult<()> {
        self.set_up(false)
    }

    /// Brings the interface up.
    ///
    /// PRIVILEGED: This requires root privilege.
    pub fn bring_up(&self) -> NlResult<()> {
        self.set_up(true)
    }

    /// Reads the link settings and CAN state in a single query.
    pub fn details(&self) -> Result<InterfaceDetails, NlInfoError> {
        let msg_hdr = self.query_details()?.ok_or(NlInfoError::NoAck)?;
        let mut details = InterfaceDetails::new(self.if_index);

        let Ok(payload) = msg_hdr.get_payload() else {
            return Ok(details);
        };
        details.is_up = payload.ifi_flags.contains(&Iff::Up);

        for attr in payload.rtattrs.iter() {
            match attr.rta_type {
                Ifla::Ifname => {
                    details.name = CStr::from_bytes_with_nul(attr.rta_payload.as_ref())
                        .ok()
                        .map(|name| name.to_string_lossy().into_owned());
                }
                Ifla::Txqlen => details.txqueuelen = attr.get_payload_as::<u32>().ok(),
                Ifla::Linkinfo => details.parse_link_info(attr)?,
                _ => (),
            }
        }
        Ok(details)
    }

    /// Sets the transmit queue length, in frames.
    ///
    /// PRIVILEGED: This requires root privilege.
    pub fn set_txqueuelen(&self, qlen: u32) -> NlResult<()> {
        let mut attrs = RtBuffer::new();
        attrs.push(Rtattr::new(None, Ifla::Txqlen, &qlen.to_ne_bytes()[..])?);
        Self::send_info_msg(Rtm::Newlink, self.info_msg(attrs))
    }

    /// Sends one attribute of the "can" link kind, nested as
    /// `IFLA_LINKINFO { IFLA_INFO_KIND "can", IFLA_INFO_DATA { attr } }`.
    fn set_can_param<P>(&self, kind: IflaCan, val: P) -> NlResult<()>
    where
        P: ToBytes + neli::Size,
    {
        let mut data = Rtattr::new(None, IflaInfo::Data, Buffer::new())?;
        data.add_nested_attribute(&Rtattr::new(None, kind, val)?)?;

        let mut link_info = Rtattr::new(None, Ifla::Linkinfo, Buffer::new())?;
        link_info.add_nested_attribute(&Rtattr::new(None, IflaInfo::Kind, "can")?)?;
        link_info.add_nested_attribute(&data)?;

        let mut attrs = RtBuffer::new();
        attrs.push(link_info);
        Self::send_info_msg(Rtm::Newlink, self.info_msg(attrs))
    }

    /// The bitrate the interface runs at. Virtual interfaces have none.
    pub fn bit_rate(&self) -> Result<Option<u32>, NlInfoError> {
        Ok(self.details()?.bit_timing.map(|timing| timing.bitrate))
    }

    /// Programs the bitrate and sample point.
    ///
    /// The sample point is in tenths of a percent; zero lets the driver
    /// pick one.
    ///
    /// PRIVILEGED: This requires root privilege.
    pub fn set_bitrate(&self, bitrate: u32, sample_point: u32) -> NlResult<()> {
        let timing = CanBitTiming {
            bitrate,
            sample_point,
            ..CanBitTiming::default()
        };
        self.set_can_param(IflaCan::BitTiming, timing)
    }

    /// The bus state the driver reports.
    pub fn state(&self) -> Result<Option<CanState>, NlInfoError> {
        Ok(self.details()?.state)
    }

    /// Switches a single control mode on or off, leaving the others alone.
    ///
    /// PRIVILEGED: This requires root privilege.
    pub fn set_ctrlmode(&self, mode: CanCtrlMode, on: bool) -> NlResult<()> {
        let mask = mode.mask();
        let modes = can_ctrlmode {
            mask,
            flags: if on { mask } else { 0 },
        };
        self.set_can_param(IflaCan::CtrlMode, modes)
    }

    /// Sets the delay before the driver restarts a bus-off controller on its
    /// own. Zero leaves recovery to the application.
    ///
    /// PRIVILEGED: This requires root privilege.
    pub fn set_restart_ms(&self, restart_ms: u32) -> NlResult<()> {
        self.set_can_param(IflaCan::RestartMs, &restart_ms.to_ne_bytes()[..])
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctrlmode_masks() {
        assert_eq!(0x04, CanCtrlMode::TripleSampling.mask());
        assert_eq!(0x10, CanCtrlMode::BerrReporting.mask());
    }

    #[test]
    fn test_can_attr_types() {
        assert_eq!(1, u16::from(IflaCan::BitTiming));
        assert_eq!(5, u16::from(IflaCan::CtrlMode));
        assert_eq!(8, u16::from(IflaCan::BerrCounter));
        assert_eq!(IflaCan::Clock, IflaCan::from(3u16));
        assert_eq!(IflaCan::UnrecognizedConst(99), IflaCan::from(99u16));
    }

    #[test]
    fn test_open_missing_iface() {
        assert!(CanInterface::open("canpong-none0").is_err());
    }

    #[test]
    fn test_details_display() {
        let details = InterfaceDetails {
            name: Some("can0".into()),
            is_up: true,
            state: Some(CanState::ErrorActive),
            bit_timing: Some(CanBitTiming {
                bitrate: 125_000,
                sample_point: 875,
                ..CanBitTiming::default()
            }),
            ctrl_mode: CanCtrlMode::TripleSampling.mask(),
            ..InterfaceDetails::new(3)
        };
        let s = details.to_string();
        assert!(s.starts_with("can0 (index 3): UP\n"));
        assert!(s.contains("state: ERROR-ACTIVE"));
        assert!(s.contains("bitrate: 125000 sample-point: 0.875"));
        assert!(s.ends_with("restart-ms: 0 triple-sampling: on"));
        assert!(details.triple_sampling());
    }
}
