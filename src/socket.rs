// canpong/src/socket.rs
//
// A bus controller backed by a Linux SocketCAN interface.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! SocketCAN controller.
//!
//! [`SocketController`] drives a kernel CAN network interface through a
//! raw CAN socket. The socket is opened non-blocking and subscribed to
//! error frames, which are folded into the tracked [`ErrorFlags`].
//!
//! An unmanaged controller expects the interface to be configured and
//! brought up by the host (e.g. `ip link set can0 up type can bitrate
//! 125000`), and only checks that the bitrate agrees. A managed one, with
//! the `netlink` feature, runs the whole reset/configure/operate sequence
//! through netlink, which requires `CAP_NET_ADMIN`.
//!
//! Attaching an [`IrqLine`] starts a small notifier thread that waits on
//! the socket and raises the line when frames arrive, standing in for the
//! receive interrupt of a directly attached controller.

use crate::{BitTiming, CanError, CanFrame, Controller, ControllerError, ErrorFlags, IrqLine};
use libc::{
    can_frame, socklen_t, AF_CAN, CAN_ERR_FLAG, CAN_ERR_MASK, CAN_MTU, CAN_RAW,
    CAN_RAW_ERR_FILTER, SOL_CAN_RAW,
};
use log::{debug, info, trace, warn};
use nix::{
    errno::Errno,
    net::if_::if_nametoindex,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use socket2::SockAddr;
use std::{
    fmt,
    io::{self, Read},
    mem,
    os::{
        raw::{c_int, c_void},
        unix::io::{AsFd, AsRawFd},
    },
    slice,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

#[cfg(feature = "netlink")]
use crate::nl::{CanBerrCounter, CanCtrlMode, CanInterface, CanState};

/// How long the notifier waits on the socket before checking for shutdown.
const NOTIFY_POLL_MS: u16 = 50;

/// How long the notifier backs off while a raised line is not yet taken.
const NOTIFY_REARM_WAIT: Duration = Duration::from_millis(1);

// ===== Private local helper functions =====

fn as_bytes<T: Sized>(val: &T) -> &[u8] {
    let sz = mem::size_of::<T>();
    unsafe { slice::from_raw_parts(val as *const _ as *const u8, sz) }
}

fn as_bytes_mut<T: Sized>(val: &mut T) -> &mut [u8] {
    let sz = mem::size_of::<T>();
    unsafe { slice::from_raw_parts_mut(val as *mut _ as *mut u8, sz) }
}

/// Builds the socket address of a CAN interface.
fn can_sock_addr(ifindex: u32) -> SockAddr {
    let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
    addr.can_family = AF_CAN as libc::sa_family_t;
    addr.can_ifindex = ifindex as c_int;

    let len = mem::size_of::<libc::sockaddr_can>();
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    as_bytes_mut(&mut storage)[..len].copy_from_slice(as_bytes(&addr));
    unsafe { SockAddr::new(storage, len as socklen_t) }
}

/// Opens a raw CAN socket bound to the interface.
fn raw_open_socket(ifindex: u32) -> io::Result<socket2::Socket> {
    let af_can = socket2::Domain::from(AF_CAN);
    let can_raw = socket2::Protocol::from(CAN_RAW);

    let sock = socket2::Socket::new_raw(af_can, socket2::Type::RAW, Some(can_raw))?;
    sock.bind(&can_sock_addr(ifindex))?;
    Ok(sock)
}

/// `setsockopt` wrapper
fn set_socket_option<T>(
    sock: &socket2::Socket,
    level: c_int,
    name: c_int,
    val: &T,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            level,
            name,
            val as *const _ as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };

    match ret {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Reads a single frame from the socket, as the kernel hands it over.
fn read_raw_frame(mut sock: &socket2::Socket) -> io::Result<can_frame> {
    let mut raw: can_frame = unsafe { mem::zeroed() };
    match sock.read(as_bytes_mut(&mut raw))? {
        CAN_MTU => Ok(raw),
        n => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected frame size: {}", n),
        )),
    }
}

/// Checks if the socket has a frame waiting, without blocking longer than
/// the timeout.
fn wait_readable(sock: &socket2::Socket, timeout: PollTimeout) -> nix::Result<bool> {
    let mut fds = [PollFd::new(sock.as_fd(), PollFlags::POLLIN)];
    let n = poll(&mut fds, timeout)?;
    Ok(n > 0
        && fds[0]
            .revents()
            .map_or(false, |ev| ev.contains(PollFlags::POLLIN)))
}

/// The error-counter level bits: warning and passive.
#[cfg(feature = "netlink")]
const LEVEL_FLAGS: ErrorFlags = ErrorFlags::ERROR_PASSIVE
    .union(ErrorFlags::TXWAR)
    .union(ErrorFlags::RXWAR)
    .union(ErrorFlags::EWARN);

/// Folds the kernel's bus state and error counters into `flags`.
///
/// The counters are the most precise source. Drivers that don't report
/// them, mcp251x among them, still report the state, which then sets the
/// level bits on its own.
#[cfg(feature = "netlink")]
fn merge_bus_state(
    mut flags: ErrorFlags,
    state: Option<CanState>,
    berr: Option<CanBerrCounter>,
) -> ErrorFlags {
    match (berr, state) {
        (Some(berr), _) => {
            let keep = flags & (ErrorFlags::RX_OVERFLOW | ErrorFlags::TXBO);
            flags = ErrorFlags::from_counters(berr.txerr, berr.rxerr) | keep;
        }
        (None, Some(CanState::ErrorActive)) => flags.remove(LEVEL_FLAGS),
        (None, Some(CanState::ErrorWarning)) => {
            flags.remove(ErrorFlags::ERROR_PASSIVE);
            flags.insert(ErrorFlags::EWARN);
        }
        (None, Some(CanState::ErrorPassive)) => {
            // Error frames may already say which counter it is
            if !flags.is_error_passive() {
                flags.insert(ErrorFlags::ERROR_PASSIVE);
            }
            flags.insert(ErrorFlags::EWARN);
        }
        _ => (),
    }

    match state {
        Some(CanState::BusOff) => flags.insert(ErrorFlags::TXBO),
        Some(CanState::ErrorActive | CanState::ErrorWarning | CanState::ErrorPassive) => {
            flags.remove(ErrorFlags::TXBO)
        }
        _ => (),
    }
    flags
}

// ===== Notifier =====

/// The thread that turns socket readability into receive interrupts.
#[derive(Debug)]
struct Notifier {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Notifier {
    fn spawn(sock: socket2::Socket, line: Arc<IrqLine>) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let keep_going = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("canpong-irq".into())
            .spawn(move || {
                while keep_going.load(Ordering::Acquire) {
                    // Edge-like behaviour: don't re-raise until the main
                    // loop has taken the last signal.
                    if line.is_pending() {
                        thread::sleep(NOTIFY_REARM_WAIT);
                        continue;
                    }
                    match wait_readable(&sock, PollTimeout::from(NOTIFY_POLL_MS)) {
                        Ok(true) => line.raise(),
                        Ok(false) | Err(Errno::EINTR) => (),
                        Err(err) => {
                            warn!("Receive notifier stopped: {}", err);
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ===== SocketController =====

/// A bus controller on top of a SocketCAN network interface.
#[derive(Debug)]
pub struct SocketController {
    ifname: String,
    ifindex: u32,
    sock: Option<socket2::Socket>,
    flags: ErrorFlags,
    irq: Option<Arc<IrqLine>>,
    notifier: Option<Notifier>,
    #[cfg(feature = "netlink")]
    iface: CanInterface,
    #[cfg(feature = "netlink")]
    managed: bool,
}

impl SocketController {
    /// Creates a controller for a host-configured interface.
    ///
    /// Fails if there is no interface by that name. The socket is opened
    /// later, on `enter_operating_mode`.
    pub fn open(ifname: &str) -> io::Result<Self> {
        let ifindex = if_nametoindex(ifname)?;
        Ok(Self {
            ifname: ifname.to_string(),
            ifindex,
            sock: None,
            flags: ErrorFlags::empty(),
            irq: None,
            notifier: None,
            #[cfg(feature = "netlink")]
            iface: CanInterface::open_iface(ifindex),
            #[cfg(feature = "netlink")]
            managed: false,
        })
    }

    /// Creates a controller that also takes the interface down, programs
    /// the bitrate and brings it back up over netlink.
    ///
    /// PRIVILEGED: Initialization will fail without `CAP_NET_ADMIN`.
    #[cfg(feature = "netlink")]
    pub fn managed(ifname: &str) -> io::Result<Self> {
        let mut ctrl = Self::open(ifname)?;
        ctrl.managed = true;
        Ok(ctrl)
    }

    /// The name of the interface.
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Whether the socket is open, i.e. the controller is operating.
    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    fn socket(&self) -> Result<&socket2::Socket, ControllerError> {
        self.sock
            .as_ref()
            .ok_or_else(|| ControllerError::Transmit(format!("{} is not operating", self.ifname)))
    }

    fn start_notifier(&mut self) {
        let (Some(sock), Some(line)) = (&self.sock, &self.irq) else {
            return;
        };
        let res = sock
            .try_clone()
            .and_then(|sock| Notifier::spawn(sock, Arc::clone(line)));
        match res {
            Ok(notifier) => self.notifier = Some(notifier),
            Err(err) => warn!("No receive notifier, falling back to polling: {}", err),
        }
    }

    /// Folds an error frame into the tracked flags.
    fn absorb_error_frame(&mut self, raw: &can_frame) {
        let len = (raw.can_dlc as usize).min(raw.data.len());
        match CanError::decode(raw.can_id & CAN_ERR_MASK, &raw.data[..len]) {
            Ok(errs) => {
                for err in errs {
                    debug!("{}: {}", self.ifname, err);
                    err.apply(&mut self.flags);
                }
            }
            Err(err) => trace!("{}: undecoded error frame: {}", self.ifname, err),
        }
    }

    /// Merges the kernel's view of the bus state into the flags.
    #[cfg(feature = "netlink")]
    fn refresh_bus_state(&mut self) {
        let details = match self.iface.details() {
            Ok(details) => details,
            Err(err) => {
                trace!("{}: no bus state: {}", self.ifname, err);
                return;
            }
        };
        self.flags = merge_bus_state(self.flags, details.state, details.berr_counter);
    }

    /// Checks that the interface agrees with the timing we want, or makes
    /// it agree if the controller is managed.
    #[cfg(feature = "netlink")]
    fn apply_timing(&mut self, timing: &BitTiming) -> Result<(), ControllerError> {
        let cfg_err = |err: &dyn fmt::Display| {
            ControllerError::Configuration(format!("{}: {}", self.ifname, err))
        };

        if self.managed {
            self.iface
                .set_bitrate(timing.bitrate, timing.sample_point)
                .map_err(|e| cfg_err(&e))?;
            if let Err(err) = self.iface.set_ctrlmode(CanCtrlMode::BerrReporting, true) {
                debug!("{}: no bus-error reporting: {}", self.ifname, err);
            }
        }

        match self.iface.bit_rate() {
            Ok(Some(rate)) if rate != timing.bitrate => Err(cfg_err(&format!(
                "interface runs at {} bit/s, not {} bit/s",
                rate, timing.bitrate
            ))),
            Ok(_) => Ok(()),
            // Virtual interfaces have no bit timing to compare against
            Err(err) => {
                debug!("{}: no bit timing: {}", self.ifname, err);
                Ok(())
            }
        }
    }

    #[cfg(not(feature = "netlink"))]
    fn apply_timing(&mut self, _timing: &BitTiming) -> Result<(), ControllerError> {
        Ok(())
    }
}

impl Controller for SocketController {
    fn reset(&mut self) {
        self.notifier = None;
        self.sock = None;
        self.flags = ErrorFlags::empty();

        #[cfg(feature = "netlink")]
        if self.managed {
            if let Err(err) = self.iface.bring_down() {
                warn!("{}: could not bring the interface down: {}", self.ifname, err);
            }
        }
    }

    fn configure(&mut self, bitrate: u32, clock_hz: u32) -> Result<(), ControllerError> {
        let timing = BitTiming::calc(bitrate, clock_hz)?;
        let [cnf1, cnf2, cnf3] = timing.mcp2515_cnf();
        debug!(
            "{}: {} bit/s = {} TQ of {} ns, sample point {}.{}% (CNF {:02X} {:02X} {:02X})",
            self.ifname,
            bitrate,
            timing.quanta(),
            timing.tq,
            timing.sample_point / 10,
            timing.sample_point % 10,
            cnf1,
            cnf2,
            cnf3
        );
        self.apply_timing(&timing)
    }

    fn enter_operating_mode(&mut self) -> Result<(), ControllerError> {
        let mode_err = |err: &dyn fmt::Display| {
            ControllerError::ModeTransition(format!("{}: {}", self.ifname, err))
        };

        #[cfg(feature = "netlink")]
        {
            if self.managed {
                self.iface.bring_up().map_err(|e| mode_err(&e))?;
            }
            if let Ok(Some(state @ (CanState::BusOff | CanState::Stopped))) = self.iface.state() {
                return Err(mode_err(&format!("interface is {}", state)));
            }
        }

        let sock = raw_open_socket(self.ifindex).map_err(|e| mode_err(&e))?;
        sock.set_nonblocking(true).map_err(|e| mode_err(&e))?;
        set_socket_option(&sock, SOL_CAN_RAW, CAN_RAW_ERR_FILTER, &CAN_ERR_MASK)
            .map_err(|e| mode_err(&e))?;

        self.sock = Some(sock);
        self.start_notifier();
        info!("{}: operating", self.ifname);
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), ControllerError> {
        let raw: can_frame = (*frame).into();
        match self.socket()?.send(as_bytes(&raw)) {
            Ok(CAN_MTU) => {
                trace!("{}: sent {:X}", self.ifname, frame);
                Ok(())
            }
            Ok(n) => Err(ControllerError::Transmit(format!("short write: {} bytes", n))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(
                ControllerError::Transmit("no free transmit buffer".into()),
            ),
            Err(err) => match Errno::from_raw(err.raw_os_error().unwrap_or(0)) {
                Errno::ENOBUFS => Err(ControllerError::Transmit("transmit queue full".into())),
                Errno::ENETDOWN => Err(ControllerError::Transmit("interface is down".into())),
                _ => Err(err.into()),
            },
        }
    }

    fn poll_receive(&mut self) -> bool {
        match &self.sock {
            Some(sock) => wait_readable(sock, PollTimeout::ZERO).unwrap_or(false),
            None => false,
        }
    }

    fn receive(&mut self) -> Option<CanFrame> {
        loop {
            let res = read_raw_frame(self.sock.as_ref()?);
            let raw = match res {
                Ok(raw) => raw,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) => {
                    warn!("{}: read failed: {}", self.ifname, err);
                    return None;
                }
            };

            if raw.can_id & CAN_ERR_FLAG != 0 {
                self.absorb_error_frame(&raw);
                continue;
            }
            match CanFrame::try_from(raw) {
                Ok(frame) => {
                    trace!("{}: received {:X}", self.ifname, frame);
                    return Some(frame);
                }
                Err(_) => trace!("{}: skipping frame 0x{:X}", self.ifname, raw.can_id),
            }
        }
    }

    fn read_error_flags(&mut self) -> ErrorFlags {
        #[cfg(feature = "netlink")]
        self.refresh_bus_state();
        self.flags
    }

    fn clear_receive_overflow(&mut self) {
        self.flags.remove(ErrorFlags::RX_OVERFLOW);
    }

    fn attach_irq(&mut self, line: Arc<IrqLine>) {
        self.irq = Some(line);
        self.notifier = None;
        self.start_notifier();
    }
}

// ===== embedded_can =====

impl embedded_can::nb::Can for SocketController {
    type Frame = CanFrame;
    type Error = ControllerError;

    /// Sends a frame, mapping a refused transmission to `WouldBlock`.
    fn transmit(&mut self, frame: &Self::Frame) -> nb::Result<Option<Self::Frame>, Self::Error> {
        match Controller::send(self, frame) {
            Ok(()) => Ok(None),
            Err(err) if err.is_transmit() => Err(nb::Error::WouldBlock),
            Err(err) => Err(nb::Error::Other(err)),
        }
    }

    /// Gets the next frame, or `WouldBlock` if there is none.
    fn receive(&mut self) -> nb::Result<Self::Frame, Self::Error> {
        Controller::receive(self).ok_or(nb::Error::WouldBlock)
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sock_addr() {
        let addr = can_sock_addr(7);
        assert_eq!(mem::size_of::<libc::sockaddr_can>(), addr.len() as usize);
        assert_eq!(AF_CAN as libc::sa_family_t, addr.family());
    }

    #[test]
    fn test_open_missing_iface() {
        assert!(SocketController::open("canpong-none0").is_err());
    }

    #[cfg(feature = "netlink")]
    #[test]
    fn test_bus_state_without_counters() {
        let passive = merge_bus_state(ErrorFlags::empty(), Some(CanState::ErrorPassive), None);
        assert!(passive.is_error_passive());
        assert!(passive.is_warning());

        // Error frames already told us it is the transmit side
        let passive = merge_bus_state(ErrorFlags::TXEP, Some(CanState::ErrorPassive), None);
        assert_eq!(ErrorFlags::TXEP | ErrorFlags::EWARN, passive);

        let warning = merge_bus_state(passive, Some(CanState::ErrorWarning), None);
        assert_eq!(ErrorFlags::EWARN, warning);

        let active = merge_bus_state(
            ErrorFlags::RX0OVR | ErrorFlags::TXBO | ErrorFlags::RXEP | ErrorFlags::RXWAR,
            Some(CanState::ErrorActive),
            None,
        );
        assert_eq!(ErrorFlags::RX0OVR, active);

        assert_eq!(
            ErrorFlags::TXBO | ErrorFlags::EWARN,
            merge_bus_state(ErrorFlags::EWARN, Some(CanState::BusOff), None)
        );
        assert_eq!(ErrorFlags::RXEP, merge_bus_state(ErrorFlags::RXEP, None, None));
    }

    #[cfg(feature = "netlink")]
    #[test]
    fn test_bus_state_with_counters() {
        let berr = CanBerrCounter {
            txerr: 100,
            rxerr: 0,
        };
        // The counters win over both the state and stale level bits
        let flags = merge_bus_state(
            ErrorFlags::RX1OVR | ErrorFlags::RXEP,
            Some(CanState::ErrorPassive),
            Some(berr),
        );
        assert_eq!(
            ErrorFlags::RX1OVR | ErrorFlags::TXWAR | ErrorFlags::EWARN,
            flags
        );
    }

    #[test]
    fn test_error_frame_absorbed() {
        let mut ctrl = SocketController {
            ifname: "test".into(),
            ifindex: 0,
            sock: None,
            flags: ErrorFlags::empty(),
            irq: None,
            notifier: None,
            #[cfg(feature = "netlink")]
            iface: CanInterface::open_iface(0),
            #[cfg(feature = "netlink")]
            managed: false,
        };

        let mut raw: can_frame = unsafe { mem::zeroed() };
        raw.can_id = CAN_ERR_FLAG | 0x0004 | 0x0040;
        raw.can_dlc = 8;
        raw.data[1] = 0x01 | 0x20;
        ctrl.absorb_error_frame(&raw);
        assert!(ctrl.flags.contains(ErrorFlags::RX0OVR | ErrorFlags::TXEP | ErrorFlags::TXBO));

        ctrl.clear_receive_overflow();
        assert!(!ctrl.flags.is_overflow());
        assert!(ctrl.flags.is_bus_off());

        // Not operating, so nothing to send or receive
        assert!(!ctrl.is_open());
        assert!(!ctrl.poll_receive());
        assert!(Controller::receive(&mut ctrl).is_none());
        assert!(Controller::send(&mut ctrl, &CanFrame::default())
            .unwrap_err()
            .is_transmit());
    }
}
