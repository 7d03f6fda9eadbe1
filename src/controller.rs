// canpong/src/controller.rs
//
// The capability surface of a CAN bus controller.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Bus controller interface.
//!
//! The link state machine and protocol engine never talk to hardware
//! directly. They drive a [`Controller`], which hides whether the frames
//! go over SPI to a stand-alone chip, through a kernel SocketCAN device
//! (see [`SocketController`](crate::SocketController)), or into a test
//! double.
//!
//! None of the calls may block: `send` and `receive` return promptly even
//! when the bus is busy or broken.

use crate::{CanFrame, ControllerError, ErrorFlags, IrqLine};
use std::sync::Arc;

/// A CAN bus controller, as seen by the link.
pub trait Controller {
    /// Forces the controller into a known, configurable state.
    ///
    /// This can not fail observably; problems show up in the following
    /// `configure` or `enter_operating_mode`.
    fn reset(&mut self);

    /// Programs the bit timing for a bitrate on a given input clock.
    ///
    /// Fails with `Configuration` if the controller can not generate that
    /// bitrate from that clock.
    fn configure(&mut self, bitrate: u32, clock_hz: u32) -> Result<(), ControllerError>;

    /// Leaves configuration mode and starts participating on the bus.
    ///
    /// Fails with `ModeTransition` if the controller does not acknowledge
    /// the change.
    fn enter_operating_mode(&mut self) -> Result<(), ControllerError>;

    /// Attempts a single transmission without waiting for the bus.
    ///
    /// Fails with `Transmit` when no transmit buffer is free, arbitration
    /// was lost, or the controller is bus-off.
    fn send(&mut self, frame: &CanFrame) -> Result<(), ControllerError>;

    /// Checks whether at least one received frame is buffered.
    fn poll_receive(&mut self) -> bool;

    /// Pops one buffered frame, if there is one.
    fn receive(&mut self) -> Option<CanFrame>;

    /// Reads the live error-flag telemetry.
    fn read_error_flags(&mut self) -> ErrorFlags;

    /// Clears the receive overflow flags. Idempotent.
    fn clear_receive_overflow(&mut self);

    /// Connects the controller's receive interrupt to a signal line.
    ///
    /// Controllers without an interrupt source ignore this, and the link
    /// falls back to polling.
    fn attach_irq(&mut self, _line: Arc<IrqLine>) {}
}

impl<C: Controller + ?Sized> Controller for Box<C> {
    fn reset(&mut self) {
        (**self).reset()
    }

    fn configure(&mut self, bitrate: u32, clock_hz: u32) -> Result<(), ControllerError> {
        (**self).configure(bitrate, clock_hz)
    }

    fn enter_operating_mode(&mut self) -> Result<(), ControllerError> {
        (**self).enter_operating_mode()
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), ControllerError> {
        (**self).send(frame)
    }

    fn poll_receive(&mut self) -> bool {
        (**self).poll_receive()
    }

    fn receive(&mut self) -> Option<CanFrame> {
        (**self).receive()
    }

    fn read_error_flags(&mut self) -> ErrorFlags {
        (**self).read_error_flags()
    }

    fn clear_receive_overflow(&mut self) {
        (**self).clear_receive_overflow()
    }

    fn attach_irq(&mut self, line: Arc<IrqLine>) {
        (**self).attach_irq(line)
    }
}
