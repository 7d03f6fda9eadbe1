// canpong/tests/helpers/mod.rs
//
// Shared test doubles for the integration tests.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

#![allow(dead_code)]

use canpong::{CanFrame, Clock, Controller, ControllerError, ErrorFlags, IrqLine};
use std::{cell::Cell, collections::VecDeque, sync::Arc};

/// A scripted bus controller.
///
/// Frames handed to `deliver` come back out of `receive`, and every frame
/// the node sends lands in `sent`.
#[derive(Debug, Default)]
pub struct FakeController {
    pub rx: VecDeque<CanFrame>,
    pub sent: Vec<CanFrame>,
    pub flags: ErrorFlags,
    pub fail_configure: bool,
    pub fail_send: bool,
    pub resets: usize,
    irq: Option<Arc<IrqLine>>,
}

impl FakeController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts a frame on the bus for the node, raising the interrupt line.
    pub fn deliver(&mut self, frame: CanFrame) {
        self.rx.push_back(frame);
        if let Some(line) = &self.irq {
            line.raise();
        }
    }

    /// Takes everything sent since the last call.
    pub fn take_sent(&mut self) -> Vec<CanFrame> {
        std::mem::take(&mut self.sent)
    }
}

impl Controller for FakeController {
    fn reset(&mut self) {
        self.resets += 1;
        self.rx.clear();
    }

    fn configure(&mut self, _bitrate: u32, _clock_hz: u32) -> Result<(), ControllerError> {
        if self.fail_configure {
            return Err(ControllerError::Configuration("no such bitrate".into()));
        }
        Ok(())
    }

    fn enter_operating_mode(&mut self) -> Result<(), ControllerError> {
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), ControllerError> {
        if self.fail_send {
            return Err(ControllerError::Transmit("all buffers busy".into()));
        }
        self.sent.push(*frame);
        Ok(())
    }

    fn poll_receive(&mut self) -> bool {
        !self.rx.is_empty()
    }

    fn receive(&mut self) -> Option<CanFrame> {
        self.rx.pop_front()
    }

    fn read_error_flags(&mut self) -> ErrorFlags {
        self.flags
    }

    fn clear_receive_overflow(&mut self) {
        self.flags.remove(ErrorFlags::RX_OVERFLOW);
    }

    fn attach_irq(&mut self, line: Arc<IrqLine>) {
        self.irq = Some(line);
    }
}

/// A clock that only moves when told to, and never sleeps.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u32>,
}

impl ManualClock {
    pub fn set(&self, now: u32) {
        self.now.set(now);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}
