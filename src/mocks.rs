// canpong/src/mocks.rs
//
// A scripted controller for unit tests.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

use crate::{CanFrame, Controller, ControllerError, ErrorFlags, IrqLine};
use std::{collections::VecDeque, sync::Arc};

/// Controller double: records what the link does and replays what the
/// test queued.
#[derive(Debug, Default)]
pub(crate) struct MockController {
    /// Frames waiting to be received
    pub rx: VecDeque<CanFrame>,
    /// Frames successfully sent
    pub sent: Vec<CanFrame>,
    /// Value returned by `read_error_flags`
    pub flags: ErrorFlags,
    /// Make `configure` fail
    pub fail_configure: bool,
    /// Make `enter_operating_mode` fail
    pub fail_mode: bool,
    /// Make every `send` fail
    pub fail_send: bool,
    /// Number of `reset` calls
    pub resets: usize,
    /// Arguments of every `configure` call
    pub configured: Vec<(u32, u32)>,
    /// Number of `read_error_flags` calls
    pub flag_reads: usize,
    /// Number of `clear_receive_overflow` calls
    pub overflow_clears: usize,
    /// The line handed over by `attach_irq`
    pub irq: Option<Arc<IrqLine>>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a frame and pulses the interrupt line, like hardware would.
    pub fn deliver(&mut self, frame: CanFrame) {
        self.rx.push_back(frame);
        if let Some(line) = &self.irq {
            line.raise();
        }
    }
}

impl Controller for MockController {
    fn reset(&mut self) {
        self.resets += 1;
    }

    fn configure(&mut self, bitrate: u32, clock_hz: u32) -> Result<(), ControllerError> {
        self.configured.push((bitrate, clock_hz));
        if self.fail_configure {
            return Err(ControllerError::Configuration("scripted failure".into()));
        }
        Ok(())
    }

    fn enter_operating_mode(&mut self) -> Result<(), ControllerError> {
        if self.fail_mode {
            return Err(ControllerError::ModeTransition("scripted failure".into()));
        }
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), ControllerError> {
        if self.fail_send {
            return Err(ControllerError::Transmit("no free buffer".into()));
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
        self.flag_reads += 1;
        self.flags
    }

    fn clear_receive_overflow(&mut self) {
        self.overflow_clears += 1;
        self.flags.remove(ErrorFlags::RX_OVERFLOW);
    }

    fn attach_irq(&mut self, line: Arc<IrqLine>) {
        self.irq = Some(line);
    }
}
