// canpong/src/irq.rs
//
// The pending-interrupt signal shared with interrupt context.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Receive interrupt signalling.
//!
//! The controller's interrupt line is only allowed to *flag* work. The
//! handler raises an [`IrqLine`] and returns; the main loop takes the flag
//! and does every bus transaction itself, since the controller transport
//! can not be used re-entrantly from interrupt context.
//!
//! The flag has a single writer (the handler) and a single reader (the
//! main tick). Only the reader ever clears it, and it does so with an
//! atomic swap *before* draining the receive buffers, so an edge that
//! arrives during the drain is kept for the next tick instead of lost.

use std::sync::atomic::{AtomicBool, Ordering};

/// A single-bit, lock-free "receive work pending" signal.
#[derive(Debug, Default)]
pub struct IrqLine {
    pending: AtomicBool,
}

impl IrqLine {
    /// Creates a line with no pending signal.
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Flags pending work. This is all an interrupt handler may do.
    #[inline]
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Reads and clears the flag in one step.
    ///
    /// Only the main loop calls this.
    #[inline]
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Peeks at the flag without consuming it.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_take_clears() {
        let line = IrqLine::new();
        assert!(!line.take());

        line.raise();
        assert!(line.is_pending());
        assert!(line.take());
        assert!(!line.is_pending());
        assert!(!line.take());
    }

    #[test]
    fn test_raise_twice_is_one_signal() {
        let line = IrqLine::new();
        line.raise();
        line.raise();
        assert!(line.take());
        assert!(!line.take());
    }

    #[test]
    fn test_raise_from_other_thread() {
        let line = Arc::new(IrqLine::new());
        let handler = Arc::clone(&line);

        thread::spawn(move || handler.raise()).join().unwrap();
        assert!(line.take());
    }
}
