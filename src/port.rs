//! UART port adapter contract.
//!
//! The core never talks to real hardware directly; it talks to whatever
//! implements [`UartPort`]. Every porting seam is a generic bound rather
//! than a boxed trait object -- here the transport is a byte stream
//! instead of a register-oriented bus.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embedded_io_async::{Read, Write};

/// Event bits a [`UartPort`] can post. Only `DATA_RECEIVED` is defined
/// today; it's edge-triggered -- posted exactly once when the RX buffer
/// transitions from empty to non-empty.
pub mod event {
    pub const DATA_RECEIVED: u8 = 0x01;
}

/// Porting contract for a physical or virtual serial transport.
///
/// Implementations compose [`embedded_io_async::Read`]/[`Write`] for the
/// byte-level I/O with the extra points those traits don't cover:
/// pending-byte count, CTS suspend/resume (used by the wake-on-tx
/// sequence), and nested-callback detection.
pub trait UartPort: Read + Write {
    /// Bytes currently buffered and not yet read.
    fn size_pending(&self) -> usize;

    /// Suspends CTS observation so a sleeping module can't stall the link
    /// with hardware flow control while it's being woken up.
    fn suspend_cts(&mut self);

    /// Resumes CTS observation after a wake sequence.
    fn resume_cts(&mut self);

    /// True if called from within the port's own RX event callback.
    /// `AtClient::lock` checks this before acquiring the transaction lock
    /// and refuses with `Error::Reentrant` rather than deadlocking or
    /// running a transaction that can never make progress.
    fn is_in_event_callback(&self) -> bool {
        false
    }
}

/// Signals `DATA_RECEIVED` from a port's RX path to whatever is awaiting new
/// bytes (the AT parser task, or a CMUX demux task). One per UART, shared
/// between the event source and the waiter.
pub type DataReadySignal<M> = Signal<M, ()>;

/// Convenience alias for the common case of a single-threaded executor
/// where `NoopRawMutex` is an adequate (and zero-cost) signal mutex.
pub fn new_data_ready_signal<M: RawMutex>() -> DataReadySignal<M> {
    Signal::new()
}
