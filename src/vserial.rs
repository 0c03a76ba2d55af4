//! Virtual serial device façade.
//!
//! A uniform byte-stream capability set over either a real UART
//! ([`UartSerial`]) or a CMUX channel ([`CmuxSerial`]). [`Ppp`] consumes it
//! directly so the dial sequencer's raw-byte pump is the same code
//! regardless of which transport it ends up running over.
//!
//! [`AtClient`] itself stays generic over [`crate::port::UartPort`] rather
//! than over this trait: without an allocator or dynamic dispatch, giving
//! it a second generic transport parameter here would mean threading a
//! `VirtualSerial`-shaped equivalent of `suspend_cts`/`resume_cts` through
//! [`crate::power::WakeOnTx`] as well, for a transport (AT-over-CMUX-
//! channel-1) this crate doesn't otherwise need -- recorded as a deliberate
//! scope decision rather than implemented speculatively.
//!
//! Unlike [`crate::port::UartPort`] (which wraps `embedded_io_async` for the
//! hardware boundary), this trait returns [`Error`] directly: it's an
//! internal seam, not a porting contract implementors outside this crate
//! need to satisfy against a foreign trait family.
//!
//! [`AtClient`]: crate::at::client::AtClient
//! [`Ppp`]: crate::ppp::Ppp

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_io_async::{Read as _, Write as _};

use crate::cmux::Cmux;
use crate::error::Error;
use crate::port::UartPort;

pub mod event {
    pub const DATA_RECEIVED: u8 = crate::port::event::DATA_RECEIVED;
}

/// Raw function-pointer callback plus an event-bit filter, matching the
/// `{function, opaque parameter}` shape used elsewhere in the crate (e.g.
/// [`crate::at::client::DeferredCallback`]) rather than a boxed closure,
/// since this crate has no allocator.
pub struct EventCallback {
    func: Option<fn(u8, *mut ())>,
    ctx: *mut (),
    filter: u8,
}

// Safety: callers installing a callback are responsible for `ctx` pointing
// at memory that outlives the registration and for the function itself
// being safe to invoke from whatever task delivers the event.
unsafe impl Send for EventCallback {}

impl Default for EventCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCallback {
    pub const fn new() -> Self {
        Self { func: None, ctx: core::ptr::null_mut(), filter: 0 }
    }

    pub fn set(&mut self, func: fn(u8, *mut ()), ctx: *mut ()) {
        self.func = Some(func);
        self.ctx = ctx;
    }

    pub fn remove(&mut self) {
        self.func = None;
        self.ctx = core::ptr::null_mut();
    }

    pub fn filter(&self) -> u8 {
        self.filter
    }

    pub fn set_filter(&mut self, mask: u8) {
        self.filter = mask;
    }

    /// Invokes the callback if one is installed and `event` passes the
    /// filter. Idempotent no-op when nothing is registered.
    pub fn send(&self, event: u8) {
        if event & self.filter != 0 {
            if let Some(f) = self.func {
                f(event, self.ctx);
            }
        }
    }
}

/// Uniform byte-stream capability set: write, read, size-pending,
/// event-callback set/remove, event-filter get/set, event-send.
/// `open`/`close` are the realization's own constructor/`Drop` rather than
/// trait methods -- this mirrors how [`UartPort`] itself needs no explicit
/// open/close beyond construction.
pub trait VirtualSerial {
    /// Writes `data`, returning the number of bytes accepted. A zero-length
    /// write returns `Ok(0)`, not an error.
    async fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// Reads up to `dst.len()` bytes, consuming them. Returns `Ok(0)` for a
    /// zero-length read without blocking.
    async fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error>;

    /// Bytes currently buffered and not yet read.
    fn size_pending(&self) -> usize;

    fn event_callback_set(&mut self, func: fn(u8, *mut ()), ctx: *mut ());
    fn event_callback_remove(&mut self);
    fn event_filter(&self) -> u8;
    fn set_event_filter(&mut self, mask: u8);

    /// Delivers `event` to the installed callback, if any, subject to the
    /// current filter. The realization calls this itself when new data
    /// arrives; exposed so a caller can also synthesize events in tests.
    fn event_send(&self, event: u8);
}

/// Identity mapping onto a real [`UartPort`].
pub struct UartSerial<P> {
    port: P,
    callback: EventCallback,
}

impl<P: UartPort> UartSerial<P> {
    pub fn new(port: P) -> Self {
        Self { port, callback: EventCallback::new() }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_inner(self) -> P {
        self.port
    }
}

impl<P: UartPort> VirtualSerial for UartSerial<P> {
    async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if data.is_empty() {
            return Ok(0);
        }
        self.port.write(data).await.map_err(|_| Error::Transport)
    }

    async fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        if dst.is_empty() {
            return Ok(0);
        }
        let n = self.port.read(dst).await.map_err(|_| Error::Transport)?;
        if n > 0 {
            self.event_send(event::DATA_RECEIVED);
        }
        Ok(n)
    }

    fn size_pending(&self) -> usize {
        self.port.size_pending()
    }

    fn event_callback_set(&mut self, func: fn(u8, *mut ()), ctx: *mut ()) {
        self.callback.set(func, ctx);
    }

    fn event_callback_remove(&mut self) {
        self.callback.remove();
    }

    fn event_filter(&self) -> u8 {
        self.callback.filter()
    }

    fn set_event_filter(&mut self, mask: u8) {
        self.callback.set_filter(mask);
    }

    fn event_send(&self, event: u8) {
        self.callback.send(event);
    }
}

/// CMUX channel adapter: writes frame a UIH frame onto the channel, reads
/// pull straight from the channel's own SPSC ring
/// (lock-free); writes and channel-open/close structural state share the
/// multiplexer's mutex, trading a small amount of lock-freedom on the write
/// side for not having to split `Cmux` into independently-lockable halves.
pub struct CmuxSerial<'a, P, M, const CH: usize, const RX_N: usize>
where
    M: RawMutex,
{
    id: u8,
    mux: &'a Mutex<M, Cmux<P, M, CH, RX_N>>,
    callback: EventCallback,
}

impl<'a, P, M, const CH: usize, const RX_N: usize> CmuxSerial<'a, P, M, CH, RX_N>
where
    P: UartPort,
    M: RawMutex,
{
    pub fn new(mux: &'a Mutex<M, Cmux<P, M, CH, RX_N>>, id: u8) -> Self {
        Self { id, mux, callback: EventCallback::new() }
    }
}

impl<'a, P, M, const CH: usize, const RX_N: usize> VirtualSerial for CmuxSerial<'a, P, M, CH, RX_N>
where
    P: UartPort,
    M: RawMutex,
{
    async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if data.is_empty() {
            return Ok(0);
        }
        self.mux.lock().await.write_channel(self.id, data).await?;
        Ok(data.len())
    }

    async fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        if dst.is_empty() {
            return Ok(0);
        }
        let guard = self.mux.lock().await;
        let channel = guard.channel(self.id).ok_or(Error::InvalidParameter)?;
        let n = channel.rx().peek(dst);
        channel.rx().consume(n);
        drop(guard);
        if n > 0 {
            self.event_send(event::DATA_RECEIVED);
        }
        Ok(n)
    }

    fn size_pending(&self) -> usize {
        // Best-effort snapshot without awaiting the mutex: callers on the
        // synchronous size-pending path accept a momentarily stale count,
        // used only for capacity planning.
        match self.mux.try_lock() {
            Ok(guard) => guard.channel(self.id).map(|c| c.rx().available()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn event_callback_set(&mut self, func: fn(u8, *mut ()), ctx: *mut ()) {
        self.callback.set(func, ctx);
    }

    fn event_callback_remove(&mut self) {
        self.callback.remove();
    }

    fn event_filter(&self) -> u8 {
        self.callback.filter()
    }

    fn set_event_filter(&mut self, mask: u8) {
        self.callback.set_filter(mask);
    }

    fn event_send(&self, event: u8) {
        self.callback.send(event);
    }
}
