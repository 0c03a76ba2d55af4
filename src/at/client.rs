//! The AT client itself: a locked transactional API over a [`UartPort`].
//!
//! Draws the same split between the generic transport and the protocol
//! state machine built on top of it that the rest of this crate's porting
//! seams do: [`AtClient`] owns the RX ring buffer (lock-free, shared with
//! the port's RX path) and a mutex-guarded transaction state; [`AtTransaction`]
//! is the RAII guard `lock()` hands back, and is the only way to reach
//! `command_start` / `response_start` / friends, which keeps "you forgot to
//! lock" unrepresentable.

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, Instant, Timer};
use embedded_io_async::Write as _;
use heapless::Vec;

use crate::error::{DeviceErrorState, Error};
use crate::intercept::{RxIntercept, TxIntercept};
use crate::port::{DataReadySignal, UartPort};
use crate::ringbuf::RingBuf;

use super::parser::{self, StopTag};

/// Wake-on-tx hook, invoked once per transaction before any command byte is
/// written. Modeled as a generic, compile-time-fixed component -- the same
/// way [`UartPort`]/`RawMutex` are fixed -- rather than a runtime-settable
/// function pointer, since a real implementation needs `&mut self` access
/// to its own deep-sleep/power state across an `await`, which a bare `fn`
/// pointer can't carry.
///
/// Takes the port directly rather than going through another
/// [`AtTransaction`]: the hook runs while the transaction lock is already
/// held, so it must suspend CTS and poke raw bytes on `port` itself instead
/// of recursively trying to lock the client.
///
/// The default [`NoWake`] always succeeds immediately, standing in for "no
/// wake-up callback installed".
pub trait WakeHook<P> {
    async fn wake(&mut self, port: &mut P) -> bool;
}

/// No-op wake hook: the modem is assumed already reachable.
#[derive(Default)]
pub struct NoWake;

impl<P> WakeHook<P> for NoWake {
    async fn wake(&mut self, _port: &mut P) -> bool {
        true
    }
}

/// A deferred callback, enqueued by a URC handler via [`AtTransaction::callback`]
/// and run later by [`AtClient::run_deferred`] -- never on the RX-parse path,
/// so it is free to call `lock()` itself.
pub struct DeferredCallback {
    func: fn(*mut ()),
    ctx: *mut (),
}

// Safety: the crate's contract is that `ctx` points at caller-owned memory
// that stays valid until the callback runs; ownership of *access* is handed
// off to the callback task at enqueue time, the enqueuer does not touch it
// again.
unsafe impl Send for DeferredCallback {}

impl DeferredCallback {
    pub fn new(func: fn(*mut ()), ctx: *mut ()) -> Self {
        Self { func, ctx }
    }

    pub fn run(self) {
        (self.func)(self.ctx);
    }
}

/// A registered URC handler: prefix to match, the handler function, and an
/// opaque context pointer passed through to it unchanged (see
/// [`AtTransaction::url_handler_set`]).
struct UrcEntry<const RX_N: usize> {
    prefix: Vec<u8, 16>,
    handler: UrcFn<RX_N>,
    ctx: *mut (),
}

// Safety: see `DeferredCallback` -- the context pointer's validity is a
// contract between the caller that registered it and the handler it wrote,
// not something this struct enforces.
unsafe impl<const RX_N: usize> Send for UrcEntry<RX_N> {}

/// Signature for a URC handler. Receives a read-only cursor positioned just
/// past the matched prefix, and the opaque context pointer it was
/// registered with. Must not call `lock()`.
pub type UrcFn<const RX_N: usize> = fn(cursor: &mut UrcCursor<'_, RX_N>, ctx: *mut ());

/// The restricted read API a URC handler gets: argument reads only, no
/// transaction control. May call `read_int`/`read_string`; must not call
/// `lock`.
pub struct UrcCursor<'a, const RX_N: usize> {
    rb: &'a RingBuf<RX_N>,
    pos: usize,
    line_end: usize,
    delimiter: u8,
}

impl<'a, const RX_N: usize> UrcCursor<'a, RX_N> {
    fn new(rb: &'a RingBuf<RX_N>, pos: usize, line_end: usize) -> Self {
        Self { rb, pos, line_end, delimiter: parser::DEFAULT_DELIMITER }
    }

    pub fn set_delimiter(&mut self, delim: u8) {
        self.delimiter = delim;
    }

    pub fn read_int(&mut self) -> Result<i64, Error> {
        self.pos = parser::skip_spaces(self.rb, self.pos);
        let end = parser::find_token_end(self.rb, self.pos, self.delimiter, self.line_end, false);
        let mut buf = [0u8; 24];
        let n = self.rb.peek_at(self.pos, &mut buf[..(end - self.pos).min(24)]);
        let v = parser::parse_i64(&buf[..n]).map_err(|_| Error::DeviceError(DeviceErrorState::None));
        self.advance_past(end);
        v
    }

    pub fn read_string<'b>(&mut self, dst: &'b mut [u8]) -> &'b [u8] {
        self.pos = parser::skip_spaces(self.rb, self.pos);
        let end = parser::find_token_end(self.rb, self.pos, self.delimiter, self.line_end, false);
        let n = self.rb.peek_at(self.pos, &mut dst[..(end - self.pos).min(dst.len())]);
        self.advance_past(end);
        parser::strip_quotes(&dst[..n])
    }

    fn advance_past(&mut self, token_end: usize) {
        self.pos = if self.rb.peek_byte(token_end) == Some(self.delimiter) {
            token_end + 1
        } else {
            token_end
        };
    }
}

/// Everything that needs exclusive access during a transaction: the port,
/// the assembling TX buffer, the response-parse cursor, and the per-client
/// configuration/registration tables.
struct AtLockState<P, W, const RX_N: usize, const TX_N: usize, const URC_N: usize> {
    port: P,
    tx_buf: Vec<u8, TX_N>,
    arg_count: u32,
    delimiter: u8,
    cursor: usize,
    line_end: usize,
    /// True once the stop tag itself has been located and fully consumed
    /// (the "response_start found the stop tag directly" case); false when
    /// `cursor`/`line_end` describe a matched prefix line still pending a
    /// later stop tag (`response_stop` then keeps scanning).
    stop_consumed: bool,
    default_timeout: Duration,
    timeout_override: Option<Duration>,
    urc_handlers: Vec<UrcEntry<RX_N>, URC_N>,
    device_error: DeviceErrorState,
    wake: W,
}

/// The AT command/response client.
///
/// Generic over the transport (`P: UartPort`), the mutex flavor (`M:
/// RawMutex`, typically `NoopRawMutex` on a single-executor target or
/// `CriticalSectionRawMutex` when shared across interrupt contexts), the RX
/// ring size, the TX scratch size, the URC handler table size, and the
/// deferred-callback queue depth.
pub struct AtClient<
    P,
    M,
    W = NoWake,
    const RX_N: usize = 1024,
    const TX_N: usize = 256,
    const URC_N: usize = 8,
    const CB_N: usize = 4,
> where
    M: RawMutex,
{
    rx: RingBuf<RX_N>,
    data_ready: DataReadySignal<M>,
    state: Mutex<M, AtLockState<P, W, RX_N, TX_N, URC_N>>,
    deferred: Channel<M, DeferredCallback, CB_N>,
}

impl<P, M, W, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>
    AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>
where
    P: UartPort,
    M: RawMutex,
    W: WakeHook<P>,
{
    pub fn new(port: P, wake: W, default_timeout: Duration) -> Self {
        Self {
            rx: RingBuf::new(),
            data_ready: DataReadySignal::new(),
            state: Mutex::new(AtLockState {
                port,
                tx_buf: Vec::new(),
                arg_count: 0,
                delimiter: parser::DEFAULT_DELIMITER,
                cursor: 0,
                line_end: 0,
                stop_consumed: true,
                default_timeout,
                timeout_override: None,
                urc_handlers: Vec::new(),
                device_error: DeviceErrorState::None,
                wake,
            }),
            deferred: Channel::new(),
        }
    }

    /// Feeds newly arrived bytes into the RX ring (called from the UART RX
    /// event path, see [`crate::port`]) and signals `DATA_RECEIVED` if the
    /// buffer transitioned from empty. Returns the number of bytes actually
    /// accepted -- less than `data.len()` if the ring buffer was full.
    pub fn feed_rx(&self, data: &[u8], rx_intercept: &mut dyn RxIntercept) -> usize {
        let was_empty = self.rx.is_empty();
        let filtered = rx_intercept.intercept_rx(data);
        let n = self.rx.write(filtered);
        if was_empty && n > 0 {
            self.data_ready.signal(());
        }
        n
    }

    /// Acquires the transaction lock. Refuses with [`Error::Reentrant`] if
    /// called from within the port's own RX event callback, where no
    /// transaction can safely run to completion. Otherwise the wake hook
    /// runs before any bytes are written; a `false` return aborts the
    /// transaction before it starts.
    pub async fn lock(&self) -> Result<AtTransaction<'_, P, M, W, RX_N, TX_N, URC_N, CB_N>, Error> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.port.is_in_event_callback() {
            return Err(Error::Reentrant);
        }
        if !state.wake.wake(&mut state.port).await {
            return Err(Error::Timeout);
        }
        Ok(AtTransaction { client: self, guard, result: Ok(()) })
    }

    /// Registers a deferred callback for later execution by
    /// [`Self::run_deferred`]. Fails gracefully if the queue is full, rather
    /// than blocking the caller (a URC handler, which must not block).
    pub fn enqueue_callback(&self, func: fn(*mut ()), ctx: *mut ()) -> Result<(), Error> {
        self.deferred
            .try_send(DeferredCallback::new(func, ctx))
            .map_err(|_| Error::NoMemory)
    }

    /// The deferred-callback task body: drains the queue forever, running
    /// each callback outside the RX-parse path.
    pub async fn run_deferred(&self) -> ! {
        loop {
            let cb = self.deferred.receive().await;
            cb.run();
        }
    }
}

/// An in-progress transaction obtained from [`AtClient::lock`]. Dropping it
/// without calling [`Self::unlock`] still releases the lock (the mutex
/// guard's `Drop` does that), but loses the transaction result code.
pub struct AtTransaction<
    'c,
    P,
    M,
    W,
    const RX_N: usize,
    const TX_N: usize,
    const URC_N: usize,
    const CB_N: usize,
> where
    M: RawMutex,
{
    client: &'c AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    guard: MutexGuard<'c, M, AtLockState<P, W, RX_N, TX_N, URC_N>>,
    result: Result<(), Error>,
}

impl<'c, P, M, W, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>
    AtTransaction<'c, P, M, W, RX_N, TX_N, URC_N, CB_N>
where
    P: UartPort,
    M: RawMutex,
    W: WakeHook<P>,
{
    /// Releases the lock and returns the transaction's result code.
    pub fn unlock(self) -> Result<(), Error> {
        self.result
    }

    /// The device-error state recorded during this transaction, if any --
    /// set by a stop tag carrying `+CME ERROR`/`+CMS ERROR`/`ABORTED`, or by
    /// [`Self::read_int`] on an empty token.
    pub fn device_error(&self) -> DeviceErrorState {
        self.guard.device_error
    }

    /// Overrides the default timeout for the remainder of this transaction
    /// only.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.guard.timeout_override = Some(timeout);
    }

    fn effective_timeout(&self) -> Duration {
        self.guard.timeout_override.unwrap_or(self.guard.default_timeout)
    }

    /// Registers a URC handler. Replaces any existing handler for the same
    /// prefix.
    pub fn url_handler_set(
        &mut self,
        prefix: &[u8],
        handler: UrcFn<RX_N>,
        ctx: *mut (),
    ) -> Result<(), Error> {
        let mut p: Vec<u8, 16> = Vec::new();
        p.extend_from_slice(prefix).map_err(|_| Error::InvalidParameter)?;
        if let Some(existing) = self.guard.urc_handlers.iter_mut().find(|e| e.prefix == p) {
            existing.handler = handler;
            existing.ctx = ctx;
            return Ok(());
        }
        self.guard
            .urc_handlers
            .push(UrcEntry { prefix: p, handler, ctx })
            .map_err(|_| Error::NoMemory)
    }

    pub fn url_handler_remove(&mut self, prefix: &[u8]) {
        if let Some(idx) = self.guard.urc_handlers.iter().position(|e| e.prefix.as_slice() == prefix) {
            self.guard.urc_handlers.swap_remove(idx);
        }
    }

    /// Enqueues a deferred callback, to be run later by
    /// [`AtClient::run_deferred`] outside of any lock held right now.
    pub fn callback(&self, func: fn(*mut ()), ctx: *mut ()) -> Result<(), Error> {
        self.client.enqueue_callback(func, ctx)
    }

    // -- command assembly ------------------------------------------------

    /// Starts assembling a new command with the given prefix (e.g.
    /// `b"AT+CSQ"`). Resets the argument delimiter to `,`.
    pub fn command_start(&mut self, prefix: &[u8]) {
        self.guard.tx_buf.clear();
        self.guard.arg_count = 0;
        self.guard.delimiter = parser::DEFAULT_DELIMITER;
        let _ = self.guard.tx_buf.extend_from_slice(prefix);
    }

    /// Overrides the argument delimiter for subsequent `write_*` calls in
    /// this command. The override lasts only for the remainder of the
    /// current command.
    pub fn set_delimiter(&mut self, delim: u8) {
        self.guard.delimiter = delim;
    }

    /// Writes the separator before an argument: `=` before the first one,
    /// the configured delimiter before every one after that.
    fn push_delimiter(&mut self) {
        let sep = if self.guard.arg_count == 0 { b'=' } else { self.guard.delimiter };
        let _ = self.guard.tx_buf.push(sep);
        self.guard.arg_count += 1;
    }

    pub fn write_int(&mut self, n: i64) {
        self.push_delimiter();
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        let neg = n < 0;
        // `i128` avoids overflow when negating `i64::MIN`.
        let mut v: i128 = (n as i128).abs();
        loop {
            i -= 1;
            digits[i] = b'0' + (v % 10) as u8;
            v /= 10;
            if v == 0 {
                break;
            }
        }
        if neg {
            let _ = self.guard.tx_buf.push(b'-');
        }
        let _ = self.guard.tx_buf.extend_from_slice(&digits[i..]);
    }

    pub fn write_string(&mut self, s: &[u8], with_quotes: bool) {
        self.push_delimiter();
        if with_quotes {
            let _ = self.guard.tx_buf.push(b'"');
        }
        let _ = self.guard.tx_buf.extend_from_slice(s);
        if with_quotes {
            let _ = self.guard.tx_buf.push(b'"');
        }
    }

    /// Writes raw bytes as an argument. When `send_standalone` is set, no
    /// delimiter is added first (used for binary payloads that follow a
    /// `>` prompt rather than a normal comma-separated field).
    pub fn write_bytes(&mut self, buf: &[u8], n: usize, send_standalone: bool) {
        if !send_standalone {
            self.push_delimiter();
        }
        let _ = self.guard.tx_buf.extend_from_slice(&buf[..n.min(buf.len())]);
    }

    /// Writes `k` empty fields, e.g. to skip optional leading parameters.
    pub fn skip_parameters(&mut self, k: usize) {
        for _ in 0..k {
            self.push_delimiter();
        }
    }

    /// Applies the TX intercept to the fully-assembled command and writes
    /// it, terminated with `\r`, to the port.
    pub async fn command_stop(&mut self, tx_intercept: &mut dyn TxIntercept) -> Result<(), Error> {
        let _ = self.guard.tx_buf.push(parser::DEFAULT_TERMINATOR);
        let out = tx_intercept.intercept_tx(&self.guard.tx_buf);
        let r = self.guard.port.write_all(out).await.map_err(|_| Error::Transport);
        if r.is_err() {
            self.result = Err(Error::Transport);
        }
        r
    }

    /// Blocks for a single byte equal to `ch`, used for the `>` upload
    /// prompt before a binary payload write.
    pub async fn wait_character(&mut self, ch: u8) -> Result<(), Error> {
        let deadline = Instant::now() + self.effective_timeout();
        loop {
            if let Some(b) = self.client.rx.peek_byte(0) {
                self.client.rx.consume(1);
                if b == ch {
                    return Ok(());
                }
                continue;
            }
            if let Either::Second(()) = select(self.client.data_ready.wait(), Timer::at(deadline)).await {
                self.result = Err(Error::Timeout);
                return Err(Error::Timeout);
            }
        }
    }

    // -- response parsing --------------------------------------------------

    /// Blocks until a response line is found, dispatching any intervening
    /// URC lines along the way. With `Some(prefix)`, stops at the first
    /// line matching it (or at a stop tag reached first). With `None`,
    /// stops at the first information line that is neither a stop tag nor
    /// URC-shaped -- an unprefixed reply such as AT+CGSN's bare IMEI line --
    /// leaving it positioned for [`Self::read_string`]/[`Self::read_int`].
    pub async fn response_start(&mut self, prefix: Option<&[u8]>) -> Result<(), Error> {
        let deadline = Instant::now() + self.effective_timeout();
        loop {
            let mut scan_from = parser::skip_leading_crlf(&self.client.rx, 0);
            loop {
                let Some(end) = parser::find_line_end(&self.client.rx, scan_from) else { break };
                let len = end - scan_from;

                if let Some(p) = prefix {
                    if len >= p.len() && Self::line_matches(&self.client.rx, scan_from, p) {
                        self.client.rx.consume(scan_from);
                        self.guard.cursor = p.len();
                        self.guard.line_end = len;
                        self.guard.stop_consumed = false;
                        self.result = Ok(());
                        return Ok(());
                    }
                }

                if let Some(tag) = parser::classify_stop_tag(&self.client.rx, scan_from, len) {
                    self.client.rx.consume(scan_from + len + 2);
                    self.guard.cursor = 0;
                    self.guard.line_end = 0;
                    self.guard.stop_consumed = true;
                    let r = Self::tag_result(tag);
                    self.result = r;
                    return r;
                }

                if parser::looks_like_urc(&self.client.rx, scan_from) {
                    self.dispatch_urc_if_matched(scan_from, len);
                } else if prefix.is_none() {
                    // No prefix was requested: the first non-stop-tag,
                    // non-URC line is the response body itself.
                    self.client.rx.consume(scan_from);
                    self.guard.cursor = 0;
                    self.guard.line_end = len;
                    self.guard.stop_consumed = false;
                    self.result = Ok(());
                    return Ok(());
                }

                scan_from = parser::skip_leading_crlf(&self.client.rx, end + 2);
            }

            if let Either::Second(()) = select(self.client.data_ready.wait(), Timer::at(deadline)).await {
                // Timeout: discard pending bytes up to the next line
                // terminator and reset the cursor to the buffer tail.
                if let Some(end) = parser::find_line_end(&self.client.rx, 0) {
                    self.client.rx.consume(end + 2);
                }
                self.guard.cursor = 0;
                self.guard.stop_consumed = true;
                self.result = Err(Error::Timeout);
                return Err(Error::Timeout);
            }
        }
    }

    fn line_matches(rb: &RingBuf<RX_N>, start: usize, prefix: &[u8]) -> bool {
        for (i, &b) in prefix.iter().enumerate() {
            if rb.peek_byte(start + i) != Some(b) {
                return false;
            }
        }
        true
    }

    fn tag_result(tag: StopTag) -> Result<(), Error> {
        match tag {
            StopTag::Ok => Ok(()),
            StopTag::Error => Err(Error::DeviceError(DeviceErrorState::None)),
            StopTag::Aborted => Err(Error::DeviceError(DeviceErrorState::Aborted)),
            StopTag::CmeError(code) | StopTag::CmsError(code) => {
                Err(Error::DeviceError(DeviceErrorState::Generic(code)))
            }
        }
    }

    fn dispatch_urc_if_matched(&mut self, line_start: usize, line_len: usize) {
        let rb = &self.client.rx;
        let matched = self
            .guard
            .urc_handlers
            .iter()
            .find(|e| line_len >= e.prefix.len() && Self::line_matches(rb, line_start, &e.prefix))
            .map(|e| (e.handler, e.ctx, e.prefix.len()));
        if let Some((handler, ctx, prefix_len)) = matched {
            let mut cursor = UrcCursor::new(rb, line_start + prefix_len, line_start + line_len);
            handler(&mut cursor, ctx);
        }
    }

    /// Reads the next argument as a signed integer, up to the current
    /// delimiter, stop tag, or line end. An empty token (e.g. a skipped
    /// optional field) yields `Ok(0)` rather than an error, matching
    /// numeric-read behavior elsewhere in the AT command set; the device
    /// error is still recorded and observable via [`Self::device_error`].
    pub fn read_int(&mut self) -> Result<i64, Error> {
        self.guard.cursor = parser::skip_spaces(&self.client.rx, self.guard.cursor);
        let end = self.next_token_end();
        let mut buf = [0u8; 24];
        let n = self.client.rx.peek_at(self.guard.cursor, &mut buf[..(end - self.guard.cursor).min(24)]);
        let v = parser::parse_i64(&buf[..n]);
        self.advance_cursor_past(end);
        match v {
            Ok(value) => Ok(value),
            Err(_) => {
                self.guard.device_error = DeviceErrorState::Generic(None);
                Ok(0)
            }
        }
    }

    /// Reads the next argument as a string into `dst`, stopping at the
    /// current delimiter, line end, or (unless `ignore_stop_tag`) the
    /// default stop tag. Strips one layer of surrounding quotes.
    pub fn read_string<'b>(&mut self, dst: &'b mut [u8], max: usize, ignore_stop_tag: bool) -> &'b [u8] {
        self.guard.cursor = parser::skip_spaces(&self.client.rx, self.guard.cursor);
        let limit = self.guard.line_end.min(self.guard.cursor + max + 2);
        let end = parser::find_token_end(
            &self.client.rx,
            self.guard.cursor,
            self.guard.delimiter,
            limit,
            !ignore_stop_tag,
        );
        let n = self
            .client
            .rx
            .peek_at(self.guard.cursor, &mut dst[..(end - self.guard.cursor).min(dst.len()).min(max)]);
        self.advance_cursor_past(end);
        parser::strip_quotes(&dst[..n])
    }

    /// Reads exactly `n` raw bytes. When `standalone` is set the bytes are
    /// not expected to be delimiter-terminated (used for binary payloads
    /// such as `+USORD` socket reads).
    pub fn read_bytes<'b>(&mut self, dst: &'b mut [u8], n: usize, standalone: bool) -> &'b [u8] {
        let copy_n = self.client.rx.peek_at(self.guard.cursor, &mut dst[..n.min(dst.len())]);
        let end = self.guard.cursor + copy_n;
        if standalone {
            self.guard.cursor = end;
        } else {
            self.advance_cursor_past(end);
        }
        &dst[..copy_n]
    }

    fn next_token_end(&self) -> usize {
        parser::find_token_end(&self.client.rx, self.guard.cursor, self.guard.delimiter, self.guard.line_end, true)
    }

    fn advance_cursor_past(&mut self, token_end: usize) {
        self.guard.cursor = if self.client.rx.peek_byte(token_end) == Some(self.guard.delimiter) {
            token_end + 1
        } else {
            token_end
        };
    }

    /// Consumes through the stop tag, which may already have been consumed
    /// by `response_start` if it returned the stop tag directly. Always a
    /// hard synchronization point: after this returns, the RX cursor sits
    /// at the start of whatever follows the stop tag.
    pub async fn response_stop(&mut self) -> Result<(), Error> {
        if self.guard.stop_consumed {
            // `response_start` matched the stop tag directly; the line and
            // its terminator are already consumed.
            return self.result;
        }
        // A prefix was matched by `response_start`: discard whatever of
        // that line is unread, then keep scanning for the real stop tag.
        self.client.rx.consume(self.guard.line_end + 2);
        self.response_start(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embedded_io_async::{ErrorType, Read, Write};

    struct FakePort {
        written: Vec<u8, 128>,
        in_event_callback: bool,
    }

    #[derive(Debug)]
    struct FakeIoError;
    impl embedded_io_async::Error for FakeIoError {
        fn kind(&self) -> embedded_io_async::ErrorKind {
            embedded_io_async::ErrorKind::Other
        }
    }

    impl ErrorType for FakePort {
        type Error = FakeIoError;
    }

    impl Read for FakePort {
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> {
            Ok(0)
        }
    }

    impl Write for FakePort {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            let _ = self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    impl UartPort for FakePort {
        fn size_pending(&self) -> usize {
            0
        }
        fn suspend_cts(&mut self) {}
        fn resume_cts(&mut self) {}
        fn is_in_event_callback(&self) -> bool {
            self.in_event_callback
        }
    }

    fn client() -> AtClient<FakePort, NoopRawMutex, NoWake, 256, 64, 4, 2> {
        AtClient::new(
            FakePort { written: Vec::new(), in_event_callback: false },
            NoWake,
            Duration::from_millis(200),
        )
    }

    #[test]
    fn command_assembly_joins_arguments_with_delimiter() {
        embassy_futures::block_on(async {
            let c = client();
            let mut txn = c.lock().await.unwrap();
            txn.command_start(b"AT+COPS");
            txn.write_int(3);
            txn.write_string(b"T-Mobile", true);
            txn.command_stop(&mut crate::intercept::Identity).await.unwrap();
            assert_eq!(txn.guard.tx_buf.as_slice(), b"AT+COPS=3,\"T-Mobile\"\r");
        });
    }

    #[test]
    fn response_start_matches_prefix_line_and_positions_cursor() {
        embassy_futures::block_on(async {
            let c = client();
            c.feed_rx(b"+CSQ: 15,99\r\nOK\r\n", &mut crate::intercept::Identity);
            let mut txn = c.lock().await.unwrap();
            txn.response_start(Some(b"+CSQ:")).await.unwrap();
            let rssi = txn.read_int().unwrap();
            let ber = txn.read_int().unwrap();
            assert_eq!((rssi, ber), (15, 99));
            txn.response_stop().await.unwrap();
        });
    }

    #[test]
    fn device_error_sets_cme_subcode() {
        embassy_futures::block_on(async {
            let c = client();
            c.feed_rx(b"+CME ERROR: 4\r\n", &mut crate::intercept::Identity);
            let mut txn = c.lock().await.unwrap();
            let err = txn.response_start(None).await.unwrap_err();
            assert_eq!(err, Error::DeviceError(DeviceErrorState::Generic(Some(4))));
        });
    }

    #[test]
    fn urc_is_dispatched_and_not_returned_as_the_prefix_match() {
        embassy_futures::block_on(async {
            static mut SEEN: i64 = 0;
            fn on_creg(cursor: &mut UrcCursor<'_, 256>, _ctx: *mut ()) {
                let stat = cursor.read_int().unwrap();
                unsafe { SEEN = stat };
            }

            let c = client();
            c.feed_rx(b"+CREG: 1\r\n+CSQ: 20,99\r\nOK\r\n", &mut crate::intercept::Identity);
            let mut txn = c.lock().await.unwrap();
            txn.url_handler_set(b"+CREG:", on_creg, core::ptr::null_mut()).unwrap();
            txn.response_start(Some(b"+CSQ:")).await.unwrap();
            let rssi = txn.read_int().unwrap();
            assert_eq!(rssi, 20);
            assert_eq!(unsafe { SEEN }, 1);
        });
    }

    #[test]
    fn read_int_on_empty_token_yields_zero_and_records_device_error() {
        embassy_futures::block_on(async {
            let c = client();
            c.feed_rx(b"+CSQ: ,99\r\nOK\r\n", &mut crate::intercept::Identity);
            let mut txn = c.lock().await.unwrap();
            txn.response_start(Some(b"+CSQ:")).await.unwrap();
            let rssi = txn.read_int().unwrap();
            assert_eq!(rssi, 0);
            assert_eq!(txn.device_error(), DeviceErrorState::Generic(None));
            let ber = txn.read_int().unwrap();
            assert_eq!(ber, 99);
        });
    }

    #[test]
    fn response_start_with_no_prefix_exposes_bare_info_line_past_a_urc() {
        embassy_futures::block_on(async {
            let c = client();
            c.feed_rx(
                b"+UUSOCL: 1\r\n869999000000000\r\nOK\r\n",
                &mut crate::intercept::Identity,
            );
            let mut txn = c.lock().await.unwrap();
            txn.response_start(None).await.unwrap();
            let mut buf = [0u8; 32];
            let imei = txn.read_string(&mut buf, 32, false);
            assert_eq!(imei, b"869999000000000");
            txn.response_stop().await.unwrap();
        });
    }

    #[test]
    fn lock_refuses_reentrant_call_from_event_callback() {
        embassy_futures::block_on(async {
            let c = AtClient::<_, NoopRawMutex, NoWake, 256, 64, 4, 2>::new(
                FakePort { written: Vec::new(), in_event_callback: true },
                NoWake,
                Duration::from_millis(200),
            );
            let err = c.lock().await.unwrap_err();
            assert_eq!(err, Error::Reentrant);
        });
    }
}
