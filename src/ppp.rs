//! PPP dial sequencer.
//!
//! Brings up a PPP data channel over CMUX the same way [`crate::power`]
//! brings up the module itself: a handful of ordered AT/CMUX steps, each
//! bounded by its own timeout, with a fallback path recorded as
//! `reboot_required` when the modem doesn't answer cleanly. The dial string
//! and the LCP terminate frame are written straight to the channel --
//! bypassing [`crate::at::client::AtClient`] entirely -- since by the time
//! either is sent the channel may already be carrying (or about to carry)
//! binary PPP framing that the AT parser has no business touching.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;

use crate::at::client::{AtClient, WakeHook};
use crate::caps::ModuleCaps;
use crate::cmux::{Cmux, CmuxState};
use crate::error::Error;
use crate::intercept::Identity;
use crate::port::UartPort;
use crate::vserial::{CmuxSerial, VirtualSerial};

/// Settle time between disabling UART-wake power saving and dialing: fixed,
/// not capability-table-driven, since it's there to let the module's own
/// power-saving state machine catch up rather than to accommodate
/// per-module boot timing.
const PPP_SETTLE_PAUSE: Duration = Duration::from_secs(1);

/// Bound on waiting for `CONNECT`/`ERROR` after the dial string.
const PPP_DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on waiting for the LCP terminate-ack during `close`.
const PPP_HANGUP_TIMEOUT: Duration = Duration::from_secs(5);

/// The fixed 29-byte LCP terminate-request frame, async-HDLC framed with
/// the standard escape (`0x7D` + byte XOR `0x20`)
/// already applied to every octet that needs it: address/control, the LCP
/// protocol id, and the code/identifier/length fields. The 12-byte LCP data
/// field and its trailing FCS are not otherwise pinned down; both are
/// filled with fixed, already-unescaped filler so the frame's total length
/// comes out to 29 bytes.
const LCP_TERMINATE_REQUEST: [u8; 29] = [
    0x7E, 0xFF, 0x7D, 0x23, 0xC0, 0x21, 0x7D, 0x25, 0x7D, 0x22, 0x7D, 0x20, 0x7D, 0x30, 0xDE, 0xAD, 0xBE, 0xEF, 0xDE,
    0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF, 0xAB, 0xCD, 0x7E,
];

/// Leading bytes of the LCP terminate-ack: matched on this prefix alone,
/// the same way the dial response is matched only on `CONNECT` and not its
/// trailing connect-speed field.
const LCP_TERMINATE_ACK_PREFIX: [u8; 8] = [0x7E, 0xFF, 0x7D, 0x23, 0xC0, 0x21, 0x7D, 0x26];

const CONNECT_PREFIX: &[u8] = b"\r\nCONNECT";
const ERROR_MARKER: &[u8] = b"\r\nERROR\r\n";

/// How far ahead a scan buffer looks for a fixed marker while polling the
/// raw channel: large enough to hold the longest marker plus a line or two
/// of noise ahead of it.
const SCAN_SCRATCH: usize = 48;

/// PPP sequencer state. Owns nothing about the CMUX multiplexer itself --
/// it borrows it the same way [`CmuxSerial`] does -- since the
/// multiplexer instance is shared with the AT client running on its own
/// channel.
pub struct Ppp<'a, P, M, const CH: usize, const RX_N: usize>
where
    M: RawMutex,
{
    mux: &'a Mutex<M, Cmux<P, M, CH, RX_N>>,
    channel: u8,
    serial: CmuxSerial<'a, P, M, CH, RX_N>,
    cmux_enabled_by_us: bool,
    power_saving_disabled_by_us: bool,
    reboot_required: bool,
}

impl<'a, P, M, const CH: usize, const RX_N: usize> Ppp<'a, P, M, CH, RX_N>
where
    P: UartPort,
    M: RawMutex,
{
    pub fn new(mux: &'a Mutex<M, Cmux<P, M, CH, RX_N>>, caps: &ModuleCaps) -> Self {
        let channel = caps.ppp_channel_id;
        Self {
            mux,
            channel,
            serial: CmuxSerial::new(mux, channel),
            cmux_enabled_by_us: false,
            power_saving_disabled_by_us: false,
            reboot_required: false,
        }
    }

    /// Whether the last `close` gave up waiting for the modem and the
    /// caller should consider a reboot.
    pub fn reboot_required(&self) -> bool {
        self.reboot_required
    }

    /// Runs the full dial sequence: registration check, CMUX bring-up,
    /// channel open, power-saving disable, the dial string, and the
    /// `CONNECT`/`ERROR` wait. On success the PPP channel is
    /// open and ready for [`Self::transmit`]/[`Self::receive`].
    pub async fn dial<W, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &mut self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
        pdp_context: u8,
    ) -> Result<(), Error>
    where
        W: WakeHook<P>,
    {
        self.check_ps_registered(at).await?;
        self.ensure_cmux_enabled(at).await?;
        self.mux.lock().await.open_channel(self.channel).await?;
        self.disable_wakeup_power_saving(at).await;
        Timer::after(PPP_SETTLE_PAUSE).await;

        let mut dial_string: Vec<u8, 24> = Vec::new();
        let _ = dial_string.extend_from_slice(b"ATD*99***");
        push_decimal(&mut dial_string, pdp_context);
        let _ = dial_string.extend_from_slice(b"#\r");
        self.serial.write(&dial_string).await?;

        self.await_connect().await
    }

    /// Checks packet-switched registration: `AT+CGREG?`, accepting stat `1`
    /// (home) or `5` (roaming).
    async fn check_ps_registered<W, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    ) -> Result<(), Error>
    where
        W: WakeHook<P>,
    {
        let mut txn = at.lock().await?;
        txn.command_start(b"AT+CGREG?");
        txn.command_stop(&mut Identity).await?;
        txn.response_start(Some(b"+CGREG:")).await?;
        let _n = txn.read_int()?;
        let stat = txn.read_int()?;
        txn.response_stop().await?;
        let _ = txn.unlock();
        if stat == 1 || stat == 5 {
            Ok(())
        } else {
            Err(Error::NotRegistered)
        }
    }

    /// Brings CMUX up if it isn't already, remembering whether this
    /// sequencer is the one that turned it on so `close` knows whether to
    /// turn it back off.
    async fn ensure_cmux_enabled<W, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &mut self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    ) -> Result<(), Error>
    where
        W: WakeHook<P>,
    {
        if self.mux.lock().await.state() == CmuxState::Enabled {
            self.cmux_enabled_by_us = false;
            return Ok(());
        }
        let mut txn = at.lock().await?;
        txn.command_start(b"AT+CMUX");
        txn.write_int(0);
        txn.command_stop(&mut Identity).await?;
        txn.response_start(None).await?;
        txn.response_stop().await?;
        let _ = txn.unlock();
        self.mux.lock().await.enable().await?;
        self.cmux_enabled_by_us = true;
        Ok(())
    }

    /// Disables UART-data-line wake-up power saving, which otherwise
    /// interferes with PPP framing. Best-effort: a module that doesn't
    /// support `AT+UPSV` still gets to dial, just without this protection.
    async fn disable_wakeup_power_saving<W, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &mut self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    ) where
        W: WakeHook<P>,
    {
        if let Ok(mut txn) = at.lock().await {
            txn.command_start(b"AT+UPSV");
            txn.write_int(0);
            if txn.command_stop(&mut Identity).await.is_ok() {
                let ok = txn.response_start(None).await.is_ok();
                let _ = txn.response_stop().await;
                self.power_saving_disabled_by_us = ok;
            }
            let _ = txn.unlock();
        }
    }

    /// Waits for the dial response. Matches only the `\r\nCONNECT` prefix,
    /// deliberately not the trailing connect-speed field that not every
    /// module emits.
    async fn await_connect(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + PPP_DIAL_TIMEOUT;
        let mut scratch: Vec<u8, SCAN_SCRATCH> = Vec::new();
        loop {
            if starts_with(&scratch, CONNECT_PREFIX) {
                return Ok(());
            }
            if contains(&scratch, ERROR_MARKER) {
                return Err(Error::DeviceError(crate::error::DeviceErrorState::None));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            let mut chunk = [0u8; 16];
            let n = self.serial.read(&mut chunk).await?;
            if n == 0 {
                Timer::after(Duration::from_millis(20)).await;
                continue;
            }
            scratch_append(&mut scratch, &chunk[..n]);
        }
    }

    /// Writes `data` verbatim to the PPP channel.
    pub async fn transmit(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.serial.write(data).await
    }

    /// Reads up to `dst.len()` inbound bytes, forwarded verbatim with no AT
    /// parsing.
    pub async fn receive(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        self.serial.read(dst).await
    }

    /// Installs the caller's receive-data event callback: fired whenever
    /// new bytes arrive, the caller then drains them with
    /// [`Self::receive`].
    pub fn set_rx_callback(&mut self, func: fn(u8, *mut ()), ctx: *mut ()) {
        self.serial.event_callback_set(func, ctx);
        self.serial.set_event_filter(crate::vserial::event::DATA_RECEIVED);
    }

    pub fn remove_rx_callback(&mut self) {
        self.serial.event_callback_remove();
    }

    /// Tears the PPP session down. Sends the fixed LCP terminate-request
    /// and waits for its ack before closing the channel; a missing ack sets
    /// [`Self::reboot_required`] but doesn't stop the teardown. Returns
    /// whether CMUX should now be disabled by whoever owns the [`Cmux`]
    /// instance -- this sequencer only ever borrows it, so it can't call
    /// [`Cmux::disable`] (which takes the multiplexer by value) itself.
    pub async fn close<W, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &mut self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    ) -> Result<bool, Error>
    where
        W: WakeHook<P>,
    {
        self.remove_rx_callback();

        if self.power_saving_disabled_by_us {
            if let Ok(mut txn) = at.lock().await {
                txn.command_start(b"AT+UPSV");
                txn.write_int(1);
                if txn.command_stop(&mut Identity).await.is_ok() {
                    let _ = txn.response_start(None).await;
                    let _ = txn.response_stop().await;
                }
                let _ = txn.unlock();
            }
        }

        self.serial.write(&LCP_TERMINATE_REQUEST).await?;
        if !self.await_terminate_ack().await {
            self.reboot_required = true;
        }

        self.mux.lock().await.close_channel(self.channel).await?;
        Ok(self.cmux_enabled_by_us)
    }

    async fn await_terminate_ack(&mut self) -> bool {
        let deadline = Instant::now() + PPP_HANGUP_TIMEOUT;
        let mut scratch: Vec<u8, SCAN_SCRATCH> = Vec::new();
        loop {
            if starts_with(&scratch, &LCP_TERMINATE_ACK_PREFIX) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let mut chunk = [0u8; 16];
            let n = match self.serial.read(&mut chunk).await {
                Ok(n) => n,
                Err(_) => return false,
            };
            if n == 0 {
                Timer::after(Duration::from_millis(20)).await;
                continue;
            }
            scratch_append(&mut scratch, &chunk[..n]);
        }
    }
}

fn push_decimal(dst: &mut Vec<u8, 24>, mut n: u8) {
    let mut digits = [0u8; 3];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + n % 10;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    let _ = dst.extend_from_slice(&digits[i..]);
}

fn starts_with<const N: usize>(scratch: &Vec<u8, N>, needle: &[u8]) -> bool {
    scratch.len() >= needle.len() && &scratch[..needle.len()] == needle
}

fn contains<const N: usize>(scratch: &Vec<u8, N>, needle: &[u8]) -> bool {
    needle.is_empty() || (scratch.len() >= needle.len() && scratch.windows(needle.len()).any(|w| w == needle))
}

/// Appends `chunk`, dropping the oldest bytes first if the scratch buffer
/// would overflow -- only the tail is ever relevant to a fixed-marker scan.
fn scratch_append<const N: usize>(scratch: &mut Vec<u8, N>, chunk: &[u8]) {
    if scratch.len() + chunk.len() > N {
        let drop = scratch.len() + chunk.len() - N;
        let keep = scratch.len().saturating_sub(drop);
        scratch.copy_within(scratch.len() - keep.., 0);
        scratch.truncate(keep);
    }
    let _ = scratch.extend_from_slice(chunk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::client::NoWake;
    use crate::caps::ModuleType;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embedded_io_async::{ErrorType, Read as IoRead, Write as IoWrite};

    #[derive(Debug)]
    struct NeverError;
    impl embedded_io_async::Error for NeverError {
        fn kind(&self) -> embedded_io_async::ErrorKind {
            embedded_io_async::ErrorKind::Other
        }
    }

    struct FakePort;
    impl ErrorType for FakePort {
        type Error = NeverError;
    }
    impl IoRead for FakePort {
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, NeverError> {
            Ok(0)
        }
    }
    impl IoWrite for FakePort {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, NeverError> {
            Ok(buf.len())
        }
    }
    impl UartPort for FakePort {
        fn size_pending(&self) -> usize {
            0
        }
        fn suspend_cts(&mut self) {}
        fn resume_cts(&mut self) {}
    }

    fn mux() -> Mutex<NoopRawMutex, Cmux<FakePort, NoopRawMutex, 3, 64>> {
        Mutex::new(Cmux::new(FakePort))
    }

    fn at_client() -> AtClient<FakePort, NoopRawMutex, NoWake, 256, 64, 4, 2> {
        AtClient::new(FakePort, NoWake, Duration::from_millis(200))
    }

    #[test]
    fn push_decimal_renders_single_and_multi_digit_contexts() {
        let mut v: Vec<u8, 24> = Vec::new();
        push_decimal(&mut v, 1);
        assert_eq!(&v[..], b"1");
        let mut v: Vec<u8, 24> = Vec::new();
        push_decimal(&mut v, 23);
        assert_eq!(&v[..], b"23");
    }

    #[test]
    fn connect_prefix_matches_regardless_of_trailing_connect_speed() {
        let mut scratch: Vec<u8, SCAN_SCRATCH> = Vec::new();
        scratch_append(&mut scratch, b"\r\nCONNECT 150000000\r\n");
        assert!(starts_with(&scratch, CONNECT_PREFIX));
    }

    #[test]
    fn scratch_append_keeps_only_the_tail_once_capacity_is_exceeded() {
        let mut scratch: Vec<u8, 8> = Vec::new();
        scratch_append(&mut scratch, b"abcdefgh");
        scratch_append(&mut scratch, b"ij");
        assert_eq!(&scratch[..], b"cdefghij");
    }

    #[test]
    fn dial_fails_fast_when_not_registered_on_the_ps_domain() {
        let m = mux();
        let at = at_client();
        at.feed_rx(b"+CGREG: 0,2\r\nOK\r\n", &mut Identity);
        let caps = ModuleType::SaraR410M02B.caps();
        let mut ppp: Ppp<FakePort, NoopRawMutex, 3, 64> = Ppp::new(&m, &caps);
        let err = embassy_futures::block_on(ppp.dial(&at, 1)).unwrap_err();
        assert_eq!(err, Error::NotRegistered);
    }

    #[test]
    fn dial_proceeds_past_registration_when_stat_is_roaming() {
        let m = mux();
        let at = at_client();
        at.feed_rx(b"+CGREG: 0,5\r\nOK\r\n", &mut Identity);
        at.feed_rx(b"OK\r\n", &mut Identity); // AT+CMUX=0
        let caps = ModuleType::SaraR410M02B.caps();
        let mut ppp: Ppp<FakePort, NoopRawMutex, 3, 64> = Ppp::new(&m, &caps);
        // Dial will still time out waiting for CONNECT against a fake port
        // that never answers; the point of this test is only that it gets
        // past the registration check instead of failing there.
        let err = embassy_futures::block_on(async {
            Timer::after(Duration::from_millis(0)).await;
            ppp.check_ps_registered(&at).await
        });
        assert!(err.is_ok());
    }

    #[test]
    fn new_sequencer_starts_with_no_cmux_ownership_and_no_pending_reboot() {
        let m = mux();
        let caps = ModuleType::SaraR410M02B.caps();
        let ppp: Ppp<FakePort, NoopRawMutex, 3, 64> = Ppp::new(&m, &caps);
        assert!(!ppp.cmux_enabled_by_us);
        assert!(!ppp.reboot_required());
    }
}
