//! 3GPP TS 27.010 basic-mode multiplexer.
//!
//! Takes over a [`UartPort`] entirely once enabled: channel 0 carries
//! control frames (SABM/UA/DISC/MSC), channels 1..N carry UIH data frames,
//! each landing in its own [`RingBuf`] demultiplexed the same way a single
//! interrupt-status register gets fanned out into per-feature bits.

pub mod frame;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use embedded_io_async::{Read, Write as _};
use heapless::Vec;

use crate::error::Error;
use crate::port::UartPort;
use crate::ringbuf::RingBuf;

use frame::{decode, encode, FrameType};

/// Default control-frame response timeout: frame wait in CMUX channel
/// open/close, bounded by the CMUX response timeout, ~5 s.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// AT runs on channel 1, PPP on channel 2 by default; the PPP id is
/// actually capability-table-configurable, kept here only as the
/// conventional default.
pub const AT_CHANNEL: u8 = 1;
pub const PPP_CHANNEL_DEFAULT: u8 = 2;

/// Per-channel RX buffer and flow-control state.
pub struct CmuxChannel<const N: usize> {
    rx: RingBuf<N>,
    open: core::sync::atomic::AtomicBool,
    remote_busy: core::sync::atomic::AtomicBool,
    local_busy: core::sync::atomic::AtomicBool,
}

impl<const N: usize> Default for CmuxChannel<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> CmuxChannel<N> {
    pub const fn new() -> Self {
        Self {
            rx: RingBuf::new(),
            open: core::sync::atomic::AtomicBool::new(false),
            remote_busy: core::sync::atomic::AtomicBool::new(false),
            local_busy: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn rx(&self) -> &RingBuf<N> {
        &self.rx
    }

    pub fn remote_busy(&self) -> bool {
        self.remote_busy.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn local_busy(&self) -> bool {
        self.local_busy.load(core::sync::atomic::Ordering::Acquire)
    }

    /// High-water mark above which local-busy is asserted to the remote:
    /// 3/4 full.
    fn crossed_high_water(&self) -> bool {
        self.rx.available() * 4 >= self.rx.capacity() * 3
    }

    /// Low-water mark below which local-busy is cleared: 1/4 full.
    fn crossed_low_water(&self) -> bool {
        self.rx.available() * 4 <= self.rx.capacity()
    }
}

/// Multiplexer state: channel lifecycle from disabled to enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmuxState {
    Disabled,
    Enabled,
}

const MAX_FRAME_SCRATCH: usize = 1600;

/// The multiplexer itself. Generic over the physical port, the mutex
/// flavor used for the control-ack signal, the number of channels (the
/// table always includes channel 0), and the per-channel RX ring size.
pub struct Cmux<P, M, const CH: usize, const RX_N: usize>
where
    M: RawMutex,
{
    port: P,
    channels: [CmuxChannel<RX_N>; CH],
    state: CmuxState,
    control_ack: Signal<M, u8>,
    scratch: Vec<u8, MAX_FRAME_SCRATCH>,
    dropped_frames: u32,
}

impl<P, M, const CH: usize, const RX_N: usize> Cmux<P, M, CH, RX_N>
where
    P: UartPort,
    M: RawMutex,
{
    pub fn new(port: P) -> Self {
        Self {
            port,
            channels: core::array::from_fn(|_| CmuxChannel::new()),
            state: CmuxState::Disabled,
            control_ack: Signal::new(),
            scratch: Vec::new(),
            dropped_frames: 0,
        }
    }

    pub fn state(&self) -> CmuxState {
        self.state
    }

    pub fn dropped_frames(&self) -> u32 {
        self.dropped_frames
    }

    pub fn channel(&self, id: u8) -> Option<&CmuxChannel<RX_N>> {
        self.channels.get(id as usize)
    }

    /// Brings up the control channel with SABM/UA. The
    /// caller is responsible for having already sent `AT+CMUX=0` through
    /// the AT client before calling this -- from here on the port is
    /// framed, and no longer safe to share with the AT client directly.
    pub async fn enable(&mut self) -> Result<(), Error> {
        self.open_control(0).await?;
        self.channels[0].open.store(true, core::sync::atomic::Ordering::Release);
        self.state = CmuxState::Enabled;
        Ok(())
    }

    /// Opens data channel `id`.
    pub async fn open_channel(&mut self, id: u8) -> Result<(), Error> {
        self.open_control(id).await?;
        self.channels
            .get(id as usize)
            .ok_or(Error::InvalidParameter)?
            .open
            .store(true, core::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn open_control(&mut self, id: u8) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        let n = encode(&mut buf, id, FrameType::Sabm, true, &[]).ok_or(Error::NoMemory)?;
        self.port.write_all(&buf[..n]).await.map_err(|_| Error::Transport)?;
        self.wait_ua(id).await
    }

    /// Closes data channel `id`. The channel's RX
    /// buffer is retained; only the open flag is cleared, so a reader that
    /// raced the close still drains whatever arrived before it.
    pub async fn close_channel(&mut self, id: u8) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        let n = encode(&mut buf, id, FrameType::Disc, true, &[]).ok_or(Error::NoMemory)?;
        self.port.write_all(&buf[..n]).await.map_err(|_| Error::Transport)?;
        self.wait_ua(id).await?;
        if let Some(ch) = self.channels.get(id as usize) {
            ch.open.store(false, core::sync::atomic::Ordering::Release);
        }
        Ok(())
    }

    /// Closes every open channel, tears down the control channel, and
    /// reverts to `Disabled`. Returns the port so the
    /// caller can hand it back to direct (non-CMUX) use.
    pub async fn disable(mut self) -> Result<P, Error> {
        for id in 1..CH as u8 {
            if self.channels[id as usize].is_open() {
                self.close_channel(id).await?;
            }
        }
        let mut buf = [0u8; 8];
        let n = encode(&mut buf, 0, FrameType::Disc, true, &[]).ok_or(Error::NoMemory)?;
        self.port.write_all(&buf[..n]).await.map_err(|_| Error::Transport)?;
        self.wait_ua(0).await?;
        self.state = CmuxState::Disabled;
        Ok(self.port)
    }

    async fn wait_ua(&mut self, id: u8) -> Result<(), Error> {
        let deadline = Instant::now() + CONTROL_TIMEOUT;
        loop {
            match select(self.control_ack.wait(), Timer::at(deadline)).await {
                Either::First(acked) if acked == id => return Ok(()),
                Either::First(_) => continue,
                Either::Second(()) => return Err(Error::Timeout),
            }
        }
    }

    /// Writes `data` as a UIH frame to channel `id`. Refuses if the remote
    /// has signaled busy on this channel.
    pub async fn write_channel(&mut self, id: u8, data: &[u8]) -> Result<(), Error> {
        let busy = self.channels.get(id as usize).ok_or(Error::InvalidParameter)?.remote_busy();
        if busy {
            return Err(Error::TemporaryFailure);
        }
        let mut buf = [0u8; MAX_FRAME_SCRATCH];
        let n = encode(&mut buf, id, FrameType::Uih, true, data).ok_or(Error::NoMemory)?;
        self.port.write_all(&buf[..n]).await.map_err(|_| Error::Transport)
    }

    /// Sends an MSC frame on channel 0 updating the remote's view of our
    /// local-busy bit for channel `id`; sent when a channel's RX ring
    /// crosses the high/low water thresholds.
    ///
    /// The two-octet MSC payload is `[DLCI address byte, signals byte]`;
    /// bit 1 of the signals byte is used here as the local-busy (FC) flag.
    /// Channel 0 is never flow-controlled.
    async fn send_msc(&mut self, id: u8, busy: bool) -> Result<(), Error> {
        let info = [frame::addr_byte(id, true), if busy { 0x03 } else { 0x01 }];
        let mut buf = [0u8; 16];
        let n = encode(&mut buf, 0, FrameType::Msc, true, &info).ok_or(Error::NoMemory)?;
        self.port.write_all(&buf[..n]).await.map_err(|_| Error::Transport)
    }

    /// The CMUX RX task body: reads bytes from
    /// the port, decodes frames, and demultiplexes them into per-channel
    /// buffers. Runs forever; call it from a spawned task once `enable()`
    /// has completed.
    pub async fn run_demux(&mut self) -> ! {
        let mut read_buf = [0u8; 256];
        loop {
            let n = match self.port.read(&mut read_buf).await {
                Ok(n) if n > 0 => n,
                _ => continue,
            };
            if self.scratch.extend_from_slice(&read_buf[..n]).is_err() {
                // Scratch overflowed without a complete frame; drop it and
                // resynchronize on the next flag byte.
                self.scratch.clear();
                self.dropped_frames += 1;
                continue;
            }
            while let Some((consumed, pending_msc)) = self.decode_one_frame() {
                self.shift_scratch(consumed);
                if let Some((id, busy)) = pending_msc {
                    // Best-effort: a dropped MSC is corrected on the next
                    // threshold crossing, not retried here.
                    let _ = self.send_msc(id, busy).await;
                }
            }
        }
    }

    /// Decodes and dispatches (at most) one frame from the front of
    /// `scratch`. Returns the number of bytes to drop from the front plus
    /// any MSC the caller should now send, or `None` if there's no
    /// complete frame to act on yet.
    fn decode_one_frame(&mut self) -> Option<(usize, Option<(u8, bool)>)> {
        let mut pending_msc: Option<(u8, bool)> = None;
        let consumed = match decode(&self.scratch) {
            Ok(None) => return None,
            Err(skip) => {
                self.dropped_frames += 1;
                skip
            }
            Ok(Some((f, consumed))) => {
                match f.kind {
                    FrameType::Ua => {
                        self.control_ack.signal(f.channel);
                    }
                    // Channel 0's ctrl byte is indistinguishable from a data
                    // channel's UIH: MSC is carried as a UIH frame on the
                    // control channel, so it's classified by channel number
                    // rather than by `FrameType::Msc`, which `decode` never
                    // produces on its own.
                    FrameType::Uih if f.channel == 0 => {
                        if let Some(&signals) = f.payload.get(1) {
                            let dlci = f.payload.first().map(|b| b >> 2).unwrap_or(0);
                            if let Some(ch) = self.channels.get(dlci as usize) {
                                ch.remote_busy.store(signals & 0x02 != 0, core::sync::atomic::Ordering::Release);
                            }
                        }
                    }
                    FrameType::Uih => {
                        if let Some(ch) = self.channels.get(f.channel as usize) {
                            ch.rx.write(f.payload);
                            let was_busy = ch.local_busy();
                            if !was_busy && ch.crossed_high_water() {
                                ch.local_busy.store(true, core::sync::atomic::Ordering::Release);
                                pending_msc = Some((f.channel, true));
                            } else if was_busy && ch.crossed_low_water() {
                                ch.local_busy.store(false, core::sync::atomic::Ordering::Release);
                                pending_msc = Some((f.channel, false));
                            }
                        }
                    }
                    FrameType::Msc | FrameType::Sabm | FrameType::Disc | FrameType::Unknown(_) => {}
                }
                consumed
            }
        };
        Some((consumed, pending_msc))
    }

    fn shift_scratch(&mut self, consumed: usize) {
        let remaining = self.scratch.len() - consumed;
        self.scratch.copy_within(consumed.., 0);
        self.scratch.truncate(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn cmux() -> Cmux<FakePort, NoopRawMutex, 3, 64> {
        Cmux::new(FakePort)
    }

    /// Appends the encoding of one frame straight into `c.scratch`, bypassing
    /// `run_demux`'s port read.
    fn push_frame(c: &mut Cmux<FakePort, NoopRawMutex, 3, 64>, channel: u8, kind: FrameType, payload: &[u8]) {
        let mut buf = [0u8; 128];
        let n = encode(&mut buf, channel, kind, true, payload).unwrap();
        c.scratch.extend_from_slice(&buf[..n]).unwrap();
    }

    #[test]
    fn uih_frame_fills_the_target_channels_ring_buffer() {
        let mut c = cmux();
        push_frame(&mut c, 1, FrameType::Uih, b"hello");
        let (consumed, pending) = c.decode_one_frame().unwrap();
        assert_eq!(consumed, c.scratch.len());
        assert!(pending.is_none());
        let mut out = [0u8; 5];
        c.channel(1).unwrap().rx().peek(&mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn msc_on_channel_zero_sets_remote_busy_on_the_named_dlci() {
        let mut c = cmux();
        push_frame(&mut c, 0, FrameType::Msc, &[frame::addr_byte(1, true), 0x03]);
        c.decode_one_frame().unwrap();
        assert!(c.channel(1).unwrap().remote_busy());
    }

    #[test]
    fn high_water_crossing_requests_one_msc_and_not_again_until_low_water() {
        let mut c = cmux();
        // Channel RX ring is 64 bytes; 50 bytes crosses the 3/4 high-water
        // mark (48) but the very next frame shouldn't re-request MSC.
        push_frame(&mut c, 1, FrameType::Uih, &[0u8; 50]);
        let (consumed, pending) = c.decode_one_frame().unwrap();
        assert_eq!(pending, Some((1, true)));
        c.shift_scratch(consumed);

        push_frame(&mut c, 1, FrameType::Uih, &[0u8; 1]);
        let (_, pending) = c.decode_one_frame().unwrap();
        assert!(pending.is_none());
    }

    #[test]
    fn wait_ua_resolves_immediately_for_an_already_signaled_matching_channel() {
        let mut c = cmux();
        c.control_ack.signal(2);
        embassy_futures::block_on(c.wait_ua(2)).unwrap();
    }
}
