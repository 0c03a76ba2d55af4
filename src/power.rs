//! Power/sleep controller.
//!
//! Generic over the three optional GPIO pins, each `Option<P>` so "no pin"
//! is just `None`, not a sentinel value threaded through every call site.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::{InputPin, OutputPin};

use crate::at::client::{AtClient, WakeHook};
use crate::caps::ModuleCaps;
use crate::error::Error;
use crate::intercept::Identity;
use crate::port::UartPort;

/// How long a pin is held/observed when there's no capability-table value
/// to use instead -- fixed windows rather than per-module figures.
const VINT_TRANSITION_WINDOW: Duration = Duration::from_secs(5);
const VINT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const AT_POLL_RETRIES: u32 = 10;
const AT_POLL_TIMEOUT: Duration = Duration::from_millis(300);
const WAKE_POLL_RETRIES: u32 = 5;

/// Electrical sense of a GPIO line: which logic level means "asserted".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    fn level_for(self, asserted: bool) -> bool {
        match self {
            Polarity::ActiveHigh => asserted,
            Polarity::ActiveLow => !asserted,
        }
    }
}

/// An optional output pin plus the polarity that means "on": enable-power
/// is active-high by default (overridable), the power-on pulse pulls low
/// to trigger.
struct DrivePin<P> {
    pin: Option<P>,
    polarity: Polarity,
}

impl<P: OutputPin> DrivePin<P> {
    fn new(pin: Option<P>, polarity: Polarity) -> Self {
        Self { pin, polarity }
    }

    fn drive(&mut self, asserted: bool) -> Result<(), Error> {
        let Some(pin) = &mut self.pin else { return Ok(()) };
        let r = if self.polarity.level_for(asserted) { pin.set_high() } else { pin.set_low() };
        r.map_err(|_| Error::Transport)
    }
}

/// The vint input pin: high means the module is live by default -- the
/// authoritative indicator of module power state when present, `None`
/// when absent.
struct SensePin<P> {
    pin: Option<P>,
    polarity: Polarity,
}

impl<P: InputPin> SensePin<P> {
    fn new(pin: Option<P>, polarity: Polarity) -> Self {
        Self { pin, polarity }
    }

    /// `None` when there is no vint pin at all -- the caller can't know
    /// power state authoritatively and must fall back to timed waits
    /// plus AT polling.
    fn is_live(&mut self) -> Result<Option<bool>, Error> {
        let Some(pin) = &mut self.pin else { return Ok(None) };
        let high = pin.is_high().map_err(|_| Error::Transport)?;
        Ok(Some(match self.polarity {
            Polarity::ActiveHigh => high,
            Polarity::ActiveLow => !high,
        }))
    }
}

/// Deep-sleep states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeepSleepState {
    Unavailable,
    Available,
    /// Entered on a `+UUPSMR` URC.
    ProtocolStackAsleep,
    /// Entered when vint goes off while 3GPP power saving is agreed.
    Asleep,
}

/// Owns the three power-control pins and the module's deep-sleep/CFUN
/// bookkeeping for one device instance: the last-CFUN-flip timestamp,
/// deep-sleep state, and "reboot required" flag.
pub struct PowerController<EN, PON, VINT> {
    enable: DrivePin<EN>,
    power_on: DrivePin<PON>,
    vint: SensePin<VINT>,
    caps: ModuleCaps,
    last_cfun_flip: Option<Instant>,
    deep_sleep: DeepSleepState,
    power_saving_agreed: bool,
    reboot_required: bool,
}

impl<EN, PON, VINT> PowerController<EN, PON, VINT>
where
    EN: OutputPin,
    PON: OutputPin,
    VINT: InputPin,
{
    pub fn new(enable: Option<EN>, power_on: Option<PON>, vint: Option<VINT>, caps: ModuleCaps) -> Self {
        Self {
            enable: DrivePin::new(enable, Polarity::ActiveHigh),
            power_on: DrivePin::new(power_on, Polarity::ActiveLow),
            vint: SensePin::new(vint, Polarity::ActiveHigh),
            caps,
            last_cfun_flip: None,
            deep_sleep: DeepSleepState::Unavailable,
            power_saving_agreed: false,
            reboot_required: false,
        }
    }

    /// Overrides the polarity of the enable-power pin (active-high by
    /// default, overridable per module).
    pub fn set_enable_polarity(&mut self, polarity: Polarity) {
        self.enable.polarity = polarity;
    }

    pub fn deep_sleep_state(&self) -> DeepSleepState {
        self.deep_sleep
    }

    pub fn last_cfun_flip(&self) -> Option<Instant> {
        self.last_cfun_flip
    }

    pub fn reboot_required(&self) -> bool {
        self.reboot_required
    }

    /// Marks whether the network has agreed to 3GPP power saving (PSM) for
    /// this attach; feeds the vint-off-while-agreed ASLEEP transition.
    pub fn set_power_saving_agreed(&mut self, agreed: bool) {
        self.power_saving_agreed = agreed;
    }

    /// Called when a `+UUPSMR` URC arrives.
    pub fn on_protocol_stack_asleep_urc(&mut self) {
        self.deep_sleep = DeepSleepState::ProtocolStackAsleep;
    }

    /// Re-evaluates the deep-sleep state from the current vint reading.
    /// Called after any vint-observing operation and from the wake hook.
    fn refresh_deep_sleep_state(&mut self) -> Result<(), Error> {
        match self.vint.is_live()? {
            Some(false) if self.power_saving_agreed => self.deep_sleep = DeepSleepState::Asleep,
            Some(true) => {
                if self.deep_sleep != DeepSleepState::ProtocolStackAsleep {
                    self.deep_sleep = DeepSleepState::Available;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Power-on sequence: assert enable, pulse power-on, wait for boot,
    /// then poll `AT` until the module answers. Attaching the PDP profile
    /// afterward is a device-open side-effect outside this module's scope.
    /// A no-op returning success if vint already reports the module live.
    pub async fn power_on<P, M, W, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &mut self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    ) -> Result<(), Error>
    where
        P: UartPort,
        M: RawMutex,
        W: WakeHook<P>,
    {
        if self.vint.is_live()? == Some(true) {
            return Ok(());
        }

        self.enable.drive(true)?;
        Timer::after(self.caps.reset_hold).await;
        self.power_on.drive(true)?;
        Timer::after(self.caps.power_on_pulse).await;
        self.power_on.drive(false)?;
        Timer::after(self.caps.boot_wait).await;

        // Poll AT responsiveness. Repeatedly poking `AT` at a fixed baud
        // also doubles as the auto-baud handshake on modules that support
        // it -- there's no separate protocol.
        for _ in 0..AT_POLL_RETRIES {
            let mut txn = at.lock().await?;
            txn.set_timeout(AT_POLL_TIMEOUT);
            txn.command_start(b"AT");
            txn.command_stop(&mut Identity).await?;
            let ok = txn.response_start(None).await.is_ok();
            let _ = txn.response_stop().await;
            let _ = txn.unlock();
            if ok {
                self.deep_sleep = DeepSleepState::Available;
                return Ok(());
            }
        }
        Err(Error::Timeout)
    }

    /// Power-off sequence: `AT+CPWROFF` first, falling back to a hard
    /// pin-pulse power-off if the module doesn't answer.
    pub async fn power_off<P, M, W, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &mut self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    ) -> Result<(), Error>
    where
        P: UartPort,
        M: RawMutex,
        W: WakeHook<P>,
    {
        let mut txn = at.lock().await?;
        txn.set_timeout(self.caps.at_response_timeout);
        txn.command_start(b"AT+CPWROFF");
        txn.command_stop(&mut Identity).await?;
        let resp = txn.response_start(None).await;
        let _ = txn.response_stop().await;
        let _ = txn.unlock();

        if resp.is_ok() {
            self.reboot_required = false;
            self.deep_sleep = DeepSleepState::Unavailable;
            return Ok(());
        }

        // Unresponsive: fall back to a hard pin-pulse power-off.
        self.power_on.drive(true)?;
        Timer::after(self.caps.power_off_pulse).await;
        self.power_on.drive(false)?;

        if self.vint.pin.is_none() {
            // No authoritative signal available; assume it worked after
            // the transition window.
            Timer::after(VINT_TRANSITION_WINDOW).await;
            self.reboot_required = false;
            self.deep_sleep = DeepSleepState::Unavailable;
            return Ok(());
        }

        let deadline = Instant::now() + VINT_TRANSITION_WINDOW;
        loop {
            if self.vint.is_live()? == Some(false) {
                self.reboot_required = false;
                self.deep_sleep = DeepSleepState::Unavailable;
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.reboot_required = true;
                return Err(Error::Timeout);
            }
            Timer::after(VINT_POLL_INTERVAL).await;
        }
    }

    /// Issues `AT+CFUN=<mode>`, honoring the minimum inter-flip gap.
    /// `mode == 1` uses the ordinary response timeout; any other target
    /// (off, radio-off) uses the extended one.
    pub async fn set_cfun<P, M, W, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &mut self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
        mode: u8,
    ) -> Result<(), Error>
    where
        P: UartPort,
        M: RawMutex,
        W: WakeHook<P>,
    {
        if let Some(last) = self.last_cfun_flip {
            let elapsed = Instant::now().saturating_duration_since(last);
            if elapsed < self.caps.min_command_gap {
                Timer::after(self.caps.min_command_gap - elapsed).await;
            }
        }

        let timeout = if mode == 1 { self.caps.at_response_timeout } else { self.caps.max_response_wait };
        let mut txn = at.lock().await?;
        txn.set_timeout(timeout);
        txn.command_start(b"AT+CFUN");
        txn.write_int(mode as i64);
        txn.command_stop(&mut Identity).await?;
        let result = txn.response_start(None).await;
        let _ = txn.response_stop().await;
        let _ = txn.unlock();

        self.last_cfun_flip = Some(Instant::now());
        result
    }
}

/// The wake-on-tx [`WakeHook`] implementation, installed on the
/// [`AtClient`] so every transaction guarantees the modem is awake before
/// a command byte is written.
///
/// Runs with the AT client's transaction lock already held, so it talks to
/// the port directly rather than recursing back through `AtClient::lock`.
pub struct WakeOnTx<EN, PON, VINT> {
    power: PowerController<EN, PON, VINT>,
}

impl<EN, PON, VINT> WakeOnTx<EN, PON, VINT> {
    pub fn new(power: PowerController<EN, PON, VINT>) -> Self {
        Self { power }
    }

    pub fn power_mut(&mut self) -> &mut PowerController<EN, PON, VINT> {
        &mut self.power
    }

    pub fn into_inner(self) -> PowerController<EN, PON, VINT> {
        self.power
    }
}

impl<EN, PON, VINT, P> WakeHook<P> for WakeOnTx<EN, PON, VINT>
where
    EN: OutputPin,
    PON: OutputPin,
    VINT: InputPin,
    P: UartPort,
{
    async fn wake(&mut self, port: &mut P) -> bool {
        port.suspend_cts();

        if self.power.refresh_deep_sleep_state().is_err() {
            port.resume_cts();
            return false;
        }

        let woke = if self.power.deep_sleep == DeepSleepState::Asleep {
            self.deep_sleep_wake_up().await
        } else {
            self.poke_until_awake(port).await
        };

        port.resume_cts();
        woke
    }
}

impl<EN, PON, VINT> WakeOnTx<EN, PON, VINT>
where
    EN: OutputPin,
    PON: OutputPin,
    VINT: InputPin,
{
    /// Deep-sleep wake-up: re-power the module. Re-attaching the PDP
    /// profile for EUTRAN RATs is device-open/upper-layer territory, out
    /// of scope here.
    async fn deep_sleep_wake_up(&mut self) -> bool {
        if self.power.enable.drive(true).is_err() {
            return false;
        }
        Timer::after(self.power.caps.reset_hold).await;
        if self.power.power_on.drive(true).is_err() {
            return false;
        }
        Timer::after(self.power.caps.power_on_pulse).await;
        if self.power.power_on.drive(false).is_err() {
            return false;
        }
        Timer::after(self.power.caps.boot_wait).await;
        self.power.deep_sleep = DeepSleepState::Available;
        true
    }

    /// Pokes raw `AT\r` on the port up to a retry budget, looking for an
    /// `OK` in whatever comes back, to wake the module from UART-sleep
    /// without going through the full AT client (which is unavailable
    /// here -- its lock is already held by the caller).
    async fn poke_until_awake<P: UartPort>(&mut self, port: &mut P) -> bool {
        use embassy_futures::select::{select, Either};
        use embedded_io_async::{Read, Write};
        let mut scratch = [0u8; 16];
        for _ in 0..WAKE_POLL_RETRIES {
            if port.write(b"AT\r").await.is_err() {
                continue;
            }
            let deadline = Instant::now() + AT_POLL_TIMEOUT;
            loop {
                match select(port.read(&mut scratch), Timer::at(deadline)).await {
                    Either::First(Ok(n)) if scratch[..n].windows(2).any(|w| w == b"OK") => {
                        self.power.deep_sleep = DeepSleepState::Available;
                        return true;
                    }
                    Either::First(Ok(_)) => continue,
                    Either::First(Err(_)) => break,
                    Either::Second(()) => break,
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::client::NoWake;
    use crate::caps::{Feature, ModuleType};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embedded_hal::digital::{Error as PinError, ErrorKind as PinErrorKind, ErrorType as PinErrorType};
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug)]
    struct NeverPinError;
    impl PinError for NeverPinError {
        fn kind(&self) -> PinErrorKind {
            PinErrorKind::Other
        }
    }

    #[derive(Clone)]
    struct FakeOutput(Rc<Cell<bool>>);
    impl PinErrorType for FakeOutput {
        type Error = NeverPinError;
    }
    impl OutputPin for FakeOutput {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.0.set(false);
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.0.set(true);
            Ok(())
        }
    }

    #[derive(Clone)]
    struct FakeInput(Rc<Cell<bool>>);
    impl PinErrorType for FakeInput {
        type Error = NeverPinError;
    }
    impl InputPin for FakeInput {
        fn is_high(&mut self) -> Result<bool, Self::Error> {
            Ok(self.0.get())
        }
        fn is_low(&mut self) -> Result<bool, Self::Error> {
            Ok(!self.0.get())
        }
    }

    #[derive(Debug)]
    struct NeverIoError;
    impl embedded_io_async::Error for NeverIoError {
        fn kind(&self) -> embedded_io_async::ErrorKind {
            embedded_io_async::ErrorKind::Other
        }
    }

    struct FakePort {
        written: heapless::Vec<u8, 64>,
    }
    impl embedded_io_async::ErrorType for FakePort {
        type Error = NeverIoError;
    }
    impl embedded_io_async::Read for FakePort {
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> {
            Ok(0)
        }
    }
    impl embedded_io_async::Write for FakePort {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.written.extend_from_slice(buf).ok();
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

    fn tiny_caps() -> ModuleCaps {
        ModuleCaps {
            module: ModuleType::SaraU201,
            power_on_pulse: Duration::from_millis(1),
            power_off_pulse: Duration::from_millis(1),
            boot_wait: Duration::from_millis(1),
            at_response_timeout: Duration::from_millis(20),
            min_command_gap: Duration::from_millis(30),
            max_response_wait: Duration::from_millis(50),
            radio_off_cfun: 0,
            reset_hold: Duration::from_millis(1),
            supported_rat: 0,
            features: Feature::CMUX,
            max_cmux_channels: 4,
            ppp_channel_id: 2,
            cmux_max_frame_size: 1509,
        }
    }

    fn at_client() -> AtClient<FakePort, NoopRawMutex, NoWake, 256, 64, 4, 2> {
        AtClient::new(FakePort { written: heapless::Vec::new() }, NoWake, Duration::from_millis(50))
    }

    #[test]
    fn polarity_active_low_inverts_the_driven_level() {
        assert!(!Polarity::ActiveLow.level_for(true));
        assert!(Polarity::ActiveLow.level_for(false));
    }

    #[test]
    fn power_on_is_a_noop_when_vint_already_reports_live() {
        let mut power: PowerController<FakeOutput, FakeOutput, FakeInput> =
            PowerController::new(None, None, Some(FakeInput(Rc::new(Cell::new(true)))), tiny_caps());
        let at = at_client();
        embassy_futures::block_on(power.power_on(&at)).unwrap();
    }

    #[test]
    fn power_on_drives_enable_then_pulses_power_on_then_polls_at() {
        let en_level = Rc::new(Cell::new(false));
        let pon_level = Rc::new(Cell::new(false));
        let vint_level = Rc::new(Cell::new(false));
        let mut power: PowerController<FakeOutput, FakeOutput, FakeInput> = PowerController::new(
            Some(FakeOutput(en_level.clone())),
            Some(FakeOutput(pon_level.clone())),
            Some(FakeInput(vint_level)),
            tiny_caps(),
        );
        let at = at_client();
        // Pre-feed the reply: the poll loop's first `AT` already finds it
        // waiting, so the sequence completes on the first iteration.
        at.feed_rx(b"OK\r\n", &mut crate::intercept::Identity);

        embassy_futures::block_on(power.power_on(&at)).unwrap();

        assert!(en_level.get(), "enable pin stays asserted once the module is on");
        assert!(!pon_level.get(), "power-on pin is released again after its pulse");
        assert_eq!(power.deep_sleep_state(), DeepSleepState::Available);
    }

    #[test]
    fn set_cfun_stamps_the_last_flip_time_and_sends_the_mode() {
        let mut power: PowerController<FakeOutput, FakeOutput, FakeInput> =
            PowerController::new(None, None, None, tiny_caps());
        let at = at_client();
        at.feed_rx(b"OK\r\n", &mut crate::intercept::Identity);

        assert!(power.last_cfun_flip().is_none());
        embassy_futures::block_on(power.set_cfun(&at, 4)).unwrap();
        assert!(power.last_cfun_flip().is_some());
    }

    #[test]
    fn power_off_falls_back_to_pin_pulse_when_cpwroff_gets_no_response() {
        let pon_level = Rc::new(Cell::new(false));
        let vint_level = Rc::new(Cell::new(false)); // already reads "off"
        let mut power: PowerController<FakeOutput, FakeOutput, FakeInput> = PowerController::new(
            None,
            Some(FakeOutput(pon_level.clone())),
            Some(FakeInput(vint_level)),
            tiny_caps(),
        );
        let at = at_client();
        // No bytes fed: `AT+CPWROFF`'s response_start times out, which
        // drives the pin-pulse fallback.

        embassy_futures::block_on(power.power_off(&at)).unwrap();

        assert!(!pon_level.get(), "power-on pin released again after the off-pulse");
        assert!(!power.reboot_required());
    }

    #[test]
    fn power_off_sets_reboot_required_when_vint_never_deasserts() {
        let mut power: PowerController<FakeOutput, FakeOutput, FakeInput> = PowerController::new(
            None,
            Some(FakeOutput(Rc::new(Cell::new(false)))),
            Some(FakeInput(Rc::new(Cell::new(true)))), // vint stuck "on"
            tiny_caps(),
        );
        let at = at_client();

        let err = embassy_futures::block_on(power.power_off(&at)).unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert!(power.reboot_required());
    }
}
