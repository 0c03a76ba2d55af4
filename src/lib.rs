//! Portable serial-transport core for u-blox cellular modules: AT
//! command/response client, 3GPP TS 27.010 CMUX multiplexer, PPP dial
//! sequencer, and power/sleep controller.
//!
//! Every porting seam ([`port::UartPort`], `embedded_hal::digital`'s
//! `OutputPin`/`InputPin`) is fixed at compile time through generics rather
//! than through boxed trait objects -- there's no allocator here. A
//! [`Device`] is generic over its physical port and GPIO pin types; CMUX and
//! PPP, when a module supports them, are composed on top of the same
//! [`at::client::AtClient`] the [`Device`] already owns (see
//! [`ppp::Ppp::dial`], which borrows it directly) rather than owned by
//! `Device` itself, since CMUX's own channel ring buffers need to outlive
//! any one `Device` borrow in a `static` the application controls.
#![cfg_attr(not(test), no_std)]

pub mod at;
pub mod caps;
pub mod cmux;
pub mod error;
pub mod intercept;
pub mod port;
pub mod power;
pub mod ppp;
pub mod registry;
pub mod ringbuf;
pub mod vserial;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;
use embedded_hal::digital::{InputPin, OutputPin};

use at::client::{AtClient, NoWake, WakeHook};
use caps::{ModuleCaps, ModuleType};
use error::Error;
use intercept::Identity;
use port::UartPort;
use power::{Polarity, PowerController};

/// Registration status on one network domain, decoded from a
/// `+CREG`/`+CGREG` `stat` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationStatus {
    #[default]
    NotRegistered,
    RegisteredHome,
    Searching,
    Denied,
    Unknown,
    RegisteredRoaming,
}

impl RegistrationStatus {
    fn from_stat(stat: i64) -> Self {
        match stat {
            0 => Self::NotRegistered,
            1 => Self::RegisteredHome,
            2 => Self::Searching,
            3 => Self::Denied,
            5 => Self::RegisteredRoaming,
            _ => Self::Unknown,
        }
    }

    pub fn is_registered(self) -> bool {
        matches!(self, Self::RegisteredHome | Self::RegisteredRoaming)
    }
}

/// Registration status on both network domains. Radio measurements are
/// deliberately left out: those are upper-layer concerns read through the
/// AT client directly, not part of the transport core's own state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkState {
    pub circuit_switched: RegistrationStatus,
    pub packet_switched: RegistrationStatus,
}

impl NetworkState {
    /// Refreshes both domains with `AT+CREG?`/`AT+CGREG?`.
    pub async fn refresh<P, M, W, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        &mut self,
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    ) -> Result<(), Error>
    where
        P: UartPort,
        M: RawMutex,
        W: WakeHook<P>,
    {
        self.circuit_switched = Self::query(at, b"AT+CREG?", b"+CREG:").await?;
        self.packet_switched = Self::query(at, b"AT+CGREG?", b"+CGREG:").await?;
        Ok(())
    }

    async fn query<P, M, W, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>(
        at: &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
        command: &[u8],
        prefix: &[u8],
    ) -> Result<RegistrationStatus, Error>
    where
        P: UartPort,
        M: RawMutex,
        W: WakeHook<P>,
    {
        let mut txn = at.lock().await?;
        txn.command_start(command);
        txn.command_stop(&mut Identity).await?;
        txn.response_start(Some(prefix)).await?;
        let _n = txn.read_int()?;
        let stat = txn.read_int()?;
        txn.response_stop().await?;
        let _ = txn.unlock();
        Ok(RegistrationStatus::from_stat(stat))
    }
}

/// Per-instance configuration: module type, the three optional GPIO pins
/// with their polarity already decided by [`power::PowerController::new`]'s
/// defaults, the "leave power alone" flag, the wake-up hook, and the AT
/// client's default response timeout. UART pin/baud selection isn't
/// represented here -- it's resolved by whatever the caller did to produce
/// the already-open `port` passed to [`Device::new`]; host UART
/// configuration is a porting concern, not part of this core. AT buffer
/// length and CMUX maximum frame size are [`Device`]'s const generics,
/// fixed at compile time rather than carried here as runtime fields.
pub struct Config<EN, PON, VINT, W = NoWake> {
    pub module: ModuleType,
    pub enable_pin: Option<EN>,
    pub power_on_pin: Option<PON>,
    pub vint_pin: Option<VINT>,
    pub leave_power_alone: bool,
    pub wake: W,
    pub at_timeout: Duration,
}

/// A single physical modem instance. Owns the AT client and the
/// power/sleep controller directly; CMUX and PPP are
/// deliberately not fields here (see the module doc) -- a caller that needs
/// them constructs a [`cmux::Cmux`] behind its own `Mutex` and a
/// [`ppp::Ppp`] borrowing it, passing `device.at()` through to
/// [`ppp::Ppp::dial`].
pub struct Device<P, M, W, EN, PON, VINT, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>
where
    M: RawMutex,
{
    module: ModuleType,
    caps: ModuleCaps,
    at: AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N>,
    power: PowerController<EN, PON, VINT>,
    network: NetworkState,
    leave_power_alone: bool,
}

impl<P, M, W, EN, PON, VINT, const RX_N: usize, const TX_N: usize, const URC_N: usize, const CB_N: usize>
    Device<P, M, W, EN, PON, VINT, RX_N, TX_N, URC_N, CB_N>
where
    P: UartPort,
    M: RawMutex,
    W: WakeHook<P>,
    EN: OutputPin,
    PON: OutputPin,
    VINT: InputPin,
{
    pub fn new(port: P, config: Config<EN, PON, VINT, W>) -> Self {
        let caps = config.module.caps();
        Self {
            module: config.module,
            caps,
            at: AtClient::new(port, config.wake, config.at_timeout),
            power: PowerController::new(config.enable_pin, config.power_on_pin, config.vint_pin, caps),
            network: NetworkState::default(),
            leave_power_alone: config.leave_power_alone,
        }
    }

    pub fn module(&self) -> ModuleType {
        self.module
    }

    pub fn caps(&self) -> &ModuleCaps {
        &self.caps
    }

    pub fn network(&self) -> &NetworkState {
        &self.network
    }

    /// Access to the AT client for upper-layer feature modules (out of
    /// scope for this crate) and for [`ppp::Ppp::dial`], which borrows it
    /// directly rather than owning its own copy.
    pub fn at(&self) -> &AtClient<P, M, W, RX_N, TX_N, URC_N, CB_N> {
        &self.at
    }

    pub fn power_mut(&mut self) -> &mut PowerController<EN, PON, VINT> {
        &mut self.power
    }

    /// Overrides the enable pin's polarity before `open`; some modules
    /// drive the enable line active-low, others active-high.
    pub fn set_enable_polarity(&mut self, polarity: Polarity) {
        self.power.set_enable_polarity(polarity);
    }

    /// Brings the module up (runs the power-on sequence unless
    /// `leave_power_alone` is set) and registers it in `registry` under a
    /// fresh handle.
    ///
    /// Safety-relevant convention, not an enforced invariant: the registry
    /// only ever hands back the raw pointer given here, so `self` must not
    /// move for as long as `registry` might still resolve this handle.
    pub async fn open<RM, const N: usize>(&mut self, registry: &registry::Registry<RM, N>) -> Result<registry::Handle, Error>
    where
        RM: RawMutex,
    {
        if !self.leave_power_alone {
            self.power.power_on(&self.at).await?;
        }
        self.network.refresh(&self.at).await?;
        registry.create(self as *mut Self as *mut ())
    }

    /// Tears the module down (runs the power-off sequence unless
    /// `leave_power_alone` is set) and removes `handle` from `registry`.
    pub async fn close<RM, const N: usize>(&mut self, registry: &registry::Registry<RM, N>, handle: registry::Handle) -> Result<(), Error>
    where
        RM: RawMutex,
    {
        let result = if self.leave_power_alone { Ok(()) } else { self.power.power_off(&self.at).await };
        let _ = registry.remove(handle);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::ModuleType;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embedded_hal::digital::{ErrorType, PinState};
    use embedded_io_async::{ErrorType as IoErrorType, Read as IoRead, Write as IoWrite};

    #[derive(Debug)]
    struct NeverPinError;
    impl embedded_hal::digital::Error for NeverPinError {
        fn kind(&self) -> embedded_hal::digital::ErrorKind {
            embedded_hal::digital::ErrorKind::Other
        }
    }

    struct FakeOutput;
    impl ErrorType for FakeOutput {
        type Error = NeverPinError;
    }
    impl OutputPin for FakeOutput {
        fn set_low(&mut self) -> Result<(), NeverPinError> {
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), NeverPinError> {
            Ok(())
        }
    }

    struct FakeInput(bool);
    impl ErrorType for FakeInput {
        type Error = NeverPinError;
    }
    impl InputPin for FakeInput {
        fn is_high(&mut self) -> Result<bool, NeverPinError> {
            Ok(self.0)
        }
        fn is_low(&mut self) -> Result<bool, NeverPinError> {
            Ok(!self.0)
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
        rx: heapless::Vec<u8, 256>,
    }
    impl IoErrorType for FakePort {
        type Error = NeverIoError;
    }
    impl IoRead for FakePort {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NeverIoError> {
            let n = self.rx.len().min(buf.len());
            buf[..n].copy_from_slice(&self.rx[..n]);
            self.rx.rotate_left(n);
            self.rx.truncate(self.rx.len() - n);
            Ok(n)
        }
    }
    impl IoWrite for FakePort {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, NeverIoError> {
            Ok(buf.len())
        }
    }
    impl UartPort for FakePort {
        fn size_pending(&self) -> usize {
            self.rx.len()
        }
        fn suspend_cts(&mut self) {}
        fn resume_cts(&mut self) {}
    }

    fn device(
        vint: bool,
    ) -> Device<FakePort, NoopRawMutex, NoWake, FakeOutput, FakeOutput, FakeInput, 256, 64, 4, 2> {
        let config = Config {
            module: ModuleType::SaraR410M02B,
            enable_pin: Some(FakeOutput),
            power_on_pin: Some(FakeOutput),
            vint_pin: Some(FakeInput(vint)),
            leave_power_alone: false,
            wake: NoWake,
            at_timeout: Duration::from_millis(50),
        };
        Device::new(FakePort { rx: heapless::Vec::new() }, config)
    }

    #[test]
    fn registration_status_decodes_home_and_roaming_stat_codes() {
        assert_eq!(RegistrationStatus::from_stat(1), RegistrationStatus::RegisteredHome);
        assert_eq!(RegistrationStatus::from_stat(5), RegistrationStatus::RegisteredRoaming);
        assert!(RegistrationStatus::from_stat(1).is_registered());
        assert!(!RegistrationStatus::from_stat(2).is_registered());
    }

    #[test]
    fn open_is_a_noop_power_sequence_when_vint_already_reports_live() {
        let mut dev = device(true);
        dev.at.feed_rx(b"+CREG: 0,1\r\nOK\r\n+CGREG: 0,1\r\nOK\r\n", &mut Identity);
        let registry: registry::Registry<NoopRawMutex, 2> = registry::Registry::new();
        let handle = embassy_futures::block_on(dev.open(&registry)).unwrap();
        assert!(registry.contains(handle));
        assert_eq!(dev.network().circuit_switched, RegistrationStatus::RegisteredHome);
        assert_eq!(dev.network().packet_switched, RegistrationStatus::RegisteredHome);
    }

    #[test]
    fn close_unregisters_the_handle() {
        let mut dev = device(true);
        dev.at.feed_rx(b"+CREG: 0,1\r\nOK\r\n+CGREG: 0,1\r\nOK\r\n", &mut Identity);
        let registry: registry::Registry<NoopRawMutex, 2> = registry::Registry::new();
        let handle = embassy_futures::block_on(dev.open(&registry)).unwrap();
        dev.at.feed_rx(b"OK\r\n", &mut Identity); // AT+CPWROFF
        embassy_futures::block_on(dev.close(&registry, handle)).unwrap();
        assert!(!registry.contains(handle));
    }

    #[allow(dead_code)]
    fn pin_state_is_reexported_the_usual_way(_s: PinState) {}
}
