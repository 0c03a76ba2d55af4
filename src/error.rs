//! Error kinds shared across the whole crate.

/// A device-side error reported by the module itself (`ERROR` / `+CME
/// ERROR` / `+CMS ERROR` / `ABORTED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceErrorState {
    #[default]
    None,
    Aborted,
    /// `CME`/`CMS` numeric sub-code, when the module provided one.
    Generic(Option<u16>),
}

/// Top-level error type returned by every fallible operation in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// API called before `Device::open`.
    NotInitialised,
    /// Argument out of contract (null, out of range, unknown module type).
    InvalidParameter,
    /// Feature not present in the module's capability row.
    NotSupported,
    /// Deadline exceeded waiting for a response or event.
    Timeout,
    /// Module replied with an error line; carries the CME/CMS sub-code if any.
    DeviceError(DeviceErrorState),
    /// Not registered on the required network domain.
    NotRegistered,
    /// No active data connection.
    NotConnected,
    /// Lookup failed (channel, handle, URC prefix, ...).
    NotFound,
    /// A bounded resource (ring buffer, channel table, callback queue) is full.
    NoMemory,
    /// Transient failure; the caller may retry.
    TemporaryFailure,
    /// Underlying transport (UART) reported an I/O failure.
    Transport,
    /// A CMUX frame failed its FCS or length checks.
    Framing,
    /// `AtClient::lock` was called from within the port's own RX event
    /// callback, where no transaction can safely run.
    Reentrant,
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
