//! Intercept pipeline -- optional pre-encode/decode hooks on the AT
//! client's TX/RX byte streams, used to layer chip-to-chip (C2C)
//! authenticated encryption transparently underneath the AT protocol.
//!
//! Modeled as a small trait the caller implements, the same way porting
//! seams elsewhere in this crate are traits rather than a pair of raw
//! function pointers with an opaque `ctx`. `TxIntercept`/`RxIntercept` own
//! whatever scratch buffer they need; the crate never assumes anything about
//! their lifetime beyond "valid until the next call".

/// Applied to outgoing AT bytes before they reach the UART.
///
/// Receives one full command, delimited by the AT client's configured
/// command terminator. Must be idempotent when `src` is empty.
pub trait TxIntercept {
    /// Transforms `src` and returns the slice to actually write to the
    /// UART. The returned slice may borrow `src` or an internal scratch
    /// buffer; it must remain valid only until the next call.
    fn intercept_tx<'a>(&'a mut self, src: &'a [u8]) -> &'a [u8];
}

/// Applied to incoming bytes before they reach the AT parser.
///
/// Receives arbitrary chunks (not necessarily line- or command-aligned).
/// Must be idempotent when `src` is empty.
pub trait RxIntercept {
    fn intercept_rx<'a>(&'a mut self, src: &'a [u8]) -> &'a [u8];
}

/// No-op passthrough, used when no C2C encryption is configured.
#[derive(Default)]
pub struct Identity;

impl TxIntercept for Identity {
    fn intercept_tx<'a>(&'a mut self, src: &'a [u8]) -> &'a [u8] {
        src
    }
}

impl RxIntercept for Identity {
    fn intercept_rx<'a>(&'a mut self, src: &'a [u8]) -> &'a [u8] {
        src
    }
}

/// Bundles a TX and RX intercept; installed as a pair on the AT client.
pub struct InterceptPipeline<Tx, Rx> {
    pub tx: Tx,
    pub rx: Rx,
}

impl Default for InterceptPipeline<Identity, Identity> {
    fn default() -> Self {
        Self { tx: Identity, rx: Identity }
    }
}
