//! AT command/response client.

pub mod client;
pub mod parser;

pub use client::{AtClient, AtTransaction, DeferredCallback, NoWake, UrcCursor, UrcFn, WakeHook};
pub use parser::StopTag;
