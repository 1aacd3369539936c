//! TCP transport for adapters and data-plane clients.
//!
//! Length-prefixed JSON envelope frames over a persistent connection. Control
//! envelopes (`target == "kernel"`) go to the control path, `response`
//! envelopes resolve dispatches forwarded to the adapter, and everything else
//! is submitted to the kernel with the result sent back as a `response`.

pub mod codec;
mod connection;
mod control;
pub mod server;

pub use server::IpcServer;
