//! # Polyroute Core - Polyglot Task-Routing Kernel
//!
//! Clients submit a task envelope naming a logical target; the kernel
//! validates it, applies rate and access policy, picks a live adapter (an
//! external process that executes code for one language or service),
//! dispatches over that adapter's persistent connection and correlates the
//! asynchronous reply, with circuit breaking and bounded retry around the
//! exchange.
//!
//! ## Architecture
//!
//! ```text
//!   TCP adapters ─┐                        ┌──────────────────────────────┐
//!   TCP clients  ─┼→ ipc / http ─ submit → │ Kernel                       │
//!   HTTP clients ─┘                        │  envelope::validate          │
//!                                          │  PolicyGate  (rate, access)  │
//!                                          │  RoutingTable (+ built-ins)  │
//!                                          │  ResilienceWrapper           │
//!                                          │        │ Dispatcher          │
//!                                          │        ▼                     │
//!                                          │  MessageBus request on       │
//!                                          │  adapter:{id}:execute        │
//!                                          └──────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod commbus;
pub mod envelope;
pub mod http;
pub mod ipc;
pub mod kernel;
pub mod policy;
pub mod resilience;
pub mod routing;
pub mod services;
pub mod types;

// Internal utilities
pub mod observability;

pub use envelope::{Envelope, Intent};
pub use kernel::Kernel;
pub use types::{Config, Error, ErrorCode, IpcConfig, Result};
