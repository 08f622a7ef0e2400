#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! A reactor-driven FIX session engine: readiness-multiplexed transports, a
//! synchronous timer wheel, the session state machine with login/heartbeat/
//! reconnect handling, sequence-number bookkeeping with gap detection and
//! resend, persistent stores, and a full-duplex channel to application
//! handlers.

pub mod applink;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fix;
pub mod reactor;
pub mod session;
pub mod signal;
pub mod store;
pub mod timer;
pub mod tls;
pub mod transport;
