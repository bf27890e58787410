//! vidstream-core: wire format and configuration shared by every vidstream crate.
//! No async code lives here.

pub mod config;
pub mod wire;

pub use config::{ConfigError, StreamConfig, StreamFormat};
pub use wire::{Datagram, HeaderParser, WireError, WordWidth};
