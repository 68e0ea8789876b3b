//! Client side of the shroud split proxy: accepts CONNECT tunnels or raw
//! TLS bytestreams, conceals the SNI (or the whole ClientHello) via an
//! out-of-band peer, then relays on a direct path to the target.

pub mod handler;
pub mod oob;
pub mod relay;
