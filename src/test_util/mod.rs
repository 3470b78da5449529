//! This module contains utilities for testing relay functionality without real multicast
//!  sockets. They are used for testing the relay itself, but they are also exported for
//!  application testing (e.g. testing a custom [crate::relay::endpoint_factory::EndpointFactory]
//!  setup end-to-end).
//!
//! Making test utilities part of the crate's regular (non-#[cfg(test)]) code is the compromise
//!  that allows sharing them with other crates.

pub mod datagram;
pub mod endpoints;

