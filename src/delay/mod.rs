//! The delay that is imposed on relayed traffic: either a fixed value for development, or the
//!  one-way light time between two bodies, computed from ephemeris data and cached so that the
//!  per-packet path never waits for the computation.

pub mod delay_config;
pub mod delay_source;
pub mod delay_value;
pub mod ephemeris;
pub mod ephemeris_table;
