//! Reed-Solomon coding offloaded to an external compute service.
//!
//! This crate provides:
//! - [`OffloadEncoder`] and [`OffloadDecoder`]: per-session dispatchers that
//!   send large, aligned cells to the compute service and code everything
//!   else locally.
//! - [`BitPattern`] and the [`framer`] functions: the compact request
//!   encoding of unit sets and cell buffers.
//! - [`OffloadChannel`] with a TCP [`LiveChannel`] and an in-memory
//!   [`MockChannel`].
//! - [`OffloadEngine`]: the request processor behind the proxy daemon and
//!   the compute-mode mock.

pub mod channel;
pub mod config;
mod decoder;
mod encoder;
pub mod engine;
pub mod error;
pub mod framer;
pub mod message;
pub mod pattern;
pub mod policy;
mod session;
pub mod software;

#[cfg(test)]
mod tests;

pub use channel::{
    EndpointSelector, LiveChannel, MockChannel, MockReply, MockStats, OffloadChannel, open_channel,
};
pub use config::{
    CodingConfiguration, ConfigSource, ConfigTable, DeliveryOptions, OffloadConfig,
    SUPPORTED_CONFIGURATIONS,
};
pub use decoder::OffloadDecoder;
pub use encoder::OffloadEncoder;
pub use engine::OffloadEngine;
pub use error::{ChannelError, CoderError, CodingError, ConfigError};
pub use message::{OffloadReply, OffloadRequest};
pub use pattern::{BitPattern, MAX_UNITS, decode_indices, encode_indices, split_to_bytes};
pub use policy::{FallbackPolicy, fallback_threshold, is_offload_eligible};
pub use software::{ReedSolomonCoder, SoftwareCoder};
