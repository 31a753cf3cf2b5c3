//! Error types for offloaded coding operations.

use std::time::Duration;

/// Errors raised while resolving or validating configuration.
///
/// All of these are fatal and surface at dispatcher construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The `(k, p)` pair has no matching compute bitstream.
    #[error("unsupported coding configuration: {data_units} data units, {parity_units} parity units")]
    UnsupportedConfiguration {
        /// Requested data unit count.
        data_units: usize,
        /// Requested parity unit count.
        parity_units: usize,
    },

    /// More units than the 16-bit pattern protocol can address.
    #[error("too many units: {total} exceeds the protocol limit of {max}")]
    TooManyUnits {
        /// `data_units + parity_units`.
        total: usize,
        /// Protocol limit.
        max: usize,
    },

    /// A key required by the selected mode is absent.
    #[error("missing required config key: {0}")]
    MissingKey(String),

    /// A key is present but its value is unusable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration document is not valid TOML.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from an [`OffloadChannel`](crate::OffloadChannel).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No session to the compute service could be established or used.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// No reply arrived within the receive timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The transport failed mid-exchange or returned garbage.
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::TransportFailure(e.to_string())
    }
}

/// Errors raised by a [`SoftwareCoder`](crate::SoftwareCoder).
#[derive(Debug, thiserror::Error)]
pub enum CodingError {
    /// The Reed-Solomon library returned an error.
    #[error("reed-solomon error: {0}")]
    ReedSolomon(#[from] reed_solomon_simd::Error),

    /// Not enough units survive to reconstruct anything.
    #[error("not enough shards: need {needed}, got {got}")]
    NotEnoughShards {
        /// Minimum units required (k).
        needed: usize,
        /// Units actually present.
        got: usize,
    },

    /// Buffer counts or lengths do not fit the coder's shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The cell length cannot be coded (zero or odd).
    #[error("unsupported cell length {0}: must be non-zero and even")]
    UnsupportedCellLength(usize),
}

/// Caller-visible error of an encode or decode call.
#[derive(Debug, thiserror::Error)]
pub enum CoderError {
    /// Invalid or incomplete configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// The compute channel failed. Never retried at this layer.
    #[error("offload channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A buffer's size is inconsistent with the declared cell length.
    #[error("length mismatch: expected {expected} bytes, got {got}")]
    LengthMismatch {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        got: usize,
    },

    /// The call cannot be satisfied regardless of channel behaviour.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The reply carries fewer bytes than the requested outputs need.
    #[error("short reply: expected at least {expected} bytes, got {got}")]
    ShortReply {
        /// Bytes needed to fill every output.
        expected: usize,
        /// Bytes received.
        got: usize,
    },

    /// The local software coder failed.
    #[error("software coder error: {0}")]
    Software(#[from] CodingError),
}
