//! Error types for the mesh exporter
//!
//! Per-packet failures (decode problems, malformed payloads, store outages)
//! are reported through [`ExporterError`] and isolated by the dispatcher so
//! that a single bad packet never stops ingestion.

use thiserror::Error;

/// Main error type for exporter operations
#[derive(Error, Debug)]
pub enum ExporterError {
    // ===== Packet Errors =====
    /// Packet JSON could not be decoded into a mesh packet
    #[error("Packet decode error: {0}")]
    Decode(String),

    /// Packet decoded but the payload for its port is missing or malformed
    #[error("Malformed packet {packet_id}: {reason}")]
    MalformedPacket {
        /// Packet identifier
        packet_id: u32,
        /// What was wrong with the payload
        reason: String,
    },

    // ===== Store Errors =====
    /// Store backend could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store command failed
    #[error("Store error: {0}")]
    Store(String),

    // ===== Metric Errors =====
    /// Metric registration or update failed
    #[error("Metrics error: {0}")]
    Metrics(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExporterError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ExporterError::StoreUnavailable(_) | ExporterError::Io(_)
        )
    }

    /// Check if this error was caused by bad packet data
    pub fn is_packet_error(&self) -> bool {
        matches!(
            self,
            ExporterError::Decode(_) | ExporterError::MalformedPacket { .. }
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            ExporterError::Decode(_) => "DECODE",
            ExporterError::MalformedPacket { .. } => "MALFORMED_PACKET",
            ExporterError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ExporterError::Store(_) => "STORE_ERROR",
            ExporterError::Metrics(_) => "METRICS_ERROR",
            ExporterError::InvalidConfig(_) => "INVALID_CONFIG",
            ExporterError::MissingConfig(_) => "MISSING_CONFIG",
            ExporterError::ChannelClosed => "CHANNEL_CLOSED",
            ExporterError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for exporter operations
pub type Result<T> = std::result::Result<T, ExporterError>;

impl From<serde_json::Error> for ExporterError {
    fn from(err: serde_json::Error) -> Self {
        ExporterError::Decode(err.to_string())
    }
}

impl From<prometheus::Error> for ExporterError {
    fn from(err: prometheus::Error) -> Self {
        ExporterError::Metrics(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for ExporterError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            ExporterError::StoreUnavailable(err.to_string())
        } else {
            ExporterError::Store(err.to_string())
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ExporterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ExporterError::ChannelClosed
    }
}
