//! Packet ingestion service
//!
//! A [`PacketSource`] yields decoded packets one at a time. The
//! [`ExporterService`] pulls from a source and hands each packet to the
//! [`PacketDispatcher`] in arrival order, while also serving commands from
//! an [`ExporterHandle`].
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_exporter::{ExporterService, JsonLinesSource, PacketDispatcher};
//!
//! let source = JsonLinesSource::new(tokio::io::BufReader::new(tokio::io::stdin()));
//! let (service, handle) = ExporterService::new(source, dispatcher);
//! let task = tokio::spawn(service.run());
//!
//! println!("{:?}", handle.stats().await?);
//! handle.shutdown().await?;
//! ```

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::dedup::DedupStats;
use crate::dispatcher::{DispatcherStats, PacketDispatcher};
use crate::error::{ExporterError, Result};
use crate::packet::MeshPacket;

/// Consecutive source errors after which the service gives up
pub const MAX_CONSECUTIVE_SOURCE_ERRORS: u32 = 10;

/// A stream of decoded packets
#[async_trait]
pub trait PacketSource: Send {
    /// Next packet, or `None` once the source is closed
    async fn next_packet(&mut self) -> Result<Option<MeshPacket>>;

    /// Source name (for logging)
    fn name(&self) -> &str;
}

// ============================================================================
// JSON lines source
// ============================================================================

/// Reads one JSON packet per line
///
/// Blank lines are skipped. Lines that do not decode are logged and
/// skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_number: u64,
    skipped: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    /// Read packets from `reader`
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
            skipped: 0,
        }
    }

    /// Lines skipped because they did not decode
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> PacketSource for JsonLinesSource<R> {
    async fn next_packet(&mut self) -> Result<Option<MeshPacket>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match MeshPacket::from_json(line) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => {
                    warn!(line = self.line_number, error = %e, "Skipping undecodable line");
                    self.skipped += 1;
                }
            }
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        "json-lines"
    }
}

// ============================================================================
// Channel source
// ============================================================================

/// Receives packets pushed by another task (e.g. a subscription callback)
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<MeshPacket>,
}

impl ChannelSource {
    /// Wrap an existing receiver
    pub fn new(rx: mpsc::Receiver<MeshPacket>) -> Self {
        Self { rx }
    }

    /// Create a bounded channel and its source
    pub fn channel(capacity: usize) -> (mpsc::Sender<MeshPacket>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl PacketSource for ChannelSource {
    async fn next_packet(&mut self) -> Result<Option<MeshPacket>> {
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

// ============================================================================
// Service
// ============================================================================

/// Commands accepted by a running service
#[derive(Debug)]
pub enum ServiceCommand {
    /// Request a statistics snapshot
    GetStats(oneshot::Sender<ServiceStats>),
    /// Stop after the current packet
    Shutdown,
}

/// Service statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Errors returned by the packet source
    pub source_errors: u64,
    /// Dispatcher counters
    pub dispatcher: DispatcherStats,
    /// Dedup filter counters
    pub dedup: DedupStats,
}

/// Handle for interacting with a running [`ExporterService`]
#[derive(Debug, Clone)]
pub struct ExporterHandle {
    command_tx: mpsc::Sender<ServiceCommand>,
}

impl ExporterHandle {
    /// Get current service statistics
    pub async fn stats(&self) -> Result<ServiceStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(ServiceCommand::GetStats(tx)).await?;
        rx.await.map_err(|_| ExporterError::ChannelClosed)
    }

    /// Ask the service to stop
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx.send(ServiceCommand::Shutdown).await?;
        Ok(())
    }
}

/// Pulls packets from a source and dispatches them one at a time
pub struct ExporterService<S: PacketSource> {
    source: S,
    dispatcher: PacketDispatcher,
    command_rx: mpsc::Receiver<ServiceCommand>,
    source_errors: u64,
}

impl<S: PacketSource> ExporterService<S> {
    /// Create a service and its control handle
    pub fn new(source: S, dispatcher: PacketDispatcher) -> (Self, ExporterHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let service = Self {
            source,
            dispatcher,
            command_rx,
            source_errors: 0,
        };
        (service, ExporterHandle { command_tx })
    }

    /// Run until the source closes or shutdown is requested
    ///
    /// Returns the final statistics. Fails only if the source keeps
    /// erroring or returns a non-retriable error.
    pub async fn run(mut self) -> Result<ServiceStats> {
        info!(source = self.source.name(), "Starting exporter service");

        let mut commands_open = true;
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv(), if commands_open => {
                    match cmd {
                        Some(ServiceCommand::GetStats(tx)) => {
                            let _ = tx.send(self.stats());
                        }
                        Some(ServiceCommand::Shutdown) => {
                            info!("Exporter shutdown requested");
                            break;
                        }
                        None => {
                            debug!("All exporter handles dropped");
                            commands_open = false;
                        }
                    }
                }

                next = self.source.next_packet() => {
                    match next {
                        Ok(Some(packet)) => {
                            consecutive_errors = 0;
                            self.dispatcher.on_packet(&packet).await;
                        }
                        Ok(None) => {
                            info!(source = self.source.name(), "Packet source closed");
                            break;
                        }
                        Err(e) => {
                            self.source_errors += 1;
                            consecutive_errors += 1;
                            warn!(source = self.source.name(), error = %e, "Error reading packet source");

                            if !e.is_retriable() || consecutive_errors >= MAX_CONSECUTIVE_SOURCE_ERRORS {
                                error!(
                                    source = self.source.name(),
                                    consecutive_errors,
                                    "Giving up on packet source"
                                );
                                return Err(e);
                            }
                        }
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            processed = stats.dispatcher.processed,
            duplicates = stats.dispatcher.duplicates,
            errors = stats.dispatcher.errors,
            "Exporter service stopped"
        );
        Ok(stats)
    }

    fn stats(&self) -> ServiceStats {
        ServiceStats {
            source_errors: self.source_errors,
            dispatcher: self.dispatcher.stats(),
            dedup: self.dispatcher.dedup().stats(),
        }
    }
}
