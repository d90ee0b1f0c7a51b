//! Mesh Exporter Node - Meshtastic packets in, Prometheus metrics out
//!
//! This binary reads decoded Meshtastic packets as JSON lines (stdin or a
//! file), runs them through the exporter pipeline and writes the Prometheus
//! text exposition when the input ends or on Ctrl-C.
//!
//! Configuration comes from the environment (`FLOOD_EXPIRE_TIME`,
//! `NODE_METADATA_TTL`, `CACHE_MAX_ENTRIES`, `STORE_BACKEND`, `REDIS_HOST`,
//! `REDIS_PORT`, `LOG_LEVEL`, `LOG_COLOR`); command-line flags override it.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mesh_exporter::config::{DEFAULT_REDIS_HOST, DEFAULT_REDIS_PORT};
use mesh_exporter::{
    open_store, parse_node_db, ChannelSource, ExporterConfig, ExporterConfigBuilder,
    ExporterService, JsonLinesSource, LoggingConfig, MeshPacket, NodeResolver, PacketDispatcher,
    PacketSource, PrometheusSink, StoreConfig, VERSION,
};

/// Packets buffered between the stdin reader thread and the service
const STDIN_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Parser)]
#[command(name = "mesh-exporter-node")]
#[command(about = "Export Meshtastic mesh packets as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Read packets from this file instead of stdin (one JSON object per line)
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Write the metrics exposition to this file instead of stdout
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    /// Pre-seed node identities from a NodeDB JSON dump
    #[arg(long)]
    node_db: Option<PathBuf>,

    /// Flood dedup window in seconds
    #[arg(long)]
    flood_expire_time: Option<u64>,

    /// Node metadata expiry in seconds
    #[arg(long)]
    node_metadata_ttl: Option<u64>,

    /// Metadata store backend
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Maximum entries held by the memory store
    #[arg(long)]
    cache_max_entries: Option<usize>,

    /// Redis host (implies --store redis)
    #[arg(long)]
    redis_host: Option<String>,

    /// Redis port (implies --store redis)
    #[arg(long)]
    redis_port: Option<u16>,

    /// Log filter, e.g. `info` or `mesh_exporter=debug`
    #[arg(long)]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    /// Layer command-line overrides on top of `base`
    fn apply(&self, base: ExporterConfig) -> anyhow::Result<ExporterConfig> {
        let mut builder = ExporterConfigBuilder::from_config(base.clone());

        if let Some(secs) = self.flood_expire_time {
            builder = builder.flood_expire_time(Duration::from_secs(secs));
        }
        if let Some(secs) = self.node_metadata_ttl {
            builder = builder.metadata_ttl(Duration::from_secs(secs));
        }

        let wants_redis = self.store == Some(StoreBackend::Redis)
            || (self.store.is_none() && (self.redis_host.is_some() || self.redis_port.is_some()));

        if wants_redis {
            let (host, port) = match &base.store {
                StoreConfig::Redis { host, port } => (host.clone(), *port),
                StoreConfig::Memory { .. } => (DEFAULT_REDIS_HOST.to_string(), DEFAULT_REDIS_PORT),
            };
            builder = builder.redis_store(
                self.redis_host.clone().unwrap_or(host),
                self.redis_port.unwrap_or(port),
            );
        } else if self.store == Some(StoreBackend::Memory) || self.cache_max_entries.is_some() {
            let current = match &base.store {
                StoreConfig::Memory { max_entries } => *max_entries,
                StoreConfig::Redis { .. } => mesh_exporter::DEFAULT_CACHE_MAX_ENTRIES,
            };
            builder = builder.memory_store(self.cache_max_entries.unwrap_or(current));
        }

        if self.verbose {
            builder = builder.log_level("debug");
        } else if let Some(level) = &self.log_level {
            builder = builder.log_level(level.clone());
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(logging.color)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn import_node_db(resolver: &NodeResolver, path: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading NodeDB {}", path.display()))?;
    let nodes = parse_node_db(&text).with_context(|| format!("parsing NodeDB {}", path.display()))?;
    if nodes.is_empty() {
        warn!(path = %path.display(), "NodeDB has no nodes with identities");
        return Ok(());
    }
    resolver.import_node_db(nodes).await?;
    Ok(())
}

/// Decode JSON lines from a blocking reader on a dedicated thread
///
/// The runtime never waits on this thread, so a blocked stdin read does not
/// keep the process alive after shutdown. The channel closes at end of input.
fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<MeshPacket>) -> std::thread::JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    std::thread::spawn(move || {
        for (index, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Error reading input, stopping");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match MeshPacket::from_json(&line) {
                Ok(packet) => {
                    if tx.blocking_send(packet).is_err() {
                        debug!("Exporter stopped, closing input reader");
                        break;
                    }
                }
                Err(e) => warn!(line = index + 1, error = %e, "Skipping undecodable line"),
            }
        }
    })
}

/// Stdin as a packet source
fn stdin_source() -> ChannelSource {
    let (tx, source) = ChannelSource::channel(STDIN_BUFFER);
    spawn_line_reader(std::io::BufReader::new(std::io::stdin()), tx);
    source
}

async fn run_service<S>(source: S, dispatcher: PacketDispatcher) -> anyhow::Result<()>
where
    S: PacketSource + 'static,
{
    let (service, handle) = ExporterService::new(source, dispatcher);
    let mut task = tokio::spawn(service.run());

    let stats = tokio::select! {
        result = &mut task => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            handle.shutdown().await?;
            task.await??
        }
    };

    info!(
        received = stats.dispatcher.received,
        processed = stats.dispatcher.processed,
        duplicates = stats.dispatcher.duplicates,
        suppressed = stats.dispatcher.suppressed,
        errors = stats.dispatcher.errors,
        source_errors = stats.source_errors,
        "Ingestion finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.apply(ExporterConfig::from_env()?)?;

    init_tracing(&config.logging)?;

    info!("Starting Mesh Exporter Node v{}", VERSION);
    info!(
        flood_expire_time = %humantime::format_duration(config.dedup.flood_expire_time),
        node_metadata_ttl = %humantime::format_duration(config.metadata.ttl),
        "Configuration loaded"
    );

    let store = open_store(&config.store).await?;
    let sink = Arc::new(PrometheusSink::new());
    let dispatcher = PacketDispatcher::new(store, sink.clone(), &config);

    if let Some(path) = &args.node_db {
        import_node_db(dispatcher.resolver(), path).await?;
    }

    let result = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            info!(path = %path.display(), "Reading packets from file");
            run_service(JsonLinesSource::new(BufReader::new(file)), dispatcher).await
        }
        None => {
            info!("Reading packets from stdin");
            run_service(stdin_source(), dispatcher).await
        }
    };
    if let Err(e) = &result {
        error!("Ingestion stopped: {:#}", e);
    }

    let exposition = sink.render()?;
    match &args.metrics_out {
        Some(path) => {
            tokio::fs::write(path, exposition.as_bytes())
                .await
                .with_context(|| format!("writing metrics {}", path.display()))?;
            info!(path = %path.display(), "Metrics written");
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(exposition.as_bytes()).await?;
            stdout.flush().await?;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("mesh-exporter-node").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults_pass_through() {
        let config = parse(&[]).apply(ExporterConfig::default()).unwrap();
        assert_eq!(config.dedup.flood_expire_time, Duration::from_secs(600));
        assert_eq!(config.metadata.ttl, Duration::from_secs(259_200));
        assert_eq!(
            config.store,
            StoreConfig::Memory {
                max_entries: mesh_exporter::DEFAULT_CACHE_MAX_ENTRIES
            }
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_flags_override_environment() {
        let env = ExporterConfig::from_lookup(|key: &str| match key {
            "FLOOD_EXPIRE_TIME" => Some("120".to_string()),
            "LOG_LEVEL" => Some("warn".to_string()),
            _ => None,
        })
        .unwrap();

        let config = parse(&["--flood-expire-time", "30", "--verbose"])
            .apply(env)
            .unwrap();
        assert_eq!(config.dedup.flood_expire_time, Duration::from_secs(30));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_redis_host_implies_redis_store() {
        let config = parse(&["--redis-host", "cache.local"])
            .apply(ExporterConfig::default())
            .unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Redis {
                host: "cache.local".to_string(),
                port: 6379
            }
        );
    }

    #[test]
    fn test_memory_store_flag_overrides_redis_env() {
        let env = ExporterConfig::from_lookup(|key: &str| match key {
            "STORE_BACKEND" => Some("redis".to_string()),
            _ => None,
        })
        .unwrap();
        let config = parse(&["--store", "memory", "--cache-max-entries", "500"])
            .apply(env)
            .unwrap();
        assert_eq!(config.store, StoreConfig::Memory { max_entries: 500 });
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(parse(&["--flood-expire-time", "0"])
            .apply(ExporterConfig::default())
            .is_err());
    }

    #[tokio::test]
    async fn test_run_service_over_reader() {
        let store = Arc::new(mesh_exporter::MemoryStore::new());
        let sink = Arc::new(PrometheusSink::new());
        let dispatcher = PacketDispatcher::new(store, sink.clone(), &ExporterConfig::default());

        let input = format!(
            "{}\n{}\n",
            mesh_exporter::test_utils::fixtures::NODEINFO_PACKET,
            mesh_exporter::test_utils::fixtures::TELEMETRY_PACKET
        );
        let source = JsonLinesSource::new(BufReader::new(std::io::Cursor::new(input.into_bytes())));
        run_service(source, dispatcher).await.unwrap();

        let text = sink.render().unwrap();
        assert!(text.contains("meshtastic_telemetry_device_battery_level_percent"));
    }

    #[tokio::test]
    async fn test_line_reader_feeds_channel_source() {
        let input = format!(
            "{}\n\nnot json\n{}\n",
            mesh_exporter::test_utils::fixtures::TELEMETRY_PACKET,
            mesh_exporter::test_utils::fixtures::NODEINFO_PACKET
        );
        let (tx, mut source) = ChannelSource::channel(4);
        let reader = spawn_line_reader(std::io::Cursor::new(input.into_bytes()), tx);

        let first = source.next_packet().await.unwrap().unwrap();
        assert_eq!(first.id, Some(3259852062));
        let second = source.next_packet().await.unwrap().unwrap();
        assert_eq!(second.id, Some(662811674));
        assert!(source.next_packet().await.unwrap().is_none());
        reader.join().unwrap();
    }

    #[tokio::test]
    async fn test_line_reader_stops_when_service_is_gone() {
        let (tx, source) = ChannelSource::channel(1);
        drop(source);

        let input = std::iter::repeat(mesh_exporter::test_utils::fixtures::TELEMETRY_PACKET)
            .take(8)
            .collect::<Vec<_>>()
            .join("\n");
        spawn_line_reader(std::io::Cursor::new(input.into_bytes()), tx)
            .join()
            .unwrap();
    }
}
