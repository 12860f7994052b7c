//! CLI for the metric-store time-series store.
//!
//! Provides commands for serving ingestion, inspecting and querying stores,
//! sending points, and managing remote rule managers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use metric_store::rules::{RemoteRuleManager, RuleManager, RuleManagerConfig};
use metric_store::transport::TcpSender;
use metric_store::{
    Batch, IngestServer, MemoryRegistrar, NoopRegistrar, QueryAuthorizer, RetentionWorker,
    Store, StoreConfig,
};
use tracing_subscriber::EnvFilter;

/// metric-store: multi-tenant time-series metric store CLI.
#[derive(Parser)]
#[command(name = "metric-store", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion server and retention loop on a store.
    Serve {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Address to accept ingestion connections on.
        #[arg(long, default_value = "127.0.0.1:8090")]
        listen: String,

        /// JSON store configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the retention age in days.
        #[arg(long)]
        retention_days: Option<u32>,

        /// Override the minimum free disk ratio.
        #[arg(long)]
        min_free_ratio: Option<f64>,

        /// Close connections idle for this long (e.g., "30s", "5m").
        #[arg(long, default_value = "5m")]
        idle_timeout: String,
    },

    /// Display store metadata, shards, and series counts.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Print statistics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run a PromQL selector query against a store.
    Query {
        /// Path to the store directory.
        store_path: PathBuf,

        /// PromQL query; every term must carry a `source_id` matcher.
        query: String,

        /// Source ids the caller may read. Defaults to whatever the query names.
        #[arg(long = "source-id")]
        source_ids: Vec<String>,

        /// Time range to query, ending now (e.g., "1h", "30m", "7d").
        #[arg(long, default_value = "1h")]
        range: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Send points from a JSON file to an ingestion server.
    Send {
        /// Server address.
        addr: SocketAddr,

        /// JSON array of points.
        file: PathBuf,

        /// Points per frame.
        #[arg(long, default_value = "1000")]
        batch_size: usize,

        /// Connect and write timeout (e.g., "5s").
        #[arg(long, default_value = "5s")]
        timeout: String,
    },

    /// Manage rule managers on a remote rules API.
    Rules {
        /// Base URL of the rules API.
        #[arg(long)]
        api: String,

        #[command(subcommand)]
        action: RulesAction,
    },
}

/// Rules API actions.
#[derive(Subcommand)]
enum RulesAction {
    /// Create a rule manager.
    CreateManager {
        /// Manager id.
        id: String,

        /// Alertmanager to notify.
        #[arg(long)]
        alertmanager_url: Option<String>,
    },

    /// Delete a rule manager.
    DeleteManager {
        /// Manager id.
        id: String,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            store_path,
            listen,
            config,
            retention_days,
            min_free_ratio,
            idle_timeout,
        } => load_config(config.as_deref(), retention_days, min_free_ratio)
            .and_then(|config| cmd_serve(&store_path, &listen, config, &idle_timeout)),
        Commands::Info { store_path, json } => cmd_info(&store_path, json),
        Commands::Query {
            store_path,
            query,
            source_ids,
            range,
            format,
        } => cmd_query(&store_path, &query, &source_ids, &range, &format),
        Commands::Send {
            addr,
            file,
            batch_size,
            timeout,
        } => cmd_send(addr, &file, batch_size, &timeout),
        Commands::Rules { api, action } => cmd_rules(&api, action),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Builds the store configuration from an optional file plus flag overrides.
fn load_config(
    path: Option<&Path>,
    retention_days: Option<u32>,
    min_free_ratio: Option<f64>,
) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(days) = retention_days {
        config = config.with_retention_days(days);
    }
    if let Some(ratio) = min_free_ratio {
        config = config.with_min_disk_free_ratio(ratio);
    }
    config.validate()?;
    Ok(config)
}

/// Implements `metric-store serve <store_path>`.
fn cmd_serve(
    store_path: &Path,
    listen: &str,
    config: StoreConfig,
    idle_timeout: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let idle_timeout = parse_duration(idle_timeout)?;
    let interval = config.retention_interval;
    let registrar = Arc::new(MemoryRegistrar::new());

    let store = Arc::new(Store::open(store_path, config, registrar.clone())?);
    let _retention = RetentionWorker::spawn(store.clone(), interval)?;
    let server = IngestServer::bind(listen, store, registrar, idle_timeout)?;

    tracing::info!(
        store = %store_path.display(),
        addr = %server.local_addr()?,
        "serving"
    );
    server.run();
    Ok(())
}

/// Implements `metric-store info <store_path>`.
fn cmd_info(store_path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(store_path)?;
    let stats = store.stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Store: {}", store_path.display());
    println!("  Shards: {}", stats.shard_count);
    println!("  Series: {}", stats.series_count);
    println!("  Measurements: {}", stats.measurement_count);
    println!("  Points: {}", stats.point_count);
    println!("  Size: {}", format_bytes(stats.byte_size));
    println!();

    for shard in &stats.shards {
        let end = shard
            .end
            .map_or_else(|| "active".to_string(), |end| end.to_string());
        println!(
            "  Shard {:>6}: [{}, {})  {} points, {} series, {}",
            shard.id,
            shard.start,
            end,
            shard.point_count,
            shard.series_count,
            format_bytes(shard.byte_size)
        );
    }

    Ok(())
}

/// Implements `metric-store query <store_path> <query>`.
fn cmd_query(
    store_path: &Path,
    query: &str,
    source_ids: &[String],
    range: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let expr = metric_store::promql::parse(query)?;
    let authorizer = QueryAuthorizer::default();
    let tenants = if source_ids.is_empty() {
        authorizer.extract_source_ids(&expr)?
    } else {
        authorizer.authorize(&expr, source_ids)?
    };

    let store = open_existing(store_path)?;
    let range_ms = i64::try_from(parse_duration(range)?.as_millis())?;
    let end = now_ms()? + 1;
    let start = end.saturating_sub(range_ms);

    let result = store.select_all(&expr, start, end)?;

    match format {
        OutputFormat::Csv => {
            let tenants: Vec<&str> = tenants.iter().map(String::as_str).collect();
            println!(
                "# source_ids={}, series={}, points={}",
                tenants.join(","),
                result.len(),
                result.sample_count()
            );
            println!("series,timestamp_ms,value");
            for series in result.iter() {
                let name = series_name(series).replace('"', "\"\"");
                for sample in &series.samples {
                    println!("\"{name}\",{},{}", sample.timestamp, sample.value);
                }
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "source_ids": tenants,
                "start_ms": start,
                "end_ms": end,
                "series": result.series,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `metric-store send <addr> <file>`.
fn cmd_send(
    addr: SocketAddr,
    file: &Path,
    batch_size: usize,
    timeout: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if batch_size == 0 {
        return Err("batch size must be at least 1".into());
    }
    let data = std::fs::read_to_string(file)?;
    let batch: Batch = serde_json::from_str(&data)?;

    let mut sender = TcpSender::connect(addr, parse_duration(timeout)?)?;
    let mut frames = 0;
    for chunk in batch.points.chunks(batch_size) {
        sender.send(&Batch::new(chunk.to_vec()))?;
        frames += 1;
    }

    println!("Sent {} points in {frames} frames to {addr}", batch.len());
    Ok(())
}

/// Implements `metric-store rules`.
fn cmd_rules(api: &str, action: RulesAction) -> Result<(), Box<dyn std::error::Error>> {
    let rules = RemoteRuleManager::new(RuleManagerConfig::new(api))?;
    match action {
        RulesAction::CreateManager {
            id,
            alertmanager_url,
        } => {
            rules.create_manager(&id, alertmanager_url.as_deref())?;
            println!("Created rule manager '{id}'");
        }
        RulesAction::DeleteManager { id } => {
            rules.delete_manager(&id)?;
            println!("Deleted rule manager '{id}'");
        }
    }
    Ok(())
}

/// Opens an existing store read-only, leaving its files untouched.
fn open_existing(store_path: &Path) -> Result<Store, Box<dyn std::error::Error>> {
    if !store_path.join("meta.json").exists() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }
    Ok(Store::open_read_only(store_path, Arc::new(NoopRegistrar))?)
}

/// Renders a series as `name{label="value", ...}`.
fn series_name(series: &metric_store::query::Series) -> String {
    let labels: Vec<String> = series
        .key
        .labels
        .iter()
        .map(|(k, v)| format!("{k}={v:?}"))
        .collect();
    format!("{}{{{}}}", series.key.metric_name, labels.join(", "))
}

fn now_ms() -> Result<i64, Box<dyn std::error::Error>> {
    Ok(i64::try_from(
        SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis(),
    )?)
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d").
fn parse_duration(s: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let Some((split, _)) = s.char_indices().last() else {
        return Err("Empty duration string".into());
    };
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str.parse()?;

    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };
    let secs = num
        .checked_mul(scale)
        .ok_or_else(|| format!("Duration '{s}' is too large"))?;

    Ok(Duration::from_secs(secs))
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5w").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_multibyte_unit() {
        assert!(parse_duration("5µ").is_err());
        assert!(parse_duration("µ").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        assert!(parse_duration("999999999999999999d").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_open_existing_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_existing(dir.path()).is_err());

        Store::open(dir.path(), StoreConfig::default(), Arc::new(NoopRegistrar)).unwrap();
        let store = open_existing(dir.path()).unwrap();
        assert!(store.is_read_only());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1_048_576), "3.0 MB");
    }

    #[test]
    fn test_load_config_overrides() {
        let config = load_config(None, Some(3), Some(0.25)).unwrap();
        assert_eq!(config.retention_max_age_days, 3);
        assert!((config.min_disk_free_ratio - 0.25).abs() < f64::EPSILON);
        assert!(load_config(None, None, Some(2.0)).is_err());
    }
}
