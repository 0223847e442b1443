use anyhow::{Context, Result, bail};
use cachet_core::config::BackendKind;
use cachet_core::{
    CacheEngine, CachedValue, EncodingKind, EngineConfig, EntryEncoding, PerformanceReport,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "cachet")]
#[command(version, about = "Cachet - adaptive cache inspection tool", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Synap server URL (switches the backend to synap)
    #[arg(short, long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a key without knowing its type
    Get { key: String },

    /// Store a JSON value (plain text is stored as a string)
    Set {
        key: String,
        value: String,
        /// Expiry in seconds, 0 for none
        #[arg(short, long, default_value_t = 0)]
        ttl: u64,
        /// flat, structured or auto (classifier decides when omitted)
        #[arg(short, long)]
        encoding: Option<EncodingKind>,
    },

    /// Read selected fields of a structured entry
    Fields {
        key: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },

    /// Show encoding, size and TTL of a key
    Inspect { key: String },

    /// Delete every key matching a glob pattern
    Evict { pattern: String },

    /// Time set/get rounds under each encoding and print the scores
    Profile {
        key: String,
        #[arg(short, long, default_value_t = 100)]
        rounds: usize,
    },
}

/// Payload written by `profile`
#[derive(Serialize, Deserialize)]
struct ProfileSample {
    id: u64,
    name: String,
    email: String,
    score: f64,
    active: bool,
    tags: Vec<String>,
}

impl ProfileSample {
    fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("sample-{}", id),
            email: format!("sample{}@example.com", id),
            score: id as f64 * 1.5,
            active: id % 2 == 0,
            tags: vec!["cachet".to_string(), "profile".to_string()],
        }
    }
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(url) = &args.url {
        config.backend.kind = BackendKind::Synap;
        config.backend.url = url.clone();
    }
    Ok(config)
}

fn init_logging(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.format == "pretty" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .pretty()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn ttl_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn encoding_label(encoding: EntryEncoding) -> String {
    match encoding {
        EntryEncoding::Structured => encoding.to_string().cyan().to_string(),
        EntryEncoding::Flat => encoding.to_string().green().to_string(),
        EntryEncoding::NotFound => encoding.to_string().dimmed().to_string(),
        EntryEncoding::Unknown | EntryEncoding::Error => encoding.to_string().red().to_string(),
    }
}

async fn cmd_get(engine: &CacheEngine, key: &str) -> Result<()> {
    match engine.get_value(key).await {
        Some(CachedValue::Flat(value)) => {
            println!("{} {}", "FLAT".green(), serde_json::to_string_pretty(&value)?);
        }
        Some(CachedValue::Fields(fields)) => {
            println!("{}", "STRUCTURED".cyan());
            let mut names: Vec<&String> = fields.keys().collect();
            names.sort();
            for name in names {
                println!("  {} = {}", name.bold(), fields[name]);
            }
        }
        Some(CachedValue::Typed(typed)) => {
            println!("{} {}", "STRUCTURED".cyan(), typed.type_name());
        }
        None => println!("{}", "(nil)".dimmed()),
    }
    Ok(())
}

async fn cmd_set(
    engine: &CacheEngine,
    key: &str,
    raw: &str,
    ttl: u64,
    encoding: Option<EncodingKind>,
) -> Result<()> {
    let value = parse_value(raw);
    let ttl = ttl_from_secs(ttl);

    // Arbitrary JSON objects are maps, so a structured write goes field by field
    let used = match (&value, encoding) {
        (Value::Object(object), Some(EncodingKind::Structured)) => {
            if object.is_empty() {
                bail!("cannot store an empty object as a structured entry");
            }
            let fields: Vec<(&str, Value)> = object
                .iter()
                .map(|(name, value)| (name.as_str(), value.clone()))
                .collect();
            engine.delete(key).await.context("failed to replace entry")?;
            engine
                .set_fields(key, &fields, ttl)
                .await
                .context("failed to write fields")?;
            EncodingKind::Structured
        }
        (_, Some(kind)) => engine
            .set_with_encoding(key, &value, ttl, kind)
            .await
            .context("failed to set value")?,
        (_, None) => engine
            .set(key, &value, ttl)
            .await
            .context("failed to set value")?,
    };

    println!("{} ({})", "OK".green(), used);
    Ok(())
}

async fn cmd_fields(engine: &CacheEngine, key: &str, fields: &[String]) -> Result<()> {
    let names: Vec<&str> = fields.iter().map(String::as_str).collect();
    let values = engine.get_fields(key, &names).await;
    for name in names {
        match values.get(name) {
            Some(value) => println!("{} = {}", name.bold(), value),
            None => println!("{} = {}", name.bold(), "(nil)".dimmed()),
        }
    }
    Ok(())
}

async fn cmd_inspect(engine: &CacheEngine, key: &str) -> Result<()> {
    let info = engine.inspect(key).await;
    println!("{}      {}", "key".bold(), info.key);
    println!("{} {}", "encoding".bold(), encoding_label(info.encoding));
    println!("{}     {}", "size".bold(), info.size);
    let ttl = match info.ttl_seconds {
        -2 => "missing".dimmed().to_string(),
        -1 => "none".to_string(),
        secs => format!("{}s", secs),
    };
    println!("{}      {}", "ttl".bold(), ttl);
    if info.encoding == EntryEncoding::Error {
        bail!("store unavailable while inspecting {}", key);
    }
    Ok(())
}

async fn cmd_evict(engine: &CacheEngine, pattern: &str) -> Result<()> {
    let report = engine.evict(pattern).await;
    println!(
        "{} matched, {} deleted",
        report.matched.to_string().bold(),
        report.deleted.to_string().bold()
    );
    if !report.complete {
        bail!(
            "eviction of {} incomplete: {}",
            pattern,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_profile(engine: &CacheEngine, key: &str, rounds: usize) -> Result<()> {
    if rounds == 0 {
        bail!("rounds must be greater than 0");
    }

    for kind in [EncodingKind::Flat, EncodingKind::Structured] {
        let start = Instant::now();
        for round in 0..rounds {
            let sample = ProfileSample::new(round as u64);
            engine
                .set_with_encoding(key, &sample, None, kind)
                .await
                .with_context(|| format!("{} write failed in round {}", kind, round))?;
            if engine.get::<ProfileSample>(key).await.is_none() {
                bail!("{} read returned nothing in round {}", kind, round);
            }
        }
        debug!("{} rounds of {} took {:?}", rounds, kind, start.elapsed());
    }

    engine.delete(key).await?;
    print_report(&engine.performance_report(), key);
    Ok(())
}

fn print_report(report: &PerformanceReport, key: &str) {
    let Some(line) = report.keys.iter().find(|line| line.key == key) else {
        println!("{}", "no observations".dimmed());
        return;
    };

    println!("{} {}", "key".bold(), line.key);
    println!(
        "{:<12} {:>8} {:>8} {:>12} {:>10} {:>10}",
        "encoding", "reads", "writes", "avg (ms)", "success", "score"
    );
    for (name, stats) in [("FLAT", &line.flat), ("STRUCTURED", &line.structured)] {
        println!(
            "{:<12} {:>8} {:>8} {:>12.4} {:>9.1}% {:>10.2}",
            name,
            stats.reads,
            stats.writes,
            stats.avg_latency_ms,
            stats.success_rate * 100.0,
            stats.score
        );
    }
    println!(
        "{} {}",
        "recommended".bold(),
        line.recommended.to_string().green()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config);

    info!("Starting cachet v{}", env!("CARGO_PKG_VERSION"));
    let engine = CacheEngine::connect(config).context("failed to build cache engine")?;

    let result = match &args.command {
        Command::Get { key } => cmd_get(&engine, key).await,
        Command::Set {
            key,
            value,
            ttl,
            encoding,
        } => cmd_set(&engine, key, value, *ttl, *encoding).await,
        Command::Fields { key, fields } => cmd_fields(&engine, key, fields).await,
        Command::Inspect { key } => cmd_inspect(&engine, key).await,
        Command::Evict { pattern } => cmd_evict(&engine, pattern).await,
        Command::Profile { key, rounds } => cmd_profile(&engine, key, *rounds).await,
    };

    engine.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_falls_back_to_string() {
        assert_eq!(parse_value("42"), Value::from(42));
        assert_eq!(parse_value("{\"a\":1}")["a"], Value::from(1));
        assert_eq!(parse_value("hello world"), Value::from("hello world"));
    }

    #[test]
    fn test_ttl_zero_means_none() {
        assert_eq!(ttl_from_secs(0), None);
        assert_eq!(ttl_from_secs(30), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_url_switches_backend() {
        let args = Args::parse_from(["cachet", "--url", "http://cache:15500", "inspect", "k"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Synap);
        assert_eq!(config.backend.url, "http://cache:15500");
    }

    #[test]
    fn test_encoding_flag_parses() {
        let args = Args::parse_from(["cachet", "set", "k", "1", "--encoding", "structured"]);
        match args.command {
            Command::Set { encoding, .. } => assert_eq!(encoding, Some(EncodingKind::Structured)),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_structured_set_from_json_object() {
        let engine = CacheEngine::connect(EngineConfig::default()).unwrap();
        cmd_set(
            &engine,
            "user:1",
            "{\"name\":\"ann\",\"age\":3}",
            0,
            Some(EncodingKind::Structured),
        )
        .await
        .unwrap();
        assert_eq!(
            engine.inspect("user:1").await.encoding,
            EntryEncoding::Structured
        );
        let fields = engine.get_fields("user:1", &["age"]).await;
        assert_eq!(fields["age"], Value::from(3));
    }
}
