//! CLI for xpgate.
//!
//! `xpgate decide` reads reward requests as JSON lines from a file or stdin
//! and writes one decision (or one error record) per line to stdout.
//! `xpgate policy` prints or checks policy files. Logs go to stderr and are
//! filtered through `RUST_LOG`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use xpgate_core::{PersonaDirectory, Policy, PolicyDocument, PolicyStore, RewardRequest};
use xpgate_engine::{CachedClassifier, DecisionEngine, EngineBuilder, Settings};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide rewards for JSON-lines requests
    Decide {
        /// Input file; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Policy file (.json or .toml); overrides XPGATE_POLICY_PATH
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Persona directory (JSON); overrides XPGATE_PERSONA_PATH
        #[arg(long)]
        personas: Option<PathBuf>,
    },
    /// Inspect policy files
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Print the effective policy, defaults filled in
    Show {
        /// Policy file; the built-in default when omitted
        #[arg(long)]
        policy: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Parse and validate a policy file
    Validate {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Toml,
}

impl Format {
    /// `.toml` files are TOML, everything else is read as JSON.
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

/// Written in place of a decision when a line could not be decided.
#[derive(Debug, Serialize)]
struct Failure {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<String>,
    error: String,
    retryable: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Summary {
    decided: usize,
    failed: usize,
}

impl Summary {
    fn total(self) -> usize {
        self.decided + self.failed
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_policy_document(path: &Path) -> Result<PolicyDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy {}", path.display()))?;
    let doc = match Format::of(path) {
        Format::Toml => toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML policy {}", path.display()))?,
        Format::Json => serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse JSON policy {}", path.display()))?,
    };
    Ok(doc)
}

fn load_policy(path: Option<&Path>) -> Result<Policy> {
    let doc = match path {
        Some(path) => load_policy_document(path)?,
        None => {
            info!("no policy file given, using the built-in default");
            PolicyDocument::default()
        }
    };
    Policy::from_document(&doc).with_context(|| format!("policy '{}' is invalid", doc.version))
}

fn render_policy(doc: &PolicyDocument, format: Format) -> Result<String> {
    match format {
        Format::Json => serde_json::to_string_pretty(doc).context("failed to render policy"),
        Format::Toml => toml::to_string_pretty(doc).context("failed to render policy"),
    }
}

fn load_personas(path: Option<&Path>) -> Result<PersonaDirectory> {
    let Some(path) = path else {
        warn!("no persona directory given, every user is classified NEW");
        return Ok(PersonaDirectory::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read personas {}", path.display()))?;
    let directory = PersonaDirectory::from_json(&raw)
        .with_context(|| format!("failed to parse personas {}", path.display()))?;
    info!(users = directory.len(), "persona directory loaded");
    Ok(directory)
}

fn build_engine(
    settings: &Settings,
    policy: Policy,
    directory: PersonaDirectory,
) -> Result<DecisionEngine> {
    info!(version = policy.version(), "policy loaded");
    let policies = Arc::new(PolicyStore::new(policy));
    let classifier = Arc::new(CachedClassifier::new(
        Arc::new(directory),
        settings.persona_cache_ttl,
    ));
    let builder = DecisionEngine::builder(policies, classifier).config(settings.engine.clone());
    Ok(attach_shared_store(builder, settings)?.build())
}

#[cfg(feature = "redis-store")]
fn attach_shared_store(builder: EngineBuilder, settings: &Settings) -> Result<EngineBuilder> {
    use xpgate_engine::{FailoverCache, RedisStore, StoreBackedCache, StoreLedger};

    let Some(url) = settings.redis_url.as_deref() else {
        warn_per_instance();
        return Ok(builder);
    };
    let store = Arc::new(RedisStore::open(url).context("invalid XPGATE_REDIS_URL")?);
    let primary = StoreBackedCache::new(Arc::clone(&store))
        .with_op_timeout(settings.engine.store_timeout);
    let cache = FailoverCache::new(Arc::new(primary), settings.failover_retry_interval);
    info!("idempotency cache and spend ledger backed by redis");
    Ok(builder
        .cache(Arc::new(cache))
        .ledger(Arc::new(StoreLedger::new(store))))
}

#[cfg(not(feature = "redis-store"))]
fn attach_shared_store(builder: EngineBuilder, settings: &Settings) -> Result<EngineBuilder> {
    if settings.redis_url.is_some() {
        warn!("XPGATE_REDIS_URL is set but this build has no redis-store feature; ignoring it");
    }
    warn_per_instance();
    Ok(builder)
}

fn warn_per_instance() {
    warn!("no shared store: idempotency and daily caps hold per instance only");
}

fn emit<W: Write, T: Serialize>(out: &mut W, record: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, record).context("failed to encode output")?;
    out.write_all(b"\n").context("failed to write output")?;
    Ok(())
}

/// Decides every non-blank line of `reader` in order. Per-line failures are
/// written as [`Failure`] records and counted; only I/O errors abort.
async fn decide_lines<R: BufRead, W: Write>(
    engine: &DecisionEngine,
    reader: R,
    mut out: W,
) -> Result<Summary> {
    let mut summary = Summary::default();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let number = idx + 1;

        let request: RewardRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(line = number, error = %err, "unparseable request");
                summary.failed += 1;
                emit(
                    &mut out,
                    &Failure {
                        line: number,
                        transaction_id: None,
                        error: format!("invalid request: {err}"),
                        retryable: false,
                    },
                )?;
                continue;
            }
        };

        match engine.decide(&request).await {
            Ok(decision) => {
                summary.decided += 1;
                emit(&mut out, &decision.to_response())?;
            }
            Err(err) => {
                summary.failed += 1;
                emit(
                    &mut out,
                    &Failure {
                        line: number,
                        transaction_id: Some(request.transaction_id),
                        error: err.to_string(),
                        retryable: err.is_retryable(),
                    },
                )?;
            }
        }
    }
    out.flush().context("failed to flush output")?;
    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Decide {
            input,
            policy,
            personas,
        } => {
            let settings = Settings::from_env().context("invalid environment configuration")?;
            let policy_path = policy.or_else(|| settings.policy_path.clone());
            let persona_path = personas.or_else(|| settings.persona_path.clone());

            let policy = load_policy(policy_path.as_deref())?;
            let directory = load_personas(persona_path.as_deref())?;
            let marks = directory.last_rewards();
            let engine = build_engine(&settings, policy, directory)?;
            let seeded = engine.seed_last_rewards(marks).await;
            if seeded > 0 {
                info!(users = seeded, "reward cooldowns seeded from the persona directory");
            }

            let stdout = std::io::stdout();
            let summary = match input {
                Some(path) => {
                    let file = File::open(&path)
                        .with_context(|| format!("failed to open input {}", path.display()))?;
                    decide_lines(&engine, BufReader::new(file), stdout.lock()).await?
                }
                None => decide_lines(&engine, std::io::stdin().lock(), stdout.lock()).await?,
            };

            info!(
                decided = summary.decided,
                failed = summary.failed,
                "decide finished"
            );
            if summary.failed > 0 {
                anyhow::bail!("{} of {} requests failed", summary.failed, summary.total());
            }
        }
        Commands::Policy { action } => match action {
            PolicyCommand::Show { policy, format } => {
                let settings = Settings::from_env().context("invalid environment configuration")?;
                let path = policy.or(settings.policy_path);
                let policy = load_policy(path.as_deref())?;
                println!("{}", render_policy(&policy.to_document(), format)?);
            }
            PolicyCommand::Validate { file } => {
                let policy = load_policy(Some(&file))?;
                println!("{}: policy '{}' is valid", file.display(), policy.version());
            }
        },
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::Value;
    use xpgate_core::{Persona, PersonaRecord};

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("xpgate_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn request_line(txn: &str, user: &str, amount: u32) -> String {
        format!(
            r#"{{"transaction_id":"{txn}","user_id":"{user}","merchant_id":"m1","amount":{amount},"transaction_type":"purchase"}}"#
        )
    }

    fn engine() -> DecisionEngine {
        let directory = PersonaDirectory::default();
        directory.upsert(
            "u_ret",
            PersonaRecord {
                persona: Some(Persona::Returning),
                lifetime_purchases: 3,
                last_reward_ts: None,
            },
        );
        let policy = Policy::from_document(&PolicyDocument::default()).unwrap();
        build_engine(&Settings::default(), policy, directory).unwrap()
    }

    #[test]
    fn format_follows_the_extension() {
        assert_eq!(Format::of(Path::new("policy.toml")), Format::Toml);
        assert_eq!(Format::of(Path::new("policy.TOML")), Format::Toml);
        assert_eq!(Format::of(Path::new("policy.json")), Format::Json);
        assert_eq!(Format::of(Path::new("policy")), Format::Json);
    }

    #[test]
    fn rendered_toml_loads_back() {
        let expected = Policy::from_document(&PolicyDocument::default()).unwrap();
        let dir = scratch("toml_roundtrip");
        let path = dir.join("policy.toml");
        std::fs::write(&path, render_policy(&expected.to_document(), Format::Toml).unwrap())
            .unwrap();

        let loaded = load_policy(Some(&path)).unwrap();
        assert_eq!(loaded.to_document(), expected.to_document());
    }

    #[test]
    fn invalid_policy_names_the_problem() {
        let mut doc = serde_json::to_value(PolicyDocument::default()).unwrap();
        doc["version"] = Value::from("v-bad");
        doc["xp"]["persona_multipliers"]["POWER"] = Value::from("0");
        let dir = scratch("invalid_policy");
        let path = dir.join("policy.json");
        std::fs::write(&path, doc.to_string()).unwrap();

        let err = load_policy(Some(&path)).unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("policy 'v-bad' is invalid"));
        assert!(chain.contains("multiplier for POWER"));
    }

    #[test]
    fn missing_policy_file_is_reported() {
        let dir = scratch("missing_policy");
        let err = load_policy(Some(&dir.join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read policy"));
    }

    #[test]
    fn personas_load_from_json() {
        let dir = scratch("personas");
        let path = dir.join("personas.json");
        std::fs::write(
            &path,
            r#"{"u1": {"persona": "POWER"}, "u2": {"lifetime_purchases": 4}}"#,
        )
        .unwrap();

        let directory = load_personas(Some(&path)).unwrap();
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.record("u2").unwrap().persona(), Persona::Returning);
        assert!(load_personas(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn decide_lines_reports_each_line() {
        let engine = engine();
        let input = [
            request_line("t1", "u_ret", 1000),
            String::new(),
            "{not json".to_string(),
            request_line("t1", "u_ret", 1000),
            request_line("t1", "u_ret", 999),
        ]
        .join("\n");
        let mut out = Vec::new();

        let summary = decide_lines(&engine, input.as_bytes(), &mut out).await.unwrap();
        assert_eq!(
            summary,
            Summary {
                decided: 2,
                failed: 2
            }
        );

        let records: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["xp"], 150);
        assert_eq!(records[0]["meta"]["persona"], "RETURNING");
        assert_eq!(records[0]["decision_id"], records[2]["decision_id"]);

        assert_eq!(records[1]["line"], 3);
        assert_eq!(records[1]["retryable"], false);
        assert!(records[1].get("transaction_id").is_none());

        assert_eq!(records[3]["line"], 5);
        assert_eq!(records[3]["transaction_id"], "t1");
        assert_eq!(records[3]["retryable"], false);
    }
}
