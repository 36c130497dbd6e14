//! CLI command implementations

use crate::output::{self, format_bytes, print_json};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, NetworkArg, OutputFormat};
use anyhow::{anyhow, bail, Context as _, Result};
use console::style;
use fetchd_core::{ConfigStore, EngineHealth, FetchEngine, HttpExecutor, SqliteStore};
use fetchd_types::{
    Connectivity, DownloadId, DownloadRequest, DownloadStatus, EngineConfig, GroupId,
    NetworkPolicy, Priority,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Data directory and output settings shared by every command
pub struct Context {
    files: ConfigStore,
    format: OutputFormat,
}

impl Context {
    pub async fn open(data_dir: PathBuf, format: OutputFormat) -> Result<Self> {
        let files = ConfigStore::new(&data_dir)
            .await
            .with_context(|| format!("cannot use data directory {}", data_dir.display()))?;
        Ok(Self { files, format })
    }

    async fn config(&self) -> Result<EngineConfig> {
        self.files
            .load()
            .await
            .with_context(|| format!("cannot read {}", self.files.config_path().display()))
    }

    async fn engine(&self, dispatch: bool, connectivity: Connectivity) -> Result<FetchEngine> {
        let config = self.config().await?;
        let store = Arc::new(SqliteStore::open(self.files.database_path()).await?);
        let executor = Arc::new(HttpExecutor::new(&config)?);
        let engine = FetchEngine::builder(store, executor)
            .config(config)
            .connectivity(connectivity)
            .dispatch(dispatch)
            .start()
            .await?;
        Ok(engine)
    }

    /// Engine that only edits records, for use next to a running `fetchd run`
    async fn manager(&self) -> Result<FetchEngine> {
        self.engine(false, Connectivity::unmetered()).await
    }
}

/// Accept a full id or a unique prefix of one
async fn resolve(engine: &FetchEngine, raw: &str) -> Result<DownloadId> {
    if let Ok(id) = raw.parse::<DownloadId>() {
        return Ok(id);
    }

    let needle = raw.to_lowercase();
    let matches: Vec<DownloadId> = engine
        .query_all()
        .await?
        .into_iter()
        .map(|record| record.id)
        .filter(|id| id.to_string().starts_with(&needle))
        .collect();

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No download matches '{}'", raw),
        _ => bail!("'{}' matches {} downloads, use more characters", raw, matches.len()),
    }
}

/// Run `f` against a manager engine and always shut it down
async fn with_manager<T, F, Fut>(ctx: &Context, f: F) -> Result<T>
where
    F: FnOnce(FetchEngine) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let engine = ctx.manager().await?;
    let result = f(engine.clone()).await;
    engine.shutdown().await?;
    result
}

fn done(ctx: &Context, message: &str, value: serde_json::Value) -> Result<()> {
    match ctx.format {
        OutputFormat::Json => print_json(&value),
        OutputFormat::Human | OutputFormat::Table => {
            println!("{} {}", style("✓").green().bold(), message);
            Ok(())
        }
    }
}

// ============================================================================
// Download Commands
// ============================================================================

pub struct AddOptions {
    pub name: Option<String>,
    pub group: Option<u32>,
    pub priority: Priority,
    pub unmetered_only: bool,
    pub headers: Vec<String>,
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Header must look like 'Name: value', got '{}'", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

pub async fn add_download(
    ctx: &Context,
    url: String,
    output: PathBuf,
    options: AddOptions,
) -> Result<()> {
    // `fetchd run` may start from another directory
    let destination = if output.is_absolute() {
        output
    } else {
        std::env::current_dir()?.join(output)
    };

    let mut request = DownloadRequest::new(url, destination).with_priority(options.priority);
    if let Some(name) = options.name {
        request = request.with_name(name);
    }
    if let Some(group) = options.group {
        request = request.with_group(GroupId(group));
    }
    if options.unmetered_only {
        request = request.with_network_policy(NetworkPolicy::UnmeteredOnly);
    }
    for raw in &options.headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }

    let record = with_manager(ctx, |engine| async move {
        let id = engine.enqueue(request).await?;
        engine
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("Download {} vanished after enqueue", id))
    })
    .await?;

    match ctx.format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Queued: {}",
                style("✓").green().bold(),
                style(&record.display_name).cyan()
            );
            println!("  ID: {}", record.id);
            println!("  File: {}", record.destination.display());
        }
    }
    Ok(())
}

pub async fn list_downloads(
    ctx: &Context,
    statuses: Vec<DownloadStatus>,
    group: Option<u32>,
    show_all: bool,
) -> Result<()> {
    let records = with_manager(ctx, |engine| async move {
        let records = match (group, statuses.is_empty()) {
            (Some(group), true) => engine.query_by_group(GroupId(group)).await?,
            (Some(group), false) => engine.query_group_by_status(GroupId(group), &statuses).await?,
            (None, true) => engine.query_all().await?,
            (None, false) => engine.query_by_status(&statuses).await?,
        };
        Ok(records)
    })
    .await?;

    match ctx.format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table => output::print_table(&records),
        OutputFormat::Human => {
            if records.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for record in &records {
                output::print_record(record, show_all);
            }
            println!();
            println!("{} download(s) total", style(records.len()).bold());
        }
    }

    Ok(())
}

pub async fn show_info(ctx: &Context, raw: &str) -> Result<()> {
    let record = with_manager(ctx, |engine| async move {
        let id = resolve(&engine, raw).await?;
        engine
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("Download {} not found", id))
    })
    .await?;

    match ctx.format {
        OutputFormat::Json => print_json(&record),
        _ => {
            output::print_record(&record, true);
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Op {
    Pause,
    Resume,
    Retry,
    Cancel,
    Remove,
}

impl Op {
    fn past(self) -> &'static str {
        match self {
            Op::Pause => "paused",
            Op::Resume => "resumed",
            Op::Retry => "queued for retry",
            Op::Cancel => "cancelled",
            Op::Remove => "removed",
        }
    }
}

pub async fn single(ctx: &Context, op: Op, raw: &str) -> Result<()> {
    let id = with_manager(ctx, |engine| async move {
        let id = resolve(&engine, raw).await?;
        match op {
            Op::Pause => engine.pause(id).await?,
            Op::Resume => engine.resume(id).await?,
            Op::Retry => engine.retry(id).await?,
            Op::Cancel => engine.cancel(id).await?,
            Op::Remove => engine.remove(id).await?,
        }
        Ok(id)
    })
    .await?;

    done(
        ctx,
        &format!("Download {} {}", id.short(), op.past()),
        json!({ "id": id, "result": op.past() }),
    )
}

pub async fn delete_download(ctx: &Context, raw: &str) -> Result<()> {
    let id = with_manager(ctx, |engine| async move {
        let id = resolve(&engine, raw).await?;
        engine.delete(id).await?;
        Ok(id)
    })
    .await?;

    done(
        ctx,
        &format!("Download {} deleted with its file", id.short()),
        json!({ "id": id, "result": "deleted" }),
    )
}

pub async fn all(ctx: &Context, op: Op) -> Result<()> {
    with_manager(ctx, |engine| async move {
        match op {
            Op::Pause => engine.pause_all().await?,
            Op::Resume => engine.resume_all().await?,
            Op::Retry => engine.retry_all().await?,
            Op::Cancel => engine.cancel_all().await?,
            Op::Remove => engine.remove_all().await?,
        }
        Ok(())
    })
    .await?;

    done(
        ctx,
        &format!("All downloads {}", op.past()),
        json!({ "result": op.past() }),
    )
}

pub async fn group(ctx: &Context, op: Op, group: u32) -> Result<()> {
    let group = GroupId(group);
    with_manager(ctx, |engine| async move {
        match op {
            Op::Pause => engine.pause_group(group).await?,
            Op::Resume => engine.resume_group(group).await?,
            Op::Retry => engine.retry_group(group).await?,
            Op::Cancel => engine.cancel_group(group).await?,
            Op::Remove => engine.remove_group(group).await?,
        }
        Ok(())
    })
    .await?;

    done(
        ctx,
        &format!("Group {} {}", group, op.past()),
        json!({ "group": group, "result": op.past() }),
    )
}

// ============================================================================
// Run
// ============================================================================

fn connectivity(network: NetworkArg) -> Connectivity {
    match network {
        NetworkArg::Unmetered => Connectivity::unmetered(),
        NetworkArg::Cellular => Connectivity::cellular(),
        NetworkArg::Offline => Connectivity::offline(),
    }
}

/// Report `online` while `target` accepts TCP connections, offline otherwise
async fn probe_connectivity(target: String, online: Connectivity, tx: watch::Sender<Connectivity>) {
    let mut tick = tokio::time::interval(PROBE_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !tx.is_closed() {
        tick.tick().await;
        let reachable = matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target.as_str())).await,
            Ok(Ok(_))
        );
        let next = if reachable { online } else { Connectivity::offline() };

        let changed = tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!("Probe of {}: {}", target, if reachable { "reachable" } else { "unreachable" });
        }
    }
}

pub async fn run(ctx: &Context, network: NetworkArg, probe: Option<String>, stay: bool) -> Result<()> {
    let online = connectivity(network);
    let engine = ctx.engine(true, online).await?;
    let idle_after = Duration::from_millis(engine.config().idle_shutdown_ms);

    let bars = Arc::new(DownloadProgress::new());
    let pending = engine
        .query_by_status(&[
            DownloadStatus::Queued,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
        ])
        .await?;
    for record in &pending {
        bars.track(record);
    }
    let listener = engine.register(bars.clone());

    let probe_task = probe.map(|target| {
        let (tx, rx) = watch::channel(online);
        let forward = engine.watch_connectivity(rx);
        let probe = tokio::spawn(probe_connectivity(target, online, tx));
        (probe, forward)
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(IDLE_CHECK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut idle_since: Option<Instant> = None;

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
            _ = tick.tick() => {
                if let EngineHealth::Halted { reason } = engine.health() {
                    break Err(anyhow!("Engine halted: {}", reason));
                }
                if stay {
                    continue;
                }
                match engine.is_idle().await {
                    Ok(true) => {
                        let since = *idle_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= idle_after {
                            debug!("Idle for {:?}, exiting", idle_after);
                            break Ok(());
                        }
                    }
                    Ok(false) => idle_since = None,
                    Err(e) => break Err(e.into()),
                }
            }
        }
    };

    if let Some((probe, forward)) = probe_task {
        probe.abort();
        forward.abort();
    }
    engine.unregister(listener);
    let shutdown = engine.shutdown().await;
    bars.clear();

    let records = engine.query_all().await.unwrap_or_default();
    let count = |status: DownloadStatus| records.iter().filter(|r| r.status == status).count();
    match ctx.format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Human | OutputFormat::Table => println!(
            "{} completed, {} paused, {} failed, {} queued",
            style(count(DownloadStatus::Completed)).green(),
            style(count(DownloadStatus::Paused)).yellow(),
            style(count(DownloadStatus::Failed)).red(),
            count(DownloadStatus::Queued),
        ),
    }

    outcome?;
    shutdown.context("Shutdown failed")?;
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

fn config_map(config: &EngineConfig) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(config)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("config did not serialize to an object"),
    }
}

/// Parse `raw` as the same JSON type the key currently holds
fn parse_config_value(current: &serde_json::Value, raw: &str) -> Result<serde_json::Value> {
    Ok(match current {
        serde_json::Value::Number(_) => {
            let n: u64 = raw
                .parse()
                .with_context(|| format!("'{}' is not a non-negative integer", raw))?;
            json!(n)
        }
        serde_json::Value::Bool(_) => json!(raw.parse::<bool>()?),
        _ => json!(raw),
    })
}

pub async fn config_action(ctx: &Context, action: Option<ConfigAction>) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let config = ctx.config().await?;
            match ctx.format {
                OutputFormat::Json => print_json(&config)?,
                _ => {
                    println!("fetchd configuration ({})", ctx.files.config_path().display());
                    println!();
                    println!("  Max concurrent downloads: {}", config.max_concurrent);
                    println!(
                        "  Default network policy: {}",
                        config.default_network_policy.as_str()
                    );
                    println!("  Progress interval: {} ms", config.progress_interval_ms);
                    println!("  Stop grace: {} ms", config.stop_grace_ms);
                    println!("  Idle shutdown: {} ms", config.idle_shutdown_ms);
                    println!("  Reconcile interval: {} ms", config.reconcile_interval_ms);
                    println!("  Throughput window: {} samples", config.throughput_window);
                    println!("  Event capacity: {}", config.event_capacity);
                    println!("  User agent: {}", config.user_agent);
                    println!("  Connect timeout: {} s", config.connect_timeout_secs);
                    println!("  Data directory: {}", ctx.files.data_dir().display());
                    println!(
                        "  Database: {} ({})",
                        ctx.files.database_path().display(),
                        tokio::fs::metadata(ctx.files.database_path())
                            .await
                            .map(|m| format_bytes(m.len()))
                            .unwrap_or_else(|_| "not created".to_string())
                    );
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let config = ctx.config().await?;
            let map = config_map(&config)?;
            let value = map
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            match value {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", other),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let config = ctx.config().await?;
            let mut map = config_map(&config)?;
            let current = map
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            let parsed = parse_config_value(current, &value)?;
            map.insert(key.clone(), parsed);

            let updated: EngineConfig = serde_json::from_value(serde_json::Value::Object(map))
                .with_context(|| format!("invalid value for {}: {}", key, value))?;
            if updated.max_concurrent == 0 {
                bail!("max_concurrent must be at least 1");
            }
            ctx.files.save(&updated).await?;
            done(
                ctx,
                &format!("{} set to {} (applies to the next run)", key, value),
                json!({ "key": key, "value": value }),
            )?;
        }

        Some(ConfigAction::Reset { yes }) => {
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                ctx.files.reset().await?;
                done(ctx, "Settings reset to defaults", json!({ "result": "reset" }))?;
            }
        }
    }

    Ok(())
}
