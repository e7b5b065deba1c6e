//! CLI command implementations

use crate::config;
use crate::output::{format_bytes, format_progress, status_icon, truncate_name};
use crate::progress::DownloadProgress;
use crate::{Commands, ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use console::style;
use segdl_core::{Conditions, DownloadDatabase, Engine, NewDownload, TokioScheduler};
use segdl_types::{ChangeableParams, DownloadInfo, EngineEvent, Settings, StatusCode};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use uuid::Uuid;

pub const DATABASE_FILE: &str = "segdl.db";

/// A running engine wired to the on-disk database
pub struct App {
    pub engine: Arc<Engine>,
}

impl App {
    pub async fn open(data_dir: &Path, settings: Settings) -> Result<Self> {
        let db = DownloadDatabase::new(data_dir.join(DATABASE_FILE)).await?;

        // No platform monitor here: the network is assumed up and unmetered
        let conditions = Conditions::default();
        let (scheduler, ready) = TokioScheduler::new(conditions.clone());
        let engine = Engine::new(db, settings, conditions, Arc::new(scheduler))?;
        tokio::spawn(Arc::clone(&engine).serve(ready));
        engine.watch_conditions();

        Ok(Self { engine })
    }
}

pub async fn execute(app: &App, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Add {
            url,
            dir,
            name,
            pieces,
            unmetered,
            headers,
            description,
            no_wait,
        } => {
            let new = NewDownload {
                url,
                dir_path: dir,
                file_name: name,
                description,
                num_pieces: pieces,
                unmetered_only: unmetered,
                headers: parse_headers(&headers)?,
            };
            add_download(app, new, no_wait, format).await
        }

        Commands::Run => run_all(app).await,

        Commands::List { status, all } => list_downloads(app, status, all, format).await,

        Commands::Info { id } => show_info(app, &id, format).await,

        Commands::Pause { id, all } => pause_download(app, id, all).await,

        Commands::Resume { id, all } => resume_download(app, id, all).await,

        Commands::Stop { id } => {
            let uuid = resolve_id(app, &id).await?;
            app.engine.stop(uuid).await?;
            println!("{} Download stopped", style("✓").green().bold());
            Ok(())
        }

        Commands::Delete { id, with_file } => {
            let uuid = resolve_id(app, &id).await?;
            app.engine.delete(uuid, with_file).await?;
            println!("{} Download deleted", style("✓").green().bold());
            Ok(())
        }

        Commands::Change {
            id,
            url,
            name,
            dir,
            pieces,
            description,
            unmetered,
            retry,
        } => {
            let params = ChangeableParams {
                url,
                description,
                unmetered_only: unmetered,
                retry,
                dir_path: dir,
                file_name: name,
                num_pieces: pieces,
            };
            change_download(app, &id, params).await
        }

        Commands::Config { .. } | Commands::Completions { .. } => {
            Err(anyhow!("Command does not need an engine"))
        }
    }
}

/// Parse `Name: value` header arguments
pub fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("Invalid header (expected \"Name: value\"): {}", header))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(anyhow!("Invalid header name: {}", header));
            }
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Accept a full id or an unambiguous prefix of one
async fn resolve_id(app: &App, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let matches: Vec<Uuid> = app
        .engine
        .db()
        .list_infos()
        .await?
        .into_iter()
        .map(|info| info.id)
        .filter(|uuid| uuid.to_string().starts_with(id))
        .collect();

    match matches.as_slice() {
        [uuid] => Ok(*uuid),
        [] => Err(anyhow!("No download matches {}", id)),
        _ => Err(anyhow!("{} matches {} downloads", id, matches.len())),
    }
}

// ============================================================================
// Download Commands
// ============================================================================

async fn add_download(app: &App, new: NewDownload, no_wait: bool, format: OutputFormat) -> Result<()> {
    let events = app.engine.subscribe();
    let info = app.engine.add_download(new).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Added download: {}",
                style("✓").green().bold(),
                style(&info.url).cyan()
            );
            println!("  ID: {}", info.id);
        }
    }

    if no_wait {
        return Ok(());
    }
    wait_for(app, vec![info], events).await
}

async fn run_all(app: &App) -> Result<()> {
    let events = app.engine.subscribe();
    let restored = app.engine.restore().await?;
    if restored == 0 {
        println!("{}", style("Nothing to download").dim());
        return Ok(());
    }

    let infos: Vec<DownloadInfo> = app
        .engine
        .db()
        .list_infos()
        .await?
        .into_iter()
        .filter(|info| in_flight(info.status_code))
        .collect();
    wait_for(app, infos, events).await
}

async fn pause_download(app: &App, id: Option<String>, all: bool) -> Result<()> {
    match id {
        Some(id) if !all => {
            let uuid = resolve_id(app, &id).await?;
            app.engine.pause(uuid).await?;
        }
        _ => app.engine.pause_all().await?,
    }
    println!("{} Paused", style("✓").green().bold());
    Ok(())
}

async fn resume_download(app: &App, id: Option<String>, all: bool) -> Result<()> {
    let events = app.engine.subscribe();
    let ids: Vec<Uuid> = match id {
        Some(id) if !all => {
            let uuid = resolve_id(app, &id).await?;
            app.engine.resume(uuid).await?;
            vec![uuid]
        }
        _ => {
            app.engine.resume_all().await?;
            app.engine
                .db()
                .list_infos()
                .await?
                .into_iter()
                .filter(|info| in_flight(info.status_code))
                .map(|info| info.id)
                .collect()
        }
    };

    let mut infos = Vec::new();
    for uuid in ids {
        if let Some(info) = app.engine.db().get_info(uuid).await? {
            if in_flight(info.status_code) {
                infos.push(info);
            }
        }
    }
    if infos.is_empty() {
        println!("{}", style("Nothing to resume").dim());
        return Ok(());
    }
    wait_for(app, infos, events).await
}

async fn change_download(app: &App, id: &str, params: ChangeableParams) -> Result<()> {
    let uuid = resolve_id(app, id).await?;
    let mut events = app.engine.subscribe();
    app.engine.change_params(uuid, params).await?;

    // Nothing is running in this process, so the change is applied synchronously
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::ParamsApplied { id, error } = event {
            if id != uuid {
                continue;
            }
            match error {
                Some(error) => println!(
                    "{} Changed, but the file stays where it was: {}",
                    style("!").yellow().bold(),
                    error
                ),
                None => println!("{} Download changed", style("✓").green().bold()),
            }
        }
    }
    Ok(())
}

/// Scheduled or already picked up by the engine
fn in_flight(status: StatusCode) -> bool {
    status.is_waiting() || status == StatusCode::Running
}

/// Show progress until every download settles or the user interrupts
async fn wait_for(
    app: &App,
    infos: Vec<DownloadInfo>,
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
) -> Result<()> {
    let mut progress = DownloadProgress::new();
    let mut pending: HashSet<Uuid> = HashSet::new();
    for info in &infos {
        progress.track(info);
        progress.seed(info.id, &app.engine.db().get_pieces(info.id).await?);
        pending.insert(info.id);
    }

    while !pending.is_empty() {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                progress.clear();
                println!(
                    "{} Interrupted; `segdl run` picks up where this left off",
                    style("!").yellow().bold()
                );
                return Ok(());
            }
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Progress display skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            EngineEvent::PieceProgress { id, .. } if progress.needs_refresh(*id) => {
                if let Some(info) = app.engine.db().get_info(*id).await? {
                    progress.refresh(&info);
                }
            }
            EngineEvent::Finished { id, status } if !status.is_waiting() => {
                pending.remove(id);
            }
            EngineEvent::StatusChanged { id, status, .. }
                if matches!(status, StatusCode::Paused | StatusCode::Stopped) =>
            {
                pending.remove(id);
            }
            EngineEvent::Deleted { id } => {
                pending.remove(id);
            }
            _ => {}
        }
        progress.handle_event(&event);
    }

    progress.clear();
    Ok(())
}

async fn list_downloads(
    app: &App,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let status_filter = status_filter
        .map(|s| s.parse::<StatusCode>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let mut filtered = Vec::new();
    for info in app.engine.db().list_infos().await? {
        if status_filter.is_some_and(|status| status != info.status_code) {
            continue;
        }
        let done = downloaded_bytes(app, &info).await?;
        filtered.push((info, done));
    }

    match format {
        OutputFormat::Json => {
            let infos: Vec<_> = filtered.iter().map(|(info, _)| info).collect();
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DownloadRow {
                id: String,
                file: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<DownloadRow> = filtered
                .iter()
                .map(|(info, done)| DownloadRow {
                    id: info.id.to_string()[..8].to_string(),
                    file: truncate_name(&info.file_name, 30),
                    size: info
                        .total_bytes
                        .map(format_bytes)
                        .unwrap_or_else(|| "?".to_string()),
                    progress: format_progress(*done, info.total_bytes),
                    status: info.status_code.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for (info, done) in &filtered {
                print_download_summary(info, *done, show_all);
            }
            println!();
            println!("{} download(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

/// Bytes already on disk, summed over the pieces
async fn downloaded_bytes(app: &App, info: &DownloadInfo) -> Result<u64> {
    let pieces = app.engine.db().get_pieces(info.id).await?;
    Ok(pieces
        .iter()
        .map(|piece| piece.cur_bytes.saturating_sub(info.piece_start(piece.index)))
        .sum())
}

fn print_download_summary(info: &DownloadInfo, done: u64, detailed: bool) {
    let name = if info.file_name.is_empty() {
        info.url.as_str()
    } else {
        info.file_name.as_str()
    };

    println!(
        "{} {} {} [{}]",
        status_icon(info.status_code),
        style(name).bold(),
        style(format_progress(done, info.total_bytes)).dim(),
        style(info.status_code).dim()
    );

    if detailed {
        println!("    ID: {}", info.id);
        println!("    URL: {}", info.url);
        println!("    Path: {}", info.file_path().display());
        if let Some(total) = info.total_bytes {
            println!("    Size: {} / {}", format_bytes(done), format_bytes(total));
        }
        println!(
            "    Pieces: {} ({})",
            info.num_pieces,
            if info.partial_support { "resumable" } else { "not resumable" }
        );
        if info.num_failed > 0 {
            println!("    Failed attempts: {}", info.num_failed);
        }
        if let Some(ref message) = info.status_msg {
            if info.status_code.is_error() {
                println!("    Error: {}", style(message).red());
            } else {
                println!("    Message: {}", message);
            }
        }
        if let Some(ref description) = info.description {
            println!("    Description: {}", description);
        }
        println!();
    }
}

async fn show_info(app: &App, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = resolve_id(app, id).await?;
    let info = app
        .engine
        .db()
        .get_info(uuid)
        .await?
        .ok_or_else(|| anyhow!("Download not found: {}", uuid))?;
    let pieces = app.engine.db().get_pieces(uuid).await?;

    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({ "info": info, "pieces": pieces });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            let done = downloaded_bytes(app, &info).await?;
            print_download_summary(&info, done, true);
            for piece in &pieces {
                let start = info.piece_start(piece.index);
                println!(
                    "    #{:<3} {} {} [{}]",
                    piece.index,
                    status_icon(piece.status_code),
                    format_progress(piece.cur_bytes.saturating_sub(start), piece.size),
                    style(piece.status_code).dim()
                );
            }
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub fn config_action(
    data_dir: &Path,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = config::load_settings(data_dir)?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("segdl Configuration:");
                    println!();
                    println!(
                        "  Default download path: {}",
                        settings.default_download_path.display()
                    );
                    println!("  Max active downloads: {}", settings.max_active_downloads);
                    println!("  Default pieces: {}", settings.default_pieces);
                    println!("  Max retries: {}", settings.max_retries);
                    println!("  Unmetered only: {}", settings.unmetered_only);
                    println!("  Roaming allowed: {}", settings.enable_roaming);
                    println!(
                        "  Move finished downloads to: {}",
                        settings
                            .move_after_download_to
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = config::load_settings(data_dir)?;
            match config::get_value(&settings, &key)? {
                serde_json::Value::String(s) => println!("{}", s),
                value => println!("{}", value),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = config::load_settings(data_dir)?;
            config::set_value(&mut settings, &key, &value)?;
            config::save_settings(data_dir, &settings)?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                config::save_settings(data_dir, &Settings::default())?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
