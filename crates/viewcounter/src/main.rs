//! `viewctr` - CLI for viewcounter
//!
//! This binary reads, counts and watches the shared view counter from the
//! command line.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use viewcounter::cli::{
    Cli, Command, ConfigCommand, IncrementCommand, SessionCommand, ShowCommand, StatusCommand,
    VisitCommand, WatchCommand,
};
use viewcounter::config::validate_page_id;
use viewcounter::display::format_views;
use viewcounter::store::fetch_or_initialize;
use viewcounter::sync::SessionState;
use viewcounter::{
    init_logging, mount, Config, CounterStore, CounterView, Error, FileSessionStorage,
    SessionGate, SqliteStore, StyleHint, SyncOptions,
};

/// Extra wait after the dwell so the count animation can land.
const SETTLE_GRACE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let mut config = Config::load_from(cli.config.clone())?;
    if let Some(page) = &cli.page {
        validate_page_id(page)?;
        config.store.page_id.clone_from(page);
    }

    // Execute the command
    match cli.command {
        Command::Show(cmd) => handle_show(&config, &cmd).await,
        Command::Increment(cmd) => handle_increment(&config, &cmd).await,
        Command::Visit(cmd) => handle_visit(&config, cmd).await,
        Command::Watch(cmd) => handle_watch(&config, &cmd).await,
        Command::Status(cmd) => handle_status(&config, &cmd),
        Command::Session(cmd) => handle_session(&config, cmd),
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let path = config.database_path();
    SqliteStore::open_with_interval(&path, config.watch_interval())
        .with_context(|| format!("opening counter store at {}", path.display()))
}

async fn handle_show(config: &Config, cmd: &ShowCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let record = fetch_or_initialize(&store, &config.store.page_id).await?;

    if cmd.json {
        let view = CounterView::showing(record.count, record.count);
        let output = serde_json::json!({
            "page_id": record.page_id,
            "count": record.count,
            "display_text": view.display_text,
            "updated_at": record.updated_at,
            "palette": StyleHint { is_dark: cmd.dark }.palette(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", format_views(record.count));
    }
    Ok(())
}

async fn handle_increment(config: &Config, cmd: &IncrementCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let record = store.increment(&config.store.page_id).await?;
    info!(page_id = %record.page_id, count = record.count, "Counter incremented");

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("{}", format_views(record.count));
    }
    Ok(())
}

async fn handle_visit(config: &Config, cmd: VisitCommand) -> anyhow::Result<()> {
    let store: Arc<dyn CounterStore> = Arc::new(open_store(config)?);
    let session_id = cmd.session.unwrap_or_else(|| {
        format!(
            "visit-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        )
    });
    let storage = FileSessionStorage::open(config.session_dir(), &session_id);
    debug!(session = %session_id, path = %storage.path().display(), "Session opened");
    let gate = SessionGate::new(Arc::new(storage), &config.store.page_id);

    let stay = cmd.leave_after.map_or_else(
        || config.minimum_dwell() + config.animation_duration() + SETTLE_GRACE,
        Duration::from_millis,
    );

    let handle = mount(store, gate, SyncOptions::from_config(config));
    tokio::select! {
        () = tokio::time::sleep(stay) => {}
        _ = tokio::signal::ctrl_c() => debug!("Interrupted, leaving page"),
    }

    let snapshot = handle.snapshot();
    let view = handle.view().borrow().clone();
    handle.unmount().await;

    if cmd.json {
        let output = serde_json::json!({
            "session": session_id,
            "page_id": config.store.page_id,
            "state": snapshot,
            "view": view,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        let counted = match snapshot.session {
            SessionState::Counted => "counted",
            SessionState::DwellPending | SessionState::NotCounted => "not counted",
        };
        println!("Session:  {session_id}");
        println!("Visit:    {counted}");
        println!("Display:  {}", view.display_text);
    }
    Ok(())
}

async fn handle_watch(config: &Config, cmd: &WatchCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let page_id = &config.store.page_id;

    // Subscribe first so nothing between the read and the subscription is lost
    let mut subscription = store.subscribe(page_id).await?;
    let record = fetch_or_initialize(&store, page_id).await?;
    println!("{}  {}", record.page_id, format_views(record.count));

    let mut last = record.count;
    let mut seen = 0;
    while !cmd.limit.is_some_and(|limit| seen >= limit) {
        tokio::select! {
            change = subscription.next() => match change {
                Some(record) if record.count > last => {
                    last = record.count;
                    seen += 1;
                    let at = record.updated_at.unwrap_or_else(chrono::Utc::now);
                    println!(
                        "{}  {}  {}",
                        at.format("%H:%M:%S"),
                        record.page_id,
                        format_views(record.count)
                    );
                }
                Some(_) => {}
                None => {
                    return Err(Error::SubscriptionClosed {
                        page_id: page_id.clone(),
                    }
                    .into());
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    subscription.cancel();
    Ok(())
}

fn handle_status(config: &Config, cmd: &StatusCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let schema_version = store.schema_version()?;
    let counters = store.counters()?;

    if cmd.json {
        let status = serde_json::json!({
            "database_path": store.path(),
            "schema_version": schema_version,
            "page_id": config.store.page_id,
            "session_dir": config.session_dir(),
            "counters": counters,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("viewctr status");
        println!("--------------");
        println!("Database:      {}", store.path().display());
        println!("Schema:        v{schema_version}");
        println!("Page:          {}", config.store.page_id);
        println!("Sessions:      {}", config.session_dir().display());
        println!();
        if counters.is_empty() {
            println!("No counters yet.");
        } else {
            for record in &counters {
                println!("  {:<24} {}", record.page_id, format_views(record.count));
            }
        }
    }
    Ok(())
}

fn handle_session(config: &Config, cmd: SessionCommand) -> anyhow::Result<()> {
    match cmd {
        SessionCommand::End { session } => {
            let storage = FileSessionStorage::open(config.session_dir(), &session);
            if storage.end()? {
                println!("Session {session} ended.");
            } else {
                println!("Session {session} was not active.");
            }
        }
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Store]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Page id:            {}", config.store.page_id);
                println!("  Watch interval:     {} ms", config.store.watch_interval_ms);
                println!();
                println!("[Counter]");
                println!("  Minimum dwell:      {} ms", config.counter.minimum_dwell_ms);
                println!();
                println!("[Display]");
                println!(
                    "  Animation:          {} ms",
                    config.display.animation_duration_ms
                );
                println!("  Frame interval:     {} ms", config.display.frame_interval_ms);
                println!();
                println!("[Session]");
                println!("  Session dir:        {}", config.session_dir().display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
