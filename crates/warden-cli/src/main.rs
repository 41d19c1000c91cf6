//! Warden Command-Line Client
//!
//! Runs secured queries and verified saves against a local Warden database.

mod config;
mod error;
mod formatter;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_core::proto::{QueryRequest, Value};
use warden_core::security::Principal;
use warden_core::{Database, EngineConfig};

use config::WardenConfig;
use error::CliError;
use formatter::OutputFormat;

/// Warden Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about = "Row-level security query engine")]
pub struct Args {
    /// Schema and rule configuration (JSON)
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Data directory
    #[arg(short = 'd', long, default_value = warden_core::config::DEFAULT_DATA_PATH)]
    pub data: PathBuf,

    /// Use a temporary database that is discarded on exit
    #[arg(long)]
    pub temporary: bool,

    /// Principal to run as, parsed as JSON when possible (e.g. 42 or "alice")
    #[arg(short = 'p', long)]
    pub principal: Option<String>,

    /// Output format
    #[arg(long, default_value = "pretty", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a descriptor query
    Query {
        /// Request JSON: {"entity": ..., "descriptors": [[op, text, ...args]]}
        request: Option<String>,

        /// Read the request from a file
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Load includes level by level
        #[arg(long)]
        split: bool,
    },

    /// Save a JSON payload
    Save {
        /// Entity type of the payload root
        #[arg(short = 'e', long)]
        entity: String,

        /// Payload JSON (an object or an array of objects)
        payload: Option<String>,

        /// Read the payload from a file
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
    },

    /// Validate the configuration and print its entity types
    Check,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info,warden_core=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        for line in e.details() {
            eprintln!("Error: {}", line);
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let config = WardenConfig::load(&args.config)?;
    let registry = config.registry()?;

    if let Command::Check = args.command {
        for name in registry.catalog().entity_names() {
            let ruled = if registry.is_registered(name) { "rules" } else { "inherited or none" };
            println!("{} ({})", name, ruled);
        }
        return Ok(());
    }

    let base = if args.temporary {
        EngineConfig::temporary()
    } else {
        EngineConfig::new(&args.data)
    };
    let engine = config.engine_config(base);
    info!(data = %engine.storage.path.display(), "opening database");
    let db = Arc::new(Database::open(Arc::new(registry), engine)?);
    let principal = args
        .principal
        .as_deref()
        .map(parse_principal)
        .unwrap_or_else(Principal::anonymous);

    let output = match args.command {
        Command::Query { request, file, split } => {
            let text = read_input(request, file, "request")?;
            let mut request = QueryRequest::from_json_str(&text).map_err(warden_core::Error::from)?;
            if split {
                request = request.with_split_includes();
            }
            run_query(db.clone(), request, principal, args.format).await?
        }
        Command::Save { entity, payload, file } => {
            let text = read_input(payload, file, "payload")?;
            let payload: serde_json::Value = serde_json::from_str(&text)?;
            run_save(db.clone(), entity, payload, principal, args.format).await?
        }
        Command::Check => return Ok(()),
    };
    db.storage().flush()?;
    println!("{}", output);
    Ok(())
}

/// Execute a query on a blocking thread; Ctrl-C cancels it.
async fn run_query(
    db: Arc<Database>,
    request: QueryRequest,
    principal: Principal,
    format: OutputFormat,
) -> Result<String, CliError> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling query");
            on_interrupt.cancel();
        }
    });

    let task = tokio::task::spawn_blocking(move || {
        let result = db.query(&request, &principal, &cancel)?;
        let rows = db.to_json(&result);
        Ok::<_, CliError>(formatter::format_rows(&rows, result.total, format))
    });
    let output = task.await;
    watcher.abort();
    output?
}

async fn run_save(
    db: Arc<Database>,
    entity: String,
    payload: serde_json::Value,
    principal: Principal,
    format: OutputFormat,
) -> Result<String, CliError> {
    tokio::task::spawn_blocking(move || {
        let saved = db.save_payload(&entity, &payload, &principal)?;
        info!(
            inserted = saved.outcome.inserted,
            updated = saved.outcome.updated,
            deleted = saved.outcome.deleted,
            "save committed"
        );
        let roots: Vec<Value> = saved.roots.iter().map(|handle| handle.read().to_row()).collect();
        let roots = db.serializer().rows_to_json(&roots);
        Ok::<_, CliError>(formatter::format_save(&saved.outcome, &roots, format))
    })
    .await?
}

fn read_input(inline: Option<String>, file: Option<PathBuf>, what: &str) -> Result<String, CliError> {
    match (inline, file) {
        (Some(text), None) => Ok(text),
        (None, Some(path)) => Ok(std::fs::read_to_string(path)?),
        (Some(_), Some(_)) => Err(CliError::Input(format!("give the {} inline or with --file, not both", what))),
        (None, None) => Err(CliError::Input(format!("missing {}", what))),
    }
}

fn parse_principal(text: &str) -> Principal {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => Principal::new(Value::from_json(&json)),
        Err(_) => Principal::new(Value::from(text)),
    }
}
