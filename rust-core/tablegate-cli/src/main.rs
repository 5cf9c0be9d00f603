// SPDX-License-Identifier: PMPL-1.0-or-later
//!
//! tgq: compile TableGate queries from the command line.
//!
//! Loads a schema catalog and permission rules from JSON files, builds the
//! caller's accountability from flags, and prints the compiled plan as SQL,
//! JSON or tables. Useful for checking what a role can actually reach.

mod formatter;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value as JsonValue};
use tablegate_query::{
    Accountability, Action, Compiler, CompilerConfig, PermissionRule, QueryError, RawQuery,
    SchemaCatalog, Share,
};
use tracing::{debug, info};

use formatter::{format_mutation, format_plan, format_schema, OutputFormat};

/// Version string, pulled from Cargo.toml at compile time.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

/// tgq: compile TableGate queries into permission-scoped SQL plans.
#[derive(Parser, Debug)]
#[command(name = "tgq", version = VERSION, about = "Compile TableGate queries into SQL plans")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a read query against a collection.
    Compile {
        #[command(flatten)]
        caller: CallerArgs,
        /// Collection to read.
        collection: String,
        /// Query parameter as key=value (repeatable), e.g. -q 'filter={"status":{"_eq":"active"}}'.
        #[arg(short = 'q', long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,
        /// Output format.
        #[arg(long, default_value = "sql")]
        format: OutputFormat,
    },
    /// Compile a create, update or delete.
    Mutate {
        #[command(flatten)]
        caller: CallerArgs,
        /// create, update or delete.
        action: Action,
        /// Collection to write.
        collection: String,
        /// JSON object to write.
        #[arg(long)]
        payload: Option<String>,
        /// Query parameter selecting the affected items (repeatable).
        #[arg(short = 'q', long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,
        /// Output format.
        #[arg(long, default_value = "sql")]
        format: OutputFormat,
    },
    /// Print the schema reduced to what the caller may see.
    Schema {
        #[command(flatten)]
        caller: CallerArgs,
        /// Actions the caller must hold (repeatable).
        #[arg(long = "action", default_value = "read")]
        actions: Vec<Action>,
    },
}

/// Inputs shared by every subcommand: snapshots plus the caller identity.
#[derive(Args, Debug)]
struct CallerArgs {
    /// Schema catalog JSON file.
    #[arg(long)]
    schema: PathBuf,
    /// Permission rules JSON file.
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Caller role (repeatable).
    #[arg(long = "role")]
    roles: Vec<String>,
    /// Caller user id.
    #[arg(long)]
    user: Option<String>,
    /// User attribute as key=value, visible as $CURRENT_USER.key (repeatable).
    #[arg(long = "attr", value_parser = parse_pair)]
    attributes: Vec<(String, String)>,
    /// Compile as an administrator (no permission checks).
    #[arg(long)]
    admin: bool,
    /// Shared item as collection:primary-key.
    #[arg(long, value_name = "COLLECTION:ITEM", value_parser = parse_share)]
    share: Option<Share>,
    /// Pin $NOW (RFC 3339).
    #[arg(long)]
    now: Option<DateTime<Utc>>,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn parse_share(raw: &str) -> Result<Share, String> {
    match raw.split_once(':') {
        Some((collection, item)) if !collection.is_empty() && !item.is_empty() => {
            Ok(Share::new("cli", collection, item))
        }
        _ => Err(format!("expected collection:item, got '{raw}'")),
    }
}

// ---------------------------------------------------------------------------
// Snapshot loading
// ---------------------------------------------------------------------------

/// Everything a compiler borrows, owned for the lifetime of one command.
struct Snapshots {
    catalog: SchemaCatalog,
    rules: Vec<PermissionRule>,
    accountability: Accountability,
    config: CompilerConfig,
}

impl CallerArgs {
    fn load(&self) -> Result<Snapshots> {
        let catalog = SchemaCatalog::from_json(&read_file(&self.schema)?)
            .with_context(|| format!("loading schema {}", self.schema.display()))?;
        let rules = match &self.rules {
            Some(path) => PermissionRule::list_from_json(&read_file(path)?)
                .with_context(|| format!("loading rules {}", path.display()))?,
            None => Vec::new(),
        };
        let config = CompilerConfig::from_env()?;

        debug!(
            collections = catalog.collections().count(),
            rules = rules.len(),
            "Loaded snapshots"
        );
        Ok(Snapshots {
            catalog,
            rules,
            accountability: self.accountability(),
            config,
        })
    }

    fn accountability(&self) -> Accountability {
        if self.admin {
            return Accountability::admin();
        }
        let roles: Vec<&str> = self.roles.iter().map(String::as_str).collect();
        let mut attributes = Map::new();
        for (key, value) in &self.attributes {
            // Values that parse as JSON keep their type; anything else is a string.
            let value = serde_json::from_str(value).unwrap_or_else(|_| JsonValue::String(value.clone()));
            attributes.insert(key.clone(), value);
        }
        Accountability::new(self.user.as_deref(), &roles).with_user_attributes(attributes)
    }

    fn compiler<'a>(&self, snapshots: &'a Snapshots) -> Result<Compiler<'a>> {
        let mut compiler = Compiler::new(
            &snapshots.catalog,
            &snapshots.rules,
            &snapshots.accountability,
            &snapshots.config,
        );
        if let Some(now) = self.now {
            compiler = compiler.at(now);
        }
        if let Some(share) = &self.share {
            compiler = compiler.with_share(share)?;
        }
        Ok(compiler)
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn raw_query(params: &[(String, String)]) -> RawQuery {
    RawQuery::from_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Compile { caller, collection, params, format } => {
            let snapshots = caller.load()?;
            let plan = caller
                .compiler(&snapshots)?
                .compile_raw(&collection, &raw_query(&params))?;
            info!(collection = %collection, fingerprint = %plan.fingerprint(), "Compiled query");
            print!("{}", format_plan(&plan, format));
        }
        Command::Mutate { caller, action, collection, payload, params, format } => {
            let snapshots = caller.load()?;
            let compiler = caller.compiler(&snapshots)?;
            let payload = payload
                .map(|raw| match serde_json::from_str(&raw) {
                    Ok(JsonValue::Object(map)) => Ok(map),
                    Ok(_) => Err(anyhow!("--payload must be a JSON object")),
                    Err(e) => Err(anyhow!("--payload is not valid JSON: {e}")),
                })
                .transpose()?;
            let query = if params.is_empty() {
                None
            } else {
                Some(compiler.normalizer().normalize(&raw_query(&params))?)
            };
            let plan = compiler.compile_mutation(action, &collection, payload.as_ref(), query.as_ref())?;
            info!(collection = %collection, action = %action, "Compiled mutation");
            print!("{}", format_mutation(&plan, format));
        }
        Command::Schema { caller, actions } => {
            let snapshots = caller.load()?;
            let schema = caller.compiler(&snapshots)?.schema(&actions)?;
            println!("{}", format_schema(&schema));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<QueryError>() {
                Some(query_error) => eprintln!(
                    "{} [{}] {e:#}",
                    "Error:".red().bold(),
                    query_error.kind()
                ),
                None => eprintln!("{} {e:#}", "Error:".red().bold()),
            }
            ExitCode::FAILURE
        }
    }
}
