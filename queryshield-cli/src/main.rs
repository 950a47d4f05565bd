use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use queryshield_cli::{dataset::Dataset, service::ShieldService};
use queryshield_core::{load_config, ConfigFormat, InMemoryExecutor, RequestContext};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Auto,
    Toml,
    Yaml,
}

impl From<FormatArg> for ConfigFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Auto => ConfigFormat::Auto,
            FormatArg::Toml => ConfigFormat::Toml,
            FormatArg::Yaml => ConfigFormat::Yaml,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "queryshield",
    version,
    about = "Applies privacy protection to SQL query results"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/queryshield.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
    config_format: FormatArg,
    /// JSON file holding the budget ledger between runs.
    #[arg(long, default_value = "queryshield-ledger.json")]
    ledger: PathBuf,
    /// Append this run's audit entries to a JSON-lines file.
    #[arg(long)]
    audit_log: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a query through the protection pipeline.
    Query {
        /// JSON dataset backing the in-memory executor.
        #[arg(long, default_value = "configs/dataset.json")]
        dataset: PathBuf,
        #[arg(long)]
        principal: String,
        #[arg(long, default_value = "analyst")]
        role: String,
        /// Treat the request as a bulk export.
        #[arg(long)]
        export: bool,
        sql: String,
    },
    /// Show a principal's privacy budget.
    Budget {
        #[arg(long)]
        principal: String,
    },
    /// Restore a principal's full budget.
    Reset {
        #[arg(long)]
        principal: String,
    },
    /// Validate the configuration and exit.
    CheckConfig,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli.config, cli.config_format.into())?;
    if let Command::CheckConfig = cli.command {
        println!(
            "configuration {} is valid ({} query rules, {} column rules)",
            cli.config.display(),
            config.policy.query_rules.len(),
            config.policy.column_rules.len()
        );
        return Ok(());
    }

    let executor = match &cli.command {
        Command::Query { dataset, .. } => Dataset::load(dataset)?.into_executor(),
        _ => InMemoryExecutor::new(),
    };
    let ledger = Some(cli.ledger.clone());
    let service = ShieldService::open(&config, Arc::new(executor), ledger, Utc::now())?;
    if let Some(path) = &cli.audit_log {
        service.continue_audit(path)?;
    }

    match &cli.command {
        Command::Query {
            principal,
            role,
            export,
            sql,
            ..
        } => {
            let mut context = RequestContext::new(principal.as_str(), role.as_str());
            if *export {
                context = context.exporting();
            }
            print_json(&service.query(sql, &context)?)?;
        }
        Command::Budget { principal } => print_json(&service.budget(principal)?)?,
        Command::Reset { principal } => print_json(&service.reset(principal)?)?,
        Command::CheckConfig => {}
    }

    if let Some(path) = &cli.audit_log {
        service.append_audit(path)?;
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
