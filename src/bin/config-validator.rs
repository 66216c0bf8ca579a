//! # Dispatch Configuration Validator
//!
//! Loads configuration exactly as a running pipeline would (defaults, TOML
//! file, `DISPATCH__*` environment) and reports problems before deployment.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use dispatch_core::config::{load_config, ConfigLoader, ConfigResult, DispatchConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "config-validator")]
#[command(about = "Validate dispatch configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (default: $DISPATCH_CONFIG_PATH or config/dispatch.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load and validate all sections
    Validate,

    /// Print the effective configuration with credentials redacted
    Show,

    /// Print the exchanges and queues the pipeline will declare
    Topology,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = load(&cli).map_err(|e| e.to_string()).and_then(|config| {
        match cli.command.as_ref().unwrap_or(&Commands::Validate) {
            Commands::Validate => {
                print_summary(&config);
                Ok(())
            }
            Commands::Show => show(&config, cli.format),
            Commands::Topology => {
                print_topology(&config);
                Ok(())
            }
        }
    });

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            eprintln!("Configuration invalid: {e}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> ConfigResult<DispatchConfig> {
    match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => load_config(),
    }
}

fn print_summary(config: &DispatchConfig) {
    let redacted = config.redacted();
    println!("Configuration is valid");
    println!();
    println!("Database");
    println!("  url:              {}", redacted.database.url);
    println!("  max_connections:  {}", config.database.max_connections);
    println!("  run_migrations:   {}", config.database.run_migrations);
    println!("RabbitMQ");
    println!("  url:              {}", redacted.rabbitmq.url);
    println!("  prefetch_count:   {}", config.rabbitmq.prefetch_count);
    println!("  retry_delay_ms:   {}", config.rabbitmq.retry_delay_ms);
    println!("Reconciliation");
    println!("  enabled:          {}", config.reconciliation.enabled);
    println!("  interval:         {}s", config.reconciliation.interval_seconds);
    println!(
        "  pending after:    {}s",
        config.reconciliation.pending_threshold_seconds
    );
    println!("  batch_size:       {}", config.reconciliation.batch_size);
    println!("Records");
    println!(
        "  max_retry_count:  {}",
        config.records.default_max_retry_count
    );
}

fn show(config: &DispatchConfig, format: OutputFormat) -> Result<(), String> {
    let redacted = config.redacted();
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&redacted).map_err(|e| e.to_string())?;
            println!("{json}");
        }
        OutputFormat::Table => println!("{redacted:#?}"),
    }
    Ok(())
}

fn print_topology(config: &DispatchConfig) {
    let topology = config.topology();
    println!("exchange          {} (direct)", topology.exchange);
    println!(
        "queue             {} <- {}",
        topology.queue, topology.routing_key
    );
    println!(
        "dead letters      {} (direct)",
        topology.dead_letter_exchange()
    );
    println!(
        "retry queue       {} <- {} (ttl {} ms)",
        topology.retry_queue(),
        topology.routing_key,
        topology.retry_delay_ms()
    );
}
