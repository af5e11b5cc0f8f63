// SPDX-License-Identifier: AGPL-3.0-or-later
//! barman-relay: wires database hosts into a Barman backup server
//!
//! Database hosts publish, the backup host collects; the shared catalog file
//! is the only thing they have in common.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use barman_relay::{
    engine::RunReport, fragment::redact, CatalogStore, Config, ConvergenceEngine, FileCatalog,
    TagPredicate,
};

/// barman-relay: export/collect catalog for Barman backups
///
/// Database hosts publish server, schedule, credential and key fragments;
/// the backup host collects and realizes them.
#[derive(Parser, Debug)]
#[command(name = "barman-relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Dry run mode (catalog and local state are left untouched)
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish this node's fragments into the catalog
    Publish,

    /// Collect matching fragments and realize them locally
    Collect,

    /// One convergence run: publish, then collect
    Run,

    /// Run convergence periodically until interrupted
    Watch {
        /// Seconds between runs
        #[arg(long, default_value_t = 1800)]
        interval_secs: u64,
    },

    /// Inspect or maintain the shared catalog
    #[command(subcommand)]
    Catalog(CatalogCommand),

    /// Show configuration
    Config,

    /// Initialize a new configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
enum CatalogCommand {
    /// List fragments, optionally filtered by a tag predicate
    #[command(alias = "ls")]
    List {
        /// Predicate such as 'tag == "barman-db"'
        #[arg(long)]
        filter: Option<String>,
    },

    /// Remove every fragment published by a decommissioned node
    Purge {
        /// Node identity
        origin: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging settings from the config file are best effort; commands report load errors
    let logging = Config::from_file(&cli.config).ok().map(|config| config.logging);

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else if let Some(logging) = &logging {
        EnvFilter::new(&logging.level)
    } else {
        EnvFilter::new("warn")
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(std::io::stderr);
    if logging.as_ref().is_some_and(|logging| logging.format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Version => {
            println!("barman-relay v{}", env!("CARGO_PKG_VERSION"));
            println!("Export/collect catalog for Barman backups");
            Ok(())
        }

        Commands::Init { force } => init_config(&cli.config, force),

        Commands::Config => show_config(&cli.config),

        Commands::Publish => publish(&cli.config, cli.dry_run),

        Commands::Collect => collect(&cli.config, cli.dry_run),

        Commands::Run => run_once(&cli.config, cli.dry_run),

        Commands::Watch { interval_secs } => watch(&cli.config, interval_secs, cli.dry_run).await,

        Commands::Catalog(CatalogCommand::List { filter }) => {
            list_catalog(&cli.config, filter.as_deref())
        }

        Commands::Catalog(CatalogCommand::Purge { origin }) => {
            purge_catalog(&cli.config, &origin, cli.dry_run)
        }
    }
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

/// Shared catalog, or a detached copy of it in dry-run mode
fn open_catalog(config: &Config, dry_run: bool) -> anyhow::Result<Arc<dyn CatalogStore>> {
    let catalog = FileCatalog::open(&config.catalog, config.conflict_policy)
        .with_context(|| format!("Failed to open catalog {}", config.catalog.display()))?;

    if dry_run {
        Ok(Arc::new(catalog.snapshot()?))
    } else {
        Ok(Arc::new(catalog))
    }
}

fn build_engine(config: &Config, dry_run: bool) -> anyhow::Result<ConvergenceEngine> {
    let catalog = open_catalog(config, dry_run)?;
    let engine = ConvergenceEngine::from_config(config, catalog)?.dry_run(dry_run);
    Ok(engine)
}

/// Initialize a new configuration file
fn init_config(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let default_config = r#"# SPDX-License-Identifier: AGPL-3.0-or-later
# barman-relay configuration

node = "pg1"
namespace = "barman"
group = "default"
catalog = "/var/lib/barman-relay/catalog.json"
# last-write-wins or reject
conflict_policy = "last-write-wins"

# Database host: publish fragments for the backup server
[publish]
# db_host = "pg1.example.com"
db_name = "postgres"
db_user = "barman"
ssh_user = "postgres"
# Leave empty to derive a stable per-node secret
secret = ""
# ssh_key = "ssh-ed25519 AAAA... postgres@pg1"
# ssh_key_file = "/var/lib/postgresql/.ssh/id_ed25519.pub"

[publish.schedule]
# monthday = 1
# weekday = 0
hour = 4
minute = 0

# Backup host: collect and realize fragments
# [collect]
# state_dir = "/var/lib/barman-relay/state"
# predicates = ['tag == "barman-default"', 'tag == "barman-default-barman"']
#
# [collect.overrides]
# description = "@origin"

[logging]
level = "info"
format = "text"
"#;

    std::fs::write(config_path, default_config)?;
    info!("Created configuration file: {}", config_path.display());
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

/// Show the current configuration
fn show_config(config_path: &Path) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(publish) = config.publish.as_mut() {
        if !publish.secret.is_empty() {
            publish.secret = "********".to_string();
        }
    }

    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn publish(config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    if config.publish.is_none() {
        anyhow::bail!("Node '{}' has no [publish] section", config.node);
    }

    let mut engine = build_engine(&config, dry_run)?;
    let report = RunReport {
        publish: engine.publish(),
        ..RunReport::default()
    };
    finish(&report, dry_run)
}

fn collect(config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    if config.collect.is_none() {
        anyhow::bail!("Node '{}' has no [collect] section", config.node);
    }

    let mut engine = build_engine(&config, dry_run)?;
    let mut report = RunReport::default();
    engine.collect(&mut report);
    finish(&report, dry_run)
}

fn run_once(config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let mut engine = build_engine(&config, dry_run)?;
    let report = engine.run()?;
    finish(&report, dry_run)
}

async fn watch(config_path: &Path, interval_secs: u64, dry_run: bool) -> anyhow::Result<()> {
    if interval_secs == 0 {
        anyhow::bail!("--interval-secs must be greater than zero");
    }

    let config = load_config(config_path)?;
    let mut engine = build_engine(&config, dry_run)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

    info!(node = %config.node, interval_secs = interval_secs, "Watching");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.run() {
                    Ok(report) => print_report(&report, dry_run),
                    // Corrected on a later run
                    Err(e) => error!(error = %e, "Run aborted"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
        }
    }

    Ok(())
}

fn list_catalog(config_path: &Path, filter: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let catalog = open_catalog(&config, true)?;

    let fragments = match filter {
        Some(text) => {
            let predicate: TagPredicate = text.parse()?;
            catalog.query(&predicate)?
        }
        None => catalog.all()?,
    };

    if fragments.is_empty() {
        println!("No fragments in {}", config.catalog.display());
        return Ok(());
    }

    for fragment in &fragments {
        let tags: Vec<&str> = fragment.tags().iter().map(String::as_str).collect();
        println!(
            "{}[{}] origin={} tags={}",
            fragment.kind(),
            fragment.title(),
            fragment.origin(),
            tags.join(",")
        );
        for (name, value) in redact(fragment.attributes()) {
            println!("    {} = {}", name, value.as_deref().unwrap_or("<unset>"));
        }
    }

    Ok(())
}

fn purge_catalog(config_path: &Path, origin: &str, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let catalog = open_catalog(&config, dry_run)?;

    let removed = catalog.purge_origin(origin)?;
    if removed == 0 {
        warn!(origin = %origin, "Nothing published by this node");
    }

    let prefix = if dry_run { "[DRY RUN] Would purge" } else { "Purged" };
    println!("{} {} fragment(s) published by '{}'", prefix, removed, origin);
    Ok(())
}

fn print_report(report: &RunReport, dry_run: bool) {
    if dry_run {
        println!("[DRY RUN] Nothing was written");
    }

    if let Some(publish) = &report.publish {
        println!(
            "Published: {} fragment(s), {} changed, {} failed",
            publish.published.len(),
            publish.changed(),
            publish.failures.len()
        );
        for failure in &publish.failures {
            println!("  - {}", failure);
        }
    }

    for collected in &report.collect {
        println!(
            "Collected {}: {} fragment(s), {} changed, {} failed",
            collected.predicate,
            collected.realized.len(),
            collected.changed(),
            collected.failures.len()
        );
        for failure in &collected.failures {
            println!("  - {}", failure);
        }
    }

    for failure in &report.failures {
        println!("Failed: {}", failure);
    }

    for path in &report.rendered {
        println!("Wrote {}", path.display());
    }

    if report.pruned > 0 {
        println!("Dropped {} entr(ies) no longer in the catalog", report.pruned);
    }
    for path in &report.removed {
        println!("Removed {}", path.display());
    }
}

fn finish(report: &RunReport, dry_run: bool) -> anyhow::Result<()> {
    print_report(report, dry_run);

    if !report.success() {
        println!("Run completed with {} failure(s)", report.failure_count());
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["barman-relay", "version"]).unwrap();
        match cli.command {
            Commands::Version => {}
            _ => panic!("Expected Version command"),
        }
    }

    #[test]
    fn test_cli_catalog_list_filter() {
        let cli = Cli::try_parse_from([
            "barman-relay",
            "catalog",
            "list",
            "--filter",
            r#"tag == "barman-db""#,
        ])
        .unwrap();
        match cli.command {
            Commands::Catalog(CatalogCommand::List { filter }) => {
                assert_eq!(filter.as_deref(), Some(r#"tag == "barman-db""#));
            }
            _ => panic!("Expected catalog list command"),
        }
    }

    #[test]
    fn test_cli_watch_interval() {
        let cli = Cli::try_parse_from(["barman-relay", "watch", "--interval-secs", "60"]).unwrap();
        match cli.command {
            Commands::Watch { interval_secs } => assert_eq!(interval_secs, 60),
            _ => panic!("Expected Watch command"),
        }
    }

    #[test]
    fn test_cli_dry_run_flag() {
        let cli = Cli::try_parse_from(["barman-relay", "--dry-run", "run"]).unwrap();
        assert!(cli.dry_run);
    }
}
