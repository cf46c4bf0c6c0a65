//! # Command Line Interface
//!
//! Operator commands: schema migrations, configuration checks, policy
//! flushes and one-off upstream registrations from a request file.

use crate::config::{load_config, AppConfig};
use crate::domain::UpstreamRegisterRequest;
use crate::observability::{init_logging, log_config_info};
use crate::services::domain_registry::DomainScope;
use crate::services::Managers;
use crate::storage::{create_pool, list_applied_migrations, run_migrations, MigrationInfo, Store};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "routeplane")]
#[command(about = "Routeplane gateway control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL override
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run pending migrations
    Migrate {
        /// List applied migrations instead of running pending ones
        #[arg(long)]
        list: bool,
    },

    /// Load and validate the configuration
    CheckConfig,

    /// Recompile and push the policies of every package in a scope
    FlushPolicies {
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        env: String,
    },

    /// Reserve a cluster's domains for a platform component
    ClaimComponentDomains {
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        component: String,
        /// Domains the component owns; an empty list releases them all
        #[arg(long = "domain")]
        domains: Vec<String>,
    },

    /// Register an upstream api list from a JSON request file
    RegisterUpstream {
        #[arg(short, long)]
        file: PathBuf,

        /// Reconcile on a background task and wait for it
        #[arg(long = "async")]
        run_async: bool,
    },
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if cli.verbose {
        config.observability.log_level = "debug".to_string();
    }
    let _guard = init_logging(&config.observability)?;

    match cli.command {
        Commands::Migrate { list } => handle_migrate(&config, list).await?,
        Commands::CheckConfig => {
            log_config_info(&config);
            println!("Configuration is valid ({} clusters)", config.clusters.len());
        }
        Commands::FlushPolicies { cluster, project, env } => {
            let managers = managers(&config).await?;
            let count = managers.packages.flush_policies(&cluster, &project, &env).await?;
            println!("Flushed policies of {} packages", count);
        }
        Commands::ClaimComponentDomains { cluster, component, domains } => {
            let managers = managers(&config).await?;
            let scope = DomainScope { cluster_name: cluster, ..Default::default() };
            let mut session = managers.store.begin().await?;
            let diff = managers.domains.touch_component_domain(&mut session, &scope, &component, &domains).await?;
            session.commit().await?;
            println!(
                "Component {}: added {:?} released {:?}",
                component,
                diff.added_domains(),
                diff.deleted_domains()
            );
        }
        Commands::RegisterUpstream { file, run_async } => {
            handle_register(&config, &file, run_async).await?
        }
    }

    Ok(())
}

async fn managers(config: &AppConfig) -> anyhow::Result<Managers> {
    let store = Store::connect(&config.database).await?;
    Ok(Managers::new(config, store))
}

async fn handle_migrate(config: &AppConfig, list: bool) -> anyhow::Result<()> {
    if config.database.is_memory() {
        anyhow::bail!("migrations need a PostgreSQL database url");
    }
    let pool = create_pool(&config.database).await?;
    if list {
        let migrations = list_applied_migrations(&pool).await?;
        if migrations.is_empty() {
            println!("No migrations have been applied");
        } else {
            print_migrations_table(&migrations);
        }
        return Ok(());
    }
    run_migrations(&pool).await?;
    println!("Migrations completed successfully!");
    Ok(())
}

async fn handle_register(config: &AppConfig, file: &Path, run_async: bool) -> anyhow::Result<()> {
    let body = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let request: UpstreamRegisterRequest =
        serde_json::from_str(&body).with_context(|| format!("parsing {}", file.display()))?;
    let managers = managers(config).await?;

    if run_async {
        let (outcome, handle) = managers.upstreams.register_async(&managers.tasks, request).await?;
        println!("Upstream {} registered (new generation: {})", outcome.upstream.id, outcome.generation_changed);
        if let Some(handle) = handle {
            handle.await.context("reconcile task")?;
        }
        return Ok(());
    }

    let outcome = managers.upstreams.register(request).await?;
    println!("Upstream {} registered (new generation: {})", outcome.upstream.id, outcome.generation_changed);
    if let Some(summary) = outcome.summary {
        println!(
            "added {} updated {} deleted {} skipped {} recovered {}",
            summary.added, summary.updated, summary.deleted, summary.skipped, summary.recovered
        );
    }
    Ok(())
}

/// Print migrations in a formatted table
fn print_migrations_table(migrations: &[MigrationInfo]) {
    println!();
    println!("{:<15} {:<50} {:<25} {:<10}", "Version", "Description", "Applied On", "Time (ms)");
    println!("{}", "-".repeat(100));

    for migration in migrations {
        println!(
            "{:<15} {:<50} {:<25} {:<10}",
            migration.version,
            truncate_string(&migration.description, 48),
            migration.installed_on.format("%Y-%m-%d %H:%M:%S"),
            migration.execution_time
        );
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn register_upstream_parses_async_flag() {
        let cli = Cli::try_parse_from(["routeplane", "register-upstream", "--file", "req.json", "--async"]).unwrap();
        match cli.command {
            Commands::RegisterUpstream { file, run_async } => {
                assert_eq!(file, PathBuf::from("req.json"));
                assert!(run_async);
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn claim_component_domains_collects_repeated_flag() {
        let cli = Cli::try_parse_from([
            "routeplane",
            "claim-component-domains",
            "--cluster",
            "dev",
            "--component",
            "console",
            "--domain",
            "a.example.com",
            "--domain",
            "b.example.com",
        ])
        .unwrap();
        match cli.command {
            Commands::ClaimComponentDomains { cluster, component, domains } => {
                assert_eq!(cluster, "dev");
                assert_eq!(component, "console");
                assert_eq!(domains, vec!["a.example.com", "b.example.com"]);
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn truncates_long_descriptions() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("a long description", 8), "a lon...");
    }
}
