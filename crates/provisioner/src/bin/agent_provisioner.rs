/*
 * Container Agents - Provisioner CLI
 * Copyright (C) 2025 Container Agents team
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Operator tooling for the agent provisioner.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_provisioner::config::CONFIG_ENV;
use agent_provisioner::naming::{self, AGENT_SUFFIX_LENGTH};
use agent_provisioner::{
    CloudRuntime, EnvCredentials, LabelExpr, ProvisionerConfig, Reclaimer, TemplateRegistry,
    TracingSink,
};

/// Agent provisioner - inspect configuration and clean up agent resources.
#[derive(Parser)]
#[command(name = "agent-provisioner")]
#[command(about = "Provision and reclaim build agents on container platforms", version)]
struct Cli {
    /// Configuration file (or set `AGENT_PROVISIONER_CONFIG`).
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// Log as JSON lines.
    #[arg(long, global = true, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration.
    Validate,

    /// Show which template a label resolves to.
    Resolve {
        /// Cloud name.
        #[arg(long)]
        cloud: String,

        /// Label expression, e.g. `linux && !gpu`.
        #[arg(long)]
        label: Option<String>,
    },

    /// Generate a resource name.
    Name {
        /// Base name, usually the template name.
        base: String,

        /// Random suffix length.
        #[arg(long, default_value_t = AGENT_SUFFIX_LENGTH)]
        length: usize,
    },

    /// Delete resources of this instance that belong to no agent.
    Reclaim {
        /// Cloud name.
        #[arg(long)]
        cloud: String,

        /// Agents to keep (comma-separated or repeated).
        #[arg(long, value_delimiter = ',')]
        keep: Vec<String>,

        /// Only report what would be deleted.
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<ProvisionerConfig> {
    let Some(path) = path else {
        bail!("no configuration given, use --config or set {CONFIG_ENV}");
    };
    ProvisionerConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            println!("\nInstance: {}", config.instance_id);
            println!(
                "Backoff:  {}s initial, {}s max",
                config.backoff.initial_seconds, config.backoff.max_seconds
            );
            for cloud in &config.clouds {
                println!(
                    "\nCloud {} ({}, {} concurrent requests)",
                    cloud.name,
                    cloud.kind.platform(),
                    cloud.max_concurrent_requests
                );
                println!("  {:<20} {:<8} {:<40} {:<20}", "TEMPLATE", "LAUNCH", "IMAGE", "LABELS");
                for template in &cloud.templates {
                    println!(
                        "  {:<20} {:<8} {:<40} {:<20}",
                        template.name,
                        template.launch.kind(),
                        template.image,
                        template.label.as_deref().unwrap_or("-")
                    );
                }
            }
            println!("\nConfiguration is valid");
        }

        Commands::Resolve { cloud, label } => {
            let config = load_config(cli.config.as_deref())?;
            let Some(cloud_config) = config.cloud(&cloud) else {
                bail!("unknown cloud '{cloud}'");
            };
            let expr = LabelExpr::parse_request(label.as_deref())
                .context("Invalid label expression")?;
            let registry = TemplateRegistry::new(cloud_config.templates.iter().cloned());
            match registry.find_template(expr.as_ref()) {
                Some(template) => {
                    println!("\nTemplate: {}", template.name);
                    println!("  Image:   {}", template.image);
                    println!("  Launch:  {}", template.launch.kind());
                    println!("  Labels:  {}", template.label.as_deref().unwrap_or("-"));
                }
                None => bail!(
                    "no template in cloud '{cloud}' matches '{}'",
                    label.unwrap_or_default()
                ),
            }
        }

        Commands::Name { base, length } => {
            println!("{}", naming::generate(&base, length));
        }

        Commands::Reclaim {
            cloud,
            keep,
            dry_run,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let Some(cloud_config) = config.cloud(&cloud).cloned() else {
                bail!("unknown cloud '{cloud}'");
            };
            let runtime = CloudRuntime::new(
                cloud_config,
                &config.backoff,
                &config.polling,
                Arc::new(EnvCredentials),
            );
            let reclaimer = Reclaimer::new(
                config.instance_id.clone(),
                Arc::new(runtime),
                Arc::new(TracingSink),
            );

            info!(cloud = %cloud, keep = keep.len(), dry_run, "Starting reclamation sweep");
            let keep: HashSet<String> = keep.into_iter().collect();
            let report = reclaimer
                .sweep(&keep, dry_run)
                .await
                .with_context(|| format!("Failed to list resources in cloud '{cloud}'"))?;

            println!("\nCloud {}: {} listed, {} kept", report.cloud, report.listed, report.kept);
            for orphan in &report.orphans {
                let outcome = if dry_run {
                    "would delete"
                } else if report.deleted.contains(orphan) {
                    "deleted"
                } else if report.failed.contains(orphan) {
                    "FAILED"
                } else {
                    "already gone"
                };
                println!("  {orphan:<40} {outcome}");
            }
            for record in &report.records {
                println!("  {record:<40} record removed");
            }
            if !report.failed.is_empty() {
                bail!("{} resources could not be deleted", report.failed.len());
            }
        }
    }

    Ok(())
}
