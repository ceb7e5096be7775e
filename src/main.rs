//! # Fleet CLI (`fleet`)
//!
//! Command-line front end for a repository fleet.
//!
//! ## Usage
//!
//! ```bash
//! fleet --config ./config/fleet.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fleet init` | Create the database, schema, and storage directories |
//! | `fleet serve` | Start the HTTP server and background tasks |
//! | `fleet golden add <url> <alias>` | Clone and index a golden repository |
//! | `fleet golden list` | List golden repositories |
//! | `fleet golden refresh <alias>` | Fetch and re-snapshot |
//! | `fleet golden branch <alias> <branch>` | Move to another branch |
//! | `fleet golden reindex <alias>` | Rebuild indexes |
//! | `fleet golden add-index <alias> <kind>` | Add an index kind |
//! | `fleet golden remove <alias>` | Remove a repository and its storage |
//! | `fleet golden health <alias>` | Index health |
//! | `fleet write-mode enter\|exit <alias>` | Manual edit sessions |
//! | `fleet job <id>` | Show a job |
//! | `fleet query <selector> <text>` | Search one or many repositories |
//! | `fleet cache <handle>` | Page through a cached result held by `fleet serve` |
//!
//! Mutating commands wait for their job and print its terminal state.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use repo_fleet::aggregate::{AggregationMode, AggregationRequest, QueryOperation};
use repo_fleet::backend::{BackendSet, IndexKind};
use repo_fleet::config::{self, Config};
use repo_fleet::fleet::{Fleet, OpResponse};
use repo_fleet::git::CliGit;
use repo_fleet::golden::AddRepoRequest;
use repo_fleet::logging::{self, Verbosity};
use repo_fleet::models::JobStatus;
use repo_fleet::selector::RepoSelector;
use repo_fleet::server;

/// Repository fleet: golden mirrors, activated workspaces, background
/// jobs, and multi-repository search.
#[derive(Parser)]
#[command(name = "fleet", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fleet.toml")]
    config: PathBuf,

    /// Debug-level logs on stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Errors only.
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database, schema, and storage directories. Idempotent.
    Init,

    /// Start the HTTP server, cache sweeper, job purger, and refresh cycle.
    Serve,

    /// Manage golden repositories.
    Golden {
        #[command(subcommand)]
        action: GoldenAction,
    },

    /// Open or close a manual edit session on a golden repository.
    WriteMode {
        #[command(subcommand)]
        action: WriteModeAction,
    },

    /// Show a job.
    Job { id: String },

    /// Search (or list files of) one or many repositories.
    Query {
        /// Alias, comma-separated list, or glob such as `team-*`.
        selector: String,

        /// Search text, or a path glob with `--list-files`.
        text: String,

        /// `global` (top results by score) or `per_repo` (even split).
        #[arg(long, default_value = "global")]
        mode: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Index kind to search (default `full_text`).
        #[arg(long)]
        kind: Option<String>,

        /// Also consider this owner's activated workspaces.
        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        list_files: bool,
    },

    /// Print one page of a cached result from the running server.
    Cache {
        handle: String,

        #[arg(long, default_value_t = 1)]
        page: usize,
    },
}

#[derive(Subcommand)]
enum GoldenAction {
    Add {
        url: String,
        alias: String,

        #[arg(long, default_value = "main")]
        branch: String,

        #[arg(long)]
        category: Option<String>,

        /// Also build the temporal index.
        #[arg(long)]
        temporal: bool,

        /// Allow manual write-mode sessions on this repository.
        #[arg(long)]
        write_exception: bool,

        /// Index kinds to build (repeatable); defaults to `[indexing] default_kinds`.
        #[arg(long = "kind")]
        kinds: Vec<String>,
    },
    List,
    Refresh { alias: String },
    Branch { alias: String, branch: String },
    Reindex { alias: String },
    AddIndex { alias: String, kind: String },
    Remove { alias: String },
    Health {
        alias: String,

        /// Bypass the health probe cache.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum WriteModeAction {
    Enter { alias: String },
    /// Refreshes the repository, then releases the lease.
    Exit { alias: String },
}

fn parse_kind(s: &str) -> anyhow::Result<IndexKind> {
    IndexKind::parse(s).with_context(|| {
        format!(
            "unknown index kind '{}'; expected semantic, full_text, temporal, or code_intel",
            s
        )
    })
}

fn parse_mode(s: &str) -> anyhow::Result<AggregationMode> {
    match s {
        "global" => Ok(AggregationMode::Global),
        "per_repo" | "per-repo" => Ok(AggregationMode::PerRepo),
        other => bail!("unknown mode '{}'; expected global or per_repo", other),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a submitted job and print how it ended.
async fn finish(fleet: &Fleet, response: OpResponse) -> anyhow::Result<()> {
    let Some(job_id) = response.job_id.clone().filter(|_| response.success) else {
        print_json(&response)?;
        bail!(
            "{}",
            response.error.unwrap_or_else(|| response.message.clone())
        );
    };

    println!("Submitted job {}", job_id);
    let job = fleet.wait_job(&job_id).await?;
    print_json(&job)?;
    if job.status == JobStatus::Failed {
        bail!("job {} failed", job_id);
    }
    Ok(())
}

async fn open_fleet(cfg: Config) -> anyhow::Result<Fleet> {
    Fleet::open(cfg, Arc::new(CliGit), BackendSet::with_builtins())
        .await
        .context("Failed to open fleet")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet));

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let root = cfg.storage.root.clone();
            open_fleet(cfg).await?;
            println!("Fleet initialized at {}", root.display());
        }
        Commands::Serve => {
            let fleet = Arc::new(open_fleet(cfg).await?);
            let _tasks = fleet.start_background();
            server::run_server(fleet).await?;
        }
        Commands::Golden { action } => {
            let fleet = open_fleet(cfg).await?;
            match action {
                GoldenAction::Add {
                    url,
                    alias,
                    branch,
                    category,
                    temporal,
                    write_exception,
                    kinds,
                } => {
                    let index_kinds = if kinds.is_empty() {
                        None
                    } else {
                        Some(
                            kinds
                                .iter()
                                .map(|k| parse_kind(k))
                                .collect::<anyhow::Result<Vec<_>>>()?,
                        )
                    };
                    let mut req = AddRepoRequest::new(url, alias);
                    req.branch = branch;
                    req.category = category;
                    req.enable_temporal = temporal;
                    req.write_exception = write_exception;
                    req.index_kinds = index_kinds;
                    finish(&fleet, fleet.add_golden(req).await).await?;
                }
                GoldenAction::List => {
                    let repos = fleet.list_golden().await?;
                    if repos.is_empty() {
                        println!("No golden repositories.");
                    }
                    for repo in repos {
                        let kinds: Vec<&str> = repo.index_kinds.iter().map(|k| k.as_str()).collect();
                        println!(
                            "{:<24} {:<10} {:<16} gen={:<4} [{}] {}",
                            repo.alias,
                            repo.status.as_str(),
                            repo.branch,
                            repo.snapshot.as_ref().map_or(0, |s| s.generation),
                            kinds.join(","),
                            repo.last_error.unwrap_or_default()
                        );
                    }
                }
                GoldenAction::Refresh { alias } => {
                    finish(&fleet, fleet.refresh_golden(&alias).await).await?;
                }
                GoldenAction::Branch { alias, branch } => {
                    finish(&fleet, fleet.change_branch(&alias, &branch).await).await?;
                }
                GoldenAction::Reindex { alias } => {
                    finish(&fleet, fleet.reindex_golden(&alias).await).await?;
                }
                GoldenAction::AddIndex { alias, kind } => {
                    let kind = parse_kind(&kind)?;
                    finish(&fleet, fleet.add_index(&alias, kind).await).await?;
                }
                GoldenAction::Remove { alias } => {
                    finish(&fleet, fleet.remove_golden(&alias).await).await?;
                }
                GoldenAction::Health { alias, force } => {
                    print_json(&fleet.golden_health(&alias, force).await?)?;
                }
            }
        }
        Commands::WriteMode { action } => {
            let fleet = open_fleet(cfg).await?;
            match action {
                WriteModeAction::Enter { alias } => {
                    print_json(&fleet.enter_write_mode(&alias).await?)?;
                }
                WriteModeAction::Exit { alias } => {
                    let outcome = fleet.exit_write_mode(&alias).await?;
                    if let Some(warning) = &outcome.warning {
                        eprintln!("warning: {}", warning);
                    }
                    print_json(&outcome)?;
                }
            }
        }
        Commands::Job { id } => {
            let fleet = open_fleet(cfg).await?;
            print_json(&fleet.poll_job(&id).await?)?;
        }
        Commands::Query {
            selector,
            text,
            mode,
            limit,
            kind,
            owner,
            list_files,
        } => {
            let req = AggregationRequest {
                repos: RepoSelector::parse(&selector),
                mode: parse_mode(&mode)?,
                limit,
                query: text,
                operation: if list_files {
                    QueryOperation::ListFiles
                } else {
                    QueryOperation::Search
                },
                kind: kind.as_deref().map(parse_kind).transpose()?,
                owner,
            };
            let fleet = open_fleet(cfg).await?;
            print_json(&fleet.query(req).await?)?;
        }
        Commands::Cache { handle, page } => {
            // Handles live in the serving process; ask it.
            let url = format!(
                "http://{}/cache/{}?page={}",
                cfg.server.bind, handle, page
            );
            let response = reqwest::get(&url)
                .await
                .with_context(|| format!("Failed to reach fleet server at {}", cfg.server.bind))?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                bail!(
                    "{}",
                    body.get("error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("cache lookup failed")
                );
            }
            print_json(&body)?;
        }
    }

    Ok(())
}
