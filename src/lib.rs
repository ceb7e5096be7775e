//! # Repo Fleet
//!
//! Server-side core for a fleet of repositories under search.
//!
//! Golden repositories are canonical, read-only mirrors served from
//! immutable copy-on-write snapshots. Activated workspaces are per-user
//! writable copies (single or composite) of golden snapshots. Every
//! mutating operation runs as a background job, serialized per repository
//! by the scheduler. Queries fan out across any selection of repositories
//! and merge their results globally or evenly per repository; large
//! payloads come back as paginated cache handles.
//!
//! ## Architecture
//!
//! ```text
//!              ┌───────────┐      ┌────────────┐
//!  CLI / HTTP ─▶   Fleet   ├─────▶│ Scheduler  │──▶ jobs (SQLite)
//!              └─────┬─────┘      └─────┬──────┘
//!                    │                  ▼
//!                    │     ┌────────────────────────┐   ┌────────────┐
//!                    │     │ Golden / Workspace mgr │──▶│ Write mode │
//!                    │     └───────────┬────────────┘   └────────────┘
//!                    │                 ▼
//!                    │        snapshots + indexes ◀── git / backends
//!                    ▼                 ▲
//!              ┌───────────┐           │
//!              │ Aggregator├───────────┘
//!              └─────┬─────┘
//!                    ▼
//!              Result cache
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error type and machine-readable kinds |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`], [`migrate`] | SQLite connection and schema |
//! | [`models`] | Jobs, repositories, workspaces |
//! | [`registry`] | Durable repository and workspace records |
//! | [`scheduler`] | Background jobs with per-target admission |
//! | [`snapshot`] | Copy-on-write snapshots and reader pinning |
//! | [`git`] | Git backend |
//! | [`backend`] | Index backends and the built-in full-text index |
//! | [`files`] | Tree walking and copying |
//! | [`health`] | Index health probe |
//! | [`golden`] | Golden repository lifecycle |
//! | [`write_mode`] | Write-mode leases |
//! | [`workspace`] | Activated workspaces and composites |
//! | [`selector`] | Repository selectors |
//! | [`aggregate`] | Multi-repository queries |
//! | [`cache`] | Paginated result cache |
//! | [`refresh`] | Automatic refresh cycle |
//! | [`fleet`] | Facade over all components |
//! | [`server`] | HTTP server |

pub mod aggregate;
pub mod backend;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod fleet;
pub mod git;
pub mod golden;
pub mod health;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod refresh;
pub mod registry;
pub mod scheduler;
pub mod selector;
pub mod server;
pub mod snapshot;
pub mod workspace;
pub mod write_mode;
