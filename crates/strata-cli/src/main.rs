//! # strata CLI
//!
//! Command-line interface for Strata multi-tenant content-addressable
//! storage. Results are printed as JSON on stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use strata_backend::{Backend, LocalFsBackend, ObjectStoreBackend};
use strata_cas::{CasService, ChunkPlanner, PutOptions, TenantAttrs, TenantProvisioner};
use strata_config::logging::{init_logging, LogLevel};
use strata_config::{expand_home, BackendKind, Config};
use strata_hash::ContentHash;
use strata_meta::MetadataStore;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about = "Multi-tenant content-addressable storage", long_about = None)]
struct Cli {
    /// Config file path (defaults to the standard lookup chain)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a tenant and prepare its storage namespace
    Provision {
        tenant: String,

        /// Storage namespace slug (defaults to the tenant id)
        #[arg(long)]
        slug: Option<String>,
    },

    /// Remove a tenant; refused while it still owns content
    Deprovision { tenant: String },

    /// Store a file (or stdin when omitted) and print its content reference
    Put {
        tenant: String,

        /// File to store; reads stdin when omitted
        file: Option<PathBuf>,

        #[arg(long)]
        mime_type: Option<String>,

        /// Logical filename recorded with the content
        #[arg(long)]
        filename: Option<String>,
    },

    /// Fetch content by hash
    Get {
        tenant: String,
        hash: String,

        /// Output path; writes to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check whether a hash is stored for a tenant
    Exists { tenant: String, hash: String },

    /// Drop one reference; the content is purged when none remain
    Delete { tenant: String, hash: String },

    /// Print tenant storage statistics
    Stats { tenant: String },

    /// Write a default config file
    InitConfig {
        /// Target path (defaults to ~/.strata/config.toml)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    if let Commands::InitConfig { path } = &cli.command {
        return init_config(path.as_deref());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    let ctx = StrataContext::build(&config)?;
    match cli.command {
        Commands::Provision { tenant, slug } => {
            let mut attrs = TenantAttrs::new(tenant);
            if let Some(slug) = slug {
                attrs = attrs.with_slug(slug);
            }
            let stored = ctx.provisioner.provision(&attrs).await?;
            print_json(&json!({
                "tenant": stored.id,
                "slug": stored.slug,
                "namespace": stored.storage_namespace,
            }))
        }
        Commands::Deprovision { tenant } => {
            ctx.provisioner.deprovision(&tenant).await?;
            print_json(&json!({ "tenant": tenant, "deprovisioned": true }))
        }
        Commands::Put {
            tenant,
            file,
            mime_type,
            filename,
        } => {
            let opts = PutOptions {
                mime_type,
                filename,
            };
            let content_ref = match file {
                Some(path) => ctx
                    .service
                    .put_file(&tenant, &path, opts)
                    .await
                    .with_context(|| format!("failed to store {}", path.display()))?,
                None => {
                    // stream stdin so large piped input is never
                    // materialized in memory
                    ctx.service
                        .put_stream(&tenant, tokio::io::stdin(), opts)
                        .await?
                }
            };
            print_json(&serde_json::to_value(&content_ref)?)
        }
        Commands::Get {
            tenant,
            hash,
            output,
        } => {
            let hash = parse_hash(&hash)?;
            let data = ctx.service.get(&tenant, &hash).await?;
            match output {
                Some(path) => tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&data)?;
                }
            }
            Ok(())
        }
        Commands::Exists { tenant, hash } => {
            let hash = parse_hash(&hash)?;
            let exists = ctx.service.exists(&tenant, &hash).await?;
            print_json(&json!({ "hash": hash.to_hex(), "exists": exists }))?;
            if !exists {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Delete { tenant, hash } => {
            let hash = parse_hash(&hash)?;
            let remaining = ctx.service.delete(&tenant, &hash).await?;
            print_json(&json!({
                "hash": hash.to_hex(),
                "remaining_references": remaining,
                "purged": remaining == 0,
            }))
        }
        Commands::Stats { tenant } => {
            let stats = ctx.service.stats(&tenant).await?;
            print_json(&serde_json::to_value(&stats)?)
        }
        Commands::InitConfig { .. } => unreachable!("handled before service construction"),
    }
}

struct StrataContext {
    service: CasService,
    provisioner: TenantProvisioner,
}

impl StrataContext {
    fn build(config: &Config) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.storage.backend {
            BackendKind::Local => {
                Arc::new(LocalFsBackend::new(expand_home(&config.storage.data_dir)))
            }
            BackendKind::ObjectStore => {
                // Config::load has already validated these are present.
                let endpoint = config.storage.endpoint.as_deref().unwrap_or_default();
                let bucket = config.storage.bucket.as_deref().unwrap_or_default();
                Arc::new(ObjectStoreBackend::new(endpoint, bucket))
            }
        };

        let db_path = expand_home(&config.storage.db_path);
        tracing::debug!(backend = ?config.storage.backend, db = %db_path.display(), "opening strata context");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let meta = Arc::new(
            MetadataStore::open(&db_path)
                .with_context(|| format!("failed to open metadata store at {}", db_path.display()))?,
        );

        let planner = ChunkPlanner::new(config.limits.max_inline_size, config.limits.chunk_size);
        let service = CasService::new(backend.clone(), meta.clone())
            .with_planner(planner)
            .with_max_content_size(config.limits.max_content_size);
        let provisioner = TenantProvisioner::new(backend, meta);

        Ok(Self {
            service,
            provisioner,
        })
    }
}

fn parse_hash(s: &str) -> Result<ContentHash> {
    s.parse::<ContentHash>()
        .with_context(|| format!("invalid content hash: {s}"))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_config(path: Option<&Path>) -> Result<()> {
    let target = match path {
        Some(p) => p.to_path_buf(),
        None => Config::global_config_path().context("could not determine home directory")?,
    };
    if target.exists() {
        anyhow::bail!("refusing to overwrite existing config at {}", target.display());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, Config::default_toml())?;
    println!("wrote {}", target.display());
    Ok(())
}
