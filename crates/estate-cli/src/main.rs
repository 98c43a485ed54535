//! `estate`: command-line access to the estate registry.
//!
//! Reads `estate.toml` (or the path given with `--config`), opens the SQLite
//! store and evolves its schema before running the requested command.
//!
//! ```text
//! estate migrate --json
//! estate mint owner --count 5
//! estate add-owner --name "Reza Ahmadi" --phone "0912 000 0000"
//! ```

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use estate_cli::{EstateConfig, summary};
use estate_core::registry::{self, NewOwner, NewProperty};
use estate_store_sqlite::SqliteStore;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "estate", author, version, about = "Estate registry tool")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "estate.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Evolve every registry table to its declared shape and report what
  /// changed.
  Migrate {
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
  },
  /// Print fresh codes without inserting anything.
  Mint {
    kind:  CodeKind,
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,
  },
  /// Insert an owner under a newly minted code.
  AddOwner {
    #[arg(long)]
    name:  String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    note:  Option<String>,
  },
  /// Insert a property under a newly minted code.
  AddProperty {
    #[arg(long)]
    owner:       Option<String>,
    #[arg(long = "type")]
    kind:        Option<String>,
    #[arg(long)]
    offer:       Option<String>,
    #[arg(long)]
    province:    Option<String>,
    #[arg(long)]
    region:      Option<String>,
    #[arg(long)]
    address:     Option<String>,
    #[arg(long, default_value_t = 0.0)]
    area:        f64,
    #[arg(long, default_value_t = 0)]
    bedrooms:    i64,
    #[arg(long, default_value_t = 0)]
    bathrooms:   i64,
    #[arg(long)]
    description: Option<String>,
  },
  /// Print one owner or property as JSON.
  Show { kind: CodeKind, code: String },
  /// Delete an owner (only without properties) or a property and its photos.
  Delete { kind: CodeKind, code: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum CodeKind {
  Owner,
  Property,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let cfg = EstateConfig::load(&cli.config)
    .with_context(|| format!("failed to load config from {:?}", cli.config))?;

  match cli.command {
    Command::Migrate { json } => migrate(&cfg, json).await?,
    Command::Mint { kind, count } => {
      let store = open(&cfg).await?;
      for _ in 0..count {
        match kind {
          CodeKind::Owner => {
            let minted = store.mint_owner_code_or_fallback().await?;
            if minted.is_verified() {
              println!("{}", minted.code());
            } else {
              println!("{} (unverified)", minted.code());
            }
          }
          CodeKind::Property => println!("{}", store.mint_property_code().await?),
        }
      }
    }
    Command::AddOwner { name, phone, note } => {
      let owner = open(&cfg).await?.add_owner(NewOwner { name, phone, note }).await?;
      print_json(&owner)?;
    }
    Command::AddProperty {
      owner,
      kind,
      offer,
      province,
      region,
      address,
      area,
      bedrooms,
      bathrooms,
      description,
    } => {
      let property = open(&cfg)
        .await?
        .add_property(NewProperty {
          owner_code: owner,
          property_type: kind,
          offer_type: offer,
          province_code: province,
          region_code: region,
          address,
          area,
          bedrooms,
          bathrooms,
          description,
        })
        .await?;
      print_json(&property)?;
    }
    Command::Show { kind: CodeKind::Owner, code } => {
      let owner =
        open(&cfg).await?.get_owner(&code).await?.with_context(|| format!("no owner {code}"))?;
      print_json(&owner)?;
    }
    Command::Show { kind: CodeKind::Property, code } => {
      let property = open(&cfg)
        .await?
        .get_property(&code)
        .await?
        .with_context(|| format!("no property {code}"))?;
      print_json(&property)?;
    }
    Command::Delete { kind, code } => {
      let store = open(&cfg).await?;
      let deleted = match kind {
        CodeKind::Owner => store.delete_owner(&code).await?,
        CodeKind::Property => store.delete_property(&code).await?,
      };
      if !deleted {
        anyhow::bail!("nothing to delete for {code}");
      }
      println!("deleted {code}");
    }
  }

  Ok(())
}

/// Open the store, evolving its schema, with the configured policies.
async fn open(cfg: &EstateConfig) -> anyhow::Result<SqliteStore> {
  SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?
    .with_policies(cfg.policies.clone())
    .context("invalid code policy in config")
}

async fn migrate(cfg: &EstateConfig, json: bool) -> anyhow::Result<()> {
  let store = SqliteStore::connect(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?;
  let report = store.evolve(registry::tables()).await.context("schema evolution failed")?;

  let summaries = summary::summarize(&report);
  if json {
    print_json(&summaries)?;
  } else {
    for table in &summaries {
      println!("{}", table.line());
    }
  }

  if report.is_degraded() {
    anyhow::bail!("some tables are not in their target shape");
  }
  Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
