//! Seed configs from a directory of JSON definitions
//!
//! Usage: cargo run --bin import -- /path/to/configs [more dirs...]
//!
//! Each `*.json` file holds one definition:
//! `{"name", "scope", "scope_id"?, "user_id"?, "payload"}`. Files are created
//! in path order so a parent defined in `a.json` can be referenced by `b.json`.

use anyhow::{Context, Result};
use sentiment_engine::{ConfigPayload, EngineSettings, NewConfig, Scope, SentimentEngine};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_IMPORT_USER: &str = "system:import";

#[derive(Debug, Deserialize)]
struct ConfigDefinition {
    name: String,
    scope: Scope,
    #[serde(default, alias = "scopeId")]
    scope_id: Option<String>,
    #[serde(default, alias = "userId")]
    user_id: Option<String>,
    #[serde(default)]
    payload: ConfigPayload,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <config-dirs...>", args[0]);
        std::process::exit(1);
    }

    let settings = EngineSettings::load()?;
    println!("Opening engine at {:?}", settings.data_dir);
    let engine = SentimentEngine::open(settings)?;

    let mut created = 0;
    let mut failed = 0;

    for arg in &args[1..] {
        let dir = PathBuf::from(arg);
        if !dir.exists() {
            eprintln!("Warning: {} does not exist, skipping", arg);
            continue;
        }

        println!("\nProcessing: {:?}", dir);
        let (ok, err) = import_directory(&engine, &dir);
        created += ok;
        failed += err;
    }

    println!("\n========================================");
    println!("Import complete!");
    println!("  Created: {}", created);
    println!("  Failed:  {}", failed);
    println!("========================================");

    if failed > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn import_directory(engine: &SentimentEngine, dir: &Path) -> (usize, usize) {
    let mut created = 0;
    let mut failed = 0;

    for entry in walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
    {
        let path = entry.path();
        let fname = path.file_name().and_then(|n| n.to_str()).unwrap_or("?");
        match import_file(engine, path) {
            Ok((config_id, name)) => {
                created += 1;
                println!("  ✓ {} -> {} ({})", fname, config_id, name);
            }
            Err(e) => {
                failed += 1;
                eprintln!("  ✗ {}: {:#}", fname, e);
            }
        }
    }

    (created, failed)
}

fn import_file(engine: &SentimentEngine, path: &Path) -> Result<(String, String)> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let def: ConfigDefinition = serde_json::from_str(&content).context("parsing definition")?;
    let user_id = def.user_id.unwrap_or_else(|| DEFAULT_IMPORT_USER.to_string());

    let config = engine.create(
        NewConfig {
            name: def.name,
            scope: def.scope,
            scope_id: def.scope_id,
            payload: def.payload,
        },
        &user_id,
    )?;
    Ok((config.config_id, config.name))
}
