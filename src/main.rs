//! sentiment-engine CLI and JSON-RPC server
//!
//! Run with: cargo run -- serve --port=3100
//! Logging: RUST_LOG=sentiment_engine=debug

use anyhow::{bail, Context, Result};
use sentiment_engine::{rpc, EngineSettings, Scope, ScopeContext, SentimentEngine};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 3100;

/// Request bodies above this are refused
const MAX_BODY: usize = 4 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "serve" => {
            let port: u16 = args
                .iter()
                .find_map(|a| a.strip_prefix("--port="))
                .map(|p| p.parse::<u16>().context("invalid --port"))
                .transpose()?
                .unwrap_or(DEFAULT_PORT);
            run_server(port).await
        }
        "methods" => {
            for method in rpc::methods() {
                println!(
                    "{:<30} {}",
                    method["name"].as_str().unwrap_or(""),
                    method["description"].as_str().unwrap_or("")
                );
            }
            Ok(())
        }
        "effective" => {
            let scope: Scope = args
                .get(2)
                .context("Usage: effective <scope> [scope_id]")?
                .parse()?;
            let ctx = ScopeContext::single(scope, args.get(3).map(|s| s.as_str()));
            let engine = open_engine()?;
            print_json(&engine.effective(&ctx)?)
        }
        "audit" => {
            let config_id = args.get(2).context("Usage: audit <config_id>")?;
            let engine = open_engine()?;
            let verification = engine.verify_audit(config_id)?;
            for record in engine.audit(config_id)? {
                println!(
                    "#{:<5} {} {:<8} v{} -> v{} by {}{}",
                    record.seq,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.action.as_str(),
                    record.previous_version.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                    record.new_version,
                    record.user_id,
                    record.reason.map(|r| format!(" ({})", r)).unwrap_or_default(),
                );
            }
            println!(
                "\nchain: {} records, {}",
                verification.chain_length,
                if verification.valid { "valid" } else { "INVALID" }
            );
            for error in &verification.errors {
                println!("  ! {}", error);
            }
            Ok(())
        }
        "preview" => {
            let config_id = args.get(2).context("Usage: preview <config_id> <text...>")?;
            let text = args[3..].join(" ");
            if text.trim().is_empty() {
                bail!("Usage: preview <config_id> <text...>");
            }
            let engine = open_engine()?;
            for p in engine.preview(config_id, &[text]).await? {
                println!(
                    "{} (score {:+.2}, confidence {:.2}){}",
                    p.label,
                    p.score,
                    p.confidence,
                    if p.derived_metrics.low_confidence { " [low confidence]" } else { "" }
                );
                print_json(&p.derived_metrics)?;
            }
            Ok(())
        }
        _ => {
            println!("sentiment-engine - sentiment configuration resolution & versioning");
            println!();
            println!("Commands:");
            println!("  serve [--port=N]              JSON-RPC 2.0 over HTTP POST (default {})", DEFAULT_PORT);
            println!("  methods                       List RPC methods");
            println!("  effective <scope> [scope_id]  Show the effective config");
            println!("  audit <config_id>             Show and verify the audit chain");
            println!("  preview <config_id> <text>    Classify text without recording it");
            Ok(())
        }
    }
}

fn open_engine() -> Result<SentimentEngine> {
    SentimentEngine::open(EngineSettings::load()?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// HTTP server mode: one JSON-RPC request per connection
async fn run_server(port: u16) -> Result<()> {
    let engine = Arc::new(open_engine()?);
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding port {}", port))?;
    tracing::info!(port, "listening on http://127.0.0.1:{}/rpc", port);

    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &engine).await {
                tracing::warn!(%peer, error = %e, "request failed");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, engine: &Arc<SentimentEngine>) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let method = request_line.split_whitespace().next().unwrap_or("");

    // Headers
    let mut content_length: usize = 0;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let (status, body) = if method != "POST" {
        ("405 Method Not Allowed", r#"{"error":"POST a JSON-RPC request"}"#.to_string())
    } else if content_length > MAX_BODY {
        ("413 Payload Too Large", r#"{"error":"request body too large"}"#.to_string())
    } else {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        let response = rpc::handle(engine, &String::from_utf8_lossy(&body)).await;
        ("200 OK", serde_json::to_string(&response)?)
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
