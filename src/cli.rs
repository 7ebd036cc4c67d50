//! CLI commands.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use console::style;

use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::repository::{DbContext, ProxyEntry};

#[derive(Parser)]
#[command(name = "partscout")]
#[command(about = "Distributed marketplace parts-listing acquisition pipeline")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Run the pipeline: workers, seeders and heartbeat recovery
    Run,

    /// Manage the articulum queue
    Articulums {
        #[command(subcommand)]
        command: ArticulumCommands,
    },

    /// Manage the proxy pool
    Proxies {
        #[command(subcommand)]
        command: ProxyCommands,
    },

    /// Show pipeline status
    Status,
}

#[derive(Subcommand)]
enum ArticulumCommands {
    /// Add part numbers, from arguments or a file with one per line
    Add {
        values: Vec<String>,
        /// File with one part number per line
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// Add proxies from a file: host:port[:username:password] per line
    Add { file: PathBuf },
}

/// Parse one proxy-list line: `host:port` or `host:port:user:pass`.
fn parse_proxy_line(line: &str) -> Option<ProxyEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split(':');
    let host = parts.next()?.to_string();
    let port: i32 = parts.next()?.parse().ok()?;
    let username = parts.next().map(str::to_string);
    let password = parts.next().map(str::to_string);
    Some(ProxyEntry {
        host,
        port,
        username,
        password,
    })
}

async fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Init => {
            let db = DbContext::from_url(&settings.database_url)?;
            db.init_schema().await?;
            println!("{} database schema created", style("ok").green());
        }
        Commands::Run => {
            // Every worker plus the background loops may hold a
            // connection at once.
            let pool_size = (settings.total_browser_workers
                + settings.total_validation_workers
                + 4) as usize;
            let db = DbContext::from_url_with_size(&settings.database_url, pool_size)?;
            db.test_connection().await?;
            db.init_schema().await?;
            Orchestrator::new(db, settings).run().await?;
        }
        Commands::Articulums { command } => match command {
            ArticulumCommands::Add { values, file } => {
                let mut parts = values;
                if let Some(path) = file {
                    parts.extend(read_lines(&path).await?);
                }
                if parts.is_empty() {
                    anyhow::bail!("no part numbers given (use arguments or --file)");
                }
                let db = DbContext::from_url(&settings.database_url)?;
                let inserted = db.articulums().insert_batch(&parts).await?;
                println!(
                    "{} {} articulums added ({} already known)",
                    style("ok").green(),
                    inserted,
                    parts.len() - inserted
                );
            }
        },
        Commands::Proxies { command } => match command {
            ProxyCommands::Add { file } => {
                let entries: Vec<ProxyEntry> = read_lines(&file)
                    .await?
                    .iter()
                    .filter_map(|line| parse_proxy_line(line))
                    .collect();
                if entries.is_empty() {
                    anyhow::bail!("no proxies parsed from {}", file.display());
                }
                let db = DbContext::from_url(&settings.database_url)?;
                let inserted = db.proxies().insert_batch(&entries).await?;
                println!(
                    "{} {} proxies added ({} already known)",
                    style("ok").green(),
                    inserted,
                    entries.len() - inserted
                );
            }
        },
        Commands::Status => {
            let db = DbContext::from_url(&settings.database_url)?;
            print_status(&db).await?;
        }
    }
    Ok(())
}

async fn print_status(db: &DbContext) -> anyhow::Result<()> {
    println!("{}", style("articulums").bold());
    let states = db.articulums().counts_by_state().await?;
    if states.is_empty() {
        println!("  (none)");
    }
    for (state, count) in states {
        println!("  {state:<24} {count}");
    }

    println!("{}", style("catalog tasks").bold());
    for (status, count) in db.catalog_tasks().counts_by_status().await? {
        println!("  {status:<24} {count}");
    }

    println!("{}", style("object tasks").bold());
    for (status, count) in db.object_tasks().counts_by_status().await? {
        println!("  {status:<24} {count}");
    }

    let proxies = db.proxies().stats().await?;
    println!("{}", style("proxies").bold());
    println!("  total                    {}", proxies.total);
    println!("  available                {}", proxies.available);
    println!("  in use                   {}", proxies.in_use);
    println!(
        "  blocked                  {}",
        if proxies.blocked > 0 {
            style(proxies.blocked.to_string()).red().to_string()
        } else {
            proxies.blocked.to_string()
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_lines() {
        let entry = parse_proxy_line("10.0.0.1:8080").unwrap();
        assert_eq!(entry.host, "10.0.0.1");
        assert_eq!(entry.port, 8080);
        assert!(entry.username.is_none());

        let entry = parse_proxy_line("proxy.example.com:3128:alice:secret").unwrap();
        assert_eq!(entry.username.as_deref(), Some("alice"));
        assert_eq!(entry.password.as_deref(), Some("secret"));

        assert!(parse_proxy_line("").is_none());
        assert!(parse_proxy_line("# comment").is_none());
        assert!(parse_proxy_line("host:notaport").is_none());
    }
}
