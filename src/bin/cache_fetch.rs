use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peakdip_offline::{app, config, db, model::FetchRequest};
use reqwest::Url;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect the offline cache and fetch through the cache worker")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch one URL through the worker and print how it was served
    Get {
        /// Absolute URL, or a path relative to app.site_url
        url: String,

        /// Treat the request as a page navigation (enables the offline page)
        #[arg(long)]
        navigate: bool,

        /// Print the response body
        #[arg(long)]
        body: bool,
    },
    /// List stored cache generations with their entry counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let site = Url::parse(&cfg.app.site_url)?;
    let services = app::build(cfg).await?;
    let worker = &services.worker;

    match args.command {
        Command::Get {
            url,
            navigate,
            body,
        } => {
            let url = site
                .join(&url)
                .with_context(|| format!("invalid url {url}"))?;
            if worker.install().await.is_ok() {
                worker.activate().await?;
            }

            let request = if navigate {
                FetchRequest::navigate(url)
            } else {
                FetchRequest::get(url)
            };
            println!("generation: {}", worker.generation_name());
            println!("strategy:   {:?}", worker.strategy_for(&request));
            match worker.handle_fetch(&request).await {
                Ok(resp) => {
                    println!("status:     {}", resp.status);
                    println!("bytes:      {}", resp.body.len());
                    if body {
                        println!("{}", resp.text());
                    }
                }
                Err(err) => println!("failed:     {err}"),
            }
        }
        Command::Status => {
            let current = worker.generation();
            let names = services.caches.keys().await?;
            if names.is_empty() {
                println!("no cache generations stored");
            }
            for name in names {
                let entries = db::count_entries(&services.pool, &name).await?;
                let marker = if current.is_current(&name) { "*" } else { " " };
                let version = current.version_of(&name).unwrap_or("-");
                println!("{marker} {name:<32} v{version:<10} {entries} entries");
            }
        }
    }
    Ok(())
}
