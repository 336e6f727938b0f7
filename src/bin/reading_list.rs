use anyhow::Result;
use clap::{Parser, Subcommand};
use peakdip_offline::reading_list::{AddOutcome, NewItem};
use peakdip_offline::{app, config};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage the saved-articles reading list")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print saved articles, newest first
    List,
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        published: Option<String>,
    },
    Remove {
        ids: Vec<String>,
    },
    Search {
        query: String,
    },
    /// Remove everything (asks for confirmation via app.auto_confirm)
    Clear,
    /// Write the list as JSON to stdout or a file
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Merge a previously exported JSON file
    Import {
        file: PathBuf,
    },
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
    let services = app::build(cfg).await?;
    let list = &services.reading_list;

    match args.command {
        Command::List => {
            for item in list.sort_by_date(true).await {
                println!("{}  {}  {}", item.saved_at.format("%Y-%m-%d %H:%M"), item.id, item.title);
            }
        }
        Command::Add {
            id,
            title,
            url,
            published,
        } => {
            let outcome = list
                .add(NewItem {
                    id,
                    title,
                    url,
                    published_date: published,
                })
                .await?;
            match outcome {
                AddOutcome::Added => println!("Saved."),
                AddOutcome::AlreadySaved => println!("Already in your reading list."),
            }
        }
        Command::Remove { ids } => {
            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            let removed = list.remove_multiple(&refs).await?;
            println!("Removed {removed}.");
        }
        Command::Search { query } => {
            for item in list.search(&query).await {
                println!("{}  {}", item.id, item.title);
            }
        }
        Command::Clear => {
            if list.clear_all().await? {
                println!("Cleared.");
            } else {
                println!("Kept.");
            }
        }
        Command::Export { out } => {
            let json = list.export().await?;
            match out {
                Some(path) => tokio::fs::write(path, json).await?,
                None => println!("{json}"),
            }
        }
        Command::Import { file } => {
            let text = tokio::fs::read_to_string(file).await?;
            let summary = list.import(&text).await?;
            println!("Added {}, replaced {}.", summary.added, summary.replaced);
        }
    }
    Ok(())
}
