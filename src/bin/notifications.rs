use anyhow::Result;
use clap::{Parser, Subcommand};
use peakdip_offline::{app, config};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Control new-article notifications")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Enable,
    Disable,
    Status,
    /// Run one notification cycle now, bypassing the metadata cache
    Check,
    /// Forget which articles were already announced
    Reset,
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
    let notifier = &services.articles;

    match args.command {
        Command::Enable => println!("{:?}", notifier.enable().await?),
        Command::Disable => {
            notifier.disable().await?;
            println!("Disabled");
        }
        Command::Status => println!("{:#?}", notifier.status().await),
        Command::Check => println!("{:?}", notifier.check_for_new_articles(true).await),
        Command::Reset => {
            notifier.reset_notified().await?;
            println!("Notified articles forgotten");
        }
    }
    notifier.stop_polling().await;
    Ok(())
}
