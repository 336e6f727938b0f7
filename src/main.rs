use anyhow::Result;
use clap::Parser;
use peakdip_offline::{app, config, model::WorkerMessage};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Seconds between background checks of the live data file
    #[arg(long, default_value = "300")]
    live_check_secs: u64,
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
    let mut page = services.worker.clients().connect().await;

    services.worker.install().await?;
    services.worker.activate().await?;

    // Forward worker broadcasts to the page-side update notifier.
    let updates = services.updates.clone();
    tokio::spawn(async move {
        while let Some(msg) = page.rx.recv().await {
            info!(kind = msg.kind.as_str(), "{}", msg.message);
            if let Some(resolution) = updates.handle_broadcast(&msg).await {
                info!(?resolution, "update prompt resolved");
            }
        }
    });

    // Periodic live-data check, posted to the worker like a page would.
    let worker = services.worker.clone();
    let every = Duration::from_secs(args.live_check_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match worker.handle_message(WorkerMessage::CheckUpdate).await {
                Ok(outcome) => info!(?outcome, "live data checked"),
                Err(err) => error!(?err, "live data check failed"),
            }
        }
    });

    if !services.articles.init().await {
        warn!("article notifications are off; turn them on with `notifications enable`");
    }
    services.updates.start_polling().await;

    info!(
        version = %services.updates.current_version(),
        generation = %services.worker.generation_name(),
        "peakdip offline services running"
    );
    tokio::signal::ctrl_c().await?;

    services.articles.stop_polling().await;
    services.updates.stop_polling().await;
    info!("shutting down");
    Ok(())
}
