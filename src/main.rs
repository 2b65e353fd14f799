//! WAF Comparison entry point.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waf_comparison::classify::VerdictContract;
use waf_comparison::cli::Args;
use waf_comparison::runner::RunController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waf_comparison=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.into_config()?;

    // The results database and datasets live under mounted directories that
    // may not exist on first run.
    if let Some(parent) = std::path::Path::new(
        config.database_url.trim_start_matches("sqlite://"),
    )
    .parent()
    {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Ctrl-C stops admission of new requests; in-flight requests drain so no
    // observation is lost mid-write.
    let (abort_tx, abort_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; draining in-flight requests before finalizing");
            let _ = abort_tx.send(true);
        }
    });

    let controller = RunController::new(config, VerdictContract::default(), abort_rx);
    let report = controller.run().await?;

    if report.results.is_empty() {
        tracing::error!("run produced no scored targets");
        std::process::exit(1);
    }
    Ok(())
}
