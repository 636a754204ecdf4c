use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use site_publisher::build::BuildClient;
use site_publisher::context::PipelineContext;
use site_publisher::flags::ConfigFlags;
use site_publisher::notify::MailClient;
use site_publisher::webhook::{self, WebhookState};
use site_publisher::{config, db, scheduler};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single scheduled publishing tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let ctx = PipelineContext::new(
        pool,
        Arc::new(ConfigFlags::new(cfg.flags.clone())),
        Arc::new(BuildClient::from_config(&cfg.build)?),
        Arc::new(MailClient::from_config(&cfg.notifications)?),
    );

    if args.once {
        let opts = scheduler::JobOptions::from_config(&cfg.scheduler)?;
        match scheduler::run_scheduled_publishing(&ctx, &opts).await? {
            Some(published) => info!(sites = published.len(), "tick finished"),
            None => info!("tick skipped; lease held elsewhere"),
        }
        return Ok(());
    }

    let mut cron = scheduler::start_scheduler(ctx.clone(), &cfg.scheduler).await?;

    let app = webhook::router(WebhookState {
        ctx,
        secret: cfg.webhook.secret.as_deref().map(Arc::from),
    });
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind))?;
    info!(bind = %cfg.app.bind, "webhook server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    cron.shutdown().await?;
    Ok(())
}
