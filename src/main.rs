mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use ofelia::event_watcher::EventWatcher;
use ofelia::pipeline::{NotifyConfig, OverlapGuard, SaveMiddleware, SlackNotifyMiddleware};
use ofelia::reconciler::Reconciler;
use ofelia::runtime::BollardRuntime;
use ofelia::scheduler::Scheduler;
use ofelia::sources::{JobSource, LabelSource};

use crate::cli::{Command, RunArgs};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = cli::Cli::parse();
    match cli.command {
        Command::Run(run_args) => run(run_args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let runtime: Arc<dyn ofelia::runtime::RuntimePort> =
        Arc::new(BollardRuntime::connect(&args.docker_host)?);
    runtime.ping().await?;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let event_watcher = Arc::new(EventWatcher::spawn(runtime.clone(), shutdown.child_token()));

    let scheduler = Scheduler::new();
    scheduler
        .use_middlewares(vec![
            Arc::new(OverlapGuard),
            Arc::new(SaveMiddleware),
            Arc::new(SlackNotifyMiddleware::default()),
        ])
        .await;

    let container_label_selector = args
        .container_label_selector
        .as_deref()
        .map(cli::parse_label_selector)
        .transpose()?;

    let label_source: Arc<dyn JobSource> = Arc::new(LabelSource::new(
        runtime.clone(),
        args.label_prefixes.clone(),
        container_label_selector,
        args.allow_host_jobs,
        args.history_limit,
    ));

    let notify = NotifyConfig {
        slack_webhook: args.slack_webhook.clone(),
        mail_to: None,
        cooldown: Duration::from_secs(300),
    };

    let reconciler = Reconciler::new(runtime.clone(), Some(event_watcher.clone()))
        .with_save_folder(args.save_folder.clone())
        .with_notify(notify);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let reconcile_interval = Duration::from_secs(args.reconcile_interval_secs.max(1));
    let mut ticker = tokio::time::interval(reconcile_interval);

    info!(interval_secs = reconcile_interval.as_secs(), "scheduler running");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reconciler.run_tick(&scheduler, label_source.as_ref()).await {
                    Ok(actions) if !actions.is_empty() => {
                        info!(count = actions.len(), "reconcile tick applied changes");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reconcile tick failed"),
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    scheduler
        .shutdown(Duration::from_secs(args.shutdown_grace_secs))
        .await;

    Ok(())
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
