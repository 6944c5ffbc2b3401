use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use bill_reconciler::config::AppConfig;
use bill_reconciler::context::AppContext;
use bill_reconciler::pipeline::handler::NotificationHandler;
use bill_reconciler::pipeline::ledger::spawn_ledger_purge;
use bill_reconciler::pipeline::watch::spawn_watch_renewal;
use bill_reconciler::server::push_routes;
use bill_reconciler::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("📬 Bill Reconciler v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Push endpoint: http://{}/pubsub/push", config.bind_addr);
    eprintln!("   Calendar: {}", config.calendar_name);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let ctx = AppContext::from_config(&config, Arc::clone(&db))?;
    eprintln!("   Rules: {} loaded", ctx.classifier.rules().len());
    let handler = Arc::new(NotificationHandler::new(&ctx));

    let (_purge_handle, purge_shutdown) =
        spawn_ledger_purge(Arc::clone(&ctx.ledger), config.ledger_purge_interval);

    let watch_shutdown = match &config.pubsub_topic {
        Some(topic) => {
            eprintln!("   Watch: {topic}");
            let (_handle, shutdown) = spawn_watch_renewal(
                Arc::clone(&ctx.mailbox),
                Arc::clone(&db),
                topic.clone(),
                config.watch_renew_interval,
            );
            Some(shutdown)
        }
        None => {
            eprintln!("   Watch: disabled (no topic)");
            None
        }
    };

    // ── Server ───────────────────────────────────────────────────────────
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "Push server started");

    axum::serve(listener, push_routes(handler))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("serving")?;

    purge_shutdown.store(true, Ordering::Relaxed);
    if let Some(flag) = watch_shutdown {
        flag.store(true, Ordering::Relaxed);
    }
    Ok(())
}

/// Stderr logging, plus a daily-rolling file when a log directory is set.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bill-reconciler.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}
