//! simple_bank server
//!
//! HTTP API, task processor and maintenance jobs in one process.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use simple_bank::api::{build_app, AppState};
use simple_bank::jobs::JobScheduler;
use simple_bank::mail::{EmailSender, MemorySender, SmtpSender};
use simple_bank::store::{PgStore, Store};
use simple_bank::telemetry::LogConfig;
use simple_bank::worker::{
    Broker, BrokerTaskDistributor, PgBroker, SendVerifyEmailHandler, ServeMux, TaskProcessor,
    TASK_SEND_VERIFY_EMAIL,
};
use simple_bank::{db, Config, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    LogConfig::from_config(&config).init()?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!(environment = %config.environment, "Starting simple_bank server");
    tracing::info!("Connecting to database...");

    let pool = db::connect(&config).await?;
    db::verify_connection(&pool).await?;

    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    tracing::info!("Database connected successfully");

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(pool.clone()));
    let distributor = Arc::new(BrokerTaskDistributor::new(broker.clone()));

    let mailer: Arc<dyn EmailSender> = if config.email.is_configured() {
        Arc::new(SmtpSender::new(&config.email)?)
    } else {
        tracing::warn!("EMAIL_SENDER_PASSWORD not set; verification mails are kept in memory");
        Arc::new(MemorySender::new())
    };

    let mut mux = ServeMux::new();
    mux.handle(
        TASK_SEND_VERIFY_EMAIL,
        Arc::new(SendVerifyEmailHandler::new(
            store.clone(),
            mailer,
            config.verify_email_url.clone(),
        )),
    );

    let processor = TaskProcessor::new(broker.clone(), mux, config.worker_config());
    processor.start();

    let shutdown = CancellationToken::new();
    let jobs = JobScheduler::new(pool.clone(), broker).start(shutdown.clone());

    let ledger = Ledger::new(store, distributor);
    let app = build_app(AppState::new(ledger, config.verify_email_task_options()));

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Server shutting down...");
    processor.shutdown().await;
    shutdown.cancel();
    if let Err(e) = jobs.await {
        tracing::warn!(error = %e, "Job scheduler exited abnormally");
    }
    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
