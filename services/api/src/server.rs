use crate::cli::ServeArgs;
use crate::infra::AppState;
use crate::routes::router;
use affiliation_sync::config::AppConfig;
use affiliation_sync::error::AppError;
use affiliation_sync::telemetry;
use affiliation_sync::verification::{BatchScheduler, VerificationContext};
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let context = Arc::new(VerificationContext::from_config(&config)?);
    let scheduler = Arc::new(BatchScheduler::new(context));
    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(scheduler.clone().run(shutdown.clone()));

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
        scheduler,
    };

    let app = router()
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "affiliation sync ready");

    let signal_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            signal_token.cancel();
        })
        .await;

    readiness_flag.store(false, Ordering::Release);
    shutdown.cancel();
    if let Err(err) = worker.await {
        warn!(error = %err, "scheduler task ended abnormally");
    }
    info!("affiliation sync stopped");

    served?;
    Ok(())
}

async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
