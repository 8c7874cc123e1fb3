use std::sync::Arc;

use anyhow::Context;
use catalog_import::{
    catalog::SqliteCatalog, config::Settings, db, http, pipeline::Pipeline,
    service::ImportService, store::SqliteKv, upload::Uploads,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let settings = Settings::from_env()?;

    std::fs::create_dir_all(settings.uploads_dir()).with_context(|| {
        format!(
            "Failed to create data directory '{}'. \
            If using host mounts, ensure the directory exists and has correct permissions",
            settings.data_dir.display()
        )
    })?;

    let pool = db::connect(&settings.database_url).await?;

    let kv = Arc::new(SqliteKv::new(pool.clone(), settings.max_value_bytes));
    let catalog = Arc::new(SqliteCatalog::new(pool.clone()));
    let pipeline = Pipeline::new(pool, kv, catalog, settings.pipeline_options());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = pipeline.start_workers(shutdown_rx).await?;

    let service = ImportService::new(
        pipeline,
        Uploads::new(settings.uploads_dir()),
        settings.default_batch_size,
    );
    let app = http::router(service);

    let listener = TcpListener::bind(settings.bind_addr()).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping workers");
    shutdown_tx.send(true).ok();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
