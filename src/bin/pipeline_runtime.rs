//! Pipeline Runtime - message triage service
//!
//! - Initializes the SQLite store with the schema
//! - Loads the startup model
//! - Runs the read / score / write tasks plus reload check, log rotation
//!   and history export until CTRL+C
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables (see `PipelineConfig`):
//!   TRIAGE_DB_PATH - SQLite database path (default: data/triage.db)
//!   TRIAGE_MODEL_PATH - Model artifact (default: data/model.json)
//!   TRIAGE_UPDATE_DIR - Hot-reload drop directory (default: updates)
//!   TRIAGE_LOG_FILE - Service log (default: logs/triage_service.log)
//!   RUST_LOG - Log filter (default: info)

use dotenv::dotenv;
use log::{error, info};
use msgtriage::pipeline::{
    config::PipelineConfig,
    db::{run_schema_migrations, SqliteStore},
    model::DenseModelLoader,
    recorder::FailureRecorder,
    runtime::{load_initial_model, PipelineRuntime},
};
use rusqlite::Connection;
use std::fs;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let config = PipelineConfig::from_env();
    config.validate()?;

    // Logging goes through the recorder so failures can freeze the log
    let recorder = FailureRecorder::open(&config.log_file, config.log_to_stderr)?;
    recorder.install_logger("info")?;

    info!("🚀 Message Triage Pipeline");
    info!("   ├─ Database: {}", config.db_path.display());
    info!("   ├─ Model: {}", config.model_path.display());
    info!("   ├─ Update dir: {}", config.update_dir.display());
    info!("   ├─ Log file: {}", config.log_file.display());
    info!("   ├─ Queue capacity: {}", config.max_queue);
    info!(
        "   └─ Intervals: read {}s, score {}s, write {}s, reload check {}s",
        config.read_interval_secs,
        config.score_interval_secs,
        config.write_interval_secs,
        config.reload_check_interval_secs
    );

    info!("🔧 Initializing database...");
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn);
    info!("✅ Database initialized");

    let loader = Arc::new(DenseModelLoader);
    let engine = match load_initial_model(loader.clone(), &config.model_path).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("❌ Failed to load startup model: {}", e);
            return Err(e.into());
        }
    };

    let store = Arc::new(SqliteStore::new(&config.db_path));
    let runtime = PipelineRuntime::new(config, store, loader, engine, recorder);

    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        }
        shutdown.cancel();
    });

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match runtime.run().await {
        Ok(()) => {
            info!("✅ Pipeline runtime stopped");
            Ok(())
        }
        Err(e) => {
            error!("💀 Pipeline runtime stopped on fatal error: {}", e);
            Err(e.into())
        }
    }
}
