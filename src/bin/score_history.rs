//! Score History - one-shot CSV export
//!
//! Writes `score_history.csv` (every scored message of the last
//! `HISTORY_LOOKBACK_DAYS`) into `TRIAGE_UPDATE_DIR` and exits.
//!
//! Usage:
//!   cargo run --release --bin score_history

use dotenv::dotenv;
use log::info;
use msgtriage::pipeline::{config::PipelineConfig, db::SqliteStore, history::export_history};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = PipelineConfig::from_env();

    info!("📊 Exporting score history");
    info!("   ├─ Database: {}", config.db_path.display());
    info!("   ├─ Lookback: {} days", config.history_lookback_days);
    info!("   └─ Output dir: {}", config.update_dir.display());

    let store = SqliteStore::new(&config.db_path);
    let rows = export_history(
        &store,
        &config.update_dir,
        chrono::Utc::now(),
        config.history_lookback_days,
    )
    .await?;

    info!("✅ Done ({} rows)", rows);
    Ok(())
}
