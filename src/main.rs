use huawei_esm_fleet::{Config, Fleet};
use tracing::{error, info};

#[tokio::main]
async fn main() -> huawei_esm_fleet::error::Result<()> {
    let mut config = Config::default();
    config.fleet = vec![214];

    let fleet = Fleet::open(config).await?;

    let report = fleet.initialize().await;
    info!(?report, "fleet initialization complete");

    if report.initialized_count == 0 {
        error!("no batteries initialized, exiting");
        return Ok(());
    }

    fleet.start_monitoring().await;

    tokio::signal::ctrl_c().await.ok();
    fleet.stop_monitoring().await;
    Ok(())
}
