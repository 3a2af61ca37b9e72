use std::path::PathBuf;

use anyhow::Context;
use odrive_control_lib::config::AppSettings;

const DEFAULT_SETTINGS_PATH: &str = "odrive-control.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
    let settings = AppSettings::load_or_default(&path).context("Could not load settings")?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log_level.as_str())).init();
    log::info!("odrive-control {} starting", env!("CARGO_PKG_VERSION"));

    odrive_control_lib::run(settings).await
}
