use anyhow::{Context, Result};
use rollcall_hw::V4lCapture;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod extractor;
mod operator;
mod store;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();

    let store = Arc::new(
        store::Store::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let operator = Arc::new(operator::Operator::load(&config.operator_path));
    let camera = Arc::new(V4lCapture::new(
        config.camera_device.clone(),
        config.warmup_frames,
    ));
    let extractor = Arc::new(extractor::CommandExtractor::from_command_line(
        config.extractor_cmd.as_deref(),
    ));

    let engine = engine::spawn_engine(
        engine::Collaborators {
            camera,
            extractor: extractor.clone(),
            roster: store.clone(),
            store: store.clone(),
        },
        config.match_threshold,
        config.reset_delay,
    )
    .context("spawning engine thread")?;

    let service = dbus_interface::AttendanceService {
        engine,
        store,
        operator,
        extractor,
    };

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("claiming {BUS_NAME}"))?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        device = %config.camera_device,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
