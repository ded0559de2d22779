use rollcall_core::DEFAULT_MATCH_THRESHOLD;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Frames discarded after the stream starts, while exposure settles.
    pub warmup_frames: usize,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where the signed-in operator is remembered between restarts.
    pub operator_path: PathBuf,
    /// Euclidean distance below which a face matches a template.
    pub match_threshold: f32,
    /// Delay before a persisted session resets itself.
    pub reset_delay: Duration,
    /// External feature extraction command line, if configured.
    pub extractor_cmd: Option<String>,
    /// Claim the bus name on the system bus rather than the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let operator_path = std::env::var("ROLLCALL_OPERATOR_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("operator.json"));

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            warmup_frames: env_usize("ROLLCALL_WARMUP_FRAMES", 4),
            db_path,
            operator_path,
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            reset_delay: Duration::from_millis(env_u64("ROLLCALL_RESET_DELAY_MS", 3000)),
            extractor_cmd: std::env::var("ROLLCALL_EXTRACTOR_CMD")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            system_bus: std::env::var("ROLLCALL_SYSTEM_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
