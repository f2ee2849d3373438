use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let log_level = std::env::var("RUST_DC_LOG").unwrap_or_else(|_| "info".to_string());
        let data_dir = std::env::var("RUST_DC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".rust-dc")
            });
        Self {
            log_level,
            data_dir,
        }
    }
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG (standard in Rust ecosystem)
    // 2) RUST_DC_LOG
    // 3) default (info)
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| config.log_level.clone());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}
