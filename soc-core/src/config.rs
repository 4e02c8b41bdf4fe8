//! Environment-driven configuration.
//!
//! No config-file crate is used: the teacher binary (`bpmn-lite-server`)
//! resolves its one piece of external config (`DATABASE_URL`) by hand via
//! `std::env::var` with a CLI-arg override, and that's the idiom followed
//! here for every setting.

use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Settings {
    pub redis_url: String,
    pub database_url: Option<String>,

    pub nmap_path: Option<String>,
    pub arp_scan_path: Option<String>,
    pub rustscan_path: Option<String>,

    pub scan_timeout_per_host: u64,
    pub rustscan_batch_size: u32,

    pub firmware_dir: String,
    pub analyzer_logs_dir: String,
    pub analyzer_path: String,
    pub analyzer_gpt_level: String,

    pub ollama_url: String,
    pub ollama_model: String,

    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            database_url: None,
            nmap_path: None,
            arp_scan_path: None,
            rustscan_path: None,
            scan_timeout_per_host: 120,
            rustscan_batch_size: 3000,
            firmware_dir: "./firmware".to_string(),
            analyzer_logs_dir: "./analyzer_logs".to_string(),
            analyzer_path: "/opt/emba/emba".to_string(),
            analyzer_gpt_level: "1".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "mistral".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from environment variables, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            database_url: env::var("DATABASE_URL").ok(),
            nmap_path: env::var("NMAP_PATH").ok(),
            arp_scan_path: env::var("ARP_SCAN_PATH").ok(),
            rustscan_path: env::var("RUSTSCAN_PATH").ok(),
            scan_timeout_per_host: env_parse("SCAN_TIMEOUT_PER_HOST", defaults.scan_timeout_per_host),
            rustscan_batch_size: env_parse("RUSTSCAN_BATCH_SIZE", defaults.rustscan_batch_size),
            firmware_dir: env::var("FIRMWARE_DIR").unwrap_or(defaults.firmware_dir),
            analyzer_logs_dir: env::var("ANALYZER_LOGS_DIR").unwrap_or(defaults.analyzer_logs_dir),
            analyzer_path: env::var("ANALYZER_PATH").unwrap_or(defaults.analyzer_path),
            analyzer_gpt_level: env::var("ANALYZER_GPT_LEVEL").unwrap_or(defaults.analyzer_gpt_level),
            ollama_url: env::var("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            ollama_model: env::var("OLLAMA_MODEL").unwrap_or(defaults.ollama_model),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_per_host)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
