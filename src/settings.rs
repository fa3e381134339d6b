use serde::Deserialize;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use serde_yaml::Error;
use backtrace::Backtrace;
use log::error;

// Main configuration struct, passed explicitly to every component
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub imap: ImapConfig,
    pub telegram: TelegramConfig,
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImapConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub chat_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    /// Addresses whose incoming mail is forwarded. Compared
    /// case-insensitively, as whole addresses.
    pub target_addresses: Vec<String>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_seconds: u64,
    /// How long one IDLE round may last before it is re-issued. Keep well
    /// under the 29-minute server-side ceiling.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
        }
    }
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    1500
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u32 {
    20
}

pub fn load_settings(path: &Path) -> Result<Config, Error> {
    // Open the YAML file
    let file = File::open(path);
    let file = match file {
        Ok(file) => file,
        Err(err) => {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            panic!("Cannot find settings")
        }
    };

    let reader = BufReader::new(file);

    // Parse the YAML file into the Config struct
    let config_result = serde_yaml::from_reader(reader);
    let config: Config = match config_result {
        Ok(config) => config,
        Err(err) => {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            panic!("Cannot deserialize settings")
        }
    };

    Ok(config)
}
