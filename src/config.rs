use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::sqlpool::SqlConfig;

/// Trigger-mode selector: 0 = both level-triggered, 1 = client
/// edge-triggered, 2 = listener edge-triggered, 3 = both edge-triggered.
pub const TRIGGER_BOTH_LT: u8 = 0;
pub const TRIGGER_CONN_ET: u8 = 1;
pub const TRIGGER_LISTEN_ET: u8 = 2;
pub const TRIGGER_BOTH_ET: u8 = 3;

/// Constructor-equivalent server parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port. 1024-65535, or 0 to let the OS pick an ephemeral
    /// port (useful in tests).
    pub port: u16,
    pub trigger_mode: u8,
    /// Idle timeout per connection in milliseconds; 0 disables eviction.
    pub timeout_ms: u64,
    /// SO_LINGER with a one-second window on the listener.
    pub linger: bool,
    /// Directory served; defaults to `<cwd>/resources`.
    pub src_dir: Option<PathBuf>,
    pub worker_threads: usize,
    /// Credential store; `None` runs the server file-serving only.
    pub sql: Option<SqlConfig>,
    pub log_enable: bool,
    /// 0 = debug, 1 = info, 2 = warn, 3 = error.
    pub log_level: u8,
    /// 0 writes synchronously; otherwise the async queue length.
    pub log_queue_size: usize,
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1316,
            trigger_mode: TRIGGER_BOTH_ET,
            timeout_ms: 60_000,
            linger: false,
            src_dir: None,
            worker_threads: num_cpus::get(),
            sql: None,
            log_enable: true,
            log_level: 1,
            log_queue_size: 1024,
            log_dir: PathBuf::from("./log"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.port != 0 && self.port < 1024 {
            return Err(Error::Config(format!(
                "port {} out of range (1024-65535)",
                self.port
            )));
        }
        if self.trigger_mode > TRIGGER_BOTH_ET {
            return Err(Error::Config(format!(
                "trigger mode {} out of range (0-3)",
                self.trigger_mode
            )));
        }
        if self.worker_threads == 0 {
            return Err(Error::Config("worker thread count must be positive".into()));
        }
        if let Some(sql) = &self.sql {
            if sql.pool_size == 0 {
                return Err(Error::Config("SQL pool size must be positive".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn privileged_ports_are_rejected() {
        let cfg = Config {
            port: 80,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ephemeral_port_is_allowed() {
        let cfg = Config {
            port: 0,
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn bad_trigger_mode_is_rejected() {
        let cfg = Config {
            trigger_mode: 4,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
