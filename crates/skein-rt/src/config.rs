//! Runtime configuration: compile-time defaults overridable from the
//! environment, and from there overridable again by the CLI layer.

use skein_core::env::{env_get, env_get_bool};

/// Defaults for every knob below. Kept as plain consts rather than
/// inlined literals scattered through `from_env`.
mod defaults {
    pub const TIMER_RESOLUTION_MS: u32 = 10;
    pub const MONITOR_SLOW_TIME_MS: u64 = 1000;
    pub const WARNING_THRESHOLD: usize = 64;
}

/// Everything a `Runtime` needs to start the four subsystem threads and
/// boot the script context, gathered from `args.h`'s `boot_args` field
/// set plus the ambient knobs each subsystem's own config struct wants.
///
/// The socket pool's size is not one of these knobs: like
/// `silly_conf.h`'s `SOCKET_POOL_EXP`, it's a fixed compile-time constant
/// (`skein_net::sid::POOL_BITS`), since it's baked into how a `SocketId`
/// packs its generation and slot index into a single `u64`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub timer_resolution_ms: u32,
    pub monitor_slow_time_ms: u64,
    pub warning_threshold: usize,

    pub reactor_affinity: Option<usize>,
    pub worker_affinity: Option<usize>,
    pub timer_affinity: Option<usize>,

    pub lualib_path: String,
    pub lualib_cpath: String,

    pub log_level: String,
    pub log_path: Option<String>,
    pub pid_file: Option<String>,
    pub daemon: bool,
    pub bootstrap: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Build defaults with environment-variable overrides, mirroring
    /// `SchedulerConfig::from_env`.
    ///
    /// - `SKEIN_TIMER_RESOLUTION_MS`
    /// - `SKEIN_MONITOR_SLOW_MS`
    /// - `SKEIN_QUEUE_WARNING_THRESHOLD`
    pub fn from_env() -> Self {
        Self {
            timer_resolution_ms: env_get(
                "SKEIN_TIMER_RESOLUTION_MS",
                defaults::TIMER_RESOLUTION_MS,
            ),
            monitor_slow_time_ms: env_get("SKEIN_MONITOR_SLOW_MS", defaults::MONITOR_SLOW_TIME_MS),
            warning_threshold: env_get(
                "SKEIN_QUEUE_WARNING_THRESHOLD",
                defaults::WARNING_THRESHOLD,
            ),
            reactor_affinity: None,
            worker_affinity: None,
            timer_affinity: None,
            lualib_path: String::new(),
            lualib_cpath: String::new(),
            log_level: "info".to_string(),
            log_path: None,
            pid_file: None,
            daemon: env_get_bool("SKEIN_DAEMON", false),
            bootstrap: None,
        }
    }

    pub fn new() -> Self {
        Self {
            timer_resolution_ms: defaults::TIMER_RESOLUTION_MS,
            monitor_slow_time_ms: defaults::MONITOR_SLOW_TIME_MS,
            warning_threshold: defaults::WARNING_THRESHOLD,
            reactor_affinity: None,
            worker_affinity: None,
            timer_affinity: None,
            lualib_path: String::new(),
            lualib_cpath: String::new(),
            log_level: "info".to_string(),
            log_path: None,
            pid_file: None,
            daemon: false,
            bootstrap: None,
        }
    }

    // Builder methods, applied by the CLI layer over whatever `from_env`
    // already resolved.

    pub fn timer_resolution_ms(mut self, ms: u32) -> Self {
        self.timer_resolution_ms = ms;
        self
    }

    pub fn monitor_slow_time_ms(mut self, ms: u64) -> Self {
        self.monitor_slow_time_ms = ms;
        self
    }

    pub fn reactor_affinity(mut self, cpu: Option<usize>) -> Self {
        self.reactor_affinity = cpu;
        self
    }

    pub fn worker_affinity(mut self, cpu: Option<usize>) -> Self {
        self.worker_affinity = cpu;
        self
    }

    pub fn timer_affinity(mut self, cpu: Option<usize>) -> Self {
        self.timer_affinity = cpu;
        self
    }

    pub fn lualib_path(mut self, path: impl Into<String>) -> Self {
        self.lualib_path = path.into();
        self
    }

    pub fn lualib_cpath(mut self, path: impl Into<String>) -> Self {
        self.lualib_cpath = path.into();
        self
    }

    pub fn bootstrap(mut self, path: impl Into<String>) -> Self {
        self.bootstrap = Some(path.into());
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn pid_file(mut self, path: impl Into<String>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_resolution_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "timer_resolution_ms must be > 0",
            ));
        }
        if self.monitor_slow_time_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "monitor_slow_time_ms must be > 0",
            ));
        }
        if self.warning_threshold == 0 {
            return Err(ConfigError::InvalidValue("warning_threshold must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = RuntimeConfig::from_env();
        assert!(config.validate().is_ok());
        assert!(config.timer_resolution_ms > 0);
    }

    #[test]
    fn builder_overrides() {
        let config = RuntimeConfig::new()
            .monitor_slow_time_ms(500)
            .reactor_affinity(Some(2));
        assert_eq!(config.monitor_slow_time_ms, 500);
        assert_eq!(config.reactor_affinity, Some(2));
    }

    #[test]
    fn rejects_zero_resolution() {
        let config = RuntimeConfig::new().timer_resolution_ms(0);
        assert!(config.validate().is_err());
    }
}
