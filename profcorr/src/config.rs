//! Agent configuration from the environment.
//!
//! | variable | meaning |
//! |---|---|
//! | `RUST_LOG` | full filter directives, takes precedence over `PROFCORR_LOG` |
//! | `PROFCORR_LOG` | level for the agent's own targets (`error`..`trace`) |
//! | `LOG_FORMAT` | `json` for structured output, anything else for text |
//! | `PROFCORR_VIRTUAL_THREADS` | enable virtual thread bridging at init |

use std::fmt;

pub const RUST_LOG_ENV: &str = "RUST_LOG";
pub const LOG_LEVEL_ENV: &str = "PROFCORR_LOG";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const VIRTUAL_THREADS_ENV: &str = "PROFCORR_VIRTUAL_THREADS";

/// Targets the level from `PROFCORR_LOG` applies to.
const LOG_TARGETS: &[&str] = &["profcorr", "profcorr_agent"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Unknown values fall back to the default level.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => Self::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Raw `RUST_LOG` directives, used verbatim when present.
    pub directives: Option<String>,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            level: lookup(LOG_LEVEL_ENV)
                .map(|v| LogLevel::parse(&v))
                .unwrap_or_default(),
            format: match lookup(LOG_FORMAT_ENV).as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            directives: lookup(RUST_LOG_ENV).filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    /// Filter string for an `EnvFilter`.
    pub fn filter_directives(&self) -> String {
        if let Some(directives) = &self.directives {
            return directives.clone();
        }
        LOG_TARGETS
            .iter()
            .map(|target| format!("{target}={}", self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentConfig {
    /// Enable virtual thread bridging during init when the runtime supports it.
    pub virtual_threads: bool,
    pub log: LogConfig,
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            virtual_threads: lookup(VIRTUAL_THREADS_ENV)
                .as_deref()
                .and_then(parse_flag)
                .unwrap_or(false),
            log: LogConfig::from_lookup(&lookup),
        }
    }

    pub fn with_virtual_threads(mut self, enabled: bool) -> Self {
        self.virtual_threads = enabled;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| env.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = AgentConfig::from_lookup(lookup(&[]));
        assert_eq!(config, AgentConfig::default());
        assert!(!config.virtual_threads);
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.log.format, LogFormat::Text);
        assert_eq!(
            config.log.filter_directives(),
            "profcorr=info,profcorr_agent=info"
        );
    }

    #[test]
    fn reads_every_variable() {
        let config = AgentConfig::from_lookup(lookup(&[
            (VIRTUAL_THREADS_ENV, "true"),
            (LOG_LEVEL_ENV, "warning"),
            (LOG_FORMAT_ENV, "json"),
        ]));
        assert!(config.virtual_threads);
        assert_eq!(config.log.level, LogLevel::Warn);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(
            config.log.filter_directives(),
            "profcorr=warn,profcorr_agent=warn"
        );
    }

    #[test]
    fn rust_log_wins_over_level() {
        let log = LogConfig::from_lookup(lookup(&[
            (RUST_LOG_ENV, "profcorr::socket=trace"),
            (LOG_LEVEL_ENV, "error"),
        ]));
        assert_eq!(log.filter_directives(), "profcorr::socket=trace");

        let blank = LogConfig::from_lookup(lookup(&[(RUST_LOG_ENV, "  ")]));
        assert_eq!(blank.directives, None);
    }

    #[test]
    fn flag_parsing() {
        for on in ["1", "TRUE", "yes", "on"] {
            assert_eq!(parse_flag(on), Some(true), "{on}");
        }
        for off in ["0", "false", "No", "off", ""] {
            assert_eq!(parse_flag(off), Some(false), "{off}");
        }
        assert_eq!(parse_flag("maybe"), None);

        let config = AgentConfig::from_lookup(lookup(&[(VIRTUAL_THREADS_ENV, "maybe")]));
        assert!(!config.virtual_threads);
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(LogLevel::parse("loud"), LogLevel::Info);
        assert_eq!(LogLevel::parse(" Debug "), LogLevel::Debug);
    }

    #[test]
    fn builder_overrides() {
        let config = AgentConfig::new().with_virtual_threads(true).with_log(
            LogConfig::default()
                .with_level(LogLevel::Trace)
                .with_format(LogFormat::Json)
                .with_directives("warn"),
        );
        assert!(config.virtual_threads);
        assert_eq!(config.log.level, LogLevel::Trace);
        assert_eq!(config.log.filter_directives(), "warn");
    }
}
