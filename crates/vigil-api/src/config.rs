//! Server configuration.
//!
//! Frame pushes and admin calls have very different shapes: a frame is a
//! few megabytes of image that must be handed off quickly, an admin call is
//! a small JSON document that may wait on a worker ack. Each gets its own
//! body limit and deadline.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rule document looked up when `VIGIL_RULES_PATH` is unset.
pub const DEFAULT_RULES_PATH: &str = "config/rules.json";

const MIB: usize = 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Deadline for admin routes.
    pub admin_timeout: Duration,
    /// Deadline for a frame push, including the hand-off to the worker.
    pub frame_timeout: Duration,
    /// Largest JSON body on admin routes (rule documents included).
    pub admin_body_limit: usize,
    /// Largest encoded frame accepted by `POST /streams/:id/frames`.
    pub frame_body_limit: usize,
    /// Frame pushes in flight before new ones are refused with 503.
    pub max_inflight_frames: usize,
    /// Concurrently running streams; forwarded to the worker.
    pub max_streams: usize,
    /// Rule document loaded at startup and by a bodiless reload.
    pub rules_path: PathBuf,
    /// Fail startup when `rules_path` is missing instead of starting empty.
    pub rules_required: bool,
    pub metrics_enabled: bool,
    pub environment: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["*".to_string()],
            admin_timeout: Duration::from_secs(30),
            frame_timeout: Duration::from_secs(5),
            admin_body_limit: MIB,
            frame_body_limit: 8 * MIB,
            max_inflight_frames: 256,
            max_streams: 64,
            rules_path: PathBuf::from(DEFAULT_RULES_PATH),
            rules_required: false,
            metrics_enabled: true,
            environment: "development".to_string(),
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let explicit_rules = std::env::var("VIGIL_RULES_PATH").ok().map(PathBuf::from);

        Self {
            host: std::env::var("VIGIL_HOST").unwrap_or(defaults.host),
            port: env_parse("VIGIL_PORT").unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| parse_origins(&s))
                .unwrap_or(defaults.cors_origins),
            admin_timeout: env_parse("VIGIL_ADMIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.admin_timeout),
            frame_timeout: env_parse("VIGIL_FRAME_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.frame_timeout),
            admin_body_limit: env_parse("VIGIL_ADMIN_BODY_LIMIT").unwrap_or(defaults.admin_body_limit),
            frame_body_limit: env_parse("VIGIL_FRAME_BODY_LIMIT").unwrap_or(defaults.frame_body_limit),
            max_inflight_frames: env_parse::<usize>("VIGIL_MAX_INFLIGHT_FRAMES")
                .unwrap_or(defaults.max_inflight_frames)
                .max(1),
            max_streams: env_parse("VIGIL_MAX_STREAMS").unwrap_or(defaults.max_streams),
            rules_required: explicit_rules.is_some(),
            rules_path: explicit_rules.unwrap_or(defaults.rules_path),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.metrics_enabled),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Rules file to load at startup, if any.
    ///
    /// A missing file at the default location means "start with no rules";
    /// a missing explicitly configured file is returned anyway so loading
    /// fails loudly.
    pub fn startup_rules(&self) -> Option<&Path> {
        (self.rules_required || self.rules_path.exists()).then_some(self.rules_path.as_path())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_frame_limit_exceeds_admin_limit() {
        let config = ApiConfig::default();
        assert!(config.frame_body_limit > config.admin_body_limit);
        assert!(config.frame_timeout < config.admin_timeout);
        assert_eq!(config.rules_path, PathBuf::from(DEFAULT_RULES_PATH));
    }

    #[test]
    fn test_startup_rules_tolerates_missing_default() {
        let config = ApiConfig {
            rules_path: PathBuf::from("/nonexistent/rules.json"),
            ..ApiConfig::default()
        };
        assert_eq!(config.startup_rules(), None);

        let required = ApiConfig {
            rules_required: true,
            ..config
        };
        assert_eq!(required.startup_rules(), Some(Path::new("/nonexistent/rules.json")));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"rules\": []}").unwrap();
        let present = ApiConfig {
            rules_path: file.path().to_path_buf(),
            ..ApiConfig::default()
        };
        assert_eq!(present.startup_rules(), Some(file.path()));
    }

    #[test]
    fn test_parse_origins_skips_blanks() {
        assert_eq!(
            parse_origins("https://ops.example, ,https://ward.example"),
            vec!["https://ops.example", "https://ward.example"]
        );
    }
}
