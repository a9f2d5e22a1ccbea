//! 設定: config/default.toml と環境変数から読み込む
//!
//! 読み込み順: `config/default.toml`（あれば）→ `--config` で指定したファイル →
//! 環境変数 `GLEANER__*`（二重アンダースコアでネスト、例: `GLEANER__SINK__BASE_URL`）。
//! すべての項目に既定値があるので、何も無くても起動できます。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::app::SchedulerSettings;
use crate::monitor::{HealthMarkers, ThrottlePolicy};
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GleanerConfig {
    pub scheduler: SchedulerSection,
    pub retry: RetrySection,
    pub throttle: ThrottleSection,
    pub health: HealthMarkers,
    pub delivery: DeliverySection,
    pub telemetry: TelemetrySection,
    pub sink: SinkSection,
    pub store: StoreSection,
    pub executor: ExecutorSection,
}

/// [scheduler]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_secs: u64,
    pub recommendation_cooldown_secs: u64,
    pub recommendation_limit: usize,
    pub recycle_batch_size: usize,
    pub navigation_timeout_secs: u64,
    pub challenge_poll_interval_secs: u64,
    pub rate_limit_cooldown_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 3,
            recommendation_cooldown_secs: 15,
            recommendation_limit: 10,
            recycle_batch_size: 5,
            navigation_timeout_secs: 45,
            challenge_poll_interval_secs: 30,
            rate_limit_cooldown_secs: 300,
        }
    }
}

/// [retry]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub multiplier: f64,
    pub jitter_fraction: f64,
    pub max_retries: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            max_delay_secs: 30 * 60,
            multiplier: 2.0,
            jitter_fraction: 0.2,
            max_retries: 3,
        }
    }
}

/// [throttle]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThrottleSection {
    /// false: no pauses at all (fixture replays).
    pub enabled: bool,
    pub base_min_ms: u64,
    pub base_max_ms: u64,
    pub session_page_limit: u32,
    pub cooldown_min_secs: u64,
    pub cooldown_max_secs: u64,
    pub latency_reference_ms: u64,
    pub latency_smoothing: f64,
    pub night_multiplier: f64,
    pub peak_multiplier: f64,
    pub utc_offset_minutes: i32,
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_min_ms: 4_000,
            base_max_ms: 9_000,
            session_page_limit: 40,
            cooldown_min_secs: 60,
            cooldown_max_secs: 180,
            latency_reference_ms: 5_000,
            latency_smoothing: 0.3,
            night_multiplier: 1.5,
            peak_multiplier: 1.2,
            utc_offset_minutes: 0,
        }
    }
}

/// [delivery]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    pub capacity: usize,
    pub flush_batch: usize,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            capacity: 3000,
            flush_batch: 20,
        }
    }
}

/// [telemetry]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub min_interval_secs: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            min_interval_secs: 10,
        }
    }
}

/// [sink]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            timeout_secs: 10,
        }
    }
}

/// [store]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub dir: PathBuf,
    /// A runner lock whose heartbeat is older than this is treated as abandoned.
    pub lock_stale_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".gleaner/state"),
            lock_stale_secs: 30,
            heartbeat_secs: 10,
        }
    }
}

/// [executor]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Root of the recorded pages replayed by `FixtureExecutor`.
    pub fixtures_dir: PathBuf,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            fixtures_dir: PathBuf::from("fixtures"),
        }
    }
}

impl GleanerConfig {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let s = &self.scheduler;
        SchedulerSettings {
            tick_interval: Duration::from_secs(s.tick_interval_secs.max(1)),
            flush_batch: self.delivery.flush_batch,
            recommendation_cooldown: Duration::from_secs(s.recommendation_cooldown_secs),
            recommendation_limit: s.recommendation_limit,
            recycle_batch_size: s.recycle_batch_size,
            navigation_timeout: Duration::from_secs(s.navigation_timeout_secs),
            challenge_poll_interval: Duration::from_secs(s.challenge_poll_interval_secs),
            rate_limit_cooldown: Duration::from_secs(s.rate_limit_cooldown_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.retry;
        RetryPolicy {
            base_delay: Duration::from_secs(r.base_delay_secs),
            max_delay: Duration::from_secs(r.max_delay_secs),
            multiplier: r.multiplier,
            jitter_fraction: r.jitter_fraction.clamp(0.0, 1.0),
            max_retries: r.max_retries,
        }
    }

    pub fn throttle_policy(&self) -> ThrottlePolicy {
        let t = &self.throttle;
        if !t.enabled {
            return ThrottlePolicy::none();
        }
        ThrottlePolicy {
            base_min: Duration::from_millis(t.base_min_ms),
            base_max: Duration::from_millis(t.base_max_ms.max(t.base_min_ms)),
            session_page_limit: t.session_page_limit,
            cooldown_min: Duration::from_secs(t.cooldown_min_secs),
            cooldown_max: Duration::from_secs(t.cooldown_max_secs.max(t.cooldown_min_secs)),
            latency_reference: Duration::from_millis(t.latency_reference_ms),
            latency_smoothing: t.latency_smoothing,
            night_multiplier: t.night_multiplier,
            peak_multiplier: t.peak_multiplier,
            utc_offset_minutes: t.utc_offset_minutes,
        }
    }

    /// Reject float settings that would poison delay arithmetic (TOML allows `nan` / `inf`).
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let floats = [
            ("retry.multiplier", self.retry.multiplier),
            ("retry.jitter_fraction", self.retry.jitter_fraction),
            ("throttle.latency_smoothing", self.throttle.latency_smoothing),
            ("throttle.night_multiplier", self.throttle.night_multiplier),
            ("throttle.peak_multiplier", self.throttle.peak_multiplier),
        ];
        for (name, value) in floats {
            if !value.is_finite() || value < 0.0 {
                return Err(config::ConfigError::Message(format!(
                    "{name} must be a finite, non-negative number (got {value})"
                )));
            }
        }
        Ok(())
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.store.lock_stale_secs.max(self.store.heartbeat_secs * 2))
    }

    pub fn lock_heartbeat(&self) -> Duration {
        Duration::from_secs(self.store.heartbeat_secs.max(1))
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink.timeout_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.min_interval_secs)
    }
}

/// config ディレクトリから設定を読み込み、`GLEANER__*` で上書き
pub fn load_config(config_path: Option<PathBuf>) -> Result<GleanerConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("GLEANER")
            .separator("__")
            .try_parsing(true),
    );

    let config: GleanerConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_the_policies() {
        let config = GleanerConfig::default();
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.throttle_policy(), ThrottlePolicy::default());
        assert_eq!(config.scheduler_settings(), SchedulerSettings::default());
        assert_eq!(config.delivery.capacity, 3000);
        assert_eq!(config.telemetry_interval(), Duration::from_secs(10));
        assert_eq!(config.lock_stale_after(), Duration::from_secs(30));
        assert_eq!(config.lock_heartbeat(), Duration::from_secs(10));
    }

    #[test]
    fn file_overrides_individual_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gleaner.toml");
        std::fs::write(
            &path,
            r#"
[retry]
max_retries = 5

[throttle]
enabled = false

[sink]
base_url = "https://sink.example"
api_key = "secret"

[health]
challenge = ["verify you are human"]
"#,
        )
        .unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_secs, 30);
        assert_eq!(config.throttle_policy(), ThrottlePolicy::none());
        assert_eq!(config.sink.base_url, "https://sink.example");
        assert_eq!(config.sink.api_key.as_deref(), Some("secret"));
        assert_eq!(config.health.challenge, vec!["verify you are human".to_string()]);
        assert!(!config.health.login_paths.is_empty());
    }

    #[rstest]
    #[case("[retry]\njitter_fraction = nan\n")]
    #[case("[retry]\nmultiplier = inf\n")]
    #[case("[throttle]\nnight_multiplier = -1.0\n")]
    fn non_finite_floats_are_rejected(#[case] body: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gleaner.toml");
        std::fs::write(&path, body).unwrap();
        let err = load_config(Some(path)).unwrap_err();
        assert!(err.to_string().contains("finite"), "{err}");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(dir.path().join("absent.toml"))).is_err());
    }
}
