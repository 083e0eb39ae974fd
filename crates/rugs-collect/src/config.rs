//! Configuration for rugs-collect.
//!
//! Supports loading from TOML file with CLI argument overrides. The resulting
//! [`CollectConfig`] is built once at startup and passed by reference to every
//! component; nothing reads configuration from global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::analyzer::AnalyzerConfig;
use crate::supervisor::SupervisorConfig;
use crate::tracker::TrackerConfig;

/// Default game feed (Socket.IO over WebSocket).
pub const DEFAULT_FEED_URL: &str = "wss://backend.rugs.fun/socket.io/?EIO=4&transport=websocket";

/// Which optional fields a session record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOptions {
    /// Embed the full ordered event buffer.
    pub include_events: bool,
    /// Keep per-participant and per-tick trade breakdowns.
    pub include_trade_detail: bool,
    /// Emit nanosecond timing as decimal strings.
    pub include_timing: bool,
}

impl RecordOptions {
    /// Summary only.
    pub fn basic() -> Self {
        Self {
            include_events: false,
            include_trade_detail: false,
            include_timing: false,
        }
    }

    /// Summary plus trade breakdowns.
    pub fn trades() -> Self {
        Self {
            include_trade_detail: true,
            ..Self::basic()
        }
    }

    /// Summary plus high-resolution timing.
    pub fn timing() -> Self {
        Self {
            include_timing: true,
            ..Self::basic()
        }
    }

    /// Everything, including the raw event buffer.
    pub fn full() -> Self {
        Self {
            include_events: true,
            include_trade_detail: true,
            include_timing: true,
        }
    }
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self::full()
    }
}

/// Named collector profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Basic,
    Trades,
    Timing,
    Full,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Basic => "basic",
            Profile::Trades => "trades",
            Profile::Timing => "timing",
            Profile::Full => "full",
        }
    }

    pub fn options(&self) -> RecordOptions {
        match self {
            Profile::Basic => RecordOptions::basic(),
            Profile::Trades => RecordOptions::trades(),
            Profile::Timing => RecordOptions::timing(),
            Profile::Full => RecordOptions::full(),
        }
    }
}

/// Parse profile string to Profile.
fn parse_profile(s: &str) -> Option<Profile> {
    match s.to_lowercase().as_str() {
        "basic" | "minimal" => Some(Profile::Basic),
        "trades" | "enhanced" => Some(Profile::Trades),
        "timing" | "precision" => Some(Profile::Timing),
        "full" | "all" => Some(Profile::Full),
        _ => None,
    }
}

/// Output locations.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Root of the hour-bucketed session tree.
    pub root: PathBuf,
    /// If set, the health task rewrites the stats snapshot here.
    pub status_file: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("rugs-data"),
            status_file: None,
        }
    }
}

/// Top-level configuration for rugs-collect.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    pub log_level: String,
    pub profile: Profile,
    pub output: OutputConfig,
    pub supervisor: SupervisorConfig,
    pub analyzer: AnalyzerConfig,
    pub tracker: TrackerConfig,
    pub health_log_interval: Duration,
    /// The collector is considered dead if connected but silent this long.
    pub alive_timeout: Duration,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            profile: Profile::Full,
            output: OutputConfig::default(),
            supervisor: SupervisorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            tracker: TrackerConfig::default(),
            health_log_interval: Duration::from_secs(30),
            alive_timeout: Duration::from_secs(60),
        }
    }
}

impl CollectConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(
        &mut self,
        url: Option<String>,
        output_root: Option<PathBuf>,
        profile: Option<String>,
    ) {
        if let Some(url) = url {
            self.supervisor.url = url;
        }

        if let Some(root) = output_root {
            self.output.root = root;
        }

        if let Some(profile) = profile.as_deref().and_then(parse_profile) {
            self.profile = profile;
        }
    }

    pub fn record_options(&self) -> RecordOptions {
        self.profile.options()
    }
}

/// TOML file structure for deserialization.
#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    output: OutputToml,
    #[serde(default)]
    connection: ConnectionToml,
    #[serde(default)]
    detection: DetectionToml,
    #[serde(default)]
    health: HealthToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    url: String,
    log_level: String,
    profile: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            log_level: "info".to_string(),
            profile: "full".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct OutputToml {
    root: PathBuf,
    status_file: Option<PathBuf>,
}

impl Default for OutputToml {
    fn default() -> Self {
        let defaults = OutputConfig::default();
        Self {
            root: defaults.root,
            status_file: defaults.status_file,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConnectionToml {
    reconnect_delay_secs: u64,
    channel_capacity: usize,
}

impl Default for ConnectionToml {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            channel_capacity: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DetectionToml {
    suspicious_gap_ms: u64,
    summary_capacity: usize,
    alert_capacity: usize,
    high_peak_threshold: f64,
    cluster_window: usize,
    cluster_min_early: usize,
    average_window: usize,
    average_peak_threshold: f64,
    stats_window: usize,
    recent_alert_secs: u64,
}

impl Default for DetectionToml {
    fn default() -> Self {
        let tracker = TrackerConfig::default();
        Self {
            suspicious_gap_ms: AnalyzerConfig::default().suspicious_gap_ms,
            summary_capacity: tracker.summary_capacity,
            alert_capacity: tracker.alert_capacity,
            high_peak_threshold: tracker.high_peak_threshold,
            cluster_window: tracker.cluster_window,
            cluster_min_early: tracker.cluster_min_early,
            average_window: tracker.average_window,
            average_peak_threshold: tracker.average_peak_threshold,
            stats_window: tracker.stats_window,
            recent_alert_secs: tracker.recent_alert_age.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HealthToml {
    log_interval_secs: u64,
    alive_timeout_secs: u64,
}

impl Default for HealthToml {
    fn default() -> Self {
        Self {
            log_interval_secs: 30,
            alive_timeout_secs: 60,
        }
    }
}

impl From<TomlConfig> for CollectConfig {
    fn from(toml: TomlConfig) -> Self {
        let profile = parse_profile(&toml.general.profile).unwrap_or(Profile::Full);

        Self {
            log_level: toml.general.log_level,
            profile,
            output: OutputConfig {
                root: toml.output.root,
                status_file: toml.output.status_file,
            },
            supervisor: SupervisorConfig {
                url: toml.general.url,
                reconnect_delay: Duration::from_secs(toml.connection.reconnect_delay_secs),
                channel_capacity: toml.connection.channel_capacity,
            },
            analyzer: AnalyzerConfig {
                suspicious_gap_ms: toml.detection.suspicious_gap_ms,
            },
            tracker: TrackerConfig {
                summary_capacity: toml.detection.summary_capacity,
                alert_capacity: toml.detection.alert_capacity,
                high_peak_threshold: toml.detection.high_peak_threshold,
                cluster_window: toml.detection.cluster_window,
                cluster_min_early: toml.detection.cluster_min_early,
                average_window: toml.detection.average_window,
                average_peak_threshold: toml.detection.average_peak_threshold,
                stats_window: toml.detection.stats_window,
                recent_alert_age: Duration::from_secs(toml.detection.recent_alert_secs),
            },
            health_log_interval: Duration::from_secs(toml.health.log_interval_secs.max(1)),
            alive_timeout: Duration::from_secs(toml.health.alive_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CollectConfig::default();
        assert_eq!(config.supervisor.url, DEFAULT_FEED_URL);
        assert_eq!(config.supervisor.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.tracker.summary_capacity, 100);
        assert_eq!(config.tracker.alert_capacity, 50);
        assert_eq!(config.analyzer.suspicious_gap_ms, 2000);
        assert_eq!(config.profile, Profile::Full);
    }

    #[test]
    fn test_parse_profile() {
        assert_eq!(parse_profile("basic"), Some(Profile::Basic));
        assert_eq!(parse_profile("TRADES"), Some(Profile::Trades));
        assert_eq!(parse_profile("enhanced"), Some(Profile::Trades));
        assert_eq!(parse_profile("timing"), Some(Profile::Timing));
        assert_eq!(parse_profile("all"), Some(Profile::Full));
        assert_eq!(parse_profile("unknown"), None);
    }

    #[test]
    fn test_profile_options() {
        let basic = Profile::Basic.options();
        assert!(!basic.include_events && !basic.include_timing && !basic.include_trade_detail);
        assert!(Profile::Trades.options().include_trade_detail);
        assert!(!Profile::Trades.options().include_timing);
        assert!(Profile::Timing.options().include_timing);
        assert_eq!(Profile::Full.options(), RecordOptions::full());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [general]
            url = "ws://localhost:9000/feed"
            log_level = "debug"
            profile = "timing"

            [output]
            root = "/tmp/rugs"
            status_file = "/tmp/rugs/status.json"

            [connection]
            reconnect_delay_secs = 2

            [detection]
            high_peak_threshold = 75.0
        "#;

        let config = CollectConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.supervisor.url, "ws://localhost:9000/feed");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.profile, Profile::Timing);
        assert_eq!(config.output.root, PathBuf::from("/tmp/rugs"));
        assert_eq!(
            config.output.status_file,
            Some(PathBuf::from("/tmp/rugs/status.json"))
        );
        assert_eq!(config.supervisor.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.tracker.high_peak_threshold, 75.0);
        assert_eq!(config.tracker.cluster_window, 5);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = CollectConfig::from_toml_str("").unwrap();
        assert_eq!(config.supervisor.url, DEFAULT_FEED_URL);
        assert_eq!(config.output.root, PathBuf::from("rugs-data"));
        assert_eq!(config.health_log_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_log_interval_clamped() {
        let config = CollectConfig::from_toml_str("[health]\nlog_interval_secs = 0\n").unwrap();
        assert_eq!(config.health_log_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = CollectConfig::default();

        config.apply_overrides(
            Some("ws://override:1234".to_string()),
            Some(PathBuf::from("out")),
            Some("basic".to_string()),
        );

        assert_eq!(config.supervisor.url, "ws://override:1234");
        assert_eq!(config.output.root, PathBuf::from("out"));
        assert_eq!(config.profile, Profile::Basic);

        config.apply_overrides(None, None, Some("bogus".to_string()));
        assert_eq!(config.profile, Profile::Basic);
    }
}
