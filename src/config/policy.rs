//! Recording policies
//!
//! [`RecordConfig`] is the configured schema; [`RecordPolicies`] is the
//! compiled, immutable snapshot the service reads. A reload builds a new
//! snapshot and swaps it in whole.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::filter::{FilterRule, StreamFilter};
use super::template;
use crate::error::{ConfigError, ResolveError};
use crate::format::RecordFormat;

/// Extension meaning "decided by the codec"
pub const CODEC_EXT: &str = ".";

/// Per-format configuration; unset fields take the format's defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatPolicy {
    pub enabled: bool,
    /// Path template or output directory
    pub path: Option<String>,
    /// File extension including the dot, `.` to let the codec decide
    pub ext: Option<String>,
    pub filter: FilterRule,
    /// Segment/fragment length (HLS and fMP4 only)
    pub fragment_duration_ms: Option<u64>,
    /// Resume existing files instead of overwriting them
    pub append: bool,
}

impl FormatPolicy {
    /// Enabled policy with every other field defaulted
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = Some(ext.into());
        self
    }

    pub fn filter(mut self, filter: FilterRule) -> Self {
        self.filter = filter;
        self
    }

    pub fn fragment_duration(mut self, duration: Duration) -> Self {
        self.fragment_duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// Subscription settings shared by every format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribePolicy {
    /// Record audio frames
    pub sub_audio: bool,
    /// Record video frames
    pub sub_video: bool,
    /// How long a recorder waits for its stream to be published
    pub wait_timeout_ms: u64,
    /// Frames a recorder may fall behind in one burst before it gives up
    /// (0 = never)
    pub broadcast_lag_limit: u64,
}

impl Default for SubscribePolicy {
    fn default() -> Self {
        Self {
            sub_audio: true,
            sub_video: true,
            wait_timeout_ms: 10_000,
            broadcast_lag_limit: 0,
        }
    }
}

impl SubscribePolicy {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Full recording configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub subscribe: SubscribePolicy,
    pub flv: FormatPolicy,
    pub mp4: FormatPolicy,
    pub fmp4: FormatPolicy,
    pub hls: FormatPolicy,
    pub raw: FormatPolicy,
    pub raw_audio: FormatPolicy,
}

impl RecordConfig {
    pub fn format(&self, format: RecordFormat) -> &FormatPolicy {
        match format {
            RecordFormat::Flv => &self.flv,
            RecordFormat::Mp4 => &self.mp4,
            RecordFormat::Fmp4 => &self.fmp4,
            RecordFormat::Hls => &self.hls,
            RecordFormat::Raw => &self.raw,
            RecordFormat::RawAudio => &self.raw_audio,
        }
    }

    pub fn format_mut(&mut self, format: RecordFormat) -> &mut FormatPolicy {
        match format {
            RecordFormat::Flv => &mut self.flv,
            RecordFormat::Mp4 => &mut self.mp4,
            RecordFormat::Fmp4 => &mut self.fmp4,
            RecordFormat::Hls => &mut self.hls,
            RecordFormat::Raw => &mut self.raw,
            RecordFormat::RawAudio => &mut self.raw_audio,
        }
    }

    /// Replace the policy of one format
    pub fn with_format(mut self, format: RecordFormat, policy: FormatPolicy) -> Self {
        *self.format_mut(format) = policy;
        self
    }

    pub fn with_subscribe(mut self, subscribe: SubscribePolicy) -> Self {
        self.subscribe = subscribe;
        self
    }
}

fn default_path(format: RecordFormat) -> &'static str {
    match format {
        RecordFormat::Flv => "record/flv",
        RecordFormat::Mp4 => "record/mp4",
        RecordFormat::Fmp4 => "record/fmp4",
        RecordFormat::Hls => "record/hls",
        RecordFormat::Raw | RecordFormat::RawAudio => "record/raw",
    }
}

fn default_ext(format: RecordFormat) -> &'static str {
    match format {
        RecordFormat::Flv => ".flv",
        RecordFormat::Mp4 | RecordFormat::Fmp4 => ".mp4",
        RecordFormat::Hls => ".m3u8",
        RecordFormat::Raw | RecordFormat::RawAudio => CODEC_EXT,
    }
}

fn default_fragment_duration(format: RecordFormat) -> Option<Duration> {
    match format {
        RecordFormat::Hls => Some(Duration::from_secs(10)),
        RecordFormat::Fmp4 => Some(Duration::from_secs(2)),
        _ => None,
    }
}

/// Compiled policy of one format
#[derive(Debug, Clone)]
pub struct Policy {
    pub format: RecordFormat,
    pub enabled: bool,
    pub path: String,
    pub ext: String,
    pub filter: StreamFilter,
    /// Set for segmented formats only
    pub fragment_duration: Option<Duration>,
    pub append: bool,
}

impl Policy {
    fn compile(format: RecordFormat, config: &FormatPolicy) -> Result<Self, ConfigError> {
        let fragment_duration = if format.is_segmented() {
            config
                .fragment_duration_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .or_else(|| default_fragment_duration(format))
        } else {
            None
        };

        Ok(Self {
            format,
            enabled: config.enabled,
            path: config.path.clone().unwrap_or_else(|| default_path(format).to_string()),
            ext: config.ext.clone().unwrap_or_else(|| default_ext(format).to_string()),
            filter: StreamFilter::compile(format, &config.filter)?,
            fragment_duration,
            append: config.append,
        })
    }

    /// Whether `stream` must be recorded in this format
    pub fn need_record(&self, stream: &str) -> bool {
        self.enabled && self.filter.matches(stream)
    }

    /// Whether the extension is chosen once the codec is known
    pub fn codec_dependent_ext(&self) -> bool {
        self.ext == CODEC_EXT
    }

    /// Destination for `stream`; without extension when the codec decides
    pub fn resolve_path(&self, stream: &str) -> Result<PathBuf, ResolveError> {
        let ext = if self.codec_dependent_ext() { "" } else { self.ext.as_str() };
        template::render(&self.path, stream, self.format, ext)
    }

    /// Destination for `stream` with an explicit extension
    pub fn resolve_path_with_ext(&self, stream: &str, ext: &str) -> Result<PathBuf, ResolveError> {
        template::render(&self.path, stream, self.format, ext)
    }
}

/// Compiled policy snapshot for every format
#[derive(Debug, Clone)]
pub struct RecordPolicies {
    subscribe: SubscribePolicy,
    policies: Vec<Policy>,
}

impl RecordPolicies {
    pub fn compile(config: &RecordConfig) -> Result<Self, ConfigError> {
        let policies = RecordFormat::ALL
            .iter()
            .map(|format| Policy::compile(*format, config.format(*format)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            subscribe: config.subscribe.clone(),
            policies,
        })
    }

    pub fn policy(&self, format: RecordFormat) -> &Policy {
        let index = RecordFormat::ALL
            .iter()
            .position(|f| *f == format)
            .unwrap_or_default();
        &self.policies[index]
    }

    pub fn subscribe(&self) -> &SubscribePolicy {
        &self.subscribe
    }

    pub fn need_record(&self, format: RecordFormat, stream: &str) -> bool {
        self.policy(format).need_record(stream)
    }

    pub fn resolve_path(&self, format: RecordFormat, stream: &str) -> Result<PathBuf, ResolveError> {
        self.policy(format).resolve_path(stream)
    }

    pub fn resolve_path_with_ext(
        &self,
        format: RecordFormat,
        stream: &str,
        ext: &str,
    ) -> Result<PathBuf, ResolveError> {
        self.policy(format).resolve_path_with_ext(stream, ext)
    }

    /// Formats with recording enabled
    pub fn enabled_formats(&self) -> impl Iterator<Item = RecordFormat> + '_ {
        self.policies.iter().filter(|p| p.enabled).map(|p| p.format)
    }
}

impl Default for RecordPolicies {
    fn default() -> Self {
        let subscribe = SubscribePolicy::default();
        let policies = RecordFormat::ALL
            .iter()
            .map(|format| Policy {
                format: *format,
                enabled: false,
                path: default_path(*format).to_string(),
                ext: default_ext(*format).to_string(),
                filter: StreamFilter::all(),
                fragment_duration: default_fragment_duration(*format),
                append: false,
            })
            .collect();
        Self { subscribe, policies }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn test_defaults() {
        let policies = RecordPolicies::default();
        for format in RecordFormat::ALL {
            assert!(!policies.need_record(format, "live/a"));
        }
        assert_eq!(policies.policy(RecordFormat::Hls).ext, ".m3u8");
        assert_eq!(
            policies.policy(RecordFormat::Hls).fragment_duration,
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            policies.policy(RecordFormat::Fmp4).fragment_duration,
            Some(Duration::from_secs(2))
        );
        assert!(policies.policy(RecordFormat::Raw).codec_dependent_ext());
        assert_eq!(policies.policy(RecordFormat::RawAudio).path, "record/raw");
        assert!(policies.subscribe().sub_audio && policies.subscribe().sub_video);
    }

    #[test]
    fn test_compiled_defaults_match() {
        let compiled = RecordPolicies::compile(&RecordConfig::default()).unwrap();
        let defaults = RecordPolicies::default();
        for format in RecordFormat::ALL {
            assert_eq!(compiled.policy(format).path, defaults.policy(format).path);
            assert_eq!(compiled.policy(format).ext, defaults.policy(format).ext);
            assert_eq!(
                compiled.policy(format).fragment_duration,
                defaults.policy(format).fragment_duration
            );
        }
    }

    #[test]
    fn test_need_record_depends_on_enabled_and_filter() {
        let config = RecordConfig::default()
            .with_format(
                RecordFormat::Flv,
                FormatPolicy::enabled().filter(FilterRule::Prefix {
                    patterns: vec!["live/".into()],
                }),
            )
            .with_format(
                RecordFormat::Mp4,
                FormatPolicy::default().filter(FilterRule::All),
            );
        let policies = RecordPolicies::compile(&config).unwrap();

        assert!(policies.need_record(RecordFormat::Flv, "live/cam1"));
        assert!(!policies.need_record(RecordFormat::Flv, "vod/cam1"));
        assert!(!policies.need_record(RecordFormat::Mp4, "live/cam1"));
        assert_eq!(
            policies.enabled_formats().collect::<Vec<_>>(),
            vec![RecordFormat::Flv]
        );
    }

    #[test]
    fn test_resolve_paths() {
        let policies = RecordPolicies::default();
        assert_eq!(
            policies.resolve_path(RecordFormat::Flv, "live/cam1").unwrap(),
            Path::new("record/flv/live/cam1.flv")
        );
        assert_eq!(
            policies.resolve_path(RecordFormat::Raw, "live/cam1").unwrap(),
            Path::new("record/raw/live/cam1")
        );
        assert_eq!(
            policies
                .resolve_path_with_ext(RecordFormat::RawAudio, "live/cam1", ".aac")
                .unwrap(),
            Path::new("record/raw/live/cam1.aac")
        );
        assert!(policies.resolve_path(RecordFormat::Mp4, "").is_err());
    }

    #[test]
    fn test_fragment_duration_only_for_segmented() {
        let config = RecordConfig::default()
            .with_format(
                RecordFormat::Flv,
                FormatPolicy::enabled().fragment_duration(Duration::from_secs(4)),
            )
            .with_format(
                RecordFormat::Hls,
                FormatPolicy::enabled().fragment_duration(Duration::from_secs(4)),
            );
        let policies = RecordPolicies::compile(&config).unwrap();
        assert_eq!(policies.policy(RecordFormat::Flv).fragment_duration, None);
        assert_eq!(
            policies.policy(RecordFormat::Hls).fragment_duration,
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn test_invalid_filter_rejects_config() {
        let config = RecordConfig::default().with_format(
            RecordFormat::Hls,
            FormatPolicy::enabled().filter(FilterRule::Regex {
                pattern: "[".into(),
            }),
        );
        assert!(matches!(
            RecordPolicies::compile(&config),
            Err(ConfigError::InvalidRegex {
                format: RecordFormat::Hls,
                ..
            })
        ));
    }

    #[test]
    fn test_config_schema() {
        let json = r#"{
            "subscribe": { "sub_audio": false, "wait_timeout_ms": 500 },
            "flv": { "enabled": true, "append": true },
            "hls": {
                "enabled": true,
                "path": "/srv/{app}/{name}",
                "filter": { "type": "regex", "pattern": "^live/" },
                "fragment_duration_ms": 6000
            }
        }"#;
        let config: RecordConfig = serde_json::from_str(json).unwrap();
        assert!(!config.subscribe.sub_audio);
        assert!(config.subscribe.sub_video);
        assert_eq!(config.subscribe.wait_timeout(), Duration::from_millis(500));
        assert!(config.flv.enabled && config.flv.append);
        assert!(!config.mp4.enabled);

        let policies = RecordPolicies::compile(&config).unwrap();
        assert_eq!(policies.policy(RecordFormat::Flv).path, "record/flv");
        assert_eq!(
            policies.resolve_path(RecordFormat::Hls, "live/cam1").unwrap(),
            Path::new("/srv/live/cam1.m3u8")
        );
        assert!(!policies.need_record(RecordFormat::Hls, "vod/x"));
    }
}
