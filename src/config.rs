//! # Configuration Management
//!
//! Loads the client's settings from several sources, lowest priority first:
//! 1. Default values (the `Default` impl below)
//! 2. Configuration file (`config.toml` in the working directory, optional)
//! 3. Environment variables with the `APP__` prefix (`APP__SESSION__WIPE_SETTLE_MS=800`)
//! 4. `SERVICE_ORIGIN`, a shortcut for `service.origin`
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are read by the `config` crate and written by `toml`
//! - **#[serde(default)]**: optional device names can simply be left out of every source
//! - **anyhow::Result**: configuration problems are reported once, at startup

use crate::channel;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use url::Url;

/// Main application configuration.
///
/// Grouped by concern so a `config.toml` stays readable:
/// `[service]`, `[audio]`, `[session]`, `[dialpad]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub dialpad: DialpadConfig,
}

/// Where the grievance service lives.
///
/// ## Fields:
/// - `origin`: the service's HTTP origin; the channel scheme follows it (`http` → `ws`, `https` → `wss`)
/// - `channel_path`: path of the call channel on that origin
/// - `connect_timeout_ms`: how long to wait for the channel to open before giving up on the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub origin: String,
    pub channel_path: String,
    pub connect_timeout_ms: u64,
}

/// Microphone, speaker and framing settings.
///
/// ## Tuning guidelines:
/// - Smaller frames: lower latency, more records on the channel
/// - Larger outbound queue: rides out short network stalls, but sends stale audio after them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub frame_samples: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
    pub outbound_queue_frames: usize,
}

/// Call lifecycle timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Delay between `memory_wipe_complete` and the ticket clearing
    pub wipe_settle_ms: u64,
    /// Ring time before a simulated inbound call connects
    pub inbound_ring_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialpadConfig {
    /// The only number that places a call
    pub hotline: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                origin: "http://localhost:8000".to_string(),
                channel_path: "/ws/call".to_string(),
                connect_timeout_ms: 5000,
            },
            audio: AudioConfig {
                frame_samples: crate::audio::frame::DEFAULT_FRAME_SAMPLES,
                input_device: None,  // Host default
                output_device: None, // Host default
                outbound_queue_frames: 8,
            },
            session: SessionConfig {
                wipe_settle_ms: 1500,
                inbound_ring_ms: 500,
            },
            dialpad: DialpadConfig {
                hotline: "311".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVICE__ORIGIN=https://grievance.example.org`
    /// - `APP__AUDIO__INPUT_DEVICE=USB Headset`
    /// - `APP__SESSION__WIPE_SETTLE_MS=800`
    /// - `SERVICE_ORIGIN=http://10.0.0.5:8000`: shortcut for deployments
    pub fn load() -> Result<Self> {
        let mut settings = Self::defaults()?
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(origin) = env::var("SERVICE_ORIGIN") {
            settings = settings.set_override("service.origin", origin)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Defaults overlaid with a TOML document. Used for `config.toml`-style input in tests.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = Self::defaults()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder().add_source(config::Config::try_from(&AppConfig::default())?))
    }

    /// Check that the values make sense together.
    pub fn validate(&self) -> Result<()> {
        let frame = self.audio.frame_samples;
        if frame == 0 || !frame.is_power_of_two() {
            return Err(anyhow::anyhow!(
                "Audio frame size must be a power of two, got {}",
                frame
            ));
        }

        if self.audio.outbound_queue_frames == 0 {
            return Err(anyhow::anyhow!("Outbound queue must hold at least one frame"));
        }

        if !self.service.channel_path.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Channel path must start with '/', got '{}'",
                self.service.channel_path
            ));
        }

        if self.dialpad.hotline.trim().is_empty() {
            return Err(anyhow::anyhow!("Hotline number cannot be empty"));
        }

        self.channel_url()?;
        Ok(())
    }

    /// Full channel URL, e.g. `ws://localhost:8000/ws/call`.
    pub fn channel_url(&self) -> Result<Url> {
        let origin = Url::parse(&self.service.origin)
            .with_context(|| format!("Invalid service origin '{}'", self.service.origin))?;
        Ok(channel::channel_url(&origin, &self.service.channel_path)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.service.connect_timeout_ms)
    }

    pub fn wipe_settle(&self) -> Duration {
        Duration::from_millis(self.session.wipe_settle_ms)
    }

    pub fn inbound_ring(&self) -> Duration {
        Duration::from_millis(self.session.inbound_ring_ms)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.audio.frame_samples, 4096);
        assert_eq!(config.session.wipe_settle_ms, 1500);
        assert_eq!(config.dialpad.hotline, "311");
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_url().unwrap().as_str(), "ws://localhost:8000/ws/call");
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.frame_samples = 3000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.outbound_queue_frames = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.service.origin = "ftp://example.org".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.service.channel_path = "ws/call".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dialpad.hotline = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [service]
            origin = "https://grievance.example.org"

            [audio]
            frame_samples = 2048
            input_device = "USB Headset"
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.frame_samples, 2048);
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Headset"));
        assert!(config.audio.output_device.is_none());
        assert_eq!(config.session.inbound_ring_ms, 500);
        assert_eq!(
            config.channel_url().unwrap().as_str(),
            "wss://grievance.example.org/ws/call"
        );
    }

    #[test]
    fn test_rendered_toml_reloads() {
        let mut config = AppConfig::default();
        config.audio.output_device = Some("Speakers".to_string());

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[dialpad]"));
        assert_eq!(AppConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
