//! Model API configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;

/// Chat-completions endpoint and request tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// API base URL; `/chat/completions` is appended
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used when a send does not name one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling mass
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Completion token cap; omitted from requests when unset
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Stream responses over SSE instead of a single blocking call
    #[serde(default = "default_stream")]
    pub stream: bool,

    /// TCP/TLS connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time allowed to send the request and receive response headers
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Total timeout for single-shot calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Capacity of the transport event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl ModelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Full URL of the chat-completions endpoint
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Picks the requested model, falling back to the default when blank
    pub fn resolve_model<'a>(&'a self, requested: &'a str) -> &'a str {
        let requested = requested.trim();
        if requested.is_empty() {
            &self.default_model
        } else {
            requested
        }
    }

    /// Validate model configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ValidationError::InvalidBaseUrl);
        }
        if self.default_model.trim().is_empty() {
            return Err(ValidationError::MissingRequired("MODEL__DEFAULT_MODEL"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ValidationError::InvalidTemperature);
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ValidationError::InvalidTopP);
        }
        if self.connect_timeout_secs == 0
            || self.write_timeout_secs == 0
            || self.request_timeout_secs == 0
        {
            return Err(ValidationError::InvalidTimeout);
        }
        if self.event_buffer == 0 {
            return Err(ValidationError::InvalidEventBuffer);
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: None,
            stream: default_stream(),
            connect_timeout_secs: default_connect_timeout(),
            write_timeout_secs: default_write_timeout(),
            request_timeout_secs: default_request_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_base_url() -> String {
    "https://open.bigmodel.cn/api/paas/v4".to_string()
}

fn default_model() -> String {
    "glm-4".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_stream() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    60
}

fn default_event_buffer() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_defaults() {
        let config = ModelConfig::default();
        assert_eq!(config.default_model, "glm-4");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.top_p, 0.9);
        assert!(config.stream);
        assert!(config.max_tokens.is_none());
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.write_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_completions_url_trims_trailing_slash() {
        let config = ModelConfig {
            base_url: "https://api.example.com/v1/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_resolve_model_falls_back_on_blank() {
        let config = ModelConfig::default();
        assert_eq!(config.resolve_model("  "), "glm-4");
        assert_eq!(config.resolve_model("glm-4-flash"), "glm-4-flash");
    }

    #[test]
    fn test_validation_rejects_bad_url() {
        let config = ModelConfig {
            base_url: "ftp://nope".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidBaseUrl)
        ));
    }

    #[test]
    fn test_validation_rejects_out_of_range_sampling() {
        let hot = ModelConfig {
            temperature: 2.5,
            ..Default::default()
        };
        assert!(hot.validate().is_err());

        let no_mass = ModelConfig {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(no_mass.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let config = ModelConfig {
            write_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidTimeout)
        ));
    }
}
