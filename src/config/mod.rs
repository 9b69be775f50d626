//! Configuration management for Beacon Lens
//!
//! Values come from environment variables, then the TOML file, then
//! defaults. Command-line flags are applied on top by the binary.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::session::SessionSettings;
use crate::speech::MIN_TRANSCRIPT_CHARS;
use crate::vision::{OPENAI_CHAT_URL, VisionSettings};
use crate::{Error, Result};

use file::LensConfigFile;

/// Beacon Lens configuration
#[derive(Debug)]
pub struct Config {
    /// API keys
    pub api_keys: ApiKeys,

    /// Vision service configuration
    pub vision: VisionConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Turn behaviour
    pub session: SessionConfig,

    /// Still-image camera sources
    pub camera: CameraConfig,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (vision, Whisper and TTS)
    pub openai: Option<SecretString>,
}

impl ApiKeys {
    /// A fresh copy of the `OpenAI` key
    #[must_use]
    pub fn openai(&self) -> Option<SecretString> {
        self.openai
            .as_ref()
            .map(|k| SecretString::from(k.expose_secret().to_owned()))
    }
}

/// Vision service configuration
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub model: String,
    pub endpoint: String,
    pub max_tokens: u32,
    pub detail: String,
}

/// Voice configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Speak prompts and answers
    pub output_enabled: bool,

    /// Locale used for recognition hints and voice selection
    pub locale: String,

    /// STT model (e.g. "whisper-1")
    pub stt_model: String,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,
}

/// Turn behaviour
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub continuous_listening: bool,
    pub restart_delay: Duration,
    pub min_transcript_chars: usize,
    pub max_reprompts: u32,
}

/// Still-image camera sources
#[derive(Debug, Clone, Default)]
pub struct CameraConfig {
    pub front_image: Option<PathBuf>,
    pub back_image: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured endpoint is not a valid URL
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Layer `env` over `fc` over defaults
    ///
    /// # Errors
    ///
    /// Returns error if a configured endpoint is not a valid URL
    pub fn resolve(fc: LensConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
        };

        let vision = VisionConfig {
            model: env("LENS_VISION_MODEL")
                .or(fc.vision.model)
                .unwrap_or_else(|| "gpt-4o".to_string()),
            endpoint: env("LENS_VISION_URL")
                .or(fc.vision.endpoint)
                .unwrap_or_else(|| OPENAI_CHAT_URL.to_string()),
            max_tokens: fc.vision.max_tokens.unwrap_or(300),
            detail: fc.vision.detail.unwrap_or_else(|| "low".to_string()),
        };
        url::Url::parse(&vision.endpoint)
            .map_err(|e| Error::Config(format!("invalid vision endpoint '{}': {e}", vision.endpoint)))?;

        let voice = VoiceConfig {
            output_enabled: env("LENS_VOICE_OUTPUT")
                .as_deref()
                .and_then(parse_bool)
                .or(fc.voice.output_enabled)
                .unwrap_or(true),
            locale: env("LENS_LOCALE")
                .or(fc.voice.locale)
                .unwrap_or_else(|| "en-US".to_string()),
            stt_model: env("LENS_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            tts_model: env("LENS_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| "tts-1".to_string()),
            tts_voice: env("LENS_TTS_VOICE")
                .or(fc.voice.tts_voice)
                .unwrap_or_else(|| "nova".to_string()),
        };

        let session = SessionConfig {
            continuous_listening: env("LENS_CONTINUOUS")
                .as_deref()
                .and_then(parse_bool)
                .or(fc.session.continuous_listening)
                .unwrap_or(true),
            restart_delay: Duration::from_millis(fc.session.restart_delay_ms.unwrap_or(500)),
            min_transcript_chars: fc
                .session
                .min_transcript_chars
                .unwrap_or(MIN_TRANSCRIPT_CHARS),
            max_reprompts: fc.session.max_reprompts.unwrap_or(2),
        };

        let camera = CameraConfig {
            front_image: env("LENS_FRONT_IMAGE")
                .map(PathBuf::from)
                .or(fc.camera.front_image),
            back_image: env("LENS_BACK_IMAGE")
                .map(PathBuf::from)
                .or(fc.camera.back_image),
        };

        if api_keys.openai.is_none() {
            tracing::warn!("OPENAI_API_KEY not set; vision, STT and TTS are unavailable");
        }

        Ok(Self {
            api_keys,
            vision,
            voice,
            session,
            camera,
        })
    }

    /// Settings for the vision service
    #[must_use]
    pub fn vision_settings(&self) -> VisionSettings {
        VisionSettings {
            endpoint: self.vision.endpoint.clone(),
            model: self.vision.model.clone(),
            detail: self.vision.detail.clone(),
            max_tokens: self.vision.max_tokens,
        }
    }

    /// Settings for the session orchestrator
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            locale: self.voice.locale.clone(),
            speech_output: self.voice.output_enabled,
            continuous: self.session.continuous_listening,
            restart_delay: self.session.restart_delay,
            min_transcript_chars: self.session.min_transcript_chars,
            max_reprompts: self.session.max_reprompts,
        }
    }
}

/// Parse a boolean env value (`1`/`true`/`yes`/`on` and their opposites)
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(LensConfigFile::default(), env(&[])).unwrap();

        assert!(config.api_keys.openai.is_none());
        assert_eq!(config.vision.model, "gpt-4o");
        assert_eq!(config.vision.detail, "low");
        assert_eq!(config.vision.max_tokens, 300);
        assert_eq!(config.vision.endpoint, OPENAI_CHAT_URL);
        assert!(config.voice.output_enabled);
        assert_eq!(config.voice.locale, "en-US");
        assert_eq!(config.voice.tts_voice, "nova");
        assert!(config.session.continuous_listening);
        assert_eq!(config.session.restart_delay, Duration::from_millis(500));
        assert_eq!(config.session.min_transcript_chars, 3);
        assert_eq!(config.session.max_reprompts, 2);
    }

    #[test]
    fn test_env_overrides_file() {
        let fc: LensConfigFile = toml::from_str(
            r#"
            [api_keys]
            openai = "sk-file"

            [vision]
            model = "gpt-4o-mini"

            [voice]
            output_enabled = true
            locale = "fr-FR"
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            fc,
            env(&[
                ("OPENAI_API_KEY", "sk-env"),
                ("LENS_VOICE_OUTPUT", "off"),
            ]),
        )
        .unwrap();

        assert_eq!(config.api_keys.openai().unwrap().expose_secret(), "sk-env");
        assert_eq!(config.vision.model, "gpt-4o-mini");
        assert!(!config.voice.output_enabled);
        assert_eq!(config.voice.locale, "fr-FR");
    }

    #[test]
    fn test_unparseable_bool_falls_through() {
        let config =
            Config::resolve(LensConfigFile::default(), env(&[("LENS_CONTINUOUS", "maybe")]))
                .unwrap();
        assert!(config.session.continuous_listening);
    }

    #[test]
    fn test_blank_key_is_absent() {
        let config =
            Config::resolve(LensConfigFile::default(), env(&[("OPENAI_API_KEY", "  ")])).unwrap();
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let result = Config::resolve(
            LensConfigFile::default(),
            env(&[("LENS_VISION_URL", "not a url")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_session_settings_follow_config() {
        let fc: LensConfigFile = toml::from_str(
            r"
            [session]
            continuous_listening = false
            restart_delay_ms = 250
            max_reprompts = 1
            ",
        )
        .unwrap();
        let settings = Config::resolve(fc, env(&[])).unwrap().session_settings();

        assert!(!settings.continuous);
        assert_eq!(settings.restart_delay, Duration::from_millis(250));
        assert_eq!(settings.max_reprompts, 1);
    }
}
