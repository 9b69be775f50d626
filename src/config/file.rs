//! TOML configuration file loading
//!
//! Supports `~/.config/omni/lens/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LensConfigFile {
    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Image analysis
    #[serde(default)]
    pub vision: VisionFileConfig,

    /// Speech input and output
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Turn behaviour
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Still-image camera sources
    #[serde(default)]
    pub camera: CameraFileConfig,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
}

/// Vision service configuration
#[derive(Debug, Default, Deserialize)]
pub struct VisionFileConfig {
    /// Model identifier (e.g. "gpt-4o")
    pub model: Option<String>,

    /// Chat completions URL
    pub endpoint: Option<String>,

    pub max_tokens: Option<u32>,

    /// Image detail hint ("low", "high", "auto")
    pub detail: Option<String>,
}

/// Voice configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Speak prompts and answers
    pub output_enabled: Option<bool>,

    /// BCP 47 locale (e.g. "en-US")
    pub locale: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "nova")
    pub tts_voice: Option<String>,
}

/// Session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Keep listening between turns
    pub continuous_listening: Option<bool>,

    /// Delay before listening restarts
    pub restart_delay_ms: Option<u64>,

    pub min_transcript_chars: Option<usize>,

    pub max_reprompts: Option<u32>,
}

/// Camera configuration
#[derive(Debug, Default, Deserialize)]
pub struct CameraFileConfig {
    pub front_image: Option<PathBuf>,
    pub back_image: Option<PathBuf>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LensConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LensConfigFile {
    config_file_path().map_or_else(LensConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file, falling back to defaults on any problem
pub fn load_config_from(path: &Path) -> LensConfigFile {
    if !path.exists() {
        return LensConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LensConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LensConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/lens/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("lens")
            .join("config.toml")
    })
}
