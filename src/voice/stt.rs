//! Speech-to-text (STT) via the OpenAI Whisper API

use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

/// Default Whisper transcription endpoint
pub const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Why a transcription failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttFailure {
    /// The service refused the credentials
    Unauthorized,
    /// The request never completed or the service errored
    Unavailable(String),
}

/// Transcribes speech to text
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    endpoint: String,
    language: Option<String>,
}

impl SpeechToText {
    /// Create a Whisper client
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new_whisper(api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            endpoint: WHISPER_URL.to_string(),
            language: None,
        })
    }

    /// Send requests to a different endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Hint the spoken language from a locale such as `en-US`
    #[must_use]
    pub fn with_locale(mut self, locale: &str) -> Self {
        self.language = locale
            .split(['-', '_'])
            .next()
            .filter(|l| !l.is_empty())
            .map(str::to_lowercase);
        self
    }

    /// Transcribe WAV audio to text
    ///
    /// # Errors
    ///
    /// Returns [`SttFailure::Unauthorized`] on 401/403 and
    /// [`SttFailure::Unavailable`] for any other failure
    pub async fn transcribe(&self, audio: &[u8]) -> std::result::Result<String, SttFailure> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| SttFailure::Unavailable(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                SttFailure::Unavailable(e.to_string())
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            tracing::error!(status = %status, "Whisper rejected credentials");
            return Err(SttFailure::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(SttFailure::Unavailable(format!(
                "Whisper API error {status}: {body}"
            )));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            SttFailure::Unavailable(e.to_string())
        })?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}
