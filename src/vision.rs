//! Vision query service
//!
//! Sends one camera frame and the user's question to an OpenAI-compatible
//! chat completions endpoint and returns the answer text.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::camera::ImageBytes;

/// Default chat completions endpoint
pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Why a vision query failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// No API key configured
    #[error("vision service is not configured")]
    Unconfigured,

    /// Network failure or non-2xx response
    #[error("vision request failed: {0}")]
    Transport(String),

    /// The response had no answer text
    #[error("vision response had no answer")]
    MalformedResponse,
}

impl QueryError {
    /// Message for the user
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::Unconfigured => {
                "Image analysis isn't set up yet. Please add an OpenAI API key to the configuration."
            }
            Self::Transport(_) | Self::MalformedResponse => {
                "Sorry, I couldn't analyze the image. Please try again."
            }
        }
    }
}

/// Answers a question about an image
#[async_trait]
pub trait VisionQuery: Send + Sync {
    /// Ask `question` about `image`
    ///
    /// # Errors
    ///
    /// Returns a classified [`QueryError`]; there are no retries
    async fn query(&self, image: &ImageBytes, question: &str) -> Result<String, QueryError>;
}

/// Vision service settings
#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub endpoint: String,
    pub model: String,
    /// Image detail hint sent with the frame
    pub detail: String,
    pub max_tokens: u32,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            endpoint: OPENAI_CHAT_URL.to_string(),
            model: "gpt-4o".to_string(),
            detail: "low".to_string(),
            max_tokens: 300,
        }
    }
}

/// OpenAI vision client
pub struct VisionQueryService {
    client: Client,
    api_key: Option<SecretString>,
    settings: VisionSettings,
}

impl VisionQueryService {
    /// Create a service; without a key every query fails as unconfigured
    #[must_use]
    pub fn new(api_key: Option<SecretString>, settings: VisionSettings) -> Self {
        let api_key = api_key.filter(|k| !k.expose_secret().trim().is_empty());
        if api_key.is_none() {
            tracing::warn!("no OpenAI API key, image analysis disabled");
        }
        Self {
            client: Client::new(),
            api_key,
            settings,
        }
    }

    /// Whether a credential is present
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Wrap the user's question in the accessibility instruction
#[must_use]
pub fn build_prompt(question: &str) -> String {
    format!(
        "You are helping a blind or low-vision person understand what their camera sees. \
         Answer their question about this image descriptively and directly, mentioning \
         anything relevant to safety or orientation. Read out any important visible text. \
         Keep the answer under 200 words.\n\nQuestion: {}",
        question.trim()
    )
}

#[async_trait]
impl VisionQuery for VisionQueryService {
    async fn query(&self, image: &ImageBytes, question: &str) -> Result<String, QueryError> {
        let api_key = self.api_key.as_ref().ok_or(QueryError::Unconfigured)?;

        let base64_data = base64::engine::general_purpose::STANDARD.encode(&image.data);
        let data_url = format!("data:{};base64,{base64_data}", image.mime_type);

        let request = ChatCompletionRequest {
            model: &self.settings.model,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: build_prompt(question),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url,
                            detail: &self.settings.detail,
                        },
                    },
                ],
            }],
            max_tokens: self.settings.max_tokens,
        };

        tracing::debug!(
            model = %self.settings.model,
            image_bytes = image.data.len(),
            "sending vision query"
        );

        let response = self
            .client
            .post(&self.settings.endpoint)
            .bearer_auth(api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "vision request failed");
                QueryError::Transport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            tracing::error!(status = %status, detail = %detail, "vision API error");
            return Err(QueryError::Transport(format!("{status}: {detail}")));
        }

        let result: ChatCompletionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse vision response");
            QueryError::MalformedResponse
        })?;

        let answer = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(QueryError::MalformedResponse)?;

        tracing::info!(chars = answer.len(), "vision answer received");
        Ok(answer.trim().to_string())
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: String },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Serialize)]
struct ImageUrl<'a> {
    url: String,
    detail: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}
