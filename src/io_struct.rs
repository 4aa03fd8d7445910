use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub const ALLOWED: [&'static str; 3] = ["system", "user", "assistant"];
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

/// Chat completion request as forwarded upstream.
///
/// Fields the proxy does not know about are kept in `other` and forwarded
/// untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl ChatRequest {
    /// Validate a raw body and turn it into a typed request.
    pub fn from_body(body: Value) -> Result<Self, ProxyError> {
        crate::validation::validate_chat_body(&body)?;
        serde_json::from_value(body)
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid request body: {}", e)))
    }

    pub fn apply_default_model(&mut self, model: &str) {
        if self.model.as_deref().is_none_or(str::is_empty) {
            self.model = Some(model.to_string());
        }
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }
}
