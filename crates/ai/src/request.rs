use serde::{Deserialize, Serialize};

use crate::result::AiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
const MAX_TOKENS_CEILING: u32 = 32_768;

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

/// Provider-neutral chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// System prompt, kept apart from `messages` because Anthropic and Google
    /// take it as a dedicated field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn validate(&self) -> Result<(), AiError> {
        if self.messages.is_empty() {
            return Err(AiError::InvalidInput("messages must not be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(AiError::InvalidInput("model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AiError::InvalidInput(
                "temperature must be between 0 and 2".to_string(),
            ));
        }
        if self.max_tokens == 0 || self.max_tokens > MAX_TOKENS_CEILING {
            return Err(AiError::InvalidInput(format!(
                "max_tokens must be between 1 and {MAX_TOKENS_CEILING}"
            )));
        }
        Ok(())
    }

    /// System prompt merged from the dedicated field and any system-role messages.
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .system
            .as_deref()
            .into_iter()
            .chain(
                self.messages
                    .iter()
                    .filter(|m| m.role == ChatRole::System)
                    .map(|m| m.content.as_str()),
            )
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// User and assistant turns, in order.
    pub fn conversation(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != ChatRole::System)
    }

    /// All prompt text, used for token approximation.
    pub fn prompt_text(&self) -> String {
        let mut text = self.system.clone().unwrap_or_default();
        for message in &self.messages {
            text.push_str(&message.content);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_missing() {
        let req: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();
        assert_eq!(req.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(req.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn system_messages_are_merged_into_the_system_prompt() {
        let req = ChatRequest::new(
            "claude-3-haiku-20240307",
            vec![
                ChatMessage {
                    role: ChatRole::System,
                    content: "be brief".to_string(),
                },
                ChatMessage::user("hello"),
            ],
        )
        .with_system("you are helpful");

        assert_eq!(
            req.system_prompt().as_deref(),
            Some("you are helpful\n\nbe brief")
        );
        assert_eq!(req.conversation().count(), 1);
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        let base = ChatRequest::new("gpt-4", vec![ChatMessage::user("x")]);
        assert!(base.clone().with_temperature(2.5).validate().is_err());
        assert!(base.clone().with_max_tokens(0).validate().is_err());
        assert!(ChatRequest::new("gpt-4", vec![]).validate().is_err());
    }
}
