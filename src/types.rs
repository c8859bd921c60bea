use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatModel {
    #[serde(rename = "gpt-4o")]
    Gpt4o,
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
}

impl ChatModel {
    pub const ALL: [ChatModel; 2] = [ChatModel::Gpt4o, ChatModel::Gpt4oMini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt4o => "gpt-4o",
            Self::Gpt4oMini => "gpt-4o-mini",
        }
    }

    /// Comma separated list of accepted identifiers, used in validation messages.
    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(ChatModel::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ChatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatModel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|model| model.as_str() == raw)
            .ok_or_else(|| format!("unsupported model: {raw}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub model: ChatModel,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, model: ChatModel) -> Self {
        Self {
            messages,
            temperature: DEFAULT_TEMPERATURE,
            model,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_identifiers_round_trip_through_serde_and_from_str() {
        assert_eq!("gpt-4o".parse::<ChatModel>(), Ok(ChatModel::Gpt4o));
        assert_eq!("gpt-4o-mini".parse::<ChatModel>(), Ok(ChatModel::Gpt4oMini));
        assert!("gpt-3.5-turbo".parse::<ChatModel>().is_err());

        let encoded = serde_json::to_string(&ChatModel::Gpt4oMini).unwrap();
        assert_eq!(encoded, "\"gpt-4o-mini\"");
    }

    #[test]
    fn supported_list_matches_validation_text() {
        assert_eq!(ChatModel::supported_list(), "gpt-4o,gpt-4o-mini");
    }

    #[test]
    fn new_request_uses_default_temperature() {
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")], ChatModel::Gpt4o);
        assert_eq!(request.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(request.with_temperature(0.2).temperature, 0.2);
    }
}
