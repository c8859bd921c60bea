//! Turns raw request input into typed completion requests.
//!
//! Checks run in a fixed order so that a payload with several problems always reports the same
//! one: temperature, presence of `messages`, its shape, the model (streaming only), then each
//! message.

use bytes::Bytes;
use serde_json::Value;

use super::GatewayError;
use crate::types::{ChatMessage, ChatModel, CompletionRequest, DEFAULT_TEMPERATURE};

pub const INVALID_JSON: &str = "Request body must be valid JSON";
pub const MISSING_PROMPT: &str = "Missing required 'prompt' query parameter";
pub const PROMPT_NOT_STRING: &str = "'prompt' must be a string";
pub const INVALID_TEMPERATURE: &str = "'temperature' must be a number between [0, 1]";
pub const MISSING_MESSAGES: &str = "Missing required 'messages' in body of request";
pub const MESSAGES_NOT_ARRAY: &str = "'messages' must be an array";
pub const MESSAGES_EMPTY: &str = "'messages' must not be empty";
pub const INVALID_MESSAGE: &str = "each 'message' object must have a 'role' and 'content' property";

fn invalid(reason: impl Into<String>) -> GatewayError {
    GatewayError::validation(reason)
}

/// An empty body parses as `null` so that presence checks report the missing field.
pub fn parse_json_body(body: &Bytes) -> Result<Value, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|_| invalid(INVALID_JSON))
}

pub fn validate_prompt(query: &[(String, String)]) -> Result<String, GatewayError> {
    let mut prompts = query.iter().filter(|(key, _)| key == "prompt");
    let Some((_, prompt)) = prompts.next() else {
        return Err(invalid(MISSING_PROMPT));
    };
    if prompts.next().is_some() {
        return Err(invalid(PROMPT_NOT_STRING));
    }
    if prompt.is_empty() {
        return Err(invalid(MISSING_PROMPT));
    }
    Ok(prompt.clone())
}

pub fn validate_temperature(value: Option<&Value>) -> Result<f32, GatewayError> {
    match value {
        None | Some(Value::Null) => Ok(DEFAULT_TEMPERATURE),
        Some(Value::Number(number)) => match number.as_f64() {
            Some(temperature) if (0.0..=1.0).contains(&temperature) => Ok(temperature as f32),
            _ => Err(invalid(INVALID_TEMPERATURE)),
        },
        Some(_) => Err(invalid(INVALID_TEMPERATURE)),
    }
}

/// Presence and shape of the `messages` value, without looking at individual messages.
fn message_array(value: Option<&Value>) -> Result<&Vec<Value>, GatewayError> {
    let messages = match value {
        None | Some(Value::Null) => return Err(invalid(MISSING_MESSAGES)),
        Some(Value::Array(messages)) => messages,
        Some(_) => return Err(invalid(MESSAGES_NOT_ARRAY)),
    };
    if messages.is_empty() {
        return Err(invalid(MESSAGES_EMPTY));
    }
    Ok(messages)
}

fn parse_messages(messages: &[Value]) -> Result<Vec<ChatMessage>, GatewayError> {
    messages
        .iter()
        .map(|message| {
            let role = message.get("role").and_then(Value::as_str);
            let content = message.get("content").and_then(Value::as_str);
            match (role, content) {
                (Some(role), Some(content)) if !role.is_empty() && !content.is_empty() => {
                    Ok(ChatMessage::new(role, content))
                }
                _ => Err(invalid(INVALID_MESSAGE)),
            }
        })
        .collect()
}

pub fn validate_messages(value: Option<&Value>) -> Result<Vec<ChatMessage>, GatewayError> {
    parse_messages(message_array(value)?)
}

pub fn validate_model(value: Option<&Value>) -> Result<ChatModel, GatewayError> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<ChatModel>().ok())
        .ok_or_else(|| {
            invalid(format!(
                "'model' must be one of {}",
                ChatModel::supported_list()
            ))
        })
}

/// Single system-message request built from the `prompt` query parameter.
pub fn prompt_request(
    query: &[(String, String)],
    model: ChatModel,
) -> Result<CompletionRequest, GatewayError> {
    let prompt = validate_prompt(query)?;
    Ok(CompletionRequest::new(vec![ChatMessage::system(prompt)], model))
}

/// Body is the message array itself.
pub fn message_list_request(
    body: &Value,
    model: ChatModel,
) -> Result<CompletionRequest, GatewayError> {
    let messages = validate_messages(Some(body))?;
    Ok(CompletionRequest::new(messages, model))
}

/// Body is `{messages, temperature?}`.
pub fn completion_request(
    body: &Value,
    model: ChatModel,
) -> Result<CompletionRequest, GatewayError> {
    let temperature = validate_temperature(body.get("temperature"))?;
    let messages = validate_messages(body.get("messages"))?;
    Ok(CompletionRequest::new(messages, model).with_temperature(temperature))
}

/// Body is `{messages, temperature?, model}`.
pub fn stream_request(body: &Value) -> Result<CompletionRequest, GatewayError> {
    let temperature = validate_temperature(body.get("temperature"))?;
    let messages = message_array(body.get("messages"))?;
    let model = validate_model(body.get("model"))?;
    let messages = parse_messages(messages)?;
    Ok(CompletionRequest::new(messages, model).with_temperature(temperature))
}
