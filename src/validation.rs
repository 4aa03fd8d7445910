//! Inbound payload checks run before anything is sent upstream.

use crate::error::ProxyError;
use crate::io_struct::Role;
use serde_json::Value;

/// Check the shape of a chat body. The body itself is not modified.
pub fn validate_chat_body(body: &Value) -> Result<(), ProxyError> {
    let messages = match body.get("messages") {
        None | Some(Value::Null) => {
            return Err(ProxyError::InvalidRequest(
                "Request must include a messages array".to_string(),
            ));
        }
        Some(Value::Array(messages)) => messages,
        Some(_) => {
            return Err(ProxyError::InvalidRequest(
                "messages must be an array".to_string(),
            ));
        }
    };

    if messages.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    for (i, message) in messages.iter().enumerate() {
        validate_message(i, message)?;
    }
    Ok(())
}

fn validate_message(index: usize, message: &Value) -> Result<(), ProxyError> {
    let role = message.get("role").and_then(Value::as_str);
    match role {
        Some(role) if Role::ALLOWED.contains(&role) => {}
        _ => {
            return Err(ProxyError::InvalidRequest(format!(
                "messages[{}].role must be one of {}",
                index,
                Role::ALLOWED.join(", ")
            )));
        }
    }

    match message.get("content") {
        Some(Value::String(content)) if !content.is_empty() => Ok(()),
        Some(Value::String(_)) => Err(ProxyError::InvalidRequest(format!(
            "messages[{}].content must not be empty",
            index
        ))),
        _ => Err(ProxyError::InvalidRequest(format!(
            "messages[{}].content must be a string",
            index
        ))),
    }
}
