//! Chat message types and prompt templates.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_prompt_role(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for ChatRole {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" | "developer" => Ok(ChatRole::System),
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            other => Err(Error::Validation(format!(
                "Unsupported chat message role: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Prompt layout for chat requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    #[default]
    ChatMl,
    Llama3,
    Gemma,
}

impl ChatTemplate {
    /// Pick a layout from the GGUF `tokenizer.chat_template` source, if any.
    pub fn detect(template_source: Option<&str>) -> Self {
        match template_source {
            Some(src) if src.contains("<|start_header_id|>") => ChatTemplate::Llama3,
            Some(src) if src.contains("<start_of_turn>") => ChatTemplate::Gemma,
            _ => ChatTemplate::ChatMl,
        }
    }

    /// Tokens that end an assistant turn for this layout.
    pub fn end_of_turn_markers(&self) -> &'static [&'static str] {
        match self {
            ChatTemplate::ChatMl => &["<|im_end|>"],
            ChatTemplate::Llama3 => &["<|eot_id|>"],
            ChatTemplate::Gemma => &["<end_of_turn>"],
        }
    }

    /// Render the conversation and open an assistant turn.
    pub fn render(&self, messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        match self {
            ChatTemplate::ChatMl => {
                for message in messages {
                    prompt.push_str(&format!(
                        "<|im_start|>{}\n{}<|im_end|>\n",
                        message.role.as_prompt_role(),
                        message.content.trim()
                    ));
                }
                prompt.push_str("<|im_start|>assistant\n");
            }
            ChatTemplate::Llama3 => {
                prompt.push_str("<|begin_of_text|>");
                for message in messages {
                    prompt.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        message.role.as_prompt_role(),
                        message.content.trim()
                    ));
                }
                prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            }
            ChatTemplate::Gemma => {
                // Gemma has no system role; fold system text into the first user turn.
                let system: Vec<&str> = messages
                    .iter()
                    .filter(|m| m.role == ChatRole::System)
                    .map(|m| m.content.trim())
                    .collect();
                let mut pending_system = (!system.is_empty()).then(|| system.join("\n\n"));

                for message in messages.iter().filter(|m| m.role != ChatRole::System) {
                    let role = match message.role {
                        ChatRole::Assistant => "model",
                        _ => "user",
                    };
                    let content = match (message.role, pending_system.take()) {
                        (ChatRole::User, Some(system)) => {
                            format!("{system}\n\n{}", message.content.trim())
                        }
                        (_, leftover) => {
                            pending_system = leftover;
                            message.content.trim().to_string()
                        }
                    };
                    prompt.push_str(&format!("<start_of_turn>{role}\n{content}<end_of_turn>\n"));
                }
                if let Some(system) = pending_system {
                    prompt.push_str(&format!("<start_of_turn>user\n{system}<end_of_turn>\n"));
                }
                prompt.push_str("<start_of_turn>model\n");
            }
        }
        prompt
    }
}
