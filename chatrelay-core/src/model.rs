use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a conversation, in the shape both upstream kinds are fed from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning_content: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// How a streamed token is classified.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    #[default]
    Text,
    Think,
    Suggest,
}

impl ContentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Think => "think",
            Self::Suggest => "suggest",
        }
    }
}

/// Normalized payload of one streamed event. At most one field is non-empty.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RefineContent {
    pub text: String,
    pub think: String,
    pub suggest: String,
}

impl RefineContent {
    /// Place `token` in the field selected by `category`.
    pub fn tagged(category: ContentCategory, token: &str) -> Self {
        let mut out = Self::default();
        match category {
            ContentCategory::Text => out.text = token.to_string(),
            ContentCategory::Think => out.think = token.to_string(),
            ContentCategory::Suggest => out.suggest = token.to_string(),
        }
        out
    }
}

/// Tool specification bound through `ChatModel::with_tools`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool arguments.
    #[serde(default)]
    pub parameters: serde_json::Value,
}
