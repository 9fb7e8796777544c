use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::WorkspaceBackendKind;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunRequest {
    pub prompt: String,
    #[serde(default)]
    pub input: Option<Value>,
    pub provider: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "workspaceBackend")]
    pub workspace_backend: Option<WorkspaceBackendKind>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}
