use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Key used when free-text arguments are forwarded to a provider.
pub const RAW_ARGUMENTS_KEY: &str = "_";

/// Arguments of a tool call as produced by the model.
///
/// Argument text that is not a JSON object is kept verbatim in `Raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArguments {
    Structured(JsonMap<String, JsonValue>),
    Raw(String),
}

impl Default for ToolArguments {
    fn default() -> Self {
        Self::Structured(JsonMap::new())
    }
}

impl ToolArguments {
    /// Empty text yields an empty object, a JSON object yields `Structured`,
    /// anything else is preserved as `Raw`.
    pub fn parse(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<JsonValue>(text) {
            Ok(JsonValue::Object(map)) => Self::Structured(map),
            _ => Self::Raw(text.to_string()),
        }
    }

    /// The object handed to the tool provider.
    pub fn to_payload(&self) -> JsonMap<String, JsonValue> {
        match self {
            Self::Structured(map) => map.clone(),
            Self::Raw(text) => {
                let mut map = JsonMap::new();
                map.insert(RAW_ARGUMENTS_KEY.to_string(), JsonValue::String(text.clone()));
                map
            }
        }
    }

    /// Argument text as echoed back to the chat backend in history.
    pub fn to_wire_string(&self) -> String {
        match self {
            Self::Structured(map) => JsonValue::Object(map.clone()).to_string(),
            Self::Raw(text) => text.clone(),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

/// One complete tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: ToolArguments,
}
