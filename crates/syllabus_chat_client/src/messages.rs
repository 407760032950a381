//! `ask_stream` event envelopes. Each `data: ` line carries one JSON object whose
//! `type` field selects the event.

use serde::Deserialize;

use crate::model::Source;

/// Server → client: status text while the answer is being prepared.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadingMessage {
    #[serde(default)]
    pub message: Option<String>,
}

/// Server → client: partial answer text.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkMessage {
    pub text: String,
}

/// Server → client: citations for the answer.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesMessage {
    pub sources: Vec<Source>,
}

/// Server → client: application error.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub message: Option<String>,
}

/// One decoded unit of the answer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Loading(Option<String>),
    Chunk(String),
    Sources(Vec<Source>),
    Complete,
    Error(String),
}

impl StreamEvent {
    /// Event name as it appears in the envelope's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Loading(_) => "loading",
            StreamEvent::Chunk(_) => "chunk",
            StreamEvent::Sources(_) => "sources",
            StreamEvent::Complete => "complete",
            StreamEvent::Error(_) => "error",
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        let typ = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or("missing type")?;
        match typ {
            "loading" => {
                let m: LoadingMessage =
                    serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(StreamEvent::Loading(m.message))
            }
            "chunk" => {
                let m: ChunkMessage =
                    serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(StreamEvent::Chunk(m.text))
            }
            "sources" => {
                let m: SourcesMessage =
                    serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(StreamEvent::Sources(m.sources))
            }
            "complete" => Ok(StreamEvent::Complete),
            "error" => {
                let m: ErrorMessage =
                    serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(StreamEvent::Error(
                    m.message.unwrap_or_else(|| "Unknown server error".into()),
                ))
            }
            _ => Err(format!("unknown type: {}", typ)),
        }
    }

    /// Parse the JSON text that follows the `data: ` prefix.
    pub fn from_data(data: &str) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(data).map_err(|e| e.to_string())?;
        Self::from_json(&value)
    }
}
