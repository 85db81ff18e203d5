use serde::{Deserialize, Serialize};

/// Body for both `/api/agent/query` and `/api/agent/query/stream`.
/// `session_id` names the uploaded dataset; `None` runs the agent with no data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQueryRequest {
    pub question: String,
    pub session_id: Option<String>,
}

/// Response of the non-streaming fallback endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentQueryResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<ChartPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_artifact: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Pie,
    Line,
    Scatter,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Pie => "pie",
            ChartKind::Line => "line",
            ChartKind::Scatter => "scatter",
        }
    }
}

/// Structural shape of a chart spec; the values in `data` are not validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPayload {
    #[serde(rename = "type")]
    pub kind: ChartKind,
    pub title: String,
    pub data: Vec<serde_json::Value>,
    pub x_key: String,
    pub y_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_key: Option<String>,
}

/// One decoded event of the streaming protocol. Frames with a `type` this
/// client does not know about land on `Unknown` instead of failing the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    ToolStart {
        name: String,
        #[serde(default)]
        args: serde_json::Map<String, serde_json::Value>,
    },
    ToolResult {
        name: String,
        #[serde(default)]
        preview: String,
    },
    Done {
        #[serde(default)]
        answer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        html_artifact: Option<String>,
        #[serde(default, rename = "chartData", skip_serializing_if = "Option::is_none")]
        chart_data: Option<ChartPayload>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}
