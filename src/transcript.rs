use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::protocol::ChartPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    ToolInvoked,
    ToolCompleted,
}

/// One observed reasoning action of the server-side agent.
#[derive(Debug, Clone)]
pub struct ThinkingStep {
    pub kind: StepKind,
    pub name: String,
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
    pub preview: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl ThinkingStep {
    pub(crate) fn invoked(name: String, arguments: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            kind: StepKind::ToolInvoked,
            name,
            arguments: Some(arguments),
            preview: None,
            observed_at: Utc::now(),
        }
    }

    pub(crate) fn completed(name: String, preview: String) -> Self {
        Self {
            kind: StepKind::ToolCompleted,
            name,
            arguments: None,
            preview: Some(preview),
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

/// What an assistant turn wants rendered besides its text.
#[derive(Debug, Clone)]
pub enum Visualization {
    Chart(ChartPayload),
    Html(String),
}

impl Visualization {
    /// Builds the turn's visualization from a terminal frame. When a frame
    /// carries both shapes the HTML artifact wins and the chart is discarded;
    /// the renderer relies on that precedence.
    pub(crate) fn from_parts(chart: Option<ChartPayload>, html: Option<String>) -> Option<Self> {
        match (html, chart) {
            (Some(html), _) => Some(Visualization::Html(html)),
            (None, Some(chart)) => Some(Visualization::Chart(chart)),
            (None, None) => None,
        }
    }

    /// One-line description for plain-text surfaces.
    pub fn describe(&self) -> String {
        match self {
            Visualization::Chart(chart) => format!(
                "chart: {} \"{}\" ({} points)",
                chart.kind.as_str(),
                chart.title,
                chart.data.len()
            ),
            Visualization::Html(html) => format!("html artifact ({} bytes)", html.len()),
        }
    }
}

/// One finalized exchange unit of the conversation.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub id: Uuid,
    pub speaker: Speaker,
    pub text: String,
    pub visualization: Option<Visualization>,
    pub steps: Option<Vec<ThinkingStep>>,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub(crate) fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            speaker: Speaker::User,
            text: text.into(),
            visualization: None,
            steps: None,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn assistant(
        text: impl Into<String>,
        visualization: Option<Visualization>,
        steps: Option<Vec<ThinkingStep>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            speaker: Speaker::Assistant,
            text: text.into(),
            visualization,
            steps,
            created_at: Utc::now(),
        }
    }
}

/// Append-only log of the in-flight query's reasoning steps. Steps are never
/// removed individually; the log is only cleared or drained whole.
#[derive(Debug, Default)]
pub struct ThinkingLog {
    steps: Vec<ThinkingStep>,
}

impl ThinkingLog {
    pub(crate) fn push(&mut self, step: ThinkingStep) {
        self.steps.push(step);
    }

    pub(crate) fn clear(&mut self) {
        self.steps.clear();
    }

    /// Freezes the log for a finished turn, leaving it empty.
    pub(crate) fn take_snapshot(&mut self) -> Vec<ThinkingStep> {
        std::mem::take(&mut self.steps)
    }

    pub fn steps(&self) -> &[ThinkingStep] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChartKind;

    fn chart() -> ChartPayload {
        ChartPayload {
            kind: ChartKind::Pie,
            title: "Requests by type".to_string(),
            data: vec![serde_json::json!({"label": "billing", "count": 4})],
            x_key: "label".to_string(),
            y_key: "count".to_string(),
            color_key: None,
        }
    }

    #[test]
    fn html_artifact_wins_over_chart() {
        let viz = Visualization::from_parts(Some(chart()), Some("<html></html>".to_string()))
            .expect("visualization");
        assert!(matches!(viz, Visualization::Html(_)));
    }

    #[test]
    fn chart_is_used_when_no_artifact_present() {
        let viz = Visualization::from_parts(Some(chart()), None).expect("visualization");
        assert!(matches!(viz, Visualization::Chart(_)));
        assert!(Visualization::from_parts(None, None).is_none());
    }

    #[test]
    fn describe_summarizes_both_shapes() {
        let chart = Visualization::Chart(chart());
        assert_eq!(chart.describe(), "chart: pie \"Requests by type\" (1 points)");
        let html = Visualization::Html("<p>hi</p>".to_string());
        assert_eq!(html.describe(), "html artifact (9 bytes)");
    }

    #[test]
    fn snapshot_drains_the_log() {
        let mut log = ThinkingLog::default();
        log.push(ThinkingStep::invoked("query_db".to_string(), serde_json::Map::new()));
        log.push(ThinkingStep::completed("query_db".to_string(), "120 rows".to_string()));

        let snapshot = log.take_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].kind, StepKind::ToolInvoked);
        assert_eq!(snapshot[1].preview.as_deref(), Some("120 rows"));
        assert!(log.steps().is_empty());
    }
}
