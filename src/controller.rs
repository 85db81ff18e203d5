use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{AgentClient, TransportError};
use crate::decoder;
use crate::protocol::{AgentQueryRequest, StreamFrame};
use crate::transcript::{ChatTurn, ThinkingLog, ThinkingStep, Visualization};

pub(crate) const TRANSPORT_FAILURE_TEXT: &str =
    "Sorry, I could not reach the server. Please try again.";

/// What one streaming session reports back to the controller.
#[derive(Debug)]
enum StreamUpdate {
    Step(ThinkingStep),
    Completed {
        answer: String,
        visualization: Option<Visualization>,
    },
    /// Server-reported failure carrying the server's message.
    Failed { message: String },
    /// Transport dropped, or the stream closed without a terminal frame.
    Lost,
}

#[derive(Debug)]
struct SessionEvent {
    generation: u64,
    update: StreamUpdate,
}

struct LiveSession {
    cancel: CancellationToken,
    generation: u64,
}

/// Owns the conversation state and at most one in-flight streaming query.
///
/// Every session is tagged with a generation; a newer `submit` cancels the
/// old session's token and bumps the generation, so anything the old
/// transport still delivers is dropped in [`ChatController::apply`]. All log
/// mutation happens on the caller's task, when events are drained through
/// `poll_once` or `run_until_idle`.
pub struct ChatController {
    client: AgentClient,
    session_id: Option<String>,
    turns: Vec<ChatTurn>,
    thinking: ThinkingLog,
    loading: bool,
    live: Option<LiveSession>,
    generation: u64,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
}

impl ChatController {
    pub fn new(client: AgentClient, session_id: Option<String>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(100);
        Self {
            client,
            session_id,
            turns: Vec::new(),
            thinking: ThinkingLog::default(),
            loading: false,
            live: None,
            generation: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn thinking_steps(&self) -> &[ThinkingStep] {
        self.thinking.steps()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Starts a streaming query. Any in-flight session is cancelled before
    /// the new one opens, so at most one session is ever live.
    pub fn submit(&mut self, question: &str) {
        let (cancel, generation) = self.begin(question);
        let client = self.client.clone();
        let events = self.events_tx.clone();
        let request = AgentQueryRequest {
            question: question.to_string(),
            session_id: self.session_id.clone(),
        };

        tokio::spawn(async move {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = client.open_stream(&request) => opened,
            };
            match opened {
                Ok(chunks) => pump_frames(chunks, cancel, events, generation).await,
                Err(err) => {
                    warn!(%err, "agent stream failed to open");
                    let _ = events
                        .send(SessionEvent {
                            generation,
                            update: StreamUpdate::Lost,
                        })
                        .await;
                }
            }
        });
    }

    /// One question over the non-streaming endpoint, resolved through the
    /// same terminal transitions as a streamed session.
    pub async fn ask_once(&mut self, question: &str) {
        let (_cancel, generation) = self.begin(question);
        let request = AgentQueryRequest {
            question: question.to_string(),
            session_id: self.session_id.clone(),
        };

        let update = match self.client.query(&request).await {
            Ok(response) => StreamUpdate::Completed {
                answer: response.answer,
                visualization: Visualization::from_parts(
                    response.chart_data,
                    response.html_artifact,
                ),
            },
            // A non-2xx here arrives before any data, same as on the
            // streaming path: a generic failure, not a server message.
            Err(err) => {
                warn!(%err, "agent query failed");
                StreamUpdate::Lost
            }
        };
        self.apply(SessionEvent { generation, update });
    }

    /// Cancels the in-flight session, if any. Silent: no turn is appended,
    /// and the thinking log is left for the next session to clear.
    pub fn cancel(&mut self) {
        self.cancel_live();
        self.loading = false;
    }

    /// Applies at most one pending session event. Returns false when none
    /// was waiting.
    pub fn poll_once(&mut self) -> bool {
        match self.events_rx.try_recv() {
            Ok(event) => {
                self.apply(event);
                true
            }
            Err(_) => false,
        }
    }

    /// Processes events until the live session reaches a terminal state.
    pub async fn run_until_idle(&mut self) {
        while self.loading {
            match self.events_rx.recv().await {
                Some(event) => self.apply(event),
                None => break,
            }
        }
    }

    fn begin(&mut self, question: &str) -> (CancellationToken, u64) {
        self.cancel_live();
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.live = Some(LiveSession {
            cancel: cancel.clone(),
            generation,
        });
        self.turns.push(ChatTurn::user(question));
        self.thinking.clear();
        self.loading = true;
        (cancel, generation)
    }

    fn cancel_live(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(generation = live.generation, "cancelling in-flight session");
            live.cancel.cancel();
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        let live_generation = self.live.as_ref().map(|live| live.generation);
        if live_generation != Some(event.generation) {
            debug!(generation = event.generation, "dropping event from stale session");
            return;
        }

        match event.update {
            StreamUpdate::Step(step) => self.thinking.push(step),
            StreamUpdate::Completed {
                answer,
                visualization,
            } => {
                let snapshot = self.thinking.take_snapshot();
                let steps = if snapshot.is_empty() { None } else { Some(snapshot) };
                self.turns.push(ChatTurn::assistant(answer, visualization, steps));
                self.settle();
            }
            StreamUpdate::Failed { message } => {
                self.thinking.clear();
                self.turns
                    .push(ChatTurn::assistant(format!("Error: {}", message), None, None));
                self.settle();
            }
            StreamUpdate::Lost => {
                self.thinking.clear();
                self.turns
                    .push(ChatTurn::assistant(TRANSPORT_FAILURE_TEXT, None, None));
                self.settle();
            }
        }
    }

    fn settle(&mut self) {
        self.live = None;
        self.loading = false;
    }

    #[cfg(test)]
    fn submit_from<S, B>(&mut self, question: &str, chunks: S)
    where
        S: Stream<Item = Result<B, TransportError>> + Unpin + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
    {
        let (cancel, generation) = self.begin(question);
        let events = self.events_tx.clone();
        tokio::spawn(pump_frames(chunks, cancel, events, generation));
    }
}

/// Decodes and drains the longest valid UTF-8 prefix of `buffer`. A chunk
/// boundary may fall inside a multibyte character, so an incomplete trailing
/// sequence is left in place for the next chunk to finish; invalid bytes are
/// replaced and skipped.
fn drain_complete_utf8(buffer: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(buffer) {
            Ok(text) => {
                out.push_str(text);
                buffer.clear();
                return out;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&buffer[..valid]));
                match err.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        buffer.drain(..valid + bad);
                    }
                    None => {
                        buffer.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// Reads chunks until a terminal frame, the end of the stream, or
/// cancellation. Reasoning frames are forwarded as they decode; nothing more
/// is read once a terminal frame has been seen, even if the transport has
/// further data buffered.
async fn pump_frames<S, B>(
    mut chunks: S,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    generation: u64,
) where
    S: Stream<Item = Result<B, TransportError>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut tail = String::new();
    let mut raw = Vec::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = chunks.next() => next,
        };
        let Some(chunk) = next else {
            // Stream closed without done/error: not a silent success.
            break;
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(%err, "agent stream dropped mid-read");
                let _ = events
                    .send(SessionEvent {
                        generation,
                        update: StreamUpdate::Lost,
                    })
                    .await;
                return;
            }
        };

        raw.extend_from_slice(chunk.as_ref());
        tail.push_str(&drain_complete_utf8(&mut raw));
        let (frames, rest) = decoder::decode(&tail);
        tail = rest;

        for frame in frames {
            let update = match frame {
                StreamFrame::ToolStart { name, args } => {
                    StreamUpdate::Step(ThinkingStep::invoked(name, args))
                }
                StreamFrame::ToolResult { name, preview } => {
                    StreamUpdate::Step(ThinkingStep::completed(name, preview))
                }
                StreamFrame::Done {
                    answer,
                    html_artifact,
                    chart_data,
                } => {
                    let update = StreamUpdate::Completed {
                        answer,
                        visualization: Visualization::from_parts(chart_data, html_artifact),
                    };
                    let _ = events.send(SessionEvent { generation, update }).await;
                    return;
                }
                StreamFrame::Error { message } => {
                    let _ = events
                        .send(SessionEvent {
                            generation,
                            update: StreamUpdate::Failed { message },
                        })
                        .await;
                    return;
                }
                // The decoder filters these; keep the match total.
                StreamFrame::Unknown => continue,
            };
            let _ = events.send(SessionEvent { generation, update }).await;
        }
    }

    let _ = events
        .send(SessionEvent {
            generation,
            update: StreamUpdate::Lost,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{Speaker, StepKind};
    use futures::stream;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    fn controller() -> ChatController {
        ChatController::new(AgentClient::new("http://127.0.0.1:9"), Some("upload-1".to_string()))
    }

    fn event(json: &str) -> String {
        format!("data: {}\n\n", json)
    }

    fn ok_chunks(parts: Vec<String>) -> stream::Iter<std::vec::IntoIter<Result<String, TransportError>>> {
        stream::iter(parts.into_iter().map(Ok).collect::<Vec<_>>().into_iter())
    }

    #[tokio::test]
    async fn happy_path_builds_turn_with_chart_and_frozen_steps() {
        let mut ctl = controller();
        let chunks = ok_chunks(vec![
            event(r#"{"type":"tool_start","name":"query_db","args":{"table":"tickets"}}"#),
            event(r#"{"type":"tool_result","name":"query_db","preview":"120 rows"}"#),
            event(
                r#"{"type":"done","answer":"Here is the breakdown","chartData":{"type":"bar","title":"Sentiment","data":[],"xKey":"label","yKey":"count"}}"#,
            ),
        ]);

        ctl.submit_from("Show sentiment breakdown", chunks);
        assert!(ctl.is_loading());
        ctl.run_until_idle().await;

        assert!(!ctl.is_loading());
        assert!(ctl.thinking_steps().is_empty());
        let turns = ctl.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::User);
        assert_eq!(turns[0].text, "Show sentiment breakdown");
        assert_eq!(turns[1].speaker, Speaker::Assistant);
        assert_eq!(turns[1].text, "Here is the breakdown");
        assert!(matches!(turns[1].visualization, Some(Visualization::Chart(_))));

        let steps = turns[1].steps.as_deref().expect("frozen steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].kind, StepKind::ToolInvoked);
        assert_eq!(steps[0].name, "query_db");
        assert_eq!(steps[1].kind, StepKind::ToolCompleted);
        assert_eq!(steps[1].preview.as_deref(), Some("120 rows"));
    }

    #[test]
    fn drain_complete_utf8_holds_back_incomplete_sequences() {
        let mut buffer = "café".as_bytes()[..4].to_vec();
        assert_eq!(drain_complete_utf8(&mut buffer), "caf");
        assert_eq!(buffer, vec![0xC3]);

        buffer.push(0xA9);
        assert_eq!(drain_complete_utf8(&mut buffer), "é");
        assert!(buffer.is_empty());

        // An invalid byte is replaced without eating what follows it.
        let mut buffer = vec![b'a', 0xFF, b'b'];
        assert_eq!(drain_complete_utf8(&mut buffer), "a\u{FFFD}b");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn multibyte_answer_survives_any_chunk_boundary() {
        let full = event(r#"{"type":"done","answer":"café ☕"}"#).into_bytes();

        for split in 0..=full.len() {
            let mut ctl = controller();
            let chunks = stream::iter(vec![
                Ok::<_, TransportError>(full[..split].to_vec()),
                Ok(full[split..].to_vec()),
            ]);

            ctl.submit_from("q", chunks);
            ctl.run_until_idle().await;

            assert_eq!(ctl.turns()[1].text, "café ☕", "split at byte {}", split);
        }
    }

    #[tokio::test]
    async fn frames_split_across_chunks_decode_once_complete() {
        let mut ctl = controller();
        let full = event(r#"{"type":"done","answer":"split ok"}"#);
        let (first, second) = full.split_at(14);
        let chunks = ok_chunks(vec![first.to_string(), second.to_string()]);

        ctl.submit_from("q", chunks);
        ctl.run_until_idle().await;

        assert_eq!(ctl.turns().len(), 2);
        assert_eq!(ctl.turns()[1].text, "split ok");
    }

    #[tokio::test]
    async fn server_error_frame_becomes_error_turn_without_steps() {
        let mut ctl = controller();
        let chunks = ok_chunks(vec![
            event(r#"{"type":"tool_start","name":"query_db","args":{}}"#),
            event(r#"{"type":"error","message":"model unavailable"}"#),
        ]);

        ctl.submit_from("q", chunks);
        ctl.run_until_idle().await;

        assert!(!ctl.is_loading());
        assert!(ctl.thinking_steps().is_empty());
        let turn = ctl.turns().last().expect("assistant turn");
        assert_eq!(turn.text, "Error: model unavailable");
        assert!(turn.steps.is_none());
        assert!(turn.visualization.is_none());
    }

    #[tokio::test]
    async fn stream_end_without_terminal_frame_is_a_transport_failure() {
        let mut ctl = controller();
        let chunks = ok_chunks(vec![event(
            r#"{"type":"tool_start","name":"query_db","args":{}}"#,
        )]);

        ctl.submit_from("q", chunks);
        ctl.run_until_idle().await;

        assert!(!ctl.is_loading());
        assert!(ctl.thinking_steps().is_empty());
        assert_eq!(ctl.turns().last().unwrap().text, TRANSPORT_FAILURE_TEXT);
    }

    #[tokio::test]
    async fn mid_read_transport_error_is_a_transport_failure() {
        let mut ctl = controller();
        let chunks = stream::iter(vec![
            Ok(event(r#"{"type":"tool_start","name":"query_db","args":{}}"#)),
            Err(TransportError::Status {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: String::new(),
            }),
        ]);

        ctl.submit_from("q", chunks);
        ctl.run_until_idle().await;

        assert_eq!(ctl.turns().last().unwrap().text, TRANSPORT_FAILURE_TEXT);
    }

    #[tokio::test]
    async fn html_artifact_wins_when_done_carries_both_shapes() {
        let mut ctl = controller();
        let chunks = ok_chunks(vec![event(
            r#"{"type":"done","answer":"both","html_artifact":"<html></html>","chartData":{"type":"pie","title":"t","data":[],"xKey":"x","yKey":"y"}}"#,
        )]);

        ctl.submit_from("q", chunks);
        ctl.run_until_idle().await;

        match &ctl.turns()[1].visualization {
            Some(Visualization::Html(html)) => assert_eq!(html, "<html></html>"),
            other => panic!("expected html artifact, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn frames_after_the_terminal_frame_are_ignored() {
        let mut ctl = controller();
        // Terminal frame and a trailing step arrive in the same chunk.
        let mut chunk = event(r#"{"type":"done","answer":"fin"}"#);
        chunk.push_str(&event(r#"{"type":"tool_start","name":"late","args":{}}"#));

        ctl.submit_from("q", ok_chunks(vec![chunk]));
        ctl.run_until_idle().await;

        assert_eq!(ctl.turns().len(), 2);
        assert!(ctl.thinking_steps().is_empty());
        assert!(ctl.turns()[1].steps.is_none());
    }

    #[tokio::test]
    async fn resubmit_cancels_the_previous_session() {
        let mut ctl = controller();

        // Session A never produces data until after B has settled.
        let (chunk_tx, chunk_rx) = mpsc::channel::<Result<String, TransportError>>(4);
        ctl.submit_from("question A", ReceiverStream::new(chunk_rx));

        ctl.submit_from(
            "question B",
            ok_chunks(vec![event(r#"{"type":"done","answer":"answer B"}"#)]),
        );
        ctl.run_until_idle().await;

        // A's transport now delivers a terminal frame; it must change nothing.
        let _ = chunk_tx
            .send(Ok(event(r#"{"type":"done","answer":"answer A"}"#)))
            .await;
        drop(chunk_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        while ctl.poll_once() {}

        let turns = ctl.turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].text, "question A");
        assert_eq!(turns[1].text, "question B");
        assert_eq!(turns[2].text, "answer B");
        assert!(!ctl.is_loading());
    }

    #[tokio::test]
    async fn explicit_cancel_is_silent_and_leaves_steps_for_the_next_session() {
        let mut ctl = controller();
        let (chunk_tx, chunk_rx) = mpsc::channel::<Result<String, TransportError>>(4);
        ctl.submit_from("q", ReceiverStream::new(chunk_rx));

        chunk_tx
            .send(Ok(event(r#"{"type":"tool_start","name":"query_db","args":{}}"#)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        while ctl.poll_once() {}
        assert_eq!(ctl.thinking_steps().len(), 1);

        ctl.cancel();
        assert!(!ctl.is_loading());
        assert_eq!(ctl.turns().len(), 1, "no turn appended for a cancelled session");
        assert_eq!(ctl.thinking_steps().len(), 1, "log left for the next session");

        // The next submit clears the leftover log.
        ctl.submit_from(
            "next",
            ok_chunks(vec![event(r#"{"type":"done","answer":"fresh"}"#)]),
        );
        assert!(ctl.thinking_steps().is_empty());
        ctl.run_until_idle().await;
        assert_eq!(ctl.turns().last().unwrap().text, "fresh");
    }

    #[tokio::test]
    async fn fallback_query_failure_is_a_generic_transport_failure() {
        // Nothing listens on the controller's port; the request fails
        // before any data, which must settle like a dropped transport.
        let mut ctl = controller();
        ctl.ask_once("q").await;

        assert!(!ctl.is_loading());
        let turn = ctl.turns().last().expect("assistant turn");
        assert_eq!(turn.text, TRANSPORT_FAILURE_TEXT);
        assert!(turn.steps.is_none());
        assert!(turn.visualization.is_none());
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_do_not_break_the_session() {
        let mut ctl = controller();
        let chunks = ok_chunks(vec![
            event(r#"{"type":"tool_start","name":"a","args":{}}"#),
            "data: {definitely not json\n\n".to_string(),
            event(r#"{"type":"heartbeat"}"#),
            event(r#"{"type":"done","answer":"survived"}"#),
        ]);

        ctl.submit_from("q", chunks);
        ctl.run_until_idle().await;

        let turn = ctl.turns().last().unwrap();
        assert_eq!(turn.text, "survived");
        assert_eq!(turn.steps.as_deref().map(|s| s.len()), Some(1));
    }
}
