use tracing::debug;

use crate::protocol::StreamFrame;

const DATA_PREFIX: &str = "data:";

/// Splits `buffer` into complete protocol frames plus the undecoded tail.
///
/// `buffer` is the previous remainder with the newest chunk appended, so the
/// same logical stream produces the same frames no matter how the transport
/// chunks it. Events are separated by a blank line; payload lines carry a
/// `data:` prefix and one JSON object. Events that fail to parse are dropped
/// without stopping the decode, and frames with an unrecognized `type` are
/// skipped.
pub(crate) fn decode(buffer: &str) -> (Vec<StreamFrame>, String) {
    let mut text = buffer.replace("\r\n", "\n");

    // A trailing bare '\r' may be half of a '\r\n' split across chunks; hold
    // it back so the next call can see the pair.
    let held_cr = text.ends_with('\r');
    if held_cr {
        text.pop();
    }

    let mut frames = Vec::new();
    let mut rest = text.as_str();
    while let Some(idx) = rest.find("\n\n") {
        let raw_event = &rest[..idx];
        rest = &rest[idx + 2..];

        let Some(payload) = extract_data(raw_event) else {
            continue;
        };
        match serde_json::from_str::<StreamFrame>(&payload) {
            Ok(StreamFrame::Unknown) => debug!("skipping frame with unknown type"),
            Ok(frame) => frames.push(frame),
            Err(err) => debug!(%err, "dropping malformed frame"),
        }
    }

    let mut remainder = rest.to_string();
    if held_cr {
        remainder.push('\r');
    }
    (frames, remainder)
}

/// Joins the `data:` lines of one event; `None` when the event carries none.
fn extract_data(raw_event: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw_event.lines() {
        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
