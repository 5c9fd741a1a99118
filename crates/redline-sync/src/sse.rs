//! Server-sent event framing for the job status stream.

use futures::{Stream, StreamExt};
use redline_core::StatusEvent;

use crate::ApiError;
use crate::api::EventStream;

/// One decoded SSE frame. `event` defaults to `"message"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder: push raw chunks, pull complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    ///
    /// Frames with no `data:` lines (comments, keepalives) are skipped.
    pub fn next_frame(&mut self) -> Option<Result<SseFrame, ApiError>> {
        loop {
            let boundary = self.find_boundary()?;
            let frame_bytes: Vec<u8> = self.buffer.drain(..boundary.end).collect();

            let text = match std::str::from_utf8(&frame_bytes[..boundary.start]) {
                Ok(s) => s,
                Err(e) => {
                    return Some(Err(ApiError::Stream(format!(
                        "invalid UTF-8 in event frame: {e}"
                    ))));
                }
            };

            if let Some(frame) = parse_frame(text) {
                return Some(Ok(frame));
            }
        }
    }

    /// Earliest blank-line delimiter: `start` is the end of the frame body,
    /// `end` is the end of the delimiter.
    fn find_boundary(&self) -> Option<std::ops::Range<usize>> {
        let buf = &self.buffer;
        (0..buf.len()).find_map(|i| {
            if buf[i..].starts_with(b"\r\n\r\n") {
                Some(i..i + 4)
            } else if buf[i..].starts_with(b"\n\n") {
                Some(i..i + 2)
            } else {
                None
            }
        })
    }
}

fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // `id:`, `retry:` and `:` comments are ignored.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}

/// Decode a raw byte stream into status events.
///
/// The stream ends after the first error: a transport failure or a frame
/// whose payload is not a valid status event.
pub fn status_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<ApiError> + Send,
{
    futures::stream::unfold(Some((bytes, SseDecoder::new())), |state| async move {
        let (mut bytes, mut decoder) = state?;
        loop {
            if let Some(frame) = decoder.next_frame() {
                let event = frame.and_then(|f| {
                    serde_json::from_str::<StatusEvent>(&f.data).map_err(ApiError::from)
                });
                return match event {
                    Ok(event) => Some((Ok(event), Some((bytes, decoder)))),
                    Err(e) => Some((Err(e), None)),
                };
            }
            match bytes.next().await {
                Some(Ok(chunk)) => decoder.push(chunk.as_ref()),
                Some(Err(e)) => return Some((Err(e.into()), None)),
                None => return None,
            }
        }
    })
    .boxed()
}
