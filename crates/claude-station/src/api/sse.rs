//! Server-Sent Events framing for the streaming Messages endpoint.
//!
//! Turns the raw byte stream into the JSON payloads of `data:` lines.
//! Event-type lines are ignored; the payloads are self-describing.

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

/// Decode `data:` payloads from an SSE byte stream.
pub fn data_lines<S>(byte_stream: S) -> impl Stream<Item = Result<String, reqwest::Error>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    stream! {
        let mut buffer = BytesMut::with_capacity(8192);
        futures_util::pin_mut!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => buffer.extend_from_slice(&bytes),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes = buffer.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line_bytes);
                if let Some(data) = extract_data(line.trim_end()) {
                    yield Ok(data.to_string());
                }
            }
        }

        // Trailing payload without a final newline.
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer);
            if let Some(data) = extract_data(line.trim()) {
                yield Ok(data.to_string());
            }
        }
    }
}

/// Payload of a `data:` line; `None` for blanks, comments, field lines,
/// and `[DONE]` markers.
fn extract_data(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data)
}
