//! Incremental decoder for the upstream `data: <json>` event stream.
//!
//! Network chunks do not respect record boundaries: a record may arrive split
//! across several chunks, and one chunk may carry several records. The
//! decoder keeps the unterminated tail between calls and only parses
//! complete lines.

use std::collections::VecDeque;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::error::Result;
use crate::remote::ByteStream;

#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every record completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.pending.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(record) = parse_line(&self.pending[start..end]) {
                records.push(record);
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        records
    }

    /// Parse whatever is left once the upstream has closed.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.pending);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return None;
    }
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, line = %payload, "skipping malformed stream record");
            None
        }
    }
}

/// Turns a raw body stream into a lazy stream of decoded records.
///
/// Ends after the upstream closes; a transport error is yielded once and ends
/// the stream.
pub fn records(body: ByteStream) -> BoxStream<'static, Result<Value>> {
    let state = (body, LineDecoder::new(), VecDeque::new(), false);
    stream::unfold(
        state,
        |(mut body, mut decoder, mut queue, mut done)| async move {
            loop {
                if let Some(record) = queue.pop_front() {
                    return Some((Ok(record), (body, decoder, queue, done)));
                }
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(chunk)) => queue.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        return Some((Err(e), (body, decoder, queue, true)));
                    }
                    None => {
                        done = true;
                        queue.extend(decoder.finish());
                    }
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn record_split_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"data: {\"ans").is_empty());
        assert!(decoder.push(b"wer\": \"hel").is_empty());
        let out = decoder.push(b"lo\"}\n\ndata: {\"answer\": \"!\"}\n");
        assert_eq!(out, vec![json!({"answer": "hello"}), json!({"answer": "!"})]);
    }

    #[test]
    fn crlf_comments_and_done_are_handled() {
        let mut decoder = LineDecoder::new();
        let out = decoder.push(
            b": keep-alive\r\nevent: message\r\ndata: {\"delta\":\"a\"}\r\n\r\ndata: [DONE]\r\n",
        );
        assert_eq!(out, vec![json!({"delta": "a"})]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn malformed_json_is_skipped() {
        let mut decoder = LineDecoder::new();
        let out = decoder.push(b"data: {not json}\ndata: {\"delta\":\"ok\"}\n");
        assert_eq!(out, vec![json!({"delta": "ok"})]);
    }

    #[test]
    fn multibyte_text_split_mid_character() {
        let line = "data: {\"answer\":\"你好\"}\n".as_bytes();
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&line[..22]).is_empty());
        assert_eq!(decoder.push(&line[22..]), vec![json!({"answer": "你好"})]);
    }

    #[test]
    fn trailing_record_without_newline() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"data: {\"delta\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), Some(json!({"delta": "tail"})));
    }

    #[tokio::test]
    async fn records_stream_is_lazy_and_finite() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"delta\":\"a\"}\ndata: {\"del")),
            Ok(Bytes::from_static(b"ta\":\"b\"}")),
        ];
        let out: Vec<Value> = records(stream::iter(chunks).boxed())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec![json!({"delta": "a"}), json!({"delta": "b"})]);
    }
}
