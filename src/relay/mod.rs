//! Streaming answer relay.
//!
//! One tokio task per question consumes the remote platform's event stream
//! and writes client-facing [`StreamEvent`]s into a bounded channel:
//!
//! ```text
//! chat-messages body ──▶ decoder::records ──▶ DeltaBuffer ──▶ Delta ... Delta
//!                                 │
//!                                 └─▶ retriever_resources ──▶ presigned URLs ──▶ Finish
//! ```
//!
//! Guarantees for a successful run: at least one `Delta` (a default notice
//! when the upstream produced no text) and exactly one `Finish`, sent last.
//! On failure or when the deadline elapses the producer is dropped (closing
//! the upstream connection), an error notice is sent as a `Delta` when the
//! channel still has room, and the channel yields the error. No `Finish`
//! follows an error.

mod buffer;
mod decoder;

pub use buffer::DeltaBuffer;
pub use decoder::{records, LineDecoder};

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::error::{GatewayError, Result};
use crate::mapping::MappingStore;
use crate::models::{DocumentId, Reference, SpaceId, StreamEvent};
use crate::object_store::ObjectStore;
use crate::remote::RemoteIndex;

/// Item type of the relay channel.
pub type RelayItem = std::result::Result<StreamEvent, GatewayError>;

/// A document cited by the upstream retrieval metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitedDocument {
    pub document_id: DocumentId,
    pub document_name: String,
}

#[derive(Clone)]
pub struct AnswerRelay {
    remote: Arc<dyn RemoteIndex>,
    objects: Arc<dyn ObjectStore>,
    mappings: MappingStore,
    config: RelayConfig,
    presign_ttl: Duration,
}

impl AnswerRelay {
    pub fn new(
        remote: Arc<dyn RemoteIndex>,
        objects: Arc<dyn ObjectStore>,
        mappings: MappingStore,
        config: RelayConfig,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            remote,
            objects,
            mappings,
            config,
            presign_ttl,
        }
    }

    /// Start answering `query` in the background.
    pub fn spawn(
        &self,
        space_id: SpaceId,
        query: String,
        user: Option<String>,
    ) -> mpsc::Receiver<RelayItem> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let relay = self.clone();

        tokio::spawn(async move {
            let deadline = relay.config.timeout();
            let run = relay.run(&space_id, &query, user.as_deref(), &tx);
            let err = match tokio::time::timeout(deadline, run).await {
                Ok(Ok(())) => {
                    tracing::debug!(space_id = %space_id, "answer stream finished");
                    return;
                }
                Ok(Err(e)) => e,
                Err(_) => GatewayError::Timeout(deadline),
            };

            if tx.is_closed() {
                tracing::info!(space_id = %space_id, "client went away before the answer completed");
                return;
            }
            tracing::error!(space_id = %space_id, error = %err, "answer stream failed");
            let _ = tx.try_send(Ok(StreamEvent::Delta(error_notice(&err))));
            let _ = tx.send(Err(err)).await;
        });

        rx
    }

    async fn run(
        &self,
        space_id: &SpaceId,
        query: &str,
        user: Option<&str>,
        tx: &mpsc::Sender<RelayItem>,
    ) -> Result<()> {
        let body = self.remote.chat_stream(query, user).await?;
        let mut stream = records(body);
        let mut buffer = DeltaBuffer::new(self.config.flush_chars);
        let mut cited: Vec<CitedDocument> = Vec::new();

        while let Some(record) = stream.next().await {
            let record = record?;
            if let Some(err) = upstream_error(&record) {
                return Err(err);
            }
            collect_citations(&record, &mut cited);
            if let Some(text) = fragment(&record).and_then(|f| buffer.push(f)) {
                emit(tx, StreamEvent::Delta(text)).await?;
            }
        }
        drop(stream);

        if let Some(rest) = buffer.finish() {
            emit(tx, StreamEvent::Delta(rest)).await?;
        }
        if !buffer.has_emitted() {
            emit(tx, StreamEvent::Delta(self.config.empty_answer.clone())).await?;
        }

        let references = self.resolve_references(space_id, &cited).await?;
        emit(tx, StreamEvent::Finish(references)).await
    }

    /// Presigned links for the cited documents, or for a few documents of
    /// the space when nothing was cited.
    pub async fn resolve_references(
        &self,
        space_id: &SpaceId,
        cited: &[CitedDocument],
    ) -> Result<Vec<Reference>> {
        let mut references = Vec::new();

        if cited.is_empty() {
            let fallback = self
                .mappings
                .find_by_space(space_id, Some(self.config.fallback_references as i64))
                .await?;
            for mapping in fallback {
                if let Some(url) = self.presign(&mapping.object_key()).await {
                    references.push(Reference {
                        document_id: mapping.document_id,
                        title: mapping.file_name,
                        file_url: url,
                    });
                }
            }
            return Ok(references);
        }

        for doc in cited {
            let (key, title) = match self.mappings.find_by_id(&doc.document_id).await? {
                Some(mapping) => (mapping.object_key(), mapping.file_name),
                None => (doc.document_name.clone(), doc.document_name.clone()),
            };
            if key.is_empty() {
                tracing::warn!(document_id = %doc.document_id, "cited document has no name, skipping reference");
                continue;
            }
            if let Some(url) = self.presign(&key).await {
                references.push(Reference {
                    document_id: doc.document_id.clone(),
                    title,
                    file_url: url,
                });
            }
        }
        Ok(references)
    }

    async fn presign(&self, key: &str) -> Option<String> {
        match self.objects.presigned_url(key, self.presign_ttl).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(key, error = %e, "could not presign reference, skipping");
                None
            }
        }
    }
}

async fn emit(tx: &mpsc::Sender<RelayItem>, event: StreamEvent) -> Result<()> {
    tx.send(Ok(event))
        .await
        .map_err(|_| GatewayError::unknown("answer stream receiver dropped"))
}

/// Answer text carried by a record: `delta`, or `answer` for message events.
fn fragment(record: &Value) -> Option<&str> {
    record
        .get("delta")
        .or_else(|| record.get("answer"))
        .and_then(Value::as_str)
}

fn upstream_error(record: &Value) -> Option<GatewayError> {
    if record.get("event").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let status = record
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(502);
    let body = record
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| record.to_string());
    Some(GatewayError::RemoteIndex { status, body })
}

/// Adds the documents listed in a record's retrieval metadata, first-seen order, no duplicates.
pub fn collect_citations(record: &Value, cited: &mut Vec<CitedDocument>) {
    let resources = record
        .pointer("/metadata/retriever_resources")
        .or_else(|| record.get("retriever_resources"))
        .and_then(Value::as_array);

    for resource in resources.into_iter().flatten() {
        let Some(id) = resource.get("document_id").and_then(Value::as_str) else {
            continue;
        };
        if cited.iter().any(|c| c.document_id.as_str() == id) {
            continue;
        }
        let name = resource
            .get("document_name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        cited.push(CitedDocument {
            document_id: DocumentId::new(id),
            document_name: name.to_string(),
        });
    }
}

fn error_notice(err: &GatewayError) -> String {
    match err {
        GatewayError::Timeout(_) => "[error] the answer took too long and was stopped".to_string(),
        e if e.is_internal() => "[error] the answer could not be completed".to_string(),
        e => format!("[error] {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn citations_are_deduplicated_in_order() {
        let mut cited = Vec::new();
        collect_citations(
            &json!({"event": "message_end", "metadata": {"retriever_resources": [
                {"document_id": "d2", "document_name": "B.pdf"},
                {"document_id": "d1", "document_name": "A.docx"},
                {"document_id": "d2", "document_name": "B.pdf"}
            ]}}),
            &mut cited,
        );
        collect_citations(
            &json!({"retriever_resources": [{"document_id": "d3"}, {"document_name": "no id"}]}),
            &mut cited,
        );
        let ids: Vec<&str> = cited.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d1", "d3"]);
        assert_eq!(cited[2].document_name, "");
    }

    #[test]
    fn error_records_become_remote_errors() {
        let err = upstream_error(&json!({"event": "error", "status": 400, "message": "quota"}))
            .unwrap();
        assert!(matches!(err, GatewayError::RemoteIndex { status: 400, ref body } if body == "quota"));
        assert!(upstream_error(&json!({"event": "message", "answer": "x"})).is_none());
    }

    #[test]
    fn answer_and_delta_fields_are_both_read() {
        assert_eq!(fragment(&json!({"answer": "a"})), Some("a"));
        assert_eq!(fragment(&json!({"delta": "b"})), Some("b"));
        assert_eq!(fragment(&json!({"event": "ping"})), None);
    }

    #[test]
    fn delta_wins_over_answer() {
        assert_eq!(fragment(&json!({"answer": "full", "delta": "d"})), Some("d"));
    }

    #[test]
    fn internal_errors_are_not_leaked() {
        assert_eq!(
            error_notice(&GatewayError::unknown("db pool poisoned")),
            "[error] the answer could not be completed"
        );
    }
}
