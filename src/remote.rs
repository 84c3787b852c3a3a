//! Client for the remote RAG platform (Dify-compatible HTTP API).
//!
//! Two API keys are used: the dataset key for document management under
//! `datasets/{dataset_id}/...`, and the application key for
//! `chat-messages`. Any non-2xx answer becomes
//! [`GatewayError::RemoteIndex`] carrying the status and the verbatim body;
//! connection failures become [`GatewayError::RemoteTransport`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::RemoteConfig;
use crate::error::{GatewayError, Result};
use crate::models::DocumentId;

/// Largest page the listing endpoint accepts.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Raw body chunks of a streaming answer.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteDocumentPage {
    #[serde(default)]
    pub data: Vec<RemoteDocument>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub total: u64,
}

#[async_trait]
pub trait RemoteIndex: Send + Sync {
    /// Index `text` under the display `name`; returns the remote-assigned id.
    async fn create_document(&self, name: &str, text: &str) -> Result<DocumentId>;

    /// Partial update: `None` fields are left untouched remotely.
    async fn update_document(
        &self,
        id: &DocumentId,
        name: Option<&str>,
        text: Option<&str>,
    ) -> Result<()>;

    async fn delete_document(&self, id: &DocumentId) -> Result<()>;

    /// `page` starts at 1; `limit` is clamped to `1..=100`.
    async fn list_documents(
        &self,
        keyword: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<RemoteDocumentPage>;

    /// Start a streaming chat request and return the raw response body.
    /// `user` overrides the configured end-user identifier.
    async fn chat_stream(&self, query: &str, user: Option<&str>) -> Result<ByteStream>;
}

pub struct DifyClient {
    client: reqwest::Client,
    base_url: String,
    dataset_id: String,
    user: String,
    dataset_key: String,
    app_key: String,
    timeout: Duration,
}

impl DifyClient {
    pub fn new(
        client: reqwest::Client,
        config: &RemoteConfig,
        dataset_key: String,
        app_key: String,
    ) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dataset_id: config.dataset_id.clone(),
            user: config.user.clone(),
            dataset_key,
            app_key,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// `{base}/datasets/{dataset_id}/{segments...}` with every segment
    /// percent-encoded on its own, so an id can never add or climb path levels.
    fn dataset_url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| GatewayError::unknown(format!("invalid remote base_url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::unknown("remote base_url cannot carry a path"))?
            .pop_if_empty()
            .push("datasets")
            .push(&self.dataset_id)
            .extend(segments);
        Ok(url)
    }

    async fn send_dataset(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req
            .bearer_auth(&self.dataset_key)
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(resp).await
    }
}

/// Ids the URL encoder would drop or resolve instead of encoding.
fn path_segment(id: &DocumentId) -> Result<&str> {
    match id.as_str() {
        "" | "." | ".." => Err(GatewayError::validation(format!(
            "invalid document id: {:?}",
            id.as_str()
        ))),
        segment => Ok(segment),
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    tracing::warn!(status, body = %body, "remote index returned an error");
    Err(GatewayError::RemoteIndex { status, body })
}

/// Create-by-text body with the fixed indexing configuration.
pub fn create_payload(name: &str, text: &str) -> Value {
    json!({
        "name": name,
        "text": text,
        "indexing_technique": "high_quality",
        "doc_form": "text_model",
        "doc_language": "中文",
        "process_rule": process_rule(),
        "retrieval_model": {
            "search_method": "hybrid_search",
            "reranking_enable": true,
            "top_k": 5,
            "score_threshold_enabled": true,
            "score_threshold": 0.8,
            "weights": {
                "semantic": 0.5,
                "keyword": 0.5
            }
        },
        "embedding_model": "text-embedding-ada-002",
        "embedding_model_provider": "openai"
    })
}

/// Update-by-text body carrying only the supplied fields.
pub fn update_payload(name: Option<&str>, text: Option<&str>) -> Value {
    let mut body = json!({ "process_rule": process_rule() });
    if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
        body["name"] = json!(name);
    }
    if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
        body["text"] = json!(text);
    }
    body
}

fn process_rule() -> Value {
    json!({
        "mode": "automatic",
        "rules": {
            "pre_processing_rules": [
                { "id": "remove_extra_spaces", "enabled": true }
            ],
            "segmentation": {
                "separator": "###",
                "max_tokens": 500
            }
        }
    })
}

pub fn chat_payload(query: &str, user: &str) -> Value {
    json!({
        "inputs": {},
        "response_mode": "streaming",
        "auto_generate_name": true,
        "query": query,
        "user": user
    })
}

#[async_trait]
impl RemoteIndex for DifyClient {
    async fn create_document(&self, name: &str, text: &str) -> Result<DocumentId> {
        let req = self
            .client
            .post(self.dataset_url(&["document", "create-by-text"])?)
            .json(&create_payload(name, text));
        let resp = self.send_dataset(req).await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;

        let id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["document"]["id"].as_str().map(str::to_string))
            .ok_or_else(|| GatewayError::RemoteIndex {
                status,
                body: format!("response has no document.id: {}", body),
            })?;

        tracing::info!(document_id = %id, name, chars = text.chars().count(), "remote document created");
        Ok(DocumentId::new(id))
    }

    async fn update_document(
        &self,
        id: &DocumentId,
        name: Option<&str>,
        text: Option<&str>,
    ) -> Result<()> {
        let req = self
            .client
            .post(self.dataset_url(&["documents", path_segment(id)?, "update-by-text"])?)
            .json(&update_payload(name, text));
        self.send_dataset(req).await?;
        tracing::info!(document_id = %id, renamed = name.is_some(), new_text = text.is_some(), "remote document updated");
        Ok(())
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<()> {
        let req = self
            .client
            .delete(self.dataset_url(&["documents", path_segment(id)?])?);
        self.send_dataset(req).await?;
        tracing::info!(document_id = %id, "remote document deleted");
        Ok(())
    }

    async fn list_documents(
        &self,
        keyword: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<RemoteDocumentPage> {
        let mut query = vec![
            ("page", page.max(1).to_string()),
            ("limit", limit.clamp(1, MAX_PAGE_LIMIT).to_string()),
        ];
        if let Some(keyword) = keyword.filter(|k| !k.is_empty()) {
            query.push(("keyword", keyword.to_string()));
        }
        let req = self.client.get(self.dataset_url(&["documents"])?).query(&query);
        let resp = self.send_dataset(req).await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| GatewayError::RemoteIndex {
            status,
            body: format!("unreadable document listing ({}): {}", e, body),
        })
    }

    async fn chat_stream(&self, query: &str, user: Option<&str>) -> Result<ByteStream> {
        let resp = self
            .client
            .post(format!("{}/chat-messages", self.base_url))
            .bearer_auth(&self.app_key)
            .json(&chat_payload(query, user.unwrap_or(&self.user)))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(GatewayError::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_payload_carries_indexing_settings() {
        let body = create_payload("Handbook", "hello world");
        assert_eq!(body["name"], "Handbook");
        assert_eq!(body["text"], "hello world");
        assert_eq!(body["indexing_technique"], "high_quality");
        assert_eq!(body["retrieval_model"]["search_method"], "hybrid_search");
        assert_eq!(body["retrieval_model"]["weights"]["semantic"], 0.5);
        assert_eq!(body["embedding_model"], "text-embedding-ada-002");
        assert_eq!(body["process_rule"]["rules"]["segmentation"]["max_tokens"], 500);
    }

    #[test]
    fn update_payload_omits_missing_fields() {
        let rename = update_payload(Some("New name"), None);
        assert_eq!(rename["name"], "New name");
        assert!(rename.get("text").is_none());

        let retext = update_payload(None, Some("body"));
        assert!(retext.get("name").is_none());
        assert_eq!(retext["text"], "body");
        assert_eq!(retext["process_rule"]["mode"], "automatic");
    }

    #[test]
    fn chat_payload_requests_streaming() {
        let body = chat_payload("what is the leave policy?", "gateway");
        assert_eq!(body["response_mode"], "streaming");
        assert_eq!(body["query"], "what is the leave policy?");
        assert_eq!(body["user"], "gateway");
        assert!(body["inputs"].as_object().unwrap().is_empty());
    }

    fn client_for(base_url: String) -> DifyClient {
        let config = RemoteConfig {
            base_url,
            dataset_id: "mine".to_string(),
            user: "gateway".to_string(),
            timeout_secs: 5,
            dataset_key_env: "UNUSED_DATASET_KEY".to_string(),
            app_key_env: "UNUSED_APP_KEY".to_string(),
        };
        DifyClient::new(
            reqwest::Client::new(),
            &config,
            "dataset-key".to_string(),
            "app-key".to_string(),
        )
    }

    /// Accepts one request, answers 200 and reports its request line.
    async fn one_shot_listener() -> (String, tokio::sync::oneshot::Receiver<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let line = String::from_utf8_lossy(&head)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            let _ = tx.send(line);
        });
        (base, rx)
    }

    #[tokio::test]
    async fn document_id_stays_one_path_segment() {
        let (base, request_line) = one_shot_listener().await;
        let client = client_for(base);

        client
            .delete_document(&DocumentId::new("../../victim"))
            .await
            .unwrap();

        assert_eq!(
            request_line.await.unwrap(),
            "DELETE /v1/datasets/mine/documents/..%2F..%2Fvictim HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn dot_segments_are_refused_before_sending() {
        let client = client_for("http://127.0.0.1:9/v1".to_string());
        for id in ["..", ".", ""] {
            let err = client
                .delete_document(&DocumentId::new(id))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Validation(_)), "{:?}", id);
        }
        let err = client
            .update_document(&DocumentId::new(".."), Some("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn dataset_urls_are_built_per_segment() {
        let client = client_for("http://rag.local/v1/".to_string());
        let url = client
            .dataset_url(&["documents", "a b/c", "update-by-text"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://rag.local/v1/datasets/mine/documents/a%20b%2Fc/update-by-text"
        );
    }

    #[test]
    fn document_listing_tolerates_missing_fields() {
        let page: RemoteDocumentPage =
            serde_json::from_str(r#"{"data":[{"id":"d1","name":"Handbook","tokens":12}]}"#)
                .unwrap();
        assert_eq!(page.data[0].name, "Handbook");
        assert!(!page.has_more);
    }
}
