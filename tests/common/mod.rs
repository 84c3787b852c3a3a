//! In-memory object store and remote index that record every call.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;

use knowledge_gateway::config::RelayConfig;
use knowledge_gateway::extract::ExtractLimits;
use knowledge_gateway::ingest::DocumentService;
use knowledge_gateway::mapping::MappingStore;
use knowledge_gateway::models::{DocumentId, SpaceId, Upload};
use knowledge_gateway::object_store::ObjectStore;
use knowledge_gateway::relay::AnswerRelay;
use knowledge_gateway::remote::{ByteStream, RemoteDocument, RemoteDocumentPage, RemoteIndex};
use knowledge_gateway::spaces::SpaceStore;
use knowledge_gateway::{db, migrate, GatewayError, Result};

#[derive(Default)]
pub struct FakeObjectStore {
    pub objects: Mutex<HashMap<String, Bytes>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_put: AtomicBool,
}

impl FakeObjectStore {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn seed(&self, key: &str, bytes: &'static [u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from_static(bytes));
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, key: &str, bytes: Bytes, _content_type: Option<&str>) -> Result<()> {
        self.record(format!("put:{}", key));
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(GatewayError::object_store("bucket unavailable"));
        }
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.record(format!("get:{}", key));
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::object_store(format!("no such key: {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.record(format!("delete:{}", key));
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.record(format!("exists:{}", key));
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.record(format!("presign:{}", key));
        if !self.objects.lock().unwrap().contains_key(key) {
            return Err(GatewayError::object_store(format!("no such key: {}", key)));
        }
        Ok(format!("https://files.test/{}?expires={}", key, ttl.as_secs()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Create { name: String, text: String },
    Update { id: String, name: Option<String>, text: Option<String> },
    Delete { id: String },
    List { page: u32 },
    Chat { query: String },
}

#[derive(Default)]
pub struct FakeRemote {
    pub calls: Mutex<Vec<RemoteCall>>,
    pub documents: Mutex<Vec<RemoteDocument>>,
    next_id: AtomicUsize,
    /// Body chunks returned by the next chat request.
    pub chat_chunks: Mutex<Vec<String>>,
    /// Keep the chat body open after the scripted chunks.
    pub chat_hangs: AtomicBool,
}

impl FakeRemote {
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn script_chat<S: Into<String>>(&self, chunks: impl IntoIterator<Item = S>) {
        *self.chat_chunks.lock().unwrap() = chunks.into_iter().map(Into::into).collect();
    }

    pub fn seed(&self, id: &str, name: &str) {
        self.documents.lock().unwrap().push(RemoteDocument {
            id: id.to_string(),
            name: name.to_string(),
        });
    }
}

#[async_trait]
impl RemoteIndex for FakeRemote {
    async fn create_document(&self, name: &str, text: &str) -> Result<DocumentId> {
        self.calls.lock().unwrap().push(RemoteCall::Create {
            name: name.to_string(),
            text: text.to_string(),
        });
        let id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.seed(&id, name);
        Ok(DocumentId::new(id))
    }

    async fn update_document(
        &self,
        id: &DocumentId,
        name: Option<&str>,
        text: Option<&str>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(RemoteCall::Update {
            id: id.to_string(),
            name: name.map(str::to_string),
            text: text.map(str::to_string),
        });
        Ok(())
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<()> {
        self.calls.lock().unwrap().push(RemoteCall::Delete { id: id.to_string() });
        let mut docs = self.documents.lock().unwrap();
        let before = docs.len();
        docs.retain(|d| d.id != id.as_str());
        if docs.len() == before {
            return Err(GatewayError::RemoteIndex {
                status: 404,
                body: r#"{"code":"not_found"}"#.to_string(),
            });
        }
        Ok(())
    }

    async fn list_documents(
        &self,
        _keyword: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<RemoteDocumentPage> {
        self.calls.lock().unwrap().push(RemoteCall::List { page });
        let docs = self.documents.lock().unwrap();
        let start = ((page.max(1) - 1) * limit) as usize;
        let data: Vec<RemoteDocument> = docs.iter().skip(start).take(limit as usize).cloned().collect();
        Ok(RemoteDocumentPage {
            has_more: start + data.len() < docs.len(),
            total: docs.len() as u64,
            data,
        })
    }

    async fn chat_stream(&self, query: &str, _user: Option<&str>) -> Result<ByteStream> {
        self.calls.lock().unwrap().push(RemoteCall::Chat {
            query: query.to_string(),
        });
        let chunks: Vec<Result<Bytes>> = std::mem::take(&mut *self.chat_chunks.lock().unwrap())
            .into_iter()
            .map(|c| Ok(Bytes::from(c)))
            .collect();
        let body = stream::iter(chunks);
        if self.chat_hangs.load(Ordering::SeqCst) {
            Ok(body.chain(stream::pending()).boxed())
        } else {
            Ok(body.boxed())
        }
    }
}

pub struct Harness {
    _tmp: TempDir,
    pub spaces: SpaceStore,
    pub mappings: MappingStore,
    pub objects: Arc<FakeObjectStore>,
    pub remote: Arc<FakeRemote>,
    pub service: DocumentService,
}

impl Harness {
    pub async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("data/gateway.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        let spaces = SpaceStore::new(pool.clone());
        let mappings = MappingStore::new(pool);
        let objects = Arc::new(FakeObjectStore::default());
        let remote = Arc::new(FakeRemote::default());
        let service = DocumentService::new(
            spaces.clone(),
            mappings.clone(),
            objects.clone(),
            remote.clone(),
            ExtractLimits::default(),
        );

        Self {
            _tmp: tmp,
            spaces,
            mappings,
            objects,
            remote,
            service,
        }
    }

    pub async fn space(&self, name: &str) -> SpaceId {
        self.spaces.create(name, "").await.unwrap().space_id
    }

    pub fn relay(&self, config: RelayConfig) -> AnswerRelay {
        AnswerRelay::new(
            self.remote.clone(),
            self.objects.clone(),
            self.mappings.clone(),
            config,
            Duration::from_secs(3600),
        )
    }
}

pub fn upload(file_name: &str, bytes: impl Into<Bytes>) -> Upload {
    Upload {
        file_name: file_name.to_string(),
        content_type: None,
        bytes: bytes.into(),
    }
}
