//! Document ingestion orchestration.
//!
//! Coordinates the three stores a document lives in: the object store (the
//! original file under `title + extension`), the remote index (the extracted
//! text) and the local `file_map` table (the join between the two).
//!
//! Creation runs as a linear sequence of stages:
//!
//! ```text
//! Start → ObjectUploaded → TextExtracted → RemoteIndexed → MappingPersisted → Done
//! ```
//!
//! Nothing is rolled back. When a stage fails after earlier stages have
//! mutated external state, the leftovers (a blob, a remote document) are
//! logged as warnings with their keys so they can be cleaned up by hand.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{GatewayError, Result};
use crate::extract::{self, ExtractLimits, SUPPORTED_EXTENSIONS};
use crate::mapping::MappingStore;
use crate::models::{object_key, DocumentId, DocumentMapping, DocumentSummary, SpaceId, Upload};
use crate::object_store::ObjectStore;
use crate::remote::{RemoteIndex, MAX_PAGE_LIMIT};
use crate::spaces::SpaceStore;

/// Listing pages scanned when recovering a document name for delete.
const MAX_LOOKUP_PAGES: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedDocument {
    pub doc_id: DocumentId,
    pub space_id: SpaceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStage {
    Start,
    ObjectUploaded,
    TextExtracted,
    RemoteIndexed,
    MappingPersisted,
    Done,
}

impl fmt::Display for CreateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CreateStage::Start => "start",
            CreateStage::ObjectUploaded => "object_uploaded",
            CreateStage::TextExtracted => "text_extracted",
            CreateStage::RemoteIndexed => "remote_indexed",
            CreateStage::MappingPersisted => "mapping_persisted",
            CreateStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// What a create has done so far.
struct CreateProgress {
    stage: CreateStage,
    key: String,
    doc_id: Option<DocumentId>,
}

impl CreateProgress {
    fn advance(&mut self, stage: CreateStage) {
        tracing::debug!(key = %self.key, stage = %stage, "create stage reached");
        self.stage = stage;
    }

    fn report_leftovers(&self, err: &GatewayError) {
        match self.stage {
            CreateStage::Start => {}
            CreateStage::ObjectUploaded | CreateStage::TextExtracted => tracing::warn!(
                key = %self.key,
                stage = %self.stage,
                error = %err,
                "document create failed, uploaded object is orphaned"
            ),
            CreateStage::RemoteIndexed => tracing::warn!(
                key = %self.key,
                document_id = ?self.doc_id.as_ref().map(DocumentId::as_str),
                error = %err,
                "document create failed, object and remote document are orphaned"
            ),
            CreateStage::MappingPersisted | CreateStage::Done => {}
        }
    }
}

pub struct DocumentService {
    spaces: SpaceStore,
    mappings: MappingStore,
    objects: Arc<dyn ObjectStore>,
    remote: Arc<dyn RemoteIndex>,
    limits: ExtractLimits,
}

impl DocumentService {
    pub fn new(
        spaces: SpaceStore,
        mappings: MappingStore,
        objects: Arc<dyn ObjectStore>,
        remote: Arc<dyn RemoteIndex>,
        limits: ExtractLimits,
    ) -> Self {
        Self {
            spaces,
            mappings,
            objects,
            remote,
            limits,
        }
    }

    pub async fn create_document(
        &self,
        space_id: &SpaceId,
        title: &str,
        upload: Upload,
    ) -> Result<CreatedDocument> {
        self.spaces.require(space_id).await?;
        let title = require_title(title)?;
        extract::check_upload(&upload.file_name, upload.size(), &self.limits)?;

        let extension = upload.extension();
        let mut progress = CreateProgress {
            stage: CreateStage::Start,
            key: object_key(title, &extension),
            doc_id: None,
        };
        match self.objects.exists(&progress.key).await {
            Ok(true) => tracing::warn!(
                space_id = %space_id,
                key = %progress.key,
                title = %title,
                "object key already in use, the stored file will be overwritten"
            ),
            Ok(false) => {}
            Err(e) => tracing::debug!(key = %progress.key, error = %e, "object existence check failed"),
        }

        match self
            .run_create(space_id, title, &extension, upload, &mut progress)
            .await
        {
            Ok(doc_id) => {
                progress.advance(CreateStage::Done);
                tracing::info!(space_id = %space_id, document_id = %doc_id, key = %progress.key, "document created");
                Ok(CreatedDocument {
                    doc_id,
                    space_id: space_id.clone(),
                })
            }
            Err(e) => {
                progress.report_leftovers(&e);
                Err(e)
            }
        }
    }

    async fn run_create(
        &self,
        space_id: &SpaceId,
        title: &str,
        extension: &str,
        upload: Upload,
        progress: &mut CreateProgress,
    ) -> Result<DocumentId> {
        self.objects
            .put(&progress.key, upload.bytes.clone(), upload.content_type.as_deref())
            .await?;
        progress.advance(CreateStage::ObjectUploaded);

        let text = extract_upload(upload.bytes, &upload.file_name, self.limits).await?;
        progress.advance(CreateStage::TextExtracted);

        let doc_id = self.remote.create_document(title, &text).await?;
        progress.doc_id = Some(doc_id.clone());
        progress.advance(CreateStage::RemoteIndexed);

        let now = chrono::Utc::now().timestamp();
        self.mappings
            .insert(&DocumentMapping {
                document_id: doc_id.clone(),
                space_id: space_id.clone(),
                file_name: title.to_string(),
                extension: extension.to_string(),
                created_at: now,
                updated_at: now,
            })
            .await?;
        progress.advance(CreateStage::MappingPersisted);

        Ok(doc_id)
    }

    pub async fn update_document(
        &self,
        space_id: &SpaceId,
        doc_id: &DocumentId,
        title: Option<&str>,
        upload: Option<Upload>,
    ) -> Result<()> {
        require_doc_id(doc_id)?;
        let title = match title.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => Some(require_title(t)?),
            None => None,
        };
        if title.is_none() && upload.is_none() {
            return Err(GatewayError::validation(
                "at least one of title or file must be provided",
            ));
        }
        let mapping = self.mapping_in_space(space_id, doc_id).await?;
        let old_key = mapping.object_key();
        let new_name = title.unwrap_or(&mapping.file_name).to_string();

        let new_extension = match upload {
            Some(upload) => {
                extract::check_upload(&upload.file_name, upload.size(), &self.limits)?;
                let extension = upload.extension();
                let new_key = object_key(&new_name, &extension);

                self.objects
                    .put(&new_key, upload.bytes.clone(), upload.content_type.as_deref())
                    .await?;
                let text = match extract_upload(upload.bytes, &upload.file_name, self.limits).await
                {
                    Ok(text) => text,
                    Err(e) => {
                        if new_key != old_key {
                            tracing::warn!(key = %new_key, error = %e, "document update failed, uploaded object is orphaned");
                        }
                        return Err(e);
                    }
                };
                if let Err(e) = self
                    .remote
                    .update_document(doc_id, title, Some(&text))
                    .await
                {
                    if new_key != old_key {
                        tracing::warn!(key = %new_key, document_id = %doc_id, error = %e, "remote update failed, uploaded object is orphaned");
                    }
                    return Err(e);
                }
                extension
            }
            None => {
                let new_key = object_key(&new_name, &mapping.extension);
                if new_key != old_key {
                    let bytes = self.objects.get(&old_key).await?;
                    self.objects.put(&new_key, bytes, None).await?;
                }
                if let Err(e) = self.remote.update_document(doc_id, title, None).await {
                    if new_key != old_key {
                        tracing::warn!(key = %new_key, document_id = %doc_id, error = %e, "remote rename failed, copied object is orphaned");
                    }
                    return Err(e);
                }
                mapping.extension.clone()
            }
        };

        let new_key = object_key(&new_name, &new_extension);
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self
            .mappings
            .update(doc_id, &new_name, &new_extension, now)
            .await
        {
            tracing::warn!(document_id = %doc_id, key = %new_key, error = %e, "remote document updated but mapping was not");
            return Err(e);
        }

        if new_key != old_key {
            if let Err(e) = self.objects.delete(&old_key).await {
                tracing::warn!(key = %old_key, error = %e, "superseded object could not be deleted");
            }
        }

        tracing::info!(space_id = %space_id, document_id = %doc_id, key = %new_key, "document updated");
        Ok(())
    }

    pub async fn delete_document(&self, space_id: &SpaceId, doc_id: &DocumentId) -> Result<()> {
        require_doc_id(doc_id)?;
        let Some(mapping) = self.mappings.find_by_id(doc_id).await? else {
            return self.delete_unmapped(space_id, doc_id).await;
        };
        if &mapping.space_id != space_id {
            return Err(GatewayError::DocumentNotFound(doc_id.to_string()));
        }

        let key = mapping.object_key();
        self.mappings.delete_by_id(doc_id).await?;

        if let Err(e) = self.objects.delete(&key).await {
            tracing::warn!(key = %key, document_id = %doc_id, error = %e, "object delete failed, remote document is orphaned");
            return Err(e);
        }
        if let Err(e) = self.remote.delete_document(doc_id).await {
            tracing::warn!(document_id = %doc_id, error = %e, "remote document delete failed, remote document is orphaned");
            return Err(e);
        }

        tracing::info!(space_id = %space_id, document_id = %doc_id, key = %key, "document deleted");
        Ok(())
    }

    /// Best-effort cleanup for a document with no mapping row. Always ends
    /// with `DocumentNotFound`.
    async fn delete_unmapped(&self, space_id: &SpaceId, doc_id: &DocumentId) -> Result<()> {
        tracing::warn!(space_id = %space_id, document_id = %doc_id, "no mapping for document, attempting best-effort cleanup");

        match self.remote_name(doc_id).await {
            Ok(Some(name)) => {
                for ext in SUPPORTED_EXTENSIONS {
                    let key = format!("{}.{}", name, ext);
                    match self.objects.exists(&key).await {
                        Ok(true) => {
                            if let Err(e) = self.objects.delete(&key).await {
                                tracing::warn!(key = %key, error = %e, "orphaned object could not be deleted");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => tracing::warn!(key = %key, error = %e, "object lookup failed"),
                    }
                }
            }
            Ok(None) => {
                tracing::warn!(document_id = %doc_id, "document name unknown remotely, object key cannot be derived")
            }
            Err(e) => tracing::warn!(document_id = %doc_id, error = %e, "remote listing failed"),
        }

        if let Err(e) = self.remote.delete_document(doc_id).await {
            tracing::warn!(document_id = %doc_id, error = %e, "remote delete of unmapped document failed");
        }

        Err(GatewayError::DocumentNotFound(doc_id.to_string()))
    }

    async fn remote_name(&self, doc_id: &DocumentId) -> Result<Option<String>> {
        for page in 1..=MAX_LOOKUP_PAGES {
            let listing = self
                .remote
                .list_documents(None, page, MAX_PAGE_LIMIT)
                .await?;
            if let Some(doc) = listing.data.iter().find(|d| d.id == doc_id.as_str()) {
                return Ok(Some(doc.name.clone()));
            }
            if !listing.has_more {
                break;
            }
        }
        Ok(None)
    }

    /// Local substring search over document titles. Never queries the remote index.
    pub async fn search_documents(
        &self,
        space_id: &SpaceId,
        query: Option<&str>,
    ) -> Result<Vec<DocumentSummary>> {
        let rows = self
            .mappings
            .search_by_name(space_id, query.unwrap_or(""))
            .await?;
        Ok(rows
            .into_iter()
            .map(|m| DocumentSummary {
                doc_id: m.document_id,
                title: m.file_name,
            })
            .collect())
    }

    async fn mapping_in_space(
        &self,
        space_id: &SpaceId,
        doc_id: &DocumentId,
    ) -> Result<DocumentMapping> {
        match self.mappings.find_by_id(doc_id).await? {
            Some(mapping) if &mapping.space_id == space_id => Ok(mapping),
            _ => Err(GatewayError::DocumentNotFound(doc_id.to_string())),
        }
    }
}

fn require_title(title: &str) -> Result<&str> {
    let title = title.trim();
    if title.is_empty() {
        return Err(GatewayError::validation("title must not be empty"));
    }
    if title.contains('/') || title.contains('\\') {
        return Err(GatewayError::validation("title must not contain path separators"));
    }
    Ok(title)
}

/// Remote ids are opaque tokens; anything path-like is refused before it
/// reaches a store.
fn require_doc_id(doc_id: &DocumentId) -> Result<()> {
    let id = doc_id.as_str();
    if id.trim().is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(GatewayError::validation(format!("invalid document id: {:?}", id)));
    }
    Ok(())
}

/// Spill the upload to a scoped temporary file and extract its text off the
/// async runtime. The file is removed when the guard drops.
pub async fn extract_upload(bytes: Bytes, file_name: &str, limits: ExtractLimits) -> Result<String> {
    let file_name = file_name.to_string();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut tmp = tempfile::Builder::new().prefix("upload_").tempfile()?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        Ok(extract::extract_file(tmp.path(), &file_name, &limits)?)
    })
    .await
    .map_err(|e| GatewayError::unknown(format!("extraction task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_are_trimmed_and_checked() {
        assert_eq!(require_title("  Handbook ").unwrap(), "Handbook");
        assert!(matches!(require_title(" "), Err(GatewayError::Validation(_))));
        assert!(matches!(
            require_title("a/b"),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn path_like_document_ids_are_refused() {
        for id in ["../../victim", "a/b", "a\\b", "..", " "] {
            assert!(
                matches!(require_doc_id(&DocumentId::new(id)), Err(GatewayError::Validation(_))),
                "{:?}",
                id
            );
        }
        assert!(require_doc_id(&DocumentId::new("3f2a-91c0")).is_ok());
    }

    #[test]
    fn stages_have_stable_names() {
        assert_eq!(CreateStage::ObjectUploaded.to_string(), "object_uploaded");
        assert_eq!(CreateStage::Done.to_string(), "done");
    }

    #[tokio::test]
    async fn extraction_runs_through_a_temp_file() {
        let text = extract_upload(
            Bytes::from_static(b"hello   world\n\n\nbye"),
            "notes.txt",
            ExtractLimits::default(),
        )
        .await
        .unwrap();
        assert_eq!(text, "hello world\nbye");
    }
}
