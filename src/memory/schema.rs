//! Tantivy schema shared by the project and local memory indexes.
//! The full `Memory` is round-tripped through an opaque stored JSON field;
//! the remaining fields exist purely for querying, sorting and faceting.

use tantivy::schema::{Facet, FacetOptions, Field, Schema, FAST, INDEXED, STORED, STRING, TEXT};
use tantivy::TantivyDocument;

use super::model::{FieldValue, Memory};

#[derive(Clone)]
pub struct MemorySchema {
    pub schema: Schema,
    pub id: Field,
    pub memory_type: Field,
    pub content: Field,
    pub all_text: Field,
    pub created_ts: Field,
    pub modified_ts: Field,
    pub last_accessed_ts: Field,
    pub access_count: Field,
    pub is_shared: Field,
    pub session_id: Field,
    pub files_involved: Field,
    pub archived: Field,
    pub expires_ts: Field,
    pub doc_json: Field,
    pub facet_type: Field,
    pub facet_status: Field,
    pub facet_priority: Field,
    pub facet_category: Field,
    pub facet_is_shared: Field,
    pub facet_files: Field,
}

impl MemorySchema {
    pub fn build() -> Self {
        let mut b = Schema::builder();
        let id = b.add_text_field("id", STRING | STORED);
        let memory_type = b.add_text_field("type", STRING | STORED);
        let content = b.add_text_field("content", TEXT | STORED);
        let all_text = b.add_text_field("_all", TEXT);
        let created_ts = b.add_i64_field("created_ts", INDEXED | STORED | FAST);
        let modified_ts = b.add_i64_field("modified_ts", INDEXED | STORED | FAST);
        let last_accessed_ts = b.add_i64_field("last_accessed_ts", INDEXED | STORED | FAST);
        let access_count = b.add_u64_field("access_count", INDEXED | STORED | FAST);
        let is_shared = b.add_u64_field("is_shared", INDEXED | STORED | FAST);
        let session_id = b.add_text_field("session_id", STRING | STORED);
        let files_involved = b.add_text_field("files_involved", TEXT | STORED);
        let archived = b.add_u64_field("archived", INDEXED | STORED | FAST);
        let expires_ts = b.add_i64_field("expires_ts", INDEXED | STORED | FAST);
        let doc_json = b.add_text_field("doc_json", STORED);

        let facet_opts = FacetOptions::default();
        let facet_type = b.add_facet_field("facet_type", facet_opts.clone());
        let facet_status = b.add_facet_field("facet_status", facet_opts.clone());
        let facet_priority = b.add_facet_field("facet_priority", facet_opts.clone());
        let facet_category = b.add_facet_field("facet_category", facet_opts.clone());
        let facet_is_shared = b.add_facet_field("facet_is_shared", facet_opts.clone());
        let facet_files = b.add_facet_field("facet_files", facet_opts);

        Self {
            schema: b.build(),
            id,
            memory_type,
            content,
            all_text,
            created_ts,
            modified_ts,
            last_accessed_ts,
            access_count,
            is_shared,
            session_id,
            files_involved,
            archived,
            expires_ts,
            doc_json,
            facet_type,
            facet_status,
            facet_priority,
            facet_category,
            facet_is_shared,
            facet_files,
        }
    }

    pub fn build_document(&self, memory: &Memory) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_text(self.id, &memory.id);
        doc.add_text(self.memory_type, &memory.memory_type);
        doc.add_text(self.content, &memory.content);
        doc.add_text(self.all_text, memory.all_text());
        doc.add_i64(self.created_ts, memory.created.timestamp());
        doc.add_i64(self.modified_ts, memory.modified.timestamp());
        doc.add_i64(self.last_accessed_ts, memory.last_accessed.timestamp());
        doc.add_u64(self.access_count, memory.access_count);
        doc.add_u64(self.is_shared, memory.is_shared as u64);
        if let Some(sid) = &memory.session_id {
            doc.add_text(self.session_id, sid);
        }
        doc.add_text(self.files_involved, memory.files_involved.iter().cloned().collect::<Vec<_>>().join(" "));
        doc.add_u64(self.archived, memory.is_archived() as u64);
        if let Some(FieldValue::Str(expires)) = memory.fields.get("expiresAt") {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(expires) {
                doc.add_i64(self.expires_ts, dt.timestamp());
            }
        }
        doc.add_text(self.doc_json, serde_json::to_string(memory).unwrap_or_default());

        doc.add_facet(self.facet_type, facet_for(&memory.memory_type));
        if let Some(status) = memory.fields.get("status").and_then(FieldValue::as_str) {
            doc.add_facet(self.facet_status, facet_for(status));
        }
        if let Some(priority) = memory.fields.get("priority").and_then(FieldValue::as_str) {
            doc.add_facet(self.facet_priority, facet_for(priority));
        }
        if let Some(category) = memory.fields.get("category").and_then(FieldValue::as_str) {
            doc.add_facet(self.facet_category, facet_for(category));
        }
        doc.add_facet(self.facet_is_shared, facet_for(if memory.is_shared { "true" } else { "false" }));
        for file in &memory.files_involved {
            doc.add_facet(self.facet_files, facet_for(file));
        }
        doc
    }

    pub fn hydrate(&self, doc: &TantivyDocument) -> Option<Memory> {
        let json = doc
            .get_first(self.doc_json)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())?;
        serde_json::from_str(&json).ok()
    }
}

/// Builds a tantivy `Facet` from a possibly-hierarchical value like
/// `"Backend/Database"`. Plain single-segment values become a depth-1 facet.
fn facet_for(value: &str) -> Facet {
    let segments: Vec<&str> = value.split('/').filter(|s| !s.is_empty()).collect();
    Facet::from_path(segments)
}
