//! Per-index document storage.
//!
//! Each index keeps two views of its documents:
//! - the realtime view, updated by every write and read by `get`
//! - the searchable view, replaced by `refresh` and read by search/count
//!
//! Flushing an on-disk index writes the searchable view as a segment file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use quarry_types::{
    DeleteResponse, GetResponse, IndexResponse, Query, SearchHit, SearchRequest, Settings,
    SettingsBuilder, SettingsError, keys,
};
use serde::Serialize;
use serde_json::Value;

use crate::query::Matcher;
use crate::{EngineError, EngineResult};

/// Key of a document inside one index.
pub(crate) type DocKey = (String, String);

#[derive(Debug, Clone)]
pub(crate) struct StoredDoc {
    pub(crate) version: u64,
    pub(crate) source: String,
    pub(crate) value: Value,
}

/// Shard layout of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShardLayout {
    pub(crate) shards: u32,
    pub(crate) replicas: u32,
}

impl ShardLayout {
    pub(crate) fn from_settings(settings: &Settings, defaults: ShardLayout) -> EngineResult<Self> {
        let shards = settings.get_or(keys::NUMBER_OF_SHARDS, defaults.shards)?;
        let replicas = settings.get_or(keys::NUMBER_OF_REPLICAS, defaults.replicas)?;
        if shards == 0 {
            return Err(EngineError::InvalidSettings(SettingsError {
                key: keys::NUMBER_OF_SHARDS.to_string(),
                value: "0".to_string(),
                reason: "an index needs at least one shard".to_string(),
            }));
        }
        Ok(Self { shards, replicas })
    }
}

/// One index: metadata plus realtime and searchable document views.
#[derive(Debug)]
pub(crate) struct IndexState {
    name: String,
    pub(crate) layout: ShardLayout,
    pub(crate) created_at: Instant,
    settings: Settings,
    mappings: BTreeMap<String, Value>,
    live: BTreeMap<DocKey, StoredDoc>,
    searchable: BTreeMap<DocKey, StoredDoc>,
    /// Last version per key, kept across deletes.
    versions: BTreeMap<DocKey, u64>,
    deleted_docs: u64,
    next_auto_id: u64,
}

impl IndexState {
    pub(crate) fn new(name: &str, layout: ShardLayout, settings: Settings) -> Self {
        let mut effective = settings.to_builder();
        effective
            .put(keys::NUMBER_OF_SHARDS, layout.shards)
            .put(keys::NUMBER_OF_REPLICAS, layout.replicas);
        Self {
            name: name.to_string(),
            layout,
            created_at: Instant::now(),
            settings: effective.build(),
            mappings: BTreeMap::new(),
            live: BTreeMap::new(),
            searchable: BTreeMap::new(),
            versions: BTreeMap::new(),
            deleted_docs: 0,
            next_auto_id: 1,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn put_mapping(&mut self, doc_type: &str, mapping: &str) -> EngineResult<()> {
        let value: Value = serde_json::from_str(mapping)
            .map_err(|e| EngineError::InvalidDocument(format!("mapping for {doc_type}: {e}")))?;
        // Accept both `{"type": {"properties": ..}}` and `{"properties": ..}`.
        let mapping = match value.get(doc_type) {
            Some(inner) => inner.clone(),
            None => value,
        };
        self.mappings.insert(doc_type.to_string(), mapping);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn mapping(&self, doc_type: &str) -> Option<&Value> {
        self.mappings.get(doc_type)
    }

    pub(crate) fn index(
        &mut self,
        doc_type: &str,
        id: Option<&str>,
        source: &str,
    ) -> EngineResult<IndexResponse> {
        let value: Value =
            serde_json::from_str(source).map_err(|e| EngineError::InvalidDocument(e.to_string()))?;
        if !value.is_object() {
            return Err(EngineError::InvalidDocument(
                "document source must be a JSON object".to_string(),
            ));
        }

        let id = match id {
            Some(id) => id.to_string(),
            None => self.generate_id(doc_type),
        };
        let key = (doc_type.to_string(), id.clone());
        let version = self.versions.get(&key).map_or(1, |v| v + 1);
        let created = !self.live.contains_key(&key);

        self.versions.insert(key.clone(), version);
        self.live.insert(
            key,
            StoredDoc {
                version,
                source: source.to_string(),
                value,
            },
        );

        Ok(IndexResponse {
            index: self.name.clone(),
            doc_type: doc_type.to_string(),
            id,
            version,
            created,
        })
    }

    fn generate_id(&mut self, doc_type: &str) -> String {
        loop {
            let candidate = format!("auto-{}", self.next_auto_id);
            self.next_auto_id += 1;
            if !self
                .live
                .contains_key(&(doc_type.to_string(), candidate.clone()))
            {
                return candidate;
            }
        }
    }

    pub(crate) fn get(&self, doc_type: &str, id: &str) -> GetResponse {
        let doc = self.live.get(&(doc_type.to_string(), id.to_string()));
        GetResponse {
            index: self.name.clone(),
            doc_type: doc_type.to_string(),
            id: id.to_string(),
            version: doc.map_or(0, |d| d.version),
            found: doc.is_some(),
            source: doc.map(|d| d.source.clone()),
        }
    }

    pub(crate) fn delete(&mut self, doc_type: &str, id: &str) -> DeleteResponse {
        let key = (doc_type.to_string(), id.to_string());
        let found = self.live.remove(&key).is_some();
        let version = self.versions.get(&key).map_or(1, |v| v + 1);
        if found {
            self.versions.insert(key, version);
            self.deleted_docs += 1;
        }
        DeleteResponse {
            index: self.name.clone(),
            doc_type: doc_type.to_string(),
            id: id.to_string(),
            version,
            found,
        }
    }

    pub(crate) fn refresh(&mut self) {
        self.searchable.clone_from(&self.live);
    }

    /// Merges segments. Deleted documents are always expunged; a full merge
    /// also compacts version history of deleted keys.
    pub(crate) fn optimize(&mut self, only_expunge_deletes: bool) {
        self.deleted_docs = 0;
        if !only_expunge_deletes {
            let live = &self.live;
            self.versions.retain(|key, _| live.contains_key(key));
        }
    }

    pub(crate) fn deleted_docs(&self) -> u64 {
        self.deleted_docs
    }

    /// Matching searchable documents, optionally restricted to `doc_type`.
    fn matching<'s, 'q>(
        &'s self,
        doc_type: Option<&'q str>,
        matcher: &'q Matcher,
    ) -> impl Iterator<Item = (&'s DocKey, &'s StoredDoc)> {
        self.searchable
            .iter()
            .filter(move |(key, _)| doc_type.is_none_or(|wanted| key.0 == wanted))
            .filter(move |(_, doc)| matcher.matches(&doc.value))
    }

    pub(crate) fn count(&self, doc_type: Option<&str>, query: &Query) -> u64 {
        let matcher = Matcher::from_query(query);
        self.matching(doc_type, &matcher).count() as u64
    }

    /// Every match of `request` as an unpaged hit list with its documents.
    pub(crate) fn collect_hits<'a>(
        &'a self,
        request: &SearchRequest,
        out: &mut Vec<(SearchHit, &'a Value)>,
    ) {
        let matcher = Matcher::from_query(&request.query);
        for ((doc_type, id), doc) in self.matching(request.doc_type.as_deref(), &matcher) {
            out.push((
                SearchHit {
                    index: self.name.clone(),
                    doc_type: doc_type.clone(),
                    id: id.clone(),
                    source: doc.source.clone(),
                },
                &doc.value,
            ));
        }
    }

    /// Writes the searchable view to `<data_dir>/indices/<index>/segments.json`.
    pub(crate) fn persist(&self, data_dir: &Path) -> EngineResult<PathBuf> {
        #[derive(Serialize)]
        struct SegmentDoc<'a> {
            #[serde(rename = "_type")]
            doc_type: &'a str,
            #[serde(rename = "_id")]
            id: &'a str,
            #[serde(rename = "_version")]
            version: u64,
            #[serde(rename = "_source")]
            source: &'a Value,
        }

        #[derive(Serialize)]
        struct Segment<'a> {
            index: &'a str,
            settings: BTreeMap<&'a str, &'a str>,
            mappings: &'a BTreeMap<String, Value>,
            docs: Vec<SegmentDoc<'a>>,
        }

        let dir = data_dir.join("indices").join(&self.name);
        fs::create_dir_all(&dir)?;
        let segment = Segment {
            index: &self.name,
            settings: self.settings.iter().collect(),
            mappings: &self.mappings,
            docs: self
                .searchable
                .iter()
                .map(|((doc_type, id), doc)| SegmentDoc {
                    doc_type,
                    id,
                    version: doc.version,
                    source: &doc.value,
                })
                .collect(),
        };
        let path = dir.join("segments.json");
        let body = serde_json::to_vec_pretty(&segment)
            .map_err(|e| EngineError::Protocol(format!("segment encoding: {e}")))?;
        fs::write(&path, body)?;
        Ok(path)
    }
}

/// Default shard layout taken from node settings.
pub(crate) fn default_layout(settings: &Settings) -> EngineResult<ShardLayout> {
    ShardLayout::from_settings(
        settings,
        ShardLayout {
            shards: 5,
            replicas: 1,
        },
    )
}

/// Index-level settings a node contributes when it creates an index.
pub(crate) fn index_settings_from_node(node: &Settings) -> Settings {
    let mut builder = SettingsBuilder::new();
    for key in [keys::NUMBER_OF_SHARDS, keys::NUMBER_OF_REPLICAS, keys::STORE_TYPE] {
        if let Some(value) = node.get(key) {
            builder.put(key, value);
        }
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> IndexState {
        IndexState::new(
            "test_index",
            ShardLayout {
                shards: 1,
                replicas: 0,
            },
            Settings::default(),
        )
    }

    #[test]
    fn index_reports_created_then_overwritten() {
        let mut idx = index();
        let first = idx.index("t", Some("1"), r#"{"msg":"a"}"#).unwrap();
        assert!(first.created);
        assert_eq!(first.version, 1);

        let second = idx.index("t", Some("1"), r#"{"msg":"b"}"#).unwrap();
        assert!(!second.created);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn search_sees_only_refreshed_documents() {
        let mut idx = index();
        idx.index("t", Some("1"), r#"{"msg":"a"}"#).unwrap();
        assert_eq!(idx.count(None, &Query::MatchAll), 0);
        assert!(idx.get("t", "1").found);

        idx.refresh();
        assert_eq!(idx.count(None, &Query::MatchAll), 1);
        assert_eq!(idx.count(Some("other"), &Query::MatchAll), 0);
    }

    #[test]
    fn delete_reports_found_and_counts_deletions() {
        let mut idx = index();
        idx.index("t", Some("1"), r#"{"msg":"a"}"#).unwrap();
        assert!(idx.delete("t", "1").found);
        assert!(!idx.delete("t", "1").found);
        assert_eq!(idx.deleted_docs(), 1);

        idx.optimize(true);
        assert_eq!(idx.deleted_docs(), 0);

        let recreated = idx.index("t", Some("1"), r#"{"msg":"c"}"#).unwrap();
        assert!(recreated.created);
        assert_eq!(recreated.version, 3);
    }

    #[test]
    fn non_object_sources_are_rejected() {
        let mut idx = index();
        assert!(matches!(
            idx.index("t", Some("1"), "[1,2]"),
            Err(EngineError::InvalidDocument(_))
        ));
        assert!(matches!(
            idx.index("t", Some("1"), "not json"),
            Err(EngineError::InvalidDocument(_))
        ));
    }

    #[test]
    fn generated_ids_are_unique() {
        let mut idx = index();
        let a = idx.index("t", None, "{}").unwrap();
        let b = idx.index("t", None, "{}").unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.created && b.created);
    }

    #[test]
    fn mapping_accepts_wrapped_and_bare_forms() {
        let mut idx = index();
        idx.put_mapping("t", r#"{"t":{"properties":{"id":{"type":"string"}}}}"#)
            .unwrap();
        assert!(idx.mapping("t").unwrap().get("properties").is_some());

        idx.put_mapping("u", r#"{"properties":{}}"#).unwrap();
        assert!(idx.mapping("u").unwrap().get("properties").is_some());
    }

    #[test]
    fn persist_writes_segment_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = index();
        idx.index("t", Some("1"), r#"{"msg":"a"}"#).unwrap();
        idx.refresh();

        let path = idx.persist(dir.path()).unwrap();
        let body: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(body["index"], "test_index");
        assert_eq!(body["docs"][0]["_id"], "1");
        assert_eq!(body["docs"][0]["_source"]["msg"], "a");
    }
}
