//! Core data models used throughout the pipeline.
//!
//! These types describe what flows from extraction to retrieval: the corpus
//! lines persisted on disk, and the documents the index and retriever hand
//! around in memory.

use serde::{Deserialize, Serialize};

/// `path` value reserved for the tree manifest line.
pub const MANIFEST_PATH: &str = "__TREE__";
/// `type` value carried by the tree manifest line.
pub const MANIFEST_TYPE: &str = "tree";

/// One extracted file.
///
/// `content_hash` is the SHA-256 of the decoded file text *before* the
/// context header is prefixed; `text` is what gets embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusRecord {
    /// Root-relative path. Unique within one corpus build.
    pub path: String,
    #[serde(alias = "abs_path")]
    pub absolute_path: String,
    pub root: String,
    #[serde(alias = "lang")]
    pub language: String,
    /// Raw file size in bytes at read time.
    pub size: u64,
    #[serde(rename = "hash")]
    pub content_hash: String,
    pub text: String,
}

/// Indented listing of the extraction root. Always the first corpus line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeManifest {
    pub path: String,
    pub text: String,
    pub root: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl TreeManifest {
    pub fn new(root: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: MANIFEST_PATH.to_string(),
            text: text.into(),
            root: root.into(),
            kind: MANIFEST_TYPE.to_string(),
        }
    }
}

/// A single line of the corpus file.
///
/// The manifest is tried first; its `type` field is what tells the two apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorpusLine {
    Manifest(TreeManifest),
    Record(CorpusRecord),
}

impl CorpusLine {
    pub fn path(&self) -> &str {
        match self {
            CorpusLine::Manifest(m) => &m.path,
            CorpusLine::Record(r) => &r.path,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            CorpusLine::Manifest(m) => &m.text,
            CorpusLine::Record(r) => &r.text,
        }
    }
}

/// An indexable unit: a stable id plus the text that was embedded.
///
/// The id is the corpus `path` (or [`MANIFEST_PATH`] for the manifest), so
/// index hits never depend on the position of a line in the corpus file.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub text: String,
}

/// A retrieval hit, closest first.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedDocument {
    pub id: String,
    pub text: String,
    /// Squared Euclidean distance to the query embedding.
    pub distance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_line_shape() {
        let m = TreeManifest::new("/repo", "repo\n├── a.rs");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["path"], "__TREE__");
        assert_eq!(json["type"], "tree");
        assert_eq!(json["root"], "/repo");
    }

    #[test]
    fn test_record_field_names() {
        let r = CorpusRecord {
            path: "src/main.rs".into(),
            absolute_path: "/repo/src/main.rs".into(),
            root: "/repo".into(),
            language: "rs".into(),
            size: 10,
            content_hash: "abc".into(),
            text: "fn main() {}".into(),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["hash"], "abc");
        assert_eq!(json["absolute_path"], "/repo/src/main.rs");
        assert_eq!(json["language"], "rs");
        assert!(json.get("content_hash").is_none());
    }

    #[test]
    fn test_untagged_line_dispatch() {
        let manifest: CorpusLine = serde_json::from_str(
            r#"{"path":"__TREE__","text":"repo","root":"/repo","type":"tree"}"#,
        )
        .unwrap();
        assert!(matches!(manifest, CorpusLine::Manifest(_)));

        let record: CorpusLine = serde_json::from_str(
            r#"{"path":"a.py","abs_path":"/r/a.py","root":"/r","lang":"py","size":3,"hash":"h","text":"x=1"}"#,
        )
        .unwrap();
        match record {
            CorpusLine::Record(r) => {
                assert_eq!(r.language, "py");
                assert_eq!(r.absolute_path, "/r/a.py");
            }
            other => panic!("expected record, got {:?}", other),
        }
    }
}
