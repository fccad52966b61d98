//! The on-disk corpus: one JSON object per line, manifest first.
//!
//! [`extract_corpus`] walks a root and builds the records, [`write_corpus`]
//! persists them (overwriting any previous corpus wholesale), and
//! [`load_corpus`] reads them back for indexing.
//!
//! There is no partial-write protection. A crash mid-write leaves a truncated
//! file; rerunning `rag extract` rebuilds it from scratch.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ExtractConfig;
use crate::models::{CorpusLine, CorpusRecord, Document, TreeManifest};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::record::build_record;
use crate::walker;

/// How often (in files) extraction progress is reported.
const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Output of one extraction run, before it is written.
#[derive(Debug)]
pub struct Extraction {
    pub manifest: TreeManifest,
    pub records: Vec<CorpusRecord>,
    /// Files that matched the filter but could not be read.
    pub skipped: usize,
}

/// A loaded corpus file.
#[derive(Debug, Default)]
pub struct Corpus {
    pub manifest: Option<TreeManifest>,
    pub records: Vec<CorpusRecord>,
}

impl Corpus {
    /// Documents to index, in file order. Ids are corpus paths; a repeated
    /// path keeps its first occurrence.
    pub fn documents(&self, include_manifest: bool) -> Vec<Document> {
        let mut seen = HashSet::new();
        let mut docs = Vec::with_capacity(self.records.len() + 1);

        if include_manifest {
            if let Some(m) = &self.manifest {
                seen.insert(m.path.clone());
                docs.push(Document {
                    id: m.path.clone(),
                    text: m.text.clone(),
                });
            }
        }

        for r in &self.records {
            if !seen.insert(r.path.clone()) {
                warn!(path = %r.path, "duplicate corpus path, keeping first occurrence");
                continue;
            }
            docs.push(Document {
                id: r.path.clone(),
                text: r.text.clone(),
            });
        }
        docs
    }
}

/// Walk `root` and build every record. Unreadable files are skipped.
pub fn extract_corpus(
    root: &Path,
    config: &ExtractConfig,
    reporter: &dyn ProgressReporter,
) -> Result<Extraction> {
    if !root.is_dir() {
        return Err(ExtractError::NotADirectory(root.to_path_buf()).into());
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", root.display()))?;

    reporter.report(ProgressEvent::Discovering {
        root: root.display().to_string(),
    });

    let walk = walker::walk(&root, config)?;
    let manifest = TreeManifest::new(root.to_string_lossy(), walk.manifest_text(&root));

    let total = walk.files.len() as u64;
    let mut records = Vec::with_capacity(walk.files.len());
    let mut skipped = 0;

    for (i, path) in walk.files.iter().enumerate() {
        match build_record(&root, path, config.max_bytes, config.context_header) {
            Ok(record) => {
                debug!(path = %record.path, size = record.size, "extracted");
                records.push(record);
            }
            Err(e) => {
                warn!(error = %e, "skipping file");
                skipped += 1;
            }
        }
        let n = i as u64 + 1;
        if n % PROGRESS_EVERY == 0 || n == total {
            reporter.report(ProgressEvent::Extracting { n, total });
        }
    }

    info!(
        root = %root.display(),
        records = records.len(),
        skipped,
        "extraction finished"
    );

    Ok(Extraction {
        manifest,
        records,
        skipped,
    })
}

/// Write the manifest and records to `path`, replacing its contents.
pub fn write_corpus(path: &Path, manifest: &TreeManifest, records: &[CorpusRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);

    serde_json::to_writer(&mut w, manifest)?;
    w.write_all(b"\n")?;
    for record in records {
        serde_json::to_writer(&mut w, record)?;
        w.write_all(b"\n")?;
    }
    w.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Read a corpus file. Blank lines are ignored; any other unparsable line is
/// an error naming its line number.
pub fn load_corpus(path: &Path) -> Result<Corpus> {
    let file = File::open(path)
        .with_context(|| format!("Corpus not found at {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut corpus = Corpus::default();
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: CorpusLine = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid corpus line", path.display(), i + 1))?;
        match parsed {
            CorpusLine::Manifest(m) => {
                if corpus.manifest.is_some() {
                    warn!(line = i + 1, "extra tree manifest ignored");
                } else {
                    corpus.manifest = Some(m);
                }
            }
            CorpusLine::Record(r) => corpus.records.push(r),
        }
    }

    info!(
        path = %path.display(),
        documents = corpus.records.len(),
        "corpus loaded"
    );
    Ok(corpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::record::content_hash;
    use std::fs;
    use tempfile::TempDir;

    fn record(path: &str, text: &str) -> CorpusRecord {
        CorpusRecord {
            path: path.to_string(),
            absolute_path: format!("/repo/{}", path),
            root: "/repo".to_string(),
            language: "md".to_string(),
            size: text.len() as u64,
            content_hash: content_hash(text),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_round_trip_n_plus_one_lines() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("data/corpus.jsonl");
        let manifest = TreeManifest::new("/repo", "repo\n├── a.md");
        let records = vec![
            record("a.md", "alpha"),
            record("b.md", "beta\nwith \"quotes\" and ✓"),
            record("c.md", ""),
        ];

        write_corpus(&out, &manifest, &records).unwrap();

        let raw = fs::read_to_string(&out).unwrap();
        assert_eq!(raw.lines().count(), records.len() + 1);
        assert!(raw.lines().next().unwrap().contains("\"__TREE__\""));

        let corpus = load_corpus(&out).unwrap();
        assert_eq!(corpus.manifest, Some(manifest));
        assert_eq!(corpus.records.len(), 3);
        for (got, want) in corpus.records.iter().zip(records.iter()) {
            assert_eq!(got.text, want.text);
            assert_eq!(got.content_hash, want.content_hash);
        }
    }

    #[test]
    fn test_write_overwrites() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("corpus.jsonl");
        let manifest = TreeManifest::new("/repo", "repo");
        write_corpus(&out, &manifest, &[record("a.md", "a"), record("b.md", "b")]).unwrap();
        write_corpus(&out, &manifest, &[record("c.md", "c")]).unwrap();

        let corpus = load_corpus(&out).unwrap();
        assert_eq!(corpus.records.len(), 1);
        assert_eq!(corpus.records[0].path, "c.md");
    }

    #[test]
    fn test_missing_corpus_is_error() {
        let err = load_corpus(Path::new("/nope/corpus.jsonl")).unwrap_err();
        assert!(err.to_string().contains("Corpus not found"));
    }

    #[test]
    fn test_bad_line_names_line_number() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("corpus.jsonl");
        fs::write(
            &out,
            "{\"path\":\"__TREE__\",\"text\":\"r\",\"root\":\"/r\",\"type\":\"tree\"}\n\nnot json\n",
        )
        .unwrap();
        let err = load_corpus(&out).unwrap_err();
        assert!(format!("{:#}", err).contains(":3:"));
    }

    #[test]
    fn test_documents_ids_and_manifest() {
        let corpus = Corpus {
            manifest: Some(TreeManifest::new("/repo", "repo")),
            records: vec![record("a.md", "a"), record("b.md", "b"), record("a.md", "dup")],
        };
        let ids: Vec<String> = corpus.documents(true).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["__TREE__", "a.md", "b.md"]);

        let without = corpus.documents(false);
        assert_eq!(without.len(), 2);
        assert_eq!(without[0].text, "a");
    }

    #[test]
    fn test_extract_not_a_directory() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        let err = extract_corpus(&file, &ExtractConfig::default(), &NoProgress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_extract_builds_records_in_walk_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("proj");
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("README.md"), "# Proj").unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn f() {}").unwrap();
        fs::write(root.join("src/blob.bin"), [0u8, 1, 2]).unwrap();

        let ex = extract_corpus(&root, &ExtractConfig::default(), &NoProgress).unwrap();
        let paths: Vec<&str> = ex.records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/lib.rs"]);
        assert_eq!(ex.skipped, 0);
        assert!(ex.manifest.text.starts_with("proj\n"));
        assert!(ex.records.iter().all(crate::record::verify_record_hash));
    }

    #[test]
    fn test_extract_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("proj");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.toml"), "x = 1").unwrap();
        fs::write(root.join("b.txt"), "hello").unwrap();

        let first = extract_corpus(&root, &ExtractConfig::default(), &NoProgress).unwrap();
        let second = extract_corpus(&root, &ExtractConfig::default(), &NoProgress).unwrap();
        assert_eq!(first.records, second.records);
        assert_eq!(first.manifest, second.manifest);
    }
}
