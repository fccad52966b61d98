//! Turning one candidate file into a [`CorpusRecord`].
//!
//! Read policy:
//! - files over `max_bytes` are truncated to their first `max_bytes` bytes and
//!   decoded as UTF-8, dropping whatever does not decode;
//! - otherwise UTF-8, UTF-16 (BOM required) and Latin-1 are tried in order and
//!   the first that decodes the whole file wins;
//! - as a last resort the bytes are decoded as UTF-8 with replacement
//!   characters, so every readable file yields some text.
//!
//! The content hash is taken over the decoded text, not the raw bytes.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::CorpusRecord;
use crate::walker::special_language;

/// Per-file failure. Extraction logs it and moves on.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Text encodings attempted for files within the size limit, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Utf16,
    Latin1,
}

const ENCODINGS: &[Encoding] = &[Encoding::Utf8, Encoding::Utf16, Encoding::Latin1];

impl Encoding {
    /// Strict decode of the whole buffer; `None` on any error.
    fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            Encoding::Utf16 => decode_utf16(bytes),
            Encoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

fn decode_utf16(bytes: &[u8]) -> Option<String> {
    let (body, little_endian) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (rest, true),
        [0xFE, 0xFF, rest @ ..] => (rest, false),
        _ => return None,
    };
    if body.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

/// UTF-8 decode that silently drops invalid sequences.
fn decode_utf8_dropping_errors(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

/// Decode a full (non-truncated) file body.
pub fn decode_text(bytes: &[u8]) -> String {
    ENCODINGS
        .iter()
        .find_map(|enc| enc.decode(bytes))
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned())
}

/// Read a file as text under the size-capped, multi-encoding policy.
pub fn read_text_file(path: &Path, max_bytes: u64) -> Result<String, ReadError> {
    let io_err = |source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_err)?;
    let size = file.metadata().map_err(io_err)?.len();

    let mut bytes = Vec::new();
    if size > max_bytes {
        file.take(max_bytes)
            .read_to_end(&mut bytes)
            .map_err(io_err)?;
        return Ok(decode_utf8_dropping_errors(&bytes));
    }

    let mut file = file;
    file.read_to_end(&mut bytes).map_err(io_err)?;
    Ok(decode_text(&bytes))
}

/// Hex SHA-256 of `text`'s UTF-8 bytes.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Classify a file: special basenames first, then the lowercase extension,
/// then `"plain"`.
pub fn detect_language(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Some(lang) = special_language(&name) {
        return lang.to_string();
    }
    match path.extension() {
        Some(ext) if !ext.is_empty() => ext.to_string_lossy().to_lowercase(),
        _ => "plain".to_string(),
    }
}

/// Header prefixed to record text so embeddings see where the text came from.
pub fn context_header(rel: &str, abs_path: &str, root: &str, lang: &str) -> String {
    format!(
        "PATH: {}\nABS_PATH: {}\nROOT: {}\nLANG: {}\n---\n",
        rel, abs_path, root, lang
    )
}

/// The record text with its context header (if any) removed.
pub fn record_body(record: &CorpusRecord) -> &str {
    let header = context_header(
        &record.path,
        &record.absolute_path,
        &record.root,
        &record.language,
    );
    record
        .text
        .strip_prefix(header.as_str())
        .unwrap_or(&record.text)
}

/// Recompute the hash from the record body and compare with the stored one.
pub fn verify_record_hash(record: &CorpusRecord) -> bool {
    content_hash(record_body(record)) == record.content_hash
}

/// Build the record for `path`, found under `root`.
pub fn build_record(
    root: &Path,
    path: &Path,
    max_bytes: u64,
    with_header: bool,
) -> Result<CorpusRecord, ReadError> {
    let text = read_text_file(path, max_bytes)?;
    let size = std::fs::metadata(path)
        .map_err(|source| ReadError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    let rel = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();
    let abs_path = path.to_string_lossy().to_string();
    let root_str = root.to_string_lossy().to_string();
    let language = detect_language(path);
    let hash = content_hash(&text);

    let text = if with_header {
        context_header(&rel, &abs_path, &root_str, &language) + &text
    } else {
        text
    };

    Ok(CorpusRecord {
        path: rel,
        absolute_path: abs_path,
        root: root_str,
        language,
        size,
        content_hash: hash,
        text,
    })
}
