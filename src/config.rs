//! Runtime configuration.
//!
//! A [`Config`] is built once at startup and passed by reference into every
//! component. Values come from three layers, later layers winning:
//!
//! 1. built-in defaults ([`Config::default`]),
//! 2. an optional TOML file ([`load_config`]),
//! 3. process environment overrides ([`Config::apply_env`]).
//!
//! ```toml
//! [extract]
//! max_bytes = 2097152
//! output = "data/corpus.jsonl"
//!
//! [embedding]
//! provider = "ollama"
//! model = "all-minilm"
//!
//! [generation]
//! host = "http://127.0.0.1:11434"
//! model = "llama3.2:1b-instruct-fp16"
//! num_predict = 300
//!
//! [retrieval]
//! top_k = 3
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding [`ExtractConfig::max_bytes`].
pub const ENV_MAX_BYTES: &str = "EXTRACT_MAX_BYTES";
/// Environment variable overriding [`GenerationConfig::num_predict`].
pub const ENV_NUM_PREDICT: &str = "NUM_PREDICT";
pub const ENV_CORPUS_PATH: &str = "RAG_CORPUS_PATH";
pub const ENV_GENERATION_HOST: &str = "RAG_GENERATION_HOST";
pub const ENV_GENERATION_MODEL: &str = "RAG_GENERATION_MODEL";
pub const ENV_EMBEDDING_PROVIDER: &str = "RAG_EMBEDDING_PROVIDER";
pub const ENV_EMBEDDING_MODEL: &str = "RAG_EMBEDDING_MODEL";
pub const ENV_EMBEDDING_URL: &str = "RAG_EMBEDDING_URL";

const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    /// Files larger than this are truncated to their first `max_bytes` bytes.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Where `rag extract` writes the corpus and where queries read it from.
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Prefix each record's text with a PATH/ABS_PATH/ROOT/LANG header.
    #[serde(default = "default_true")]
    pub context_header: bool,
    /// Extra exclusions, matched against the root-relative path.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_true")]
    pub follow_symlinks: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            output: default_output(),
            context_header: true,
            exclude_globs: Vec::new(),
            follow_symlinks: true,
        }
    }
}

fn default_max_bytes() -> u64 {
    2 * 1024 * 1024
}
fn default_output() -> PathBuf {
    PathBuf::from("data/corpus.jsonl")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of the Ollama server used for embeddings.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Request timeout. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: None,
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_embedding_model() -> Option<String> {
    Some("all-minilm".to_string())
}
fn default_batch_size() -> usize {
    64
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn ollama_url(&self) -> &str {
        self.url.as_deref().unwrap_or(DEFAULT_OLLAMA_HOST)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Token budget sent as `options.num_predict`; also the 100% mark for progress.
    #[serde(default = "default_num_predict")]
    pub num_predict: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            model: default_generation_model(),
            num_predict: default_num_predict(),
            timeout_secs: None,
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_OLLAMA_HOST.to_string()
}
fn default_generation_model() -> String {
    "llama3.2:1b-instruct-fp16".to_string()
}
fn default_num_predict() -> u64 {
    300
}
fn default_progress_interval_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Index the tree manifest alongside the file records.
    #[serde(default = "default_true")]
    pub include_manifest: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            include_manifest: true,
        }
    }
}

fn default_top_k() -> usize {
    3
}

impl Config {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_BYTES) {
            self.extract.max_bytes = parse_env(ENV_MAX_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_NUM_PREDICT) {
            self.generation.num_predict = parse_env(ENV_NUM_PREDICT, &v)?;
        }
        if let Some(v) = lookup(ENV_CORPUS_PATH) {
            self.extract.output = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_GENERATION_HOST) {
            self.generation.host = v;
        }
        if let Some(v) = lookup(ENV_GENERATION_MODEL) {
            self.generation.model = v;
        }
        if let Some(v) = lookup(ENV_EMBEDDING_PROVIDER) {
            self.embedding.provider = v;
        }
        if let Some(v) = lookup(ENV_EMBEDDING_MODEL) {
            self.embedding.model = Some(v);
        }
        if let Some(v) = lookup(ENV_EMBEDDING_URL) {
            self.embedding.url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.extract.max_bytes == 0 {
            bail!("extract.max_bytes must be > 0");
        }
        if self.generation.num_predict == 0 {
            bail!("generation.num_predict must be > 0");
        }
        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "ollama" | "local" => {}
            "openai" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!("embedding.dims must be > 0 when provider is 'openai'");
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, ollama, openai, or local.",
                other
            ),
        }

        if self.embedding.is_enabled() && self.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                self.embedding.provider
            );
        }

        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))
}

/// Read a TOML config file. Missing sections fall back to defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    Ok(config)
}

/// Build the effective configuration: defaults, then `path` if given, then env.
pub fn resolve_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_config(p)?,
        None => Config::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.extract.max_bytes, 2 * 1024 * 1024);
        assert_eq!(config.generation.num_predict, 300);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.embedding.ollama_url(), "http://127.0.0.1:11434");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [generation]
            num_predict = 42
            "#,
        )
        .unwrap();
        assert_eq!(config.generation.num_predict, 42);
        assert_eq!(config.generation.model, "llama3.2:1b-instruct-fp16");
        assert_eq!(config.extract.output, PathBuf::from("data/corpus.jsonl"));
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            (ENV_MAX_BYTES, "1024"),
            (ENV_NUM_PREDICT, "50"),
            (ENV_GENERATION_HOST, "http://gpu-box:11434"),
            (ENV_CORPUS_PATH, "/tmp/c.jsonl"),
        ]);
        let mut config = Config::default();
        config.apply_env_with(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.extract.max_bytes, 1024);
        assert_eq!(config.generation.num_predict, 50);
        assert_eq!(config.generation.host, "http://gpu-box:11434");
        assert_eq!(config.extract.output, PathBuf::from("/tmp/c.jsonl"));
    }

    #[test]
    fn test_bad_env_value_is_fatal() {
        let vars = env(&[(ENV_NUM_PREDICT, "lots")]);
        let mut config = Config::default();
        let err = config
            .apply_env_with(|k| vars.get(k).cloned())
            .unwrap_err();
        assert!(err.to_string().contains(ENV_NUM_PREDICT));
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut config = Config::default();
        config.generation.num_predict = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_provider() {
        let mut config = Config::default();
        config.embedding.provider = "magic".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_openai_requires_dims() {
        let mut config = Config::default();
        config.embedding.provider = "openai".to_string();
        assert!(config.validate().is_err());
        config.embedding.dims = Some(1536);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let err = load_config(Path::new("/nonexistent/rag.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
