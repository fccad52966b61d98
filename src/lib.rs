//! # repo-rag
//!
//! Retrieval-augmented question answering over a local source tree.
//!
//! A repository is flattened into a JSONL corpus (one record per text file
//! plus a tree manifest), the corpus is embedded into an exact L2 index, and
//! questions are answered by retrieving the closest records and streaming a
//! completion from an Ollama-compatible backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────┐   ┌──────────────┐
//! │ walker  │──▶│  record  │──▶│ corpus.jsonl │
//! └─────────┘   └──────────┘   └──────┬───────┘
//!                                     │ load
//!                                     ▼
//!               ┌───────────┐   ┌──────────┐   ┌──────────┐
//!   query ─────▶│ embedding │──▶│  index   │──▶│ retrieve │
//!               └───────────┘   └──────────┘   └────┬─────┘
//!                                                   │ prompt
//!                                                   ▼
//!                                             ┌──────────┐
//!                                             │ generate │──▶ answer
//!                                             └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag extract ~/src/my-project
//! rag retrieve "where is the config loaded?"
//! rag ask "how does authentication work?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Corpus line and document types |
//! | [`walker`] | Directory traversal and file filtering |
//! | [`record`] | Text decoding and record construction |
//! | [`corpus`] | JSONL corpus write and load |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Exact L2 vector index |
//! | [`retrieve`] | Query-time retrieval and prompt assembly |
//! | [`generate`] | Streaming generation with progress and cancellation |
//! | [`progress`] | Progress reporting on stderr |

pub mod config;
pub mod corpus;
pub mod embedding;
pub mod generate;
pub mod index;
pub mod models;
pub mod progress;
pub mod record;
pub mod retrieve;
pub mod walker;
