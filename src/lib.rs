//! # mdkb
//!
//! A local-first Markdown archive with hybrid retrieval.
//!
//! mdkb ingests a directory tree of Markdown documents, splits each one
//! into addressable passages with stable line ranges and heading context,
//! keeps a SQLite index in sync with the tree by content-hash diffing,
//! and answers queries by ranking passages through full-text search and
//! (optionally) vector similarity, fused into a single ranked list.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │ archive tree │──▶│   indexer    │──▶│  SQLite   │
//! │ *.md + meta  │   │ chunk+embed  │   │ FTS5+vec  │
//! └──────────────┘   └──────────────┘   └─────┬─────┘
//!                                             │
//!                                       ┌─────▼─────┐
//!                                       │ retriever │
//!                                       │ fts/vec/  │
//!                                       │  hybrid   │
//!                                       └───────────┘
//! ```
//!
//! ## Quick start
//!
//! ```bash
//! kb init                          # create the index database
//! kb index                         # scan the archive tree
//! kb index --embed                 # also request embeddings
//! kb search "deployment" --hybrid  # fused keyword + semantic search
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Markdown chunking |
//! | [`dirmeta`] | Per-directory metadata files |
//! | [`store`] | SQLite schema and persistence |
//! | [`indexer`] | Incremental tree indexing |
//! | [`embedding`] | Embedding/chat capability |
//! | [`search`] | Lexical, semantic, and hybrid retrieval |
//! | [`db`] | Database connection |

pub mod chunk;
pub mod config;
pub mod db;
pub mod dirmeta;
pub mod embedding;
pub mod indexer;
pub mod models;
pub mod search;
pub mod store;
pub mod util;
