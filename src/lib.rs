//! # drive-chat
//!
//! Mirror a Google Drive to local disk, index the files, and ask questions
//! about them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Google Drive │──▶│ local mirror │──▶│   SQLite    │
//! │  (Drive v3)  │   │  + metadata  │   │ FTS5 + vecs │
//! └──────────────┘   └──────────────┘   └──────┬──────┘
//!                                              │
//!                          ┌───────────────────┤
//!                          ▼                   ▼
//!                     ┌──────────┐       ┌──────────┐
//!                     │ dchat    │       │   HTTP   │
//!                     │ chat     │       │  /chat   │
//!                     └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dchat auth                     # consent once, writes token.json
//! dchat download                 # mirror My Drive into downloaded_files/
//! dchat ingest                   # chunk, embed and store
//! dchat chat                     # ask questions in the terminal
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`drive_auth`] | OAuth installed-app flow and token cache |
//! | [`drive_client`] | Drive v3 listing, download and export |
//! | [`drive_tree`] | Remote tree walk and drive map |
//! | [`mirror`] | Local mirror reconciliation |
//! | [`metadata`] | Content hashes and the metadata index |
//! | [`download`] | `tree` / `download` orchestration |
//! | [`loader`] | Mirror files → source items |
//! | [`extract`] | PDF / DOCX / PPTX / XLSX text extraction |
//! | [`chunk`] | Paragraph chunking with overlap |
//! | [`ingest`] | Document store writes |
//! | [`embedding`] | Embedding providers |
//! | [`search`] | Keyword, semantic and hybrid retrieval |
//! | [`llm`] | Chat-completion client |
//! | [`chat`] | Conversational retrieval and the terminal loop |
//! | [`server`] | HTTP chat server |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod download;
pub mod drive_auth;
pub mod drive_client;
pub mod drive_tree;
pub mod embed_cmd;
pub mod embedding;
pub mod extract;
pub mod get;
pub mod http_retry;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod metadata;
pub mod migrate;
pub mod mirror;
pub mod models;
pub mod progress;
pub mod search;
pub mod server;
pub mod stats;
pub mod status;
