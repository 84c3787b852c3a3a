//! # Knowledge Gateway
//!
//! A backend gateway for knowledge spaces: clients upload documents into a
//! space, search their titles, and ask questions whose answers are produced
//! by a remote RAG platform and streamed back with links to the source files.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────┐   ┌──────────────┐
//!   upload ───────▶│   ingest     │──▶│ object store │  original file (S3 / MinIO)
//!                  │  (extract)   │──▶│ remote index │  extracted text (Dify API)
//!                  └──────┬───────┘   └──────────────┘
//!                         ▼
//!                  ┌──────────────┐
//!                  │   SQLite     │  spaces, file_map
//!                  └──────┬───────┘
//!                         ▼
//!   question ─────▶┌──────────────┐
//!   ◀── SSE ───────│    relay     │◀── remote chat stream
//!                  └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kgw init                              # create database
//! kgw space create --name "Handbook"    # prints the space id
//! kgw serve                             # start HTTP gateway
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and codes |
//! | [`models`] | Identifiers, mappings, stream events |
//! | [`extract`] | Multi-format text extraction |
//! | [`object_store`] | S3-compatible blob storage with SigV4 |
//! | [`remote`] | Remote RAG platform client |
//! | [`spaces`] | Knowledge space records |
//! | [`mapping`] | Document mapping table |
//! | [`ingest`] | Create / update / delete / search orchestration |
//! | [`relay`] | Streaming answer relay |
//! | [`server`] | HTTP gateway |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod object_store;
pub mod relay;
pub mod remote;
pub mod server;
pub mod spaces;

pub use error::{GatewayError, Result};
