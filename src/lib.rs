//! # docflow
//!
//! A stateful, idempotent document ingestion and tracking pipeline over
//! object storage.
//!
//! docflow discovers raw files in an object-storage container, registers
//! each one exactly once in a SQLite document registry, and advances every
//! document through a fixed sequence of processing stages while recording
//! per-stage provenance and failures.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Configuration │──▶│  Provision  │──▶│     Scan     │──▶│    Stages    │
//! │  (SQLite row) │   │ containers  │   │ raw → rows   │   │ state machine│
//! └───────────────┘   └──────┬──────┘   └──────┬───────┘   └──────┬───────┘
//!                            ▼                 ▼                  ▼
//!                     ┌────────────────────────────────────────────────┐
//!                     │   ObjectStore (S3 / local / memory) + SQLite   │
//!                     └────────────────────────────────────────────────┘
//! ```
//!
//! Documents move `raw → preprocessing_done → qna_extracted → evaluated`.
//! A failed stage run leaves the state alone and records a failure marker;
//! the next run of that stage retries the document.
//!
//! ## Quick Start
//!
//! ```bash
//! docflow init                                   # create the registry
//! docflow config template > pipeline.json
//! docflow config load ai_pipeline pipeline.json  # store the container map
//! docflow provision                              # create missing containers
//! docflow scan                                   # register new raw objects
//! docflow stage extract-text                     # raw → preprocessing_done
//! docflow status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML application configuration |
//! | [`error`] | Error taxonomy |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | SQLite pool |
//! | [`migrate`] | Schema creation |
//! | [`models`] | Documents and the processing state machine |
//! | [`configuration`] | Stored pipeline configurations |
//! | [`storage`] | Object-store abstraction and backends |
//! | [`provision`] | Container provisioning |
//! | [`documents`] | The document registry |
//! | [`ingest`] | Raw-container scanning |
//! | [`stages`] | Stage contract, driver and the three stages |
//! | [`extract`] | Text extraction |
//! | [`chunk`] | Text chunking |
//! | [`qna`] | Question/answer generation |
//! | [`scoring`] | Question/answer evaluation |
//! | [`pipeline`] | The pipeline handle |
//! | [`status`] | Registry status report |

pub mod chunk;
pub mod config;
pub mod configuration;
pub mod db;
pub mod documents;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod provision;
pub mod qna;
pub mod scoring;
pub mod stages;
pub mod status;
pub mod storage;
