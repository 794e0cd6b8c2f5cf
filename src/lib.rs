//! # docwatch
//!
//! Watches a directory of documents and keeps a catalog of them in SQLite:
//! one record per file, a PNG thumbnail per file, and a live stream of
//! change events for anyone who subscribes.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Watcher  │──▶│   Pipeline   │──▶│   Catalog    │
//! │  (notify) │   │ index/forget │   │   (SQLite)   │
//! └───────────┘   └──────┬───────┘   └──────────────┘
//!                        │
//!          ┌─────────────┼──────────────┐
//!          ▼             ▼              ▼
//!   ┌────────────┐ ┌────────────┐ ┌────────────┐
//!   │ Thumbnails │ │ Broadcaster│ │ Reconciler │
//!   │   (PNG)    │ │  (events)  │ │  (sweeps)  │
//!   └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docwatch init                    # create database
//! docwatch sweep                   # reconcile catalog with the folder once
//! docwatch watch --print-events    # watch live, print events as JSON lines
//! docwatch list --query report     # list documents
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Catalog rows and change events |
//! | [`store`] | `CatalogStore` trait with SQLite and in-memory backends |
//! | [`watcher`] | OS notifications → normalized actions → ordered dispatch |
//! | [`pipeline`] | Index and remove documents, publish events |
//! | [`thumbnail`] | Bounded, timed thumbnail generation |
//! | [`render`] | Per-format PNG renderers |
//! | [`reconcile`] | Catalog/filesystem convergence |
//! | [`broadcast`] | Multi-subscriber event fan-out |
//! | [`query`] | Filtered document listing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod reconcile;
pub mod render;
pub mod store;
pub mod thumbnail;
pub mod watcher;
