//! # File Search Proxy
//!
//! An HTTP proxy in front of the Gemini File Search API. It creates and
//! manages document stores, runs retrieval-augmented chat, and uploads files
//! without sending the same content twice.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────┐   ┌──────────────┐
//! │  HTTP    │──▶│ Orchestrator │──▶│ Staging │──▶│ RemoteStore  │
//! │ (axum)   │   │  per file    │   │ scratch │   │ Gemini / mem │
//! └──────────┘   └──────┬───────┘   └─────────┘   └──────┬───────┘
//!                       │                                │
//!                       ▼                                ▼
//!                 ┌──────────┐                    ┌────────────┐
//!                 │  Ledger  │                    │   Waiter   │
//!                 │data.json │                    │ poll ops   │
//!                 └──────────┘                    └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors for each layer |
//! | [`fingerprint`] | SHA-256 content fingerprints |
//! | [`fingerprint_lock`] | Per-fingerprint mutual exclusion |
//! | [`staging`] | Scratch files and the stale-file sweeper |
//! | [`ledger`] | Persisted upload history and active store |
//! | [`remote`] | Remote service trait, Gemini client, in-memory backend |
//! | [`waiter`] | Long-running operation polling |
//! | [`orchestrator`] | The upload pipeline |
//! | [`chat`] | Store and file chat |
//! | [`rate_limit`] | Per-client request limiting |
//! | [`server`] | HTTP server |
//! | [`logging`] | Tracing subscriber setup |

pub mod chat;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod fingerprint_lock;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod rate_limit;
pub mod remote;
pub mod server;
pub mod staging;
pub mod waiter;
