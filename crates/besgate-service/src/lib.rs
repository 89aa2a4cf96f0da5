//! Core library for the besgate gateway.
//!
//! besgate sits between an HTTP front-end and a Backend Execution Service
//! (BES), the process that actually opens data files and computes responses.
//! BES transactions can be slow, so this crate provides the machinery that
//! keeps the gateway responsive:
//!
//! - [`caching`] — a bounded in-memory cache of executed BES transactions
//!   with least-recently-accessed eviction and a periodic background refresh.
//! - [`scope`] — a per-request key/value store that lets cooperating handlers
//!   within one inbound request share computed values.
//! - [`deferred`] — the asynchronous-fulfillment state machine that
//!   negotiates, with clients unwilling to block, when a slow result will be
//!   ready and for how long it can be retrieved.
//! - [`bes`] — request descriptors, the error taxonomy, and the client used
//!   to talk to the BES.

pub mod bes;
pub mod caching;
pub mod config;
pub mod deferred;
pub mod scope;
