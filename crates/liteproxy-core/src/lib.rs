//! # liteproxy core
//!
//! Engine of a caching, validating reverse proxy for the light-server
//! RPC protocol. Clients connect over an authenticated length-framed
//! transport, are admitted under per-key and per-IP rate limits, and
//! every query is answered from cache, by a local get-method emulation
//! over cached chain state, or by forwarding to an upstream backend.
//! Replies are byte-identical (proofs included) to what the backend
//! itself would have returned.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Frontend                          │
//! │   server keys · leaky buckets · per-query task spawn     │
//! └────────────┬─────────────────────────────────────────────┘
//!              ▼
//! ┌──────────────────────┐      ┌───────────────────────────┐
//! │      Dispatcher      │─────►│        LiteBackend        │
//! │ classify → resolve → │      │  (external pool, 1 query  │
//! │ emulate / forward    │      │        entry point)       │
//! └────────────┬─────────┘      └───────────────────────────┘
//!              ▼
//! ┌──────────────────────┐      ┌───────────────────────────┐
//! │      BlockCache      │      │      MethodEmulator       │
//! │ masters · accounts · │      │   (external deterministic │
//! │ blocks · txs · libs  │      │        TVM runner)        │
//! │ single-flight fetch  │      └───────────────────────────┘
//! └──────────────────────┘
//! ```
//!
//! The wire transport and the backend pool are collaborators behind
//! traits ([`frontend::Connection`], [`backend::LiteBackend`]); the
//! binary in `crates/server` wires them up.

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod emulate;
pub mod frontend;
pub mod limiter;
pub mod metrics;
pub mod proto;

#[cfg(test)]
pub(crate) mod testing;
