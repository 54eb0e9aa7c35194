//! Key escrow core: the authorization decision pipeline.
//!
//! One inbound authenticated connection maps to one pipeline evaluation
//! with a terminal decision: serve the key bytes, or reject with a
//! specific reason. The checks run strictly in order:
//!
//! ```text
//! client certificate present
//!   → key path validation        (no traversal, /v1/ prefix)
//!   → key existence              (directory + secret file)
//!   → per-key config load        (trust pool, allow-list, recipients)
//!   → host authorization         (exact match against resolved allow-list)
//!   → chain verification         (webpki path validation, per-key roots)
//!   → policy hook                (external veto, bounded timeout)
//!   → secret read
//!   → access notification        (failure aborts the release)
//! ```
//!
//! Nothing here is shared across requests: per-key configuration is read
//! fresh from disk every time, so there is no cache to invalidate and no
//! stale-trust window.
//!
//! # Modules
//!
//! - [`store`] — per-key on-disk configuration ([`KeyDir`], [`KeyConfig`])
//! - [`verify`] — certificate chain verification ([`VerifiedChain`])
//! - [`hosts`] — caller address authorization
//! - [`hook`] — external policy veto point ([`PolicyHook`])
//! - [`notify`] — access notification dispatch ([`Notifier`])
//! - [`pipeline`] — the ordered decision pipeline ([`Pipeline`])

pub mod hook;
pub mod hosts;
pub mod notify;
pub mod pipeline;
pub mod store;
pub mod verify;

pub use hook::{DisabledHook, HookContext, PolicyHook, ScriptHook};
pub use hosts::authorize_host;
pub use notify::{AccessEvent, DisabledNotifier, Notifier, SmtpNotifier};
pub use pipeline::{KeyRequest, Pipeline};
pub use store::{KeyConfig, KeyDir};
pub use verify::VerifiedChain;
