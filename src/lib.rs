//! Autosave and dual-canvas synchronization for per-customer sketch documents.
//!
//! A [`pane::DocumentPane`] binds an editor surface and a read-only viewer
//! surface to one subject at a time. Edits are mirrored to the viewer within a
//! frame, saved after an idle pause or on a heartbeat, and the pane follows
//! saves other sessions make to the same document.
//!
//! Documents come from any [`source::Loader`] / [`source::Persister`]: the
//! HTTP document service, its push channel, or an in-process
//! [`storage::DocumentStore`].

pub mod autosave;
pub mod config;
pub mod mirror;
pub mod pane;
pub mod protocol;
pub mod scene;
pub mod session;
pub mod source;
pub mod storage;
pub mod surface;
pub mod unlock;

#[cfg(test)]
mod test_support;
