//! Marker services: layout, synchronization, labels, and the action protocol.
//!
//! ARCHITECTURE
//! ============
//! `layout` is pure geometry. `sync` and `label` read and write the scene
//! store. `api` (service role) and `client` (caller role) sit on the
//! broadcast bus and translate protocol messages into store operations.

pub mod api;
pub mod client;
pub mod label;
pub mod layout;
pub mod sync;
