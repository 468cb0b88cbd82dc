//! Condition markers for shared virtual-tabletop scenes.
//!
//! Markers are small icons attached to a token, one per active condition
//! ("Poisoned", "Burned", ...). Their placement is derived entirely from the
//! parent token's transform and re-derived whenever the token changes, on
//! every client, with no central authority. Other extensions add and remove
//! conditions through a broadcast request/response protocol.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`scene`] | Item model, store and player traits, in-memory implementations |
//! | [`bus`] | Broadcast channel trait and in-process bus |
//! | [`protocol`] | Wire request/response types, validation, error codes |
//! | [`services::layout`] | Pure marker geometry |
//! | [`services::sync`] | Change-driven marker relayout |
//! | [`services::label`] | Marker text labels |
//! | [`services::api`] | Protocol service (answers requests) |
//! | [`services::client`] | Protocol client (sends requests, awaits answers) |
//! | [`config`] | Environment-driven configuration |

pub mod bus;
pub mod config;
pub mod protocol;
pub mod scene;
pub mod services;
