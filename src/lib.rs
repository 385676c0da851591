//! Outgoing multi-part Lightning payment engine.
//!
//! The crate drives locally originated payments: it splits a requested
//! amount across the wallet's channels, asks an external path-finder for
//! routes, wraps each part in a sphinx onion, dispatches add-HTLC commands
//! and reacts to local and remote failures by re-routing, re-splitting or
//! failing the whole payment.
//!
//! Channel state machines, the path-finder, onion cryptography and
//! persistence are external collaborators consumed through the traits in
//! [`crate::core::outbound::provider`].

pub mod core;
pub mod primitives;
pub mod util;
