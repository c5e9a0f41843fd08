//! # Routing Module
//!
//! Request routing with path matching and parameter extraction.

pub mod router;

pub use router::{MatchKind, RequestRouter, RouteBinding, RouteMatch, RouterHandle};
