//! Application Layer - Port definitions.
//!
//! This layer defines how the streaming sessions interact with external
//! collaborators they do not own.

/// Port interfaces for external systems (session credential issuance).
pub mod ports;
