//! Domain Layer - Session and subscription types.
//!
//! This layer contains the core types shared by the streaming sessions
//! with no transport dependencies.

/// Channel kinds, session status, restart signals and session credentials.
pub mod session;

/// Subscription requests and the replay registry.
pub mod subscription;
