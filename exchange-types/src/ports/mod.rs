//! Port traits (interfaces for adapters).
//!
//! These are the contracts that adapters must implement.
//! The application layer depends on these traits, not concrete implementations.

mod identity;
mod repository;

pub use identity::IdentityVerifier;
pub use repository::{ExchangeRepository, OrderScope, ReviewScope};
