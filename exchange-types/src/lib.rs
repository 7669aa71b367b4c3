//! # Exchange Types
//!
//! Domain types, access policy and port traits for the currency exchange
//! back office. This crate has ZERO external IO dependencies - only data
//! structures, business rules, and trait definitions.
//!
//! ## Architecture
//!
//! This crate represents the **innermost core** of the hexagonal architecture:
//! - `domain/` - Catalog, balances, orders and their lifecycle, reviews, users
//! - `policy` - The single place permission decisions are made
//! - `ports/` - Trait definitions that adapters must implement
//! - `dto/` - Data Transfer Objects for API boundaries
//! - `error/` - Domain and application error types
//!
//! Rate conversion and balance arithmetic live one layer further in, in the
//! `exchange-rates` crate.

pub mod domain;
pub mod dto;
pub mod error;
pub mod policy;
pub mod ports;

// Re-export commonly used types
pub use domain::{
    Branch, BranchId, Currency, CurrencyBalance, CurrencyCode, DocumentType, ExchangeRate,
    Identity, Notification, NotificationStatus, Order, OrderDocument, OrderId, OrderItem,
    OrderStatus, RateId, Review, ReviewId, Role, TrackingCode, User, UserId,
};
pub use dto::*;
pub use error::{AccessError, AppError, DomainError, RepoError};
pub use exchange_rates::{Conversion, Direction};
pub use policy::{Action, Actor, Resource, authorize};
pub use ports::{ExchangeRepository, IdentityVerifier, OrderScope, ReviewScope};
