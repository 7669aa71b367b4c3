//! # Exchange Hex
//!
//! Application service layer and HTTP adapter for the exchange back office.
//!
//! ## Architecture
//!
//! - `service/` - Application service (access checks, orchestration, presentation rounding)
//! - `inbound/` - HTTP adapter (Axum server, JWT identity, rate limiting)
//! - `openapi` - OpenAPI document served at `/api-docs/openapi.json`
//!
//! The service is generic over `R: ExchangeRepository`, allowing
//! different repository implementations to be injected.

pub mod inbound;
pub mod openapi;
pub mod service;

#[cfg(test)]
mod service_tests;

pub use service::ExchangeService;
