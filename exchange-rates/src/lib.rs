//! Decimal Rate Engine and Balance Accounting
//!
//! The arithmetic core of the exchange back office. Everything here is pure:
//! no IO, no clocks, no randomness. Amounts and rates are `rust_decimal::Decimal`
//! throughout; rounding happens only when a value is presented.
//!
//! # Modules
//! - `currency` - ISO-style currency codes and half-up display rounding
//! - `engine` - converting an amount through a branch rate with a minimum-amount policy
//! - `accounting` - weighted-average acquisition cost of a currency holding
//!
//! # Example
//! ```
//! use exchange_rates::{convert, CurrencyCode, Direction, RateQuote};
//! use rust_decimal::Decimal;
//!
//! let quote = RateQuote {
//!     from: CurrencyCode::parse("USD").unwrap(),
//!     to: CurrencyCode::parse("EUR").unwrap(),
//!     rate: Decimal::new(92, 2),
//!     min_amount: Decimal::new(10, 0),
//! };
//!
//! let conversion = convert(&quote, Direction::ToAmountFromFromAmount, Decimal::new(100, 0)).unwrap();
//! assert_eq!(conversion.amount_to, Decimal::new(9200, 2));
//! ```

pub mod accounting;
pub mod currency;
pub mod engine;
pub mod error;

pub use accounting::{Holding, record_purchase};
pub use currency::{CurrencyCode, round_half_up};
pub use engine::{Conversion, Direction, RateQuote, convert};
pub use error::RateError;
