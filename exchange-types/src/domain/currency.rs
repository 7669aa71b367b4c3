//! Currency catalog entry.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use exchange_rates::CurrencyCode;

use crate::dto::UpdateCurrencyRequest;
use crate::error::DomainError;

/// Highest display precision a currency may declare.
pub const MAX_DECIMAL_PLACES: u32 = 8;

/// A currency the back office trades.
///
/// Currencies are never hard-deleted; `is_active = false` retires them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Currency {
    pub code: CurrencyCode,
    #[schema(example = "US Dollar")]
    pub name: String,
    #[schema(example = "$")]
    pub symbol: String,
    /// Digits shown after the decimal point
    #[schema(example = 2)]
    pub decimal_places: u32,
    pub is_active: bool,
}

impl Currency {
    pub fn new(
        code: CurrencyCode,
        name: String,
        symbol: String,
        decimal_places: u32,
    ) -> Result<Self, DomainError> {
        let currency = Self {
            code,
            name: name.trim().to_string(),
            symbol: symbol.trim().to_string(),
            decimal_places,
            is_active: true,
        };
        currency.validate()?;
        Ok(currency)
    }

    /// Applies a partial update, re-validating the result.
    pub fn apply_update(&mut self, req: UpdateCurrencyRequest) -> Result<(), DomainError> {
        let mut updated = self.clone();
        if let Some(name) = req.name {
            updated.name = name.trim().to_string();
        }
        if let Some(symbol) = req.symbol {
            updated.symbol = symbol.trim().to_string();
        }
        if let Some(decimal_places) = req.decimal_places {
            updated.decimal_places = decimal_places;
        }
        if let Some(is_active) = req.is_active {
            updated.is_active = is_active;
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.is_empty() || self.name.chars().count() > 50 {
            return Err(DomainError::Validation(
                "Currency name must be 1 to 50 characters".into(),
            ));
        }
        if self.symbol.is_empty() || self.symbol.chars().count() > 5 {
            return Err(DomainError::Validation(
                "Currency symbol must be 1 to 5 characters".into(),
            ));
        }
        if self.decimal_places > MAX_DECIMAL_PLACES {
            return Err(DomainError::Validation(format!(
                "Decimal places cannot exceed {}",
                MAX_DECIMAL_PLACES
            )));
        }
        Ok(())
    }
}
