//! Per-branch currency holdings.

use chrono::{DateTime, Utc};
use exchange_rates::Holding;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::currency::CurrencyCode;
use super::ids::{BalanceId, BranchId};
use crate::error::DomainError;

/// How much of one currency a branch holds, and what it paid on average.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CurrencyBalance {
    pub id: BalanceId,
    pub branch_id: BranchId,
    pub currency: CurrencyCode,
    #[schema(value_type = String, example = "150")]
    pub amount: Decimal,
    /// Weighted-average acquisition rate
    #[schema(value_type = String, example = "12")]
    pub average_purchase_rate: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl CurrencyBalance {
    /// An empty holding, the starting point before the first purchase.
    pub fn empty(branch_id: BranchId, currency: CurrencyCode) -> Self {
        Self {
            id: BalanceId::new(),
            branch_id,
            currency,
            amount: Decimal::ZERO,
            average_purchase_rate: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    pub fn holding(&self) -> Holding {
        Holding::new(self.amount, self.average_purchase_rate)
    }

    /// Adds a purchase and recomputes the weighted average.
    pub fn record_purchase(&mut self, amount: Decimal, rate: Decimal) -> Result<(), DomainError> {
        let updated = exchange_rates::record_purchase(self.holding(), amount, rate)?;
        self.amount = updated.amount;
        self.average_purchase_rate = updated.average_rate;
        self.updated_at = Utc::now();
        Ok(())
    }
}
