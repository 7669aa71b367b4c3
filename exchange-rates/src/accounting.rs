//! Balance Accountant.
//!
//! Tracks how much of a currency a branch holds and the amount-weighted
//! average rate it paid for it.

use rust_decimal::Decimal;

use crate::error::RateError;

/// Quantity held and its weighted-average acquisition rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Holding {
    pub amount: Decimal,
    pub average_rate: Decimal,
}

impl Holding {
    pub fn new(amount: Decimal, average_rate: Decimal) -> Self {
        Self {
            amount,
            average_rate,
        }
    }
}

/// Folds a purchase into a holding.
///
/// `new_average = (amount * average + purchased * rate) / (amount + purchased)`
pub fn record_purchase(
    holding: Holding,
    purchased_amount: Decimal,
    purchase_rate: Decimal,
) -> Result<Holding, RateError> {
    if purchased_amount <= Decimal::ZERO {
        return Err(RateError::InvalidInput(
            "Purchased amount must be positive".into(),
        ));
    }
    if purchase_rate <= Decimal::ZERO {
        return Err(RateError::InvalidInput(
            "Purchase rate must be positive".into(),
        ));
    }
    if holding.amount < Decimal::ZERO || holding.average_rate < Decimal::ZERO {
        return Err(RateError::InvalidInput(
            "Existing balance cannot be negative".into(),
        ));
    }

    let overflow = || RateError::InvalidInput("Balance is too large".into());

    let held_cost = holding
        .amount
        .checked_mul(holding.average_rate)
        .ok_or_else(overflow)?;
    let purchase_cost = purchased_amount
        .checked_mul(purchase_rate)
        .ok_or_else(overflow)?;
    let total_cost = held_cost.checked_add(purchase_cost).ok_or_else(overflow)?;
    let amount = holding
        .amount
        .checked_add(purchased_amount)
        .ok_or_else(overflow)?;
    let average_rate = total_cost.checked_div(amount).ok_or_else(overflow)?;

    Ok(Holding {
        amount,
        average_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_weighted_average() {
        let updated = record_purchase(Holding::new(dec!(100), dec!(10)), dec!(50), dec!(16)).unwrap();
        assert_eq!(updated.amount, dec!(150));
        assert_eq!(updated.average_rate, dec!(12));
    }

    #[test]
    fn test_first_purchase_takes_purchase_rate() {
        let updated = record_purchase(Holding::default(), dec!(250), dec!(39.5)).unwrap();
        assert_eq!(updated.amount, dec!(250));
        assert_eq!(updated.average_rate, dec!(39.5));
    }

    #[test]
    fn test_average_stays_between_old_and_new_rates() {
        let updated = record_purchase(Holding::new(dec!(7), dec!(1.1)), dec!(3), dec!(1.7)).unwrap();
        assert!(updated.average_rate > dec!(1.1));
        assert!(updated.average_rate < dec!(1.7));
        assert_eq!(updated.amount, dec!(10));
    }

    #[test]
    fn test_rejects_non_positive_inputs() {
        let held = Holding::new(dec!(1), dec!(1));
        assert!(matches!(
            record_purchase(held, dec!(0), dec!(1)),
            Err(RateError::InvalidInput(_))
        ));
        assert!(matches!(
            record_purchase(held, dec!(5), dec!(-2)),
            Err(RateError::InvalidInput(_))
        ));
        assert!(matches!(
            record_purchase(held, dec!(5), dec!(0)),
            Err(RateError::InvalidInput(_))
        ));
    }
}
