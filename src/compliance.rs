use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::model::ComplianceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ComplianceError {
    #[error("minimum price must be greater than zero (got {0})")]
    NonPositiveMinimum(Decimal),
    #[error("price gap between {detected} and {minimum} is out of range")]
    Overflow { detected: Decimal, minimum: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compliance {
    pub status: ComplianceStatus,
    /// Negative when the listing sits below the floor.
    pub gap_absolute: Decimal,
    /// Percentage of the minimum, two decimal places.
    pub gap_percent: Decimal,
}

/// Compare a detected price against the authorized minimum.
///
/// Strictly below is `BelowMinimum`; equal to the minimum is compliant.
pub fn evaluate(detected: Decimal, minimum: Decimal) -> Result<Compliance, ComplianceError> {
    if minimum <= Decimal::ZERO {
        return Err(ComplianceError::NonPositiveMinimum(minimum));
    }

    let status = if detected < minimum {
        ComplianceStatus::BelowMinimum
    } else {
        ComplianceStatus::Compliant
    };
    let overflow = ComplianceError::Overflow { detected, minimum };
    let gap_absolute = detected.checked_sub(minimum).ok_or(overflow)?;
    let gap_percent = gap_absolute
        .checked_div(minimum)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .ok_or(overflow)?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    Ok(Compliance {
        status,
        gap_absolute,
        gap_percent,
    })
}
