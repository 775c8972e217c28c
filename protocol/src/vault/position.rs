//! # Positions & Debt Conversions
//!
//! A [`Position`] is two numbers: collateral held and `normal_debt`, the
//! interest-free principal. Real debt is derived, never stored:
//!
//! ```text
//! debt = floor(normal_debt * rate_accumulator) - accrued_rebate
//! ```
//!
//! The inverse conversion rounds *up* by one normalized unit whenever floor
//! rounding would leave a residual. The asymmetry is the rounding policy of
//! the whole protocol: converting back and forth may overshoot by a wei, but
//! it can never under-collect. [`debt_to_normal_debt`] documents the exact
//! rule; `tests::round_trip_never_under_collects` pins it down.

use serde::{Deserialize, Serialize};

use crate::math::{self, MathError};

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Collateral and normalized debt for one owner in one vault.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Collateral locked in the position (wad token units).
    pub collateral: u128,

    /// Interest-free principal (wad credit units). Multiply by the rate
    /// accumulator to get real debt.
    pub normal_debt: u128,
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Real debt of a position: `floor(normal_debt * accumulator) - rebate`,
/// saturating at zero if the rebate covers everything.
pub fn normal_debt_to_debt(
    normal_debt: u128,
    rate_accumulator: u128,
    accrued_rebate: u128,
) -> Result<u128, MathError> {
    let gross = math::wmul(normal_debt, rate_accumulator)?;
    Ok(gross.saturating_sub(accrued_rebate))
}

/// The smallest `normal_debt` whose real debt covers `debt`.
///
/// Floors the division, then checks whether the floored value actually
/// extinguishes `debt`; if truncation left a residual, adds one normalized
/// unit. The result therefore satisfies
/// `normal_debt_to_debt(result, acc, rebate) >= debt` always.
pub fn debt_to_normal_debt(
    debt: u128,
    rate_accumulator: u128,
    accrued_rebate: u128,
) -> Result<u128, MathError> {
    let gross = debt.checked_add(accrued_rebate).ok_or(MathError::Overflow)?;
    let floored = math::wdiv(gross, rate_accumulator)?;
    if math::wmul(floored, rate_accumulator)? < gross {
        floored.checked_add(1).ok_or(MathError::Overflow)
    } else {
        Ok(floored)
    }
}

// ---------------------------------------------------------------------------
// Repayment
// ---------------------------------------------------------------------------

/// The resolved arithmetic of one repayment, shared by `modify_position`,
/// the liquidation engine, and the exchange engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Repayment {
    /// Normalized debt to remove from the position.
    pub normal_debt_delta: u128,

    /// Portion of the position's accrued rebate claimed by this repayment.
    pub rebate_claim: u128,

    /// Credit the payer must actually supply: the gross value of the
    /// removed normalized debt minus the rebate claim.
    pub credit_required: u128,
}

/// Resolves a repayment of up to `debt_amount` against a position.
///
/// A `debt_amount` at or above the position's current debt is a full
/// repayment: all normalized debt goes, the whole rebate is claimed, and
/// the payer supplies exactly the current debt. Anything smaller removes
/// the rounded-up normalized equivalent (capped at `normal_debt`) and
/// claims rebate pro-rata to the fraction of normalized debt removed.
pub fn resolve_repayment(
    debt_amount: u128,
    normal_debt: u128,
    rate_accumulator: u128,
    accrued_rebate: u128,
) -> Result<Repayment, MathError> {
    if normal_debt == 0 {
        return Ok(Repayment {
            normal_debt_delta: 0,
            rebate_claim: 0,
            credit_required: 0,
        });
    }

    let current_debt = normal_debt_to_debt(normal_debt, rate_accumulator, accrued_rebate)?;
    if debt_amount >= current_debt {
        return Ok(Repayment {
            normal_debt_delta: normal_debt,
            rebate_claim: accrued_rebate,
            credit_required: current_debt,
        });
    }

    // Partial: round the normalized delta up (never under-collect), cap at
    // the position's principal, claim rebate pro-rata.
    let delta = debt_to_normal_debt(debt_amount, rate_accumulator, 0)?.min(normal_debt);
    resolve_normalized_repayment(delta, normal_debt, rate_accumulator, accrued_rebate)
}

/// Resolves removal of an exact normalized-debt `delta` from a position.
///
/// Requires `0 < delta <= normal_debt`. The rebate claim is pro-rata to
/// the principal share removed; the payer supplies the gross value of the
/// removed principal net of that claim. [`resolve_repayment`] and the
/// repay arm of `modify_position` both land here, so there is exactly one
/// place the rounding happens.
pub fn resolve_normalized_repayment(
    delta: u128,
    normal_debt: u128,
    rate_accumulator: u128,
    accrued_rebate: u128,
) -> Result<Repayment, MathError> {
    let claim = math::mul_div(accrued_rebate, delta, normal_debt)?;
    let gross = math::wmul(delta, rate_accumulator)?;
    Ok(Repayment {
        normal_debt_delta: delta,
        rebate_claim: claim,
        credit_required: gross.saturating_sub(claim),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WAD;

    #[test]
    fn debt_at_unit_accumulator_is_principal() {
        assert_eq!(normal_debt_to_debt(500 * WAD, WAD, 0).unwrap(), 500 * WAD);
        assert_eq!(debt_to_normal_debt(500 * WAD, WAD, 0).unwrap(), 500 * WAD);
    }

    #[test]
    fn rebate_reduces_debt_and_saturates() {
        let acc = WAD + WAD / 10;
        let gross = 550 * WAD; // 500 * 1.1
        assert_eq!(
            normal_debt_to_debt(500 * WAD, acc, 50 * WAD).unwrap(),
            gross - 50 * WAD
        );
        // Rebate larger than gross debt clamps at zero instead of wrapping.
        assert_eq!(normal_debt_to_debt(500 * WAD, acc, 10_000 * WAD).unwrap(), 0);
    }

    #[test]
    fn inverse_conversion_rounds_up_on_residual() {
        // accumulator = 3.0: a debt of 100 wei needs ceil(100/3) = 34
        // normalized units; floor would leave 1 wei uncollected.
        let acc = 3 * WAD;
        let nd = debt_to_normal_debt(100, acc, 0).unwrap();
        assert_eq!(nd, 34);
        assert!(normal_debt_to_debt(nd, acc, 0).unwrap() >= 100);
    }

    #[test]
    fn round_trip_never_under_collects() {
        let accumulators = [WAD, WAD + 1, 3 * WAD / 2, 7 * WAD / 3, 10 * WAD];
        let debts = [1u128, 99, 100 * WAD, 12_345_678_901_234_567_890];
        let rebates = [0u128, 1, WAD / 7];
        for &acc in &accumulators {
            for &d in &debts {
                for &r in &rebates {
                    let nd = debt_to_normal_debt(d, acc, r).unwrap();
                    let back = normal_debt_to_debt(nd, acc, r).unwrap();
                    assert!(back >= d, "under-collected: d={} acc={} r={}", d, acc, r);
                }
            }
        }
    }

    #[test]
    fn full_repayment_clears_everything() {
        let acc = WAD + WAD / 10;
        let nd = 500 * WAD;
        let rebate = 5 * WAD;
        let debt = normal_debt_to_debt(nd, acc, rebate).unwrap();

        let r = resolve_repayment(debt, nd, acc, rebate).unwrap();
        assert_eq!(r.normal_debt_delta, nd);
        assert_eq!(r.rebate_claim, rebate);
        assert_eq!(r.credit_required, debt);

        // Overpaying asks for nothing extra.
        let r2 = resolve_repayment(debt + 1_000 * WAD, nd, acc, rebate).unwrap();
        assert_eq!(r2, r);
    }

    #[test]
    fn partial_repayment_claims_rebate_pro_rata() {
        let acc = 2 * WAD;
        let nd = 100 * WAD;
        let rebate = 10 * WAD;
        // Current debt = 200 - 10 = 190. Repay 100 of it.
        let r = resolve_repayment(100 * WAD, nd, acc, rebate).unwrap();
        assert_eq!(r.normal_debt_delta, 50 * WAD);
        // Half the principal leaves, so half the rebate is claimed.
        assert_eq!(r.rebate_claim, 5 * WAD);
        // Payer supplies gross (100) minus claim (5).
        assert_eq!(r.credit_required, 95 * WAD);
    }

    #[test]
    fn normalized_and_debt_denominated_repayments_agree() {
        // The debt-denominated path resolves to a normalized delta and
        // must then charge exactly what the normalized path charges.
        let acc = 7 * WAD / 3;
        let nd = 333 * WAD;
        let rebate = 11 * WAD;
        let by_debt = resolve_repayment(100 * WAD, nd, acc, rebate).unwrap();
        let by_delta =
            resolve_normalized_repayment(by_debt.normal_debt_delta, nd, acc, rebate).unwrap();
        assert_eq!(by_debt, by_delta);
    }

    #[test]
    fn repayment_of_zero_debt_position_is_a_no_op() {
        let r = resolve_repayment(100 * WAD, 0, 2 * WAD, 0).unwrap();
        assert_eq!(r.normal_debt_delta, 0);
        assert_eq!(r.credit_required, 0);
    }

    #[test]
    fn repayment_never_exceeds_requested_amount() {
        // The credit a payer supplies for a partial repay can exceed the
        // removed-principal value only through rounding up by one unit.
        let acc = 7 * WAD / 3;
        let nd = 333 * WAD;
        let r = resolve_repayment(100 * WAD, nd, acc, 0).unwrap();
        assert!(r.credit_required <= 100 * WAD + acc / WAD + 1);
        assert!(r.normal_debt_delta < nd);
    }
}
