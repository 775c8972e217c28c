//! # Interest Rate Machinery
//!
//! Interest in OBOL never touches individual positions eagerly. A single
//! global *rate accumulator* compounds forward in time; a position's real
//! debt is its interest-free `normal_debt` multiplied by the accumulator,
//! minus whatever rebate the position has earned by keeping a limit order
//! on the redemption book.
//!
//! The split between *computing* and *settling* is deliberate and strict:
//!
//! - [`GlobalIRS::accumulator_at`] and [`compute_position_irs`] are pure.
//!   They answer "what would the state be at time t" and write nothing.
//! - The vault's `settle_irs` (in [`crate::vault`]) is the only place the
//!   results get written back.
//!
//! ## Rate models
//!
//! [`InterestRateModel`] is chosen once, at vault construction. `Static`
//! compounds a fixed per-second rate. `Utilization` derives the per-second
//! rate from `total_normal_debt / total_delegated_credit` by linear
//! interpolation through (0, min), (target, target), (max, max), then
//! compounds identically. Both paths go through [`crate::math::wpow`] —
//! exponentiation by squaring, never a linear approximation, so the
//! accumulator is exactly non-decreasing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{MAX_RATE_PER_SECOND, WAD};
use crate::math::{self, MathError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from rate-model configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateModelError {
    /// A configured rate is below 1.0 wad — it would make debt shrink.
    #[error("rate {0} is below 1.0 wad")]
    RateBelowOne(u128),

    /// A configured rate is above the protocol hard cap.
    #[error("rate {0} exceeds the per-second rate cap")]
    RateAboveCap(u128),

    /// Utilization knots are not ordered `0 < target < max`.
    #[error("utilization knots out of order: target {target}, max {max}")]
    UtilizationKnotsUnordered {
        /// Target utilization knot.
        target: u128,
        /// Maximum utilization knot.
        max: u128,
    },

    /// Rate knots are not ordered `min <= target <= max`.
    #[error("rate knots out of order")]
    RateKnotsUnordered,
}

// ---------------------------------------------------------------------------
// InterestRateModel
// ---------------------------------------------------------------------------

/// How a vault derives its per-second compounding rate.
///
/// Selected at configuration time. There is no runtime branch that flips a
/// vault between models — the original system encodes the choice as a
/// sentinel base-rate value, here it is simply the variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterestRateModel {
    /// Fixed per-second rate, wad, `>= 1.0`.
    Static {
        /// Per-second compounding factor.
        rate_per_second: u128,
    },

    /// Rate derived from credit-pool utilization on every accrual.
    Utilization {
        /// Rate at zero utilization (wad, per second).
        min_rate: u128,
        /// Rate at `target_utilization`.
        target_rate: u128,
        /// Rate at `max_utilization`.
        max_rate: u128,
        /// Utilization knot where `target_rate` applies (wad ratio).
        target_utilization: u128,
        /// Clamp for measured utilization (wad ratio).
        max_utilization: u128,
    },
}

impl InterestRateModel {
    /// Validates the configured rates against protocol bounds.
    pub fn validate(&self) -> Result<(), RateModelError> {
        let check = |rate: u128| {
            if rate < WAD {
                Err(RateModelError::RateBelowOne(rate))
            } else if rate > MAX_RATE_PER_SECOND {
                Err(RateModelError::RateAboveCap(rate))
            } else {
                Ok(())
            }
        };
        match *self {
            InterestRateModel::Static { rate_per_second } => check(rate_per_second),
            InterestRateModel::Utilization {
                min_rate,
                target_rate,
                max_rate,
                target_utilization,
                max_utilization,
            } => {
                check(min_rate)?;
                check(target_rate)?;
                check(max_rate)?;
                if !(min_rate <= target_rate && target_rate <= max_rate) {
                    return Err(RateModelError::RateKnotsUnordered);
                }
                if target_utilization == 0 || target_utilization >= max_utilization {
                    return Err(RateModelError::UtilizationKnotsUnordered {
                        target: target_utilization,
                        max: max_utilization,
                    });
                }
                Ok(())
            }
        }
    }

    /// The per-second rate for the current pool state.
    ///
    /// For the static model the pool arguments are ignored. For the
    /// utilization model, `total_normal_debt / total_delegated_credit` is
    /// clamped to `[0, max_utilization]` and interpolated; an empty pool
    /// counts as maximum utilization (no delegated credit but outstanding
    /// debt is the most stressed state the curve knows).
    pub fn rate_per_second(
        &self,
        total_normal_debt: u128,
        total_delegated_credit: u128,
    ) -> Result<u128, MathError> {
        match *self {
            InterestRateModel::Static { rate_per_second } => Ok(rate_per_second),
            InterestRateModel::Utilization {
                min_rate,
                target_rate,
                max_rate,
                target_utilization,
                max_utilization,
            } => {
                let utilization = if total_normal_debt == 0 {
                    0
                } else if total_delegated_credit == 0 {
                    max_utilization
                } else {
                    math::wdiv(total_normal_debt, total_delegated_credit)?
                        .min(max_utilization)
                };

                if utilization <= target_utilization {
                    // min + (target - min) * u / target_u
                    let span = target_rate - min_rate;
                    Ok(min_rate + math::mul_div(span, utilization, target_utilization)?)
                } else {
                    // target + (max - target) * (u - target_u) / (max_u - target_u)
                    let span = max_rate - target_rate;
                    let over = utilization - target_utilization;
                    let width = max_utilization - target_utilization;
                    Ok(target_rate + math::mul_div(span, over, width)?)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GlobalIRS
// ---------------------------------------------------------------------------

/// Vault-wide interest-rate state: one per vault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalIRS {
    /// The compounding accumulator, wad, starts at 1.0. Monotonically
    /// non-decreasing — the central invariant of the interest machinery.
    pub rate_accumulator: u128,

    /// Sum of all positions' `normal_debt`.
    pub total_normal_debt: u128,

    /// Sum of the rebate accrued by all *reconciled* positions.
    pub global_accrued_rebate: u128,

    /// Timestamp (unix seconds) of the last accumulator write.
    pub last_updated: u64,
}

impl GlobalIRS {
    /// Fresh state at time `now` with the accumulator at 1.0.
    pub fn new(now: u64) -> Self {
        Self {
            rate_accumulator: WAD,
            total_normal_debt: 0,
            global_accrued_rebate: 0,
            last_updated: now,
        }
    }

    /// Pure: the accumulator extrapolated to `now`.
    ///
    /// Timestamps earlier than `last_updated` are treated as `last_updated`
    /// — time does not run backwards, and a stale caller clock must not
    /// regress the accumulator.
    pub fn accumulator_at(
        &self,
        model: &InterestRateModel,
        now: u64,
        total_delegated_credit: u128,
    ) -> Result<u128, MathError> {
        let elapsed = now.saturating_sub(self.last_updated);
        if elapsed == 0 {
            return Ok(self.rate_accumulator);
        }
        let rate = model.rate_per_second(self.total_normal_debt, total_delegated_credit)?;
        let growth = math::wpow(rate, elapsed)?;
        math::wmul(self.rate_accumulator, growth)
    }
}

// ---------------------------------------------------------------------------
// PositionIRS
// ---------------------------------------------------------------------------

/// Per-position interest-rate state: the accumulator snapshot from the last
/// reconciliation, the rebate accrued so far, and the position's active
/// limit order, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionIRS {
    /// Accumulator value at the last settle. Zero only for never-touched
    /// positions; the first settle snaps it to the current accumulator.
    pub rate_accumulator: u128,

    /// Interest rebate accrued since the position last repaid (wad credit).
    pub accrued_rebate: u128,

    /// Key of the position's active limit order in the exchange arena.
    pub limit_order: Option<u64>,
}

/// Pure: a position's IRS reconciled against `new_accumulator`.
///
/// Rebate accrues as `rebate_factor * normal_debt * Δaccumulator`. Since
/// `rebate_factor <= 1.0`, each accrual step respects the invariant
/// `accrued_rebate <= normal_debt * (current - snapshot)`.
pub fn compute_position_irs(
    irs: &PositionIRS,
    normal_debt: u128,
    rebate_factor: u128,
    new_accumulator: u128,
) -> Result<PositionIRS, MathError> {
    let snapshot = if irs.rate_accumulator == 0 {
        new_accumulator
    } else {
        irs.rate_accumulator
    };
    let delta = new_accumulator.saturating_sub(snapshot);

    let mut accrued = irs.accrued_rebate;
    if rebate_factor > 0 && normal_debt > 0 && delta > 0 {
        let interest_share = math::wmul(normal_debt, delta)?;
        accrued = accrued
            .checked_add(math::wmul(rebate_factor, interest_share)?)
            .ok_or(MathError::Overflow)?;
    }

    Ok(PositionIRS {
        rate_accumulator: new_accumulator,
        accrued_rebate: accrued,
        limit_order: irs.limit_order,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
