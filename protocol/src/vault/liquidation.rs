//! # Liquidation Engine
//!
//! Unsafe positions are repaired by liquidators: they supply credit, the
//! position's debt shrinks by `credit * penalty`, and they buy collateral
//! at a discount to the oracle price. Three caps shape every liquidation:
//!
//! - **Target health**: a partial liquidation may not leave the position
//!   healthier than `target_health_factor`. Liquidate to safety, not to
//!   extraction. The cap is the closed-form repay amount that lands the
//!   health factor exactly on target.
//! - **Debt floor**: a partial liquidation may not leave a dust position.
//!   If it would, the repay amount shrinks so at least `debt_floor` of
//!   debt remains. A position whose debt already sits at or below the
//!   floor is all-or-nothing: the entry must clear the whole debt (or
//!   exhaust the collateral) or it is refused.
//! - **Collateral**: if the position's collateral cannot buy the repay
//!   amount, the liquidation goes *full* — all collateral sells, the debt
//!   zeroes, and the uncovered remainder becomes bad debt: first a buffer
//!   bailout is requested, then whatever the buffer declines is socialized
//!   against the delegation pool.
//!
//! Batches are processed per-position: one entry failing does not abort
//! its neighbours, and the result vector lines up with the input.

use serde::{Deserialize, Serialize};

use crate::config::WAD;
use crate::external::{Buffer, Oracle};
use crate::ledger::Ledger;
use crate::math;
use crate::vault::position::{self, Position};
use crate::vault::{Vault, VaultError};

/// What one liquidation entry actually did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationOutcome {
    /// The liquidated owner.
    pub owner: String,

    /// Credit the liquidator paid. Never exceeds the requested amount.
    pub credit_paid: u128,

    /// Collateral transferred to the liquidator's cash balance.
    pub collateral_bought: u128,

    /// Debt removed from the position (includes the penalty markup).
    pub debt_removed: u128,

    /// Uncovered debt written off in a full liquidation.
    pub bad_debt: u128,

    /// Portion of `bad_debt` the buffer declined, socialized against the
    /// delegation pool.
    pub socialized: u128,

    /// Whether the position was fully cleared.
    pub full: bool,
}

/// A staged plan for one entry, computed entirely on locals.
struct LiquidationPlan {
    repay: u128,
    collateral_out: u128,
    debt_removed: u128,
    normal_debt_delta: u128,
    rebate_forfeit: u128,
    bad_debt: u128,
    full: bool,
}

impl Vault {
    /// Liquidates a batch of positions. The result vector is index-aligned
    /// with `entries`; each entry succeeds or fails on its own.
    pub fn liquidate_positions(
        &mut self,
        now: u64,
        entries: &[(String, u128)],
        liquidator: &str,
        oracle: &dyn Oracle,
        buffer: &mut dyn Buffer,
        ledger: &mut Ledger,
    ) -> Vec<Result<LiquidationOutcome, VaultError>> {
        entries
            .iter()
            .map(|(owner, repay)| {
                self.liquidate_one(now, owner, *repay, liquidator, oracle, buffer, ledger)
            })
            .collect()
    }

    fn liquidate_one(
        &mut self,
        now: u64,
        owner: &str,
        requested_repay: u128,
        liquidator: &str,
        oracle: &dyn Oracle,
        buffer: &mut dyn Buffer,
        ledger: &mut Ledger,
    ) -> Result<LiquidationOutcome, VaultError> {
        self.require_live()?;
        let spot = self.spot_price(oracle)?;

        // -- Check -------------------------------------------------------
        let (acc, settled) = self.settled_state(now, owner)?;
        let pos = self.position_of(owner);
        let debt = position::normal_debt_to_debt(pos.normal_debt, acc, settled.accrued_rebate)?;

        let collateral_value = math::wmul(pos.collateral, spot)?;
        if debt == 0 || math::wdiv(collateral_value, self.params.liquidation_ratio)? >= debt {
            return Err(VaultError::PositionSafe(owner.to_string()));
        }

        let plan = self.plan_liquidation(
            requested_repay,
            &pos,
            debt,
            collateral_value,
            spot,
            acc,
            settled.accrued_rebate,
        )?;

        // -- Interact ----------------------------------------------------
        // The liquidator's credit lands in the vault account before any
        // internal write. If the move fails, this entry changes nothing.
        ledger.move_balance(liquidator, &self.account, plan.repay, liquidator)?;

        // -- Commit ------------------------------------------------------
        self.commit_settlement(now, acc, owner, settled.clone());

        let mut new_pos = pos;
        new_pos.collateral -= plan.collateral_out;
        new_pos.normal_debt -= plan.normal_debt_delta;

        let mut irs = settled;
        irs.accrued_rebate -= plan.rebate_forfeit;
        self.global_irs.global_accrued_rebate = self
            .global_irs
            .global_accrued_rebate
            .saturating_sub(plan.rebate_forfeit);
        self.global_irs.total_normal_debt -= plan.normal_debt_delta;

        self.write_position(owner, new_pos, irs);
        self.add_cash(liquidator, plan.collateral_out);
        self.detach_if_dust(owner)?;

        // Bad debt: ask the buffer, socialize the refusal. Both are
        // interactions against already-consistent state.
        let mut socialized = 0;
        if plan.bad_debt > 0 {
            let granted = buffer.request_bailout(plan.bad_debt);
            let shortfall = plan.bad_debt - granted;
            if shortfall > 0 {
                socialized = self.delegation.socialize_bad_debt(shortfall);
                self.note_bad_debt(shortfall);
            }
        }

        tracing::info!(
            owner,
            liquidator,
            repay = plan.repay,
            collateral = plan.collateral_out,
            debt_removed = plan.debt_removed,
            bad_debt = plan.bad_debt,
            full = plan.full,
            "position liquidated"
        );
        Ok(LiquidationOutcome {
            owner: owner.to_string(),
            credit_paid: plan.repay,
            collateral_bought: plan.collateral_out,
            debt_removed: plan.debt_removed,
            bad_debt: plan.bad_debt,
            socialized,
            full: plan.full,
        })
    }

    /// Computes the repay/collateral/bad-debt split for one liquidation,
    /// with every cap applied, touching no state.
    #[allow(clippy::too_many_arguments)]
    fn plan_liquidation(
        &self,
        requested_repay: u128,
        pos: &Position,
        debt: u128,
        collateral_value: u128,
        spot: u128,
        acc: u128,
        accrued_rebate: u128,
    ) -> Result<LiquidationPlan, VaultError> {
        let params = &self.params;
        let discounted_price = math::wmul(spot, WAD - params.liquidation_discount)?;

        // Collateral bound: past `max_repay` there is nothing left to buy.
        let max_repay = math::wmul(pos.collateral, discounted_price)?;

        // A position already at or below the floor cannot shrink further:
        // the dust rule overrides the target cap, so the entry either
        // clears the whole debt (possibly exhausting the collateral) or
        // is refused.
        if debt <= params.debt_floor {
            let full_repay = math::wdiv_up(debt, params.liquidation_penalty)?.min(max_repay);
            if requested_repay < full_repay {
                let removable = math::wmul(requested_repay, params.liquidation_penalty)?;
                return Err(VaultError::DebtFloorViolation {
                    debt: debt.saturating_sub(removable),
                    floor: params.debt_floor,
                });
            }
        }

        // Cap 1: don't push health past the target. Solving
        //   (value - repay/(1-discount)) / ratio == target * (debt - penalty*repay)
        // for repay gives the closed form below; a non-positive denominator
        // means no finite repay reaches the target and only the full-
        // liquidation cap applies. Sub-floor positions skip the cap: their
        // only legal outcome is a full clear.
        let target_cap = if debt > params.debt_floor {
            let capacity = math::wdiv(collateral_value, params.liquidation_ratio)?;
            let numerator = math::wmul(params.target_health_factor, debt)?.saturating_sub(capacity);
            let lhs = math::wmul(params.target_health_factor, params.liquidation_penalty)?;
            let rhs = math::wdiv(
                WAD,
                math::wmul(WAD - params.liquidation_discount, params.liquidation_ratio)?,
            )?;
            if lhs > rhs {
                Some(math::wdiv_up(numerator, lhs - rhs)?)
            } else {
                None
            }
        } else {
            None
        };

        let mut repay = requested_repay;
        if let Some(cap) = target_cap {
            repay = repay.min(cap);
        }

        // Cap 2: collateral.
        let exhausts_collateral = repay >= max_repay;
        if exhausts_collateral {
            repay = max_repay;
        }

        let mut debt_removed = math::wmul(repay, params.liquidation_penalty)?;
        if debt_removed >= debt {
            // The repay clears the whole debt. The liquidator buys only the
            // collateral the (reduced) repay pays for; the remainder stays
            // with the owner.
            let repay = math::wdiv_up(debt, params.liquidation_penalty)?.min(max_repay);
            let collateral_out = math::wdiv(repay, discounted_price)?.min(pos.collateral);
            return Ok(LiquidationPlan {
                repay,
                collateral_out,
                debt_removed: debt,
                normal_debt_delta: pos.normal_debt,
                rebate_forfeit: accrued_rebate,
                bad_debt: 0,
                full: true,
            });
        }

        if exhausts_collateral {
            // All collateral sold and debt remains: the position zeroes and
            // the uncovered remainder is bad debt.
            return Ok(LiquidationPlan {
                repay,
                collateral_out: pos.collateral,
                debt_removed,
                normal_debt_delta: pos.normal_debt,
                rebate_forfeit: accrued_rebate,
                bad_debt: debt - debt_removed,
                full: true,
            });
        }

        // Cap 3: never leave a dust position behind. The sub-floor check
        // above guarantees `debt > debt_floor` here, so the subtraction
        // cannot underflow. A shrink that collapses the repay to zero
        // means no partial amount is legal at all.
        let remaining = debt - debt_removed;
        if remaining < params.debt_floor {
            debt_removed = debt - params.debt_floor;
            repay = math::wdiv(debt_removed, params.liquidation_penalty)?;
            if repay == 0 {
                return Err(VaultError::DebtFloorViolation {
                    debt: remaining,
                    floor: params.debt_floor,
                });
            }
            debt_removed = math::wmul(repay, params.liquidation_penalty)?;
        }

        let collateral_out = math::wdiv(repay, discounted_price)?.min(pos.collateral);
        let delta = position::debt_to_normal_debt(debt_removed, acc, 0)?.min(pos.normal_debt);
        // The forfeited rebate share tracks the principal share.
        let forfeit = math::mul_div(accrued_rebate, delta, pos.normal_debt)?;
        Ok(LiquidationPlan {
            repay,
            collateral_out,
            debt_removed,
            normal_debt_delta: delta,
            rebate_forfeit: forfeit,
            bad_debt: 0,
            full: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
