//! # Exchange / Redemption Engine
//!
//! Borrowers can volunteer their positions for redemption by parking a
//! limit order at a *price tick* — a wad multiplier `>= 1.0` applied to the
//! oracle spot price. In exchange they earn an interest rebate whose factor
//! is `1.0 / tick`: the closer to par a borrower is willing to be redeemed,
//! the more of their interest is forgiven.
//!
//! The book is an arena: orders are records keyed by integer, linked into
//! per-tick FIFO queues by explicit prev/next keys. Iteration order is
//! defined by the links alone, never by the backing container. Ticks
//! themselves live in an ordered map and are walked lowest-first.
//!
//! [`Vault::exchange`] is all-or-nothing at the call boundary: the walk is
//! simulated first, and if the requested credit cannot be fully filled the
//! call fails with `InsufficientLiquidity` having mutated nothing.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WAD;
use crate::external::Oracle;
use crate::ledger::Ledger;
use crate::math::{self, MathError};
use crate::vault::position::{self, Repayment};
use crate::vault::{Vault, VaultError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the tick/order book.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    /// Ticks are multipliers on the spot price; below 1.0 makes no sense.
    #[error("price tick {0} is below 1.0 wad")]
    TickBelowOne(u128),

    /// The tick is already active.
    #[error("price tick {0} already exists")]
    TickExists(u128),

    /// No such active tick.
    #[error("price tick {0} not found")]
    TickNotFound(u128),

    /// The tick still has queued orders and cannot be removed.
    #[error("price tick {0} still has queued orders")]
    TickNotEmpty(u128),

    /// The owner already has an active order (one per position).
    #[error("'{0}' already has an active limit order")]
    OrderExists(String),

    /// The owner has no active order.
    #[error("'{0}' has no active limit order")]
    NoOrder(String),
}

// ---------------------------------------------------------------------------
// Book structures
// ---------------------------------------------------------------------------

/// One queued redemption offer: an owner's position, parked at a tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOrder {
    /// Position owner.
    pub owner: String,

    /// The tick this order is queued at.
    pub tick: u128,

    prev: Option<u64>,
    next: Option<u64>,
}

/// One active price tick and its FIFO queue endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Interest rebate factor for orders at this tick: `1.0 / tick`, wad.
    pub rebate_factor: u128,

    head: Option<u64>,
    tail: Option<u64>,
}

/// The full order book: ordered ticks, an order arena, and an owner index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TickBook {
    ticks: BTreeMap<u128, PriceTick>,
    orders: HashMap<u64, LimitOrder>,
    by_owner: HashMap<String, u64>,
    next_key: u64,
}

/// The rebate factor earned at `tick`: `1.0 / tick` in wad. A tick of
/// exactly 1.0 forgives all interest; higher ticks forgive less.
pub fn rebate_factor_for_tick(tick: u128) -> Result<u128, MathError> {
    math::wdiv(WAD, tick)
}

impl TickBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activates a tick. Fails below 1.0 wad or if already active.
    pub fn add_tick(&mut self, tick: u128) -> Result<(), BookError> {
        if tick < WAD {
            return Err(BookError::TickBelowOne(tick));
        }
        if self.ticks.contains_key(&tick) {
            return Err(BookError::TickExists(tick));
        }
        // wdiv cannot fail here: tick >= WAD > 0 and WAD*WAD fits.
        let rebate_factor = rebate_factor_for_tick(tick).unwrap_or(0);
        self.ticks.insert(
            tick,
            PriceTick {
                rebate_factor,
                head: None,
                tail: None,
            },
        );
        Ok(())
    }

    /// Deactivates a tick. Only an empty queue can be removed.
    pub fn remove_tick(&mut self, tick: u128) -> Result<(), BookError> {
        let entry = self.ticks.get(&tick).ok_or(BookError::TickNotFound(tick))?;
        if entry.head.is_some() {
            return Err(BookError::TickNotEmpty(tick));
        }
        self.ticks.remove(&tick);
        Ok(())
    }

    /// The rebate factor of an active tick.
    pub fn tick_rebate_factor(&self, tick: u128) -> Option<u128> {
        self.ticks.get(&tick).map(|t| t.rebate_factor)
    }

    /// The order key of `owner`'s active order, if any.
    pub fn order_of(&self, owner: &str) -> Option<u64> {
        self.by_owner.get(owner).copied()
    }

    /// The order record behind `key`.
    pub fn order(&self, key: u64) -> Option<&LimitOrder> {
        self.orders.get(&key)
    }

    /// Appends a new order for `owner` at the back of `tick`'s queue.
    pub fn create_order(&mut self, owner: &str, tick: u128) -> Result<u64, BookError> {
        if self.by_owner.contains_key(owner) {
            return Err(BookError::OrderExists(owner.to_string()));
        }
        if !self.ticks.contains_key(&tick) {
            return Err(BookError::TickNotFound(tick));
        }

        let key = self.next_key;
        self.next_key += 1;

        let tick_entry = self.ticks.get_mut(&tick).expect("tick checked above");
        let order = LimitOrder {
            owner: owner.to_string(),
            tick,
            prev: tick_entry.tail,
            next: None,
        };
        match tick_entry.tail {
            Some(tail_key) => {
                self.orders
                    .get_mut(&tail_key)
                    .expect("tail key is linked")
                    .next = Some(key);
            }
            None => tick_entry.head = Some(key),
        }
        tick_entry.tail = Some(key);

        self.orders.insert(key, order);
        self.by_owner.insert(owner.to_string(), key);
        Ok(key)
    }

    /// Detaches `owner`'s active order.
    pub fn cancel_order(&mut self, owner: &str) -> Result<u64, BookError> {
        let key = self
            .by_owner
            .get(owner)
            .copied()
            .ok_or_else(|| BookError::NoOrder(owner.to_string()))?;
        self.unlink(key);
        Ok(key)
    }

    /// Unlinks the order at `key` from its queue and drops it from the
    /// arena. Silently ignores unknown keys.
    pub(crate) fn unlink(&mut self, key: u64) {
        let Some(order) = self.orders.remove(&key) else {
            return;
        };
        self.by_owner.remove(&order.owner);

        match order.prev {
            Some(prev) => {
                if let Some(p) = self.orders.get_mut(&prev) {
                    p.next = order.next;
                }
            }
            None => {
                if let Some(tick) = self.ticks.get_mut(&order.tick) {
                    tick.head = order.next;
                }
            }
        }
        match order.next {
            Some(next) => {
                if let Some(n) = self.orders.get_mut(&next) {
                    n.prev = order.prev;
                }
            }
            None => {
                if let Some(tick) = self.ticks.get_mut(&order.tick) {
                    tick.tail = order.prev;
                }
            }
        }
    }

    /// Active ticks up to and including `upper`, ascending.
    pub fn ticks_up_to(&self, upper: u128) -> impl Iterator<Item = u128> + '_ {
        self.ticks.range(..=upper).map(|(tick, _)| *tick)
    }

    /// Order keys queued at `tick`, oldest first, by following the links.
    pub fn queue_at(&self, tick: u128) -> Vec<u64> {
        let mut keys = Vec::new();
        let Some(entry) = self.ticks.get(&tick) else {
            return keys;
        };
        let mut cursor = entry.head;
        while let Some(key) = cursor {
            keys.push(key);
            cursor = self.orders.get(&key).and_then(|o| o.next);
        }
        keys
    }
}

// ---------------------------------------------------------------------------
// Exchange operation
// ---------------------------------------------------------------------------

/// One planned fill, produced by the simulation pass and consumed verbatim
/// by the apply pass.
struct PlannedFill {
    owner: String,
    repayment: Repayment,
    collateral_out: u128,
}

impl Vault {
    /// Redeems `credit_to_exchange` credit for collateral by walking the
    /// book from the lowest active tick up to `upper_tick`, consuming each
    /// tick's queue oldest-first.
    ///
    /// Each touched position is reconciled up to the moment of execution,
    /// then has debt repaid at `spot * tick` per collateral unit. The call
    /// either fills the full amount or fails with
    /// [`VaultError::InsufficientLiquidity`] without mutating anything.
    /// Redeemed collateral lands in the redeemer's cash balance; the credit
    /// moves into the vault's account in one aggregate ledger move.
    pub fn exchange(
        &mut self,
        now: u64,
        upper_tick: u128,
        credit_to_exchange: u128,
        redeemer: &str,
        oracle: &dyn Oracle,
        ledger: &mut Ledger,
    ) -> Result<u128, VaultError> {
        self.require_live()?;
        let spot = self.spot_price(oracle)?;

        // -- Simulate ----------------------------------------------------
        // Walk the book on locals only. Any shortfall aborts before a
        // single write.
        let mut remaining = credit_to_exchange;
        let mut fills: Vec<PlannedFill> = Vec::new();

        let ticks: Vec<u128> = self.book.ticks_up_to(upper_tick).collect();
        'walk: for tick in ticks {
            let exec_price = math::wmul(spot, tick)?;
            for key in self.book.queue_at(tick) {
                if remaining == 0 {
                    break 'walk;
                }
                let order = self.book.order(key).expect("queued key resolves");
                let owner = order.owner.clone();

                let (acc, irs) = self.settled_state(now, &owner)?;
                let pos = self.position_of(&owner);
                let debt =
                    position::normal_debt_to_debt(pos.normal_debt, acc, irs.accrued_rebate)?;

                // Fill up to the order's full debt, bounded by what the
                // position's collateral is worth at the execution price.
                let collateral_value = math::wmul(pos.collateral, exec_price)?;
                let fillable = remaining.min(debt).min(collateral_value);
                if fillable == 0 {
                    continue;
                }

                let repayment =
                    position::resolve_repayment(fillable, pos.normal_debt, acc, irs.accrued_rebate)?;
                let collateral_out = math::wdiv(fillable, exec_price)?.min(pos.collateral);

                remaining -= fillable;
                fills.push(PlannedFill {
                    owner,
                    repayment,
                    collateral_out,
                });
            }
            if remaining == 0 {
                break;
            }
        }

        if remaining > 0 {
            return Err(VaultError::InsufficientLiquidity {
                requested: credit_to_exchange,
                available: credit_to_exchange - remaining,
            });
        }

        // Total credit the redeemer owes: the sum of per-fill requirements,
        // which can undercut `credit_to_exchange` only by rebate claims.
        let mut credit_due: u128 = 0;
        for fill in &fills {
            credit_due = credit_due
                .checked_add(fill.repayment.credit_required)
                .ok_or(MathError::Overflow)?;
        }

        // -- Interact ----------------------------------------------------
        // The aggregate ledger move is the last fallible step.
        ledger.move_balance(redeemer, &self.account, credit_due, redeemer)?;

        // -- Commit ------------------------------------------------------
        let mut collateral_redeemed: u128 = 0;
        for fill in &fills {
            let (acc, mut irs) = self.settled_state(now, &fill.owner)?;
            self.commit_settlement(now, acc, &fill.owner, irs.clone());

            let mut pos = self.position_of(&fill.owner);
            pos.collateral -= fill.collateral_out;
            pos.normal_debt -= fill.repayment.normal_debt_delta;
            irs.accrued_rebate -= fill.repayment.rebate_claim;

            self.global_irs.total_normal_debt -= fill.repayment.normal_debt_delta;
            self.global_irs.global_accrued_rebate = self
                .global_irs
                .global_accrued_rebate
                .saturating_sub(fill.repayment.rebate_claim);

            self.write_position(&fill.owner, pos, irs);
            collateral_redeemed += fill.collateral_out;

            // Detach orders whose position no longer carries enough debt.
            self.detach_if_dust(&fill.owner)?;
        }
        self.add_cash(redeemer, collateral_redeemed);

        tracing::info!(
            redeemer,
            credit = credit_to_exchange,
            credit_due,
            collateral_redeemed,
            fills = fills.len(),
            "exchange executed"
        );
        Ok(collateral_redeemed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
