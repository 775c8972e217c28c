//! # Credit Delegation
//!
//! Delegators supply credit to a vault's lending pool and receive shares
//! priced at `pool_credit / total_shares`. Leaving is a two-phase affair:
//! `undelegate` locks shares into a pending record tagged with the current
//! epoch, and `claim` pays out only after the epoch delay has passed.
//!
//! The interesting case is a claim against a pool whose liquid credit has
//! been lent out. Instead of reverting (which turns high utilization into a
//! bank run where the fastest claimant wins), the claim burns shares and
//! pays credit *proportionally* to what is actually available; the rest of
//! the locked shares stay pending and remain claimable as liquidity
//! returns.
//!
//! Bad debt socialization writes down `pool_credit` directly, which lowers
//! the share price for every delegator at once.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EPOCH_DURATION_SECS, UNDELEGATION_DELAY_EPOCHS, WAD};
use crate::ledger::{Ledger, LedgerError};
use crate::math::{self, MathError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the delegation pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DelegationError {
    /// The delegator holds fewer shares than they tried to lock.
    #[error("holds {held} shares, tried to undelegate {requested}")]
    InsufficientShares {
        /// Shares actually held.
        held: u128,
        /// Shares requested for undelegation.
        requested: u128,
    },

    /// No pending undelegation exists for this delegator.
    #[error("no pending undelegation for '{0}'")]
    NoPendingUndelegation(String),

    /// The epoch delay has not yet elapsed.
    #[error("undelegation from epoch {request_epoch} not claimable in epoch {current_epoch}")]
    UndelegationNotMature {
        /// Epoch the undelegation was requested in.
        request_epoch: u64,
        /// Current epoch.
        current_epoch: u64,
    },

    /// Arithmetic failure inside share-price math.
    #[error(transparent)]
    Math(#[from] MathError),

    /// Ledger refused the credit movement.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

/// Shares locked for undelegation, waiting out the epoch delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUndelegation {
    /// Shares locked.
    pub shares: u128,

    /// Epoch the lock was made (or last topped up) in.
    pub request_epoch: u64,
}

/// The vault's credit-delegation pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DelegationPool {
    /// Outstanding shares, including shares locked in pending records.
    pub total_shares: u128,

    /// Credit backing the shares. Grows on delegation, shrinks on claims
    /// and on bad-debt socialization.
    pub pool_credit: u128,

    /// Unlocked shares per delegator.
    shares: HashMap<String, u128>,

    /// Locked shares per delegator, at most one record each.
    pending: HashMap<String, PendingUndelegation>,
}

/// The epoch containing timestamp `now`.
pub fn epoch_at(now: u64) -> u64 {
    now / EPOCH_DURATION_SECS
}

impl DelegationPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit per share, wad. An empty pool prices shares at 1.0 so the
    /// first delegator gets shares equal to their credit.
    pub fn share_price(&self) -> Result<u128, MathError> {
        if self.total_shares == 0 {
            Ok(WAD)
        } else {
            math::wdiv(self.pool_credit, self.total_shares)
        }
    }

    /// Unlocked shares held by `delegator`.
    pub fn shares_of(&self, delegator: &str) -> u128 {
        self.shares.get(delegator).copied().unwrap_or(0)
    }

    /// The pending undelegation record for `delegator`, if any.
    pub fn pending_of(&self, delegator: &str) -> Option<PendingUndelegation> {
        self.pending.get(delegator).copied()
    }

    /// Total credit delegated to the pool. Feeds the utilization-based
    /// rate model.
    pub fn total_delegated(&self) -> u128 {
        self.pool_credit
    }

    /// Supplies `amount` credit to the pool, minting shares at the current
    /// price. The credit moves from the delegator's ledger account into
    /// `vault_account`.
    pub fn delegate(
        &mut self,
        ledger: &mut Ledger,
        vault_account: &str,
        delegator: &str,
        amount: u128,
    ) -> Result<u128, DelegationError> {
        let price = self.share_price()?;
        let minted = math::wdiv(amount, price)?;

        ledger.move_balance(delegator, vault_account, amount, delegator)?;

        self.pool_credit = self
            .pool_credit
            .checked_add(amount)
            .ok_or(MathError::Overflow)?;
        self.total_shares = self
            .total_shares
            .checked_add(minted)
            .ok_or(MathError::Overflow)?;
        *self.shares.entry(delegator.to_string()).or_insert(0) += minted;

        tracing::debug!(delegator, amount, minted, "credit delegated");
        Ok(minted)
    }

    /// Locks `shares` into a pending record tagged with the current epoch.
    /// No credit moves. Topping up an existing record re-tags it with the
    /// current epoch, restarting the delay for the whole lock.
    pub fn undelegate(
        &mut self,
        delegator: &str,
        shares: u128,
        now: u64,
    ) -> Result<(), DelegationError> {
        let held = self.shares_of(delegator);
        if shares > held {
            return Err(DelegationError::InsufficientShares {
                held,
                requested: shares,
            });
        }
        self.shares.insert(delegator.to_string(), held - shares);

        let epoch = epoch_at(now);
        let entry = self
            .pending
            .entry(delegator.to_string())
            .or_insert(PendingUndelegation {
                shares: 0,
                request_epoch: epoch,
            });
        entry.shares += shares;
        entry.request_epoch = epoch;

        tracing::debug!(delegator, shares, epoch, "undelegation requested");
        Ok(())
    }

    /// Pays out a matured pending undelegation, proportionally reduced if
    /// the vault account lacks liquid credit. Returns the credit paid;
    /// unredeemed shares stay pending for a later claim.
    pub fn claim(
        &mut self,
        ledger: &mut Ledger,
        vault_account: &str,
        delegator: &str,
        now: u64,
    ) -> Result<u128, DelegationError> {
        let record = self
            .pending
            .get(delegator)
            .copied()
            .ok_or_else(|| DelegationError::NoPendingUndelegation(delegator.to_string()))?;

        let current_epoch = epoch_at(now);
        if current_epoch < record.request_epoch + UNDELEGATION_DELAY_EPOCHS {
            return Err(DelegationError::UndelegationNotMature {
                request_epoch: record.request_epoch,
                current_epoch,
            });
        }

        let price = self.share_price()?;
        let required = math::wmul(record.shares, price)?;
        let available = ledger.credit(vault_account);

        let (burned, paid) = if available >= required {
            (record.shares, required)
        } else if required == 0 {
            (record.shares, 0)
        } else {
            // Liquidity shortfall: burn and pay pro-rata, keep the rest
            // locked so later claims see the same rules.
            let scale = math::wdiv(available, required)?;
            (math::wmul(record.shares, scale)?, available)
        };

        // Effects before the ledger interaction.
        let remaining = record.shares - burned;
        if remaining == 0 {
            self.pending.remove(delegator);
        } else {
            self.pending.insert(
                delegator.to_string(),
                PendingUndelegation {
                    shares: remaining,
                    request_epoch: record.request_epoch,
                },
            );
        }
        self.total_shares -= burned;
        self.pool_credit = self.pool_credit.saturating_sub(paid);

        ledger.move_balance(vault_account, delegator, paid, vault_account)?;

        tracing::debug!(delegator, burned, paid, remaining, "undelegation claimed");
        Ok(paid)
    }

    /// Writes `amount` of socialized bad debt down against the pool,
    /// lowering the share price for all delegators at once. Returns the
    /// amount actually absorbed (capped at the pool's credit).
    pub fn socialize_bad_debt(&mut self, amount: u128) -> u128 {
        let absorbed = amount.min(self.pool_credit);
        self.pool_credit -= absorbed;
        if absorbed > 0 {
            tracing::warn!(absorbed, "bad debt socialized against delegation pool");
        }
        absorbed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
