//! # The Vault
//!
//! One vault manages one collateral token: positions, interest, the
//! delegation pool, the redemption book, and the liquidation engine all
//! hang off the [`Vault`] struct. The vault owns a ledger account (its
//! `account` field) through which every credit movement flows — minting
//! happens by that account going negative against its debt ceiling.
//!
//! ## Architecture
//!
//! ```text
//! position.rs    — Position records, debt conversions, repayment math
//! delegation.rs  — Credit delegation pool: shares, epochs, claims
//! liquidation.rs — Liquidation engine: penalties, bad debt, socialization
//! exchange.rs    — Redemption book: price ticks, FIFO orders, exchange
//! ```
//!
//! ## Transaction discipline
//!
//! Every public operation is all-or-nothing. The pattern, repeated
//! throughout, is:
//!
//! 1. **Check** — settle interest on locals, stage every mutation on local
//!    copies, validate debt floor and collateralization.
//! 2. **Interact** — the ledger move is the last fallible step; if it
//!    fails, nothing internal has been written.
//! 3. **Commit** — write the staged locals back. Nothing in this phase can
//!    fail.
//!
//! External collaborators (oracle, buffer, token bridge) are called only
//! when internal state is already consistent, so a collaborator that calls
//! back into the vault observes finalized state.
//!
//! ## Lazy interest
//!
//! Interest settles lazily: [`Vault::settled_state`] computes a position's
//! up-to-date `(rate_accumulator, PositionIRS)` without writing, and
//! `commit_settlement` is the single place the result lands in storage.
//! Read-only callers get the same numbers through [`Vault::virtual_debt`]
//! and friends.

pub mod delegation;
pub mod exchange;
pub mod liquidation;
pub mod position;

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{
    DEFAULT_DEBT_FLOOR, DEFAULT_LIMIT_ORDER_FLOOR, DEFAULT_LIQUIDATION_DISCOUNT,
    DEFAULT_LIQUIDATION_PENALTY, DEFAULT_LIQUIDATION_RATIO, DEFAULT_TARGET_HEALTH_FACTOR,
    MAX_RATE_PER_SECOND, UNWIND_COOLDOWN_SECS, WAD,
};
use crate::external::{Oracle, OracleError, TokenBridge, TokenError};
use crate::interest::{
    compute_position_irs, GlobalIRS, InterestRateModel, PositionIRS, RateModelError,
};
use crate::ledger::{Ledger, LedgerError};
use crate::math::{self, MathError};

pub use delegation::{DelegationError, DelegationPool, PendingUndelegation};
pub use exchange::{BookError, LimitOrder, PriceTick, TickBook};
pub use liquidation::LiquidationOutcome;
pub use position::{debt_to_normal_debt, normal_debt_to_debt, Position};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from vault operations. Every failure aborts the whole operation;
/// there is no partial application and no internal retry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    /// The vault is paused; only exits are serviced.
    #[error("vault is in emergency mode")]
    EmergencyModeActive,

    /// Unpause was requested but the vault is not paused.
    #[error("vault is not paused")]
    NotPaused,

    /// The oracle feed for this token is invalid or expired.
    #[error("oracle feed for '{0}' is stale")]
    StaleOracle(String),

    /// A cash (or position collateral) balance came up short.
    #[error("'{account}' has {held} cash but {needed} is required")]
    InsufficientCash {
        /// Account whose balance was insufficient.
        account: String,
        /// Units held.
        held: u128,
        /// Units required.
        needed: u128,
    },

    /// The operation would leave a position in the forbidden dust zone.
    #[error("resulting debt {debt} is at or below the floor {floor}")]
    DebtFloorViolation {
        /// Debt the position would be left with.
        debt: u128,
        /// Configured debt floor.
        floor: u128,
    },

    /// The operation would leave the position under-collateralized.
    #[error("position of '{0}' would be unsafe")]
    PositionUnsafe(String),

    /// Liquidation was attempted on a healthy position.
    #[error("position of '{0}' is safe")]
    PositionSafe(String),

    /// The order book cannot fill the requested exchange amount.
    #[error("book can fill {available} of the requested {requested}")]
    InsufficientLiquidity {
        /// Credit the caller asked to exchange.
        requested: u128,
        /// Credit the walk could actually fill.
        available: u128,
    },

    /// The position's debt is too small to keep a limit order.
    #[error("debt {debt} is at or below the limit-order floor {floor}")]
    DebtBelowLimitOrderFloor {
        /// The position's current debt.
        debt: u128,
        /// Configured limit-order floor.
        floor: u128,
    },

    /// A repayment tried to remove more normalized debt than exists.
    #[error("position has {normal_debt} normalized debt, repay asked for {requested}")]
    RepaymentExceedsDebt {
        /// Normalized debt outstanding.
        normal_debt: u128,
        /// Normalized debt the repay tried to remove.
        requested: u128,
    },

    /// The caller lacks the administrative capability for this operation.
    #[error("'{caller}' lacks the {capability:?} capability")]
    CapabilityMissing {
        /// Caller that was refused.
        caller: String,
        /// Capability the operation requires.
        capability: Capability,
    },

    /// `set_parameter` was called with a name the vault does not know.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    /// `set_parameter` was called with a value outside the legal range.
    #[error("value {value} is out of range for parameter '{name}'")]
    InvalidParameterValue {
        /// Parameter name.
        name: String,
        /// Rejected value.
        value: u128,
    },

    /// Arithmetic failure.
    #[error(transparent)]
    Math(#[from] MathError),

    /// The ledger refused a credit movement.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The delegation pool refused an operation.
    #[error(transparent)]
    Delegation(#[from] DelegationError),

    /// The order book refused an operation.
    #[error(transparent)]
    Book(#[from] BookError),

    /// The oracle failed outright (distinct from a stale-but-known feed).
    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// The token bridge refused a collateral movement.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// An interest-rate model failed validation.
    #[error(transparent)]
    RateModel(#[from] RateModelError),
}

// ---------------------------------------------------------------------------
// Parameters & capabilities
// ---------------------------------------------------------------------------

/// Per-vault risk knobs, all retunable through [`Vault::set_parameter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultParams {
    /// Minimum debt per position (exclusive), wad credit.
    pub debt_floor: u128,

    /// Collateral value must be at least `debt * liquidation_ratio`.
    pub liquidation_ratio: u128,

    /// Debt removed per unit of liquidator credit, wad, `>= 1.0`.
    pub liquidation_penalty: u128,

    /// Haircut liquidators buy collateral at, wad, `< 1.0`.
    pub liquidation_discount: u128,

    /// Cap on how healthy a partial liquidation may leave a position.
    pub target_health_factor: u128,

    /// Minimum debt (exclusive) to keep a limit order on the book.
    pub limit_order_floor: u128,
}

impl Default for VaultParams {
    fn default() -> Self {
        Self {
            debt_floor: DEFAULT_DEBT_FLOOR,
            liquidation_ratio: DEFAULT_LIQUIDATION_RATIO,
            liquidation_penalty: DEFAULT_LIQUIDATION_PENALTY,
            liquidation_discount: DEFAULT_LIQUIDATION_DISCOUNT,
            target_health_factor: DEFAULT_TARGET_HEALTH_FACTOR,
            limit_order_floor: DEFAULT_LIMIT_ORDER_FLOOR,
        }
    }
}

/// Administrative capabilities, granted per address. A capability map, not
/// a role hierarchy: an address either holds the exact capability an
/// operation requires or it doesn't.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// May call `set_parameter`.
    SetParameter,

    /// May add and remove price ticks.
    ManageTicks,

    /// May pause and unpause the vault.
    Pause,

    /// May grant and revoke capabilities.
    Govern,
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// A single-collateral credit vault.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vault {
    /// The vault's ledger account. Minting drives this balance negative.
    pub account: String,

    /// Collateral token this vault accepts.
    pub token: String,

    /// Risk parameters.
    pub params: VaultParams,

    /// The interest-rate model, fixed at construction (modulo `base_rate`).
    pub rate_model: InterestRateModel,

    /// Vault-wide interest state.
    pub global_irs: GlobalIRS,

    /// The redemption order book.
    pub book: TickBook,

    /// The credit-delegation pool.
    pub delegation: DelegationPool,

    positions: HashMap<String, Position>,
    position_irs: HashMap<String, PositionIRS>,
    cash: HashMap<String, u128>,
    capabilities: HashMap<String, BTreeSet<Capability>>,
    paused_at: Option<u64>,
    accrued_bad_debt: u128,
}

impl Vault {
    /// Creates a vault. `admin` receives every capability.
    pub fn new(
        account: &str,
        token: &str,
        admin: &str,
        params: VaultParams,
        rate_model: InterestRateModel,
        now: u64,
    ) -> Result<Self, RateModelError> {
        rate_model.validate()?;
        let mut capabilities: HashMap<String, BTreeSet<Capability>> = HashMap::new();
        capabilities.insert(
            admin.to_string(),
            BTreeSet::from([
                Capability::SetParameter,
                Capability::ManageTicks,
                Capability::Pause,
                Capability::Govern,
            ]),
        );
        Ok(Self {
            account: account.to_string(),
            token: token.to_string(),
            params,
            rate_model,
            global_irs: GlobalIRS::new(now),
            book: TickBook::new(),
            delegation: DelegationPool::new(),
            positions: HashMap::new(),
            position_irs: HashMap::new(),
            cash: HashMap::new(),
            capabilities,
            paused_at: None,
            accrued_bad_debt: 0,
        })
    }

    // -- Capabilities --------------------------------------------------------

    /// Whether `caller` holds `capability`.
    pub fn has_capability(&self, caller: &str, capability: Capability) -> bool {
        self.capabilities
            .get(caller)
            .map(|set| set.contains(&capability))
            .unwrap_or(false)
    }

    fn require_capability(&self, caller: &str, capability: Capability) -> Result<(), VaultError> {
        if self.has_capability(caller, capability) {
            Ok(())
        } else {
            Err(VaultError::CapabilityMissing {
                caller: caller.to_string(),
                capability,
            })
        }
    }

    /// Grants `capability` to `grantee`. Requires [`Capability::Govern`].
    pub fn grant_capability(
        &mut self,
        grantee: &str,
        capability: Capability,
        caller: &str,
    ) -> Result<(), VaultError> {
        self.require_capability(caller, Capability::Govern)?;
        self.capabilities
            .entry(grantee.to_string())
            .or_default()
            .insert(capability);
        tracing::info!(grantee, ?capability, "capability granted");
        Ok(())
    }

    /// Revokes `capability` from `grantee`. Requires [`Capability::Govern`].
    pub fn revoke_capability(
        &mut self,
        grantee: &str,
        capability: Capability,
        caller: &str,
    ) -> Result<(), VaultError> {
        self.require_capability(caller, Capability::Govern)?;
        if let Some(set) = self.capabilities.get_mut(grantee) {
            set.remove(&capability);
        }
        tracing::info!(grantee, ?capability, "capability revoked");
        Ok(())
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Whether the vault is paused.
    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Pauses the vault. Mutations other than exits are refused until
    /// unpause. Pausing an already-paused vault keeps the earlier
    /// timestamp, which is the one the unwind cooldown counts from.
    pub fn pause(&mut self, now: u64, caller: &str) -> Result<(), VaultError> {
        self.require_capability(caller, Capability::Pause)?;
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
            tracing::warn!(now, "vault paused");
        }
        Ok(())
    }

    /// Lifts the pause.
    pub fn unpause(&mut self, caller: &str) -> Result<(), VaultError> {
        self.require_capability(caller, Capability::Pause)?;
        if self.paused_at.take().is_none() {
            return Err(VaultError::NotPaused);
        }
        tracing::warn!("vault unpaused");
        Ok(())
    }

    /// Whether the paused vault has sat through the unwind cooldown. The
    /// unwind process itself lives outside this crate.
    pub fn eligible_for_unwind(&self, now: u64) -> bool {
        match self.paused_at {
            Some(at) => now >= at.saturating_add(UNWIND_COOLDOWN_SECS),
            None => false,
        }
    }

    pub(crate) fn require_live(&self) -> Result<(), VaultError> {
        if self.paused_at.is_some() {
            Err(VaultError::EmergencyModeActive)
        } else {
            Ok(())
        }
    }

    // -- Parameters ----------------------------------------------------------

    /// Retunes one risk knob by name. Requires [`Capability::SetParameter`].
    ///
    /// Ledger-side knobs (`debt_ceiling`, `global_debt_ceiling`) are set
    /// through the ledger's own admin surface, since they are ledger state.
    pub fn set_parameter(
        &mut self,
        name: &str,
        value: u128,
        caller: &str,
    ) -> Result<(), VaultError> {
        self.require_capability(caller, Capability::SetParameter)?;

        let reject = || VaultError::InvalidParameterValue {
            name: name.to_string(),
            value,
        };
        match name {
            "base_rate" => {
                if !(WAD..=MAX_RATE_PER_SECOND).contains(&value) {
                    return Err(reject());
                }
                self.rate_model = InterestRateModel::Static {
                    rate_per_second: value,
                };
            }
            "debt_floor" => self.params.debt_floor = value,
            "liquidation_ratio" => {
                if value < WAD {
                    return Err(reject());
                }
                self.params.liquidation_ratio = value;
            }
            "liquidation_penalty" => {
                if value < WAD {
                    return Err(reject());
                }
                self.params.liquidation_penalty = value;
            }
            "liquidation_discount" => {
                if value >= WAD {
                    return Err(reject());
                }
                self.params.liquidation_discount = value;
            }
            "target_health_factor" => {
                if value < WAD {
                    return Err(reject());
                }
                self.params.target_health_factor = value;
            }
            "limit_order_floor" => self.params.limit_order_floor = value,
            _ => return Err(VaultError::UnknownParameter(name.to_string())),
        }
        tracing::info!(name, value, "vault parameter set");
        Ok(())
    }

    // -- Cash (collateral custody) -------------------------------------------

    /// Internal collateral cash balance of `owner`.
    pub fn cash_of(&self, owner: &str) -> u128 {
        self.cash.get(owner).copied().unwrap_or(0)
    }

    pub(crate) fn add_cash(&mut self, owner: &str, amount: u128) {
        *self.cash.entry(owner.to_string()).or_insert(0) += amount;
    }

    pub(crate) fn take_cash(&mut self, owner: &str, amount: u128) -> Result<(), VaultError> {
        let held = self.cash_of(owner);
        if held < amount {
            return Err(VaultError::InsufficientCash {
                account: owner.to_string(),
                held,
                needed: amount,
            });
        }
        self.cash.insert(owner.to_string(), held - amount);
        Ok(())
    }

    /// Pulls `amount` collateral tokens from `owner` into vault custody and
    /// credits their cash balance. The token pull comes first: cash is only
    /// credited for tokens actually received.
    pub fn deposit(
        &mut self,
        owner: &str,
        amount: u128,
        bridge: &mut dyn TokenBridge,
    ) -> Result<(), VaultError> {
        self.require_live()?;
        bridge.transfer(&self.token, owner, &self.account, amount)?;
        self.add_cash(owner, amount);
        tracing::debug!(owner, amount, "collateral deposited");
        Ok(())
    }

    /// Pays out `amount` of `owner`'s cash balance as collateral tokens.
    /// Allowed while paused — exits always work.
    pub fn withdraw(
        &mut self,
        owner: &str,
        amount: u128,
        bridge: &mut dyn TokenBridge,
    ) -> Result<(), VaultError> {
        self.take_cash(owner, amount)?;
        bridge.transfer(&self.token, &self.account, owner, amount)?;
        tracing::debug!(owner, amount, "collateral withdrawn");
        Ok(())
    }

    // -- Interest settlement -------------------------------------------------

    /// Pure: the global accumulator at `now` and `owner`'s reconciled IRS,
    /// with nothing written back.
    pub fn settled_state(&self, now: u64, owner: &str) -> Result<(u128, PositionIRS), VaultError> {
        let acc = self
            .global_irs
            .accumulator_at(&self.rate_model, now, self.delegation.total_delegated())?;
        let irs = self.irs_of(owner);
        let factor = self.rebate_factor_of(&irs);
        let settled = compute_position_irs(&irs, self.position_of(owner).normal_debt, factor, acc)?;
        Ok((acc, settled))
    }

    /// Writes a settlement produced by [`Vault::settled_state`] back into
    /// storage and rolls the accrual delta into the global rebate total.
    /// Infallible — call only with values from `settled_state` at the same
    /// `now`.
    pub(crate) fn commit_settlement(
        &mut self,
        now: u64,
        acc: u128,
        owner: &str,
        settled: PositionIRS,
    ) {
        let old = self.irs_of(owner).accrued_rebate;
        let accrued = settled.accrued_rebate.saturating_sub(old);
        self.global_irs.global_accrued_rebate = self
            .global_irs
            .global_accrued_rebate
            .saturating_add(accrued);
        self.global_irs.rate_accumulator = acc;
        self.global_irs.last_updated = now;
        self.position_irs.insert(owner.to_string(), settled);
    }

    /// Settles `owner`'s interest state at `now` and persists it.
    pub fn settle_irs(&mut self, now: u64, owner: &str) -> Result<PositionIRS, VaultError> {
        let (acc, settled) = self.settled_state(now, owner)?;
        self.commit_settlement(now, acc, owner, settled.clone());
        Ok(settled)
    }

    /// The rebate factor currently applying to a position: its order's
    /// tick factor, or zero without an order.
    pub(crate) fn rebate_factor_of(&self, irs: &PositionIRS) -> u128 {
        irs.limit_order
            .and_then(|key| self.book.order(key))
            .and_then(|order| self.book.tick_rebate_factor(order.tick))
            .unwrap_or(0)
    }

    // -- Views ---------------------------------------------------------------

    /// `owner`'s position (zeroed if none exists).
    pub fn position_of(&self, owner: &str) -> Position {
        self.positions.get(owner).copied().unwrap_or_default()
    }

    /// `owner`'s stored interest state (default if none exists).
    pub fn irs_of(&self, owner: &str) -> PositionIRS {
        self.position_irs.get(owner).cloned().unwrap_or_default()
    }

    /// Pure view: `owner`'s IRS as it would be after settling at `now`.
    pub fn virtual_irs(&self, now: u64, owner: &str) -> Result<PositionIRS, VaultError> {
        Ok(self.settled_state(now, owner)?.1)
    }

    /// Pure view: `owner`'s real debt at `now`.
    pub fn virtual_debt(&self, now: u64, owner: &str) -> Result<u128, VaultError> {
        let (acc, irs) = self.settled_state(now, owner)?;
        let pos = self.position_of(owner);
        Ok(position::normal_debt_to_debt(
            pos.normal_debt,
            acc,
            irs.accrued_rebate,
        )?)
    }

    /// Pure view: `owner`'s health factor at `now`, wad. A debt-free
    /// position reports `u128::MAX`. Health 1.0 is the liquidation edge.
    pub fn health_factor(
        &self,
        now: u64,
        owner: &str,
        oracle: &dyn Oracle,
    ) -> Result<u128, VaultError> {
        let debt = self.virtual_debt(now, owner)?;
        if debt == 0 {
            return Ok(u128::MAX);
        }
        let spot = self.spot_price(oracle)?;
        let pos = self.position_of(owner);
        let value = math::wmul(pos.collateral, spot)?;
        let capacity = math::wdiv(value, self.params.liquidation_ratio)?;
        Ok(math::wdiv(capacity, debt)?)
    }

    /// Bad debt socialized against the pool over the vault's lifetime,
    /// net of buffer bailouts.
    pub fn accrued_bad_debt(&self) -> u128 {
        self.accrued_bad_debt
    }

    pub(crate) fn note_bad_debt(&mut self, amount: u128) {
        self.accrued_bad_debt = self.accrued_bad_debt.saturating_add(amount);
    }

    pub(crate) fn spot_price(&self, oracle: &dyn Oracle) -> Result<u128, VaultError> {
        if !oracle.is_valid(&self.token) {
            return Err(VaultError::StaleOracle(self.token.clone()));
        }
        Ok(oracle.spot(&self.token)?)
    }

    pub(crate) fn write_position(&mut self, owner: &str, pos: Position, irs: PositionIRS) {
        self.positions.insert(owner.to_string(), pos);
        self.position_irs.insert(owner.to_string(), irs);
    }

    // -- modify_position -----------------------------------------------------

    /// The single mutation path for positions: collateral in or out, debt
    /// up or down, in one atomic operation.
    ///
    /// `delta_collateral > 0` pulls from `collateralizer`'s cash into the
    /// position; negative pushes back out. `delta_normal_debt > 0` mints
    /// `delta * accumulator` credit to `creditor`; negative repays from
    /// `creditor`, net of the position's pro-rata rebate claim.
    ///
    /// The safety check is skipped only when the operation cannot make the
    /// position riskier (collateral non-decreasing and debt non-increasing);
    /// the debt floor is checked unconditionally.
    #[allow(clippy::too_many_arguments)]
    pub fn modify_position(
        &mut self,
        now: u64,
        owner: &str,
        collateralizer: &str,
        creditor: &str,
        delta_collateral: i128,
        delta_normal_debt: i128,
        caller: &str,
        oracle: &dyn Oracle,
        ledger: &mut Ledger,
    ) -> Result<(), VaultError> {
        self.require_live()?;

        // Acting on someone else's position or cash needs their delegated
        // permission, tracked in the ledger's permission table.
        for principal in [owner, collateralizer] {
            if caller != principal && !ledger.has_permission(principal, caller) {
                return Err(VaultError::Ledger(LedgerError::PermissionDenied {
                    owner: principal.to_string(),
                    caller: caller.to_string(),
                }));
            }
        }

        // -- Check: stage everything on locals ---------------------------
        let (acc, settled) = self.settled_state(now, owner)?;
        let mut irs = settled.clone();
        let mut pos = self.position_of(owner);

        if delta_collateral > 0 {
            let amount = delta_collateral as u128;
            let held = self.cash_of(collateralizer);
            if held < amount {
                return Err(VaultError::InsufficientCash {
                    account: collateralizer.to_string(),
                    held,
                    needed: amount,
                });
            }
            pos.collateral = pos
                .collateral
                .checked_add(amount)
                .ok_or(MathError::Overflow)?;
        } else if delta_collateral < 0 {
            let amount = delta_collateral.unsigned_abs();
            pos.collateral =
                pos.collateral
                    .checked_sub(amount)
                    .ok_or(VaultError::InsufficientCash {
                        account: owner.to_string(),
                        held: pos.collateral,
                        needed: amount,
                    })?;
        }

        let mut credit_minted: u128 = 0;
        let mut credit_repaid: u128 = 0;
        let mut rebate_claim: u128 = 0;
        if delta_normal_debt > 0 {
            let delta = delta_normal_debt as u128;
            pos.normal_debt = pos
                .normal_debt
                .checked_add(delta)
                .ok_or(MathError::Overflow)?;
            credit_minted = math::wmul(delta, acc)?;
        } else if delta_normal_debt < 0 {
            let delta = delta_normal_debt.unsigned_abs();
            if delta > pos.normal_debt {
                return Err(VaultError::RepaymentExceedsDebt {
                    normal_debt: pos.normal_debt,
                    requested: delta,
                });
            }
            let repayment =
                position::resolve_normalized_repayment(delta, pos.normal_debt, acc, irs.accrued_rebate)?;
            rebate_claim = repayment.rebate_claim;
            credit_repaid = repayment.credit_required;
            pos.normal_debt -= delta;
            irs.accrued_rebate -= rebate_claim;
        }

        // -- Validate -----------------------------------------------------
        let debt_after = position::normal_debt_to_debt(pos.normal_debt, acc, irs.accrued_rebate)?;
        if pos.normal_debt != 0 && debt_after <= self.params.debt_floor {
            return Err(VaultError::DebtFloorViolation {
                debt: debt_after,
                floor: self.params.debt_floor,
            });
        }

        let strictly_safer = delta_collateral >= 0 && delta_normal_debt <= 0;
        if !strictly_safer {
            let spot = self.spot_price(oracle)?;
            let value = math::wmul(pos.collateral, spot)?;
            if math::wdiv(value, self.params.liquidation_ratio)? < debt_after {
                return Err(VaultError::PositionUnsafe(owner.to_string()));
            }
        }

        // -- Interact: ledger moves are the last fallible steps ----------
        if credit_minted > 0 {
            let vault_account = self.account.clone();
            ledger.move_balance(&vault_account, creditor, credit_minted, &vault_account)?;
        }
        if credit_repaid > 0 {
            ledger.move_balance(creditor, &self.account, credit_repaid, caller)?;
        }

        // -- Commit -------------------------------------------------------
        self.commit_settlement(now, acc, owner, settled);
        if rebate_claim > 0 {
            self.global_irs.global_accrued_rebate = self
                .global_irs
                .global_accrued_rebate
                .saturating_sub(rebate_claim);
        }
        if delta_normal_debt > 0 {
            self.global_irs.total_normal_debt += delta_normal_debt as u128;
        } else if delta_normal_debt < 0 {
            self.global_irs.total_normal_debt -= delta_normal_debt.unsigned_abs();
        }
        if delta_collateral > 0 {
            let taken = self.take_cash(collateralizer, delta_collateral as u128);
            debug_assert!(taken.is_ok(), "cash balance verified in the check phase");
        } else if delta_collateral < 0 {
            self.add_cash(collateralizer, delta_collateral.unsigned_abs());
        }
        self.write_position(owner, pos, irs);
        self.detach_if_dust(owner)?;

        tracing::debug!(
            owner,
            delta_collateral,
            delta_normal_debt,
            debt_after,
            "position modified"
        );
        Ok(())
    }

    // -- Limit orders ----------------------------------------------------

    /// Activates a price tick. Requires [`Capability::ManageTicks`].
    pub fn add_limit_price_tick(&mut self, tick: u128, caller: &str) -> Result<(), VaultError> {
        self.require_capability(caller, Capability::ManageTicks)?;
        self.book.add_tick(tick)?;
        tracing::info!(tick, "price tick added");
        Ok(())
    }

    /// Deactivates an empty price tick. Requires [`Capability::ManageTicks`].
    pub fn remove_limit_price_tick(&mut self, tick: u128, caller: &str) -> Result<(), VaultError> {
        self.require_capability(caller, Capability::ManageTicks)?;
        self.book.remove_tick(tick)?;
        tracing::info!(tick, "price tick removed");
        Ok(())
    }

    /// Queues `owner`'s position at `tick`. Interest up to now accrues at
    /// the old factor; the new factor applies from this moment.
    pub fn create_limit_order(
        &mut self,
        now: u64,
        owner: &str,
        tick: u128,
    ) -> Result<u64, VaultError> {
        self.require_live()?;
        let (acc, settled) = self.settled_state(now, owner)?;
        let debt = position::normal_debt_to_debt(
            self.position_of(owner).normal_debt,
            acc,
            settled.accrued_rebate,
        )?;
        if debt <= self.params.limit_order_floor {
            return Err(VaultError::DebtBelowLimitOrderFloor {
                debt,
                floor: self.params.limit_order_floor,
            });
        }

        let key = self.book.create_order(owner, tick)?;
        let mut irs = settled;
        irs.limit_order = Some(key);
        self.commit_settlement(now, acc, owner, irs);
        tracing::debug!(owner, tick, key, "limit order created");
        Ok(key)
    }

    /// Detaches `owner`'s order. Accrued rebate is kept — it is claimed on
    /// the next repayment, not forfeited by leaving the book.
    pub fn cancel_limit_order(&mut self, now: u64, owner: &str) -> Result<(), VaultError> {
        let (acc, settled) = self.settled_state(now, owner)?;
        self.book.cancel_order(owner)?;
        let mut irs = settled;
        irs.limit_order = None;
        self.commit_settlement(now, acc, owner, irs);
        tracing::debug!(owner, "limit order cancelled");
        Ok(())
    }

    /// Drops `owner`'s order if their debt has fallen to the limit-order
    /// floor. Called after every debt-reducing mutation.
    pub(crate) fn detach_if_dust(&mut self, owner: &str) -> Result<(), VaultError> {
        let irs = self.irs_of(owner);
        let Some(key) = irs.limit_order else {
            return Ok(());
        };
        let debt = position::normal_debt_to_debt(
            self.position_of(owner).normal_debt,
            self.global_irs.rate_accumulator,
            irs.accrued_rebate,
        )?;
        if debt <= self.params.limit_order_floor {
            self.book.unlink(key);
            let mut irs = irs;
            irs.limit_order = None;
            self.position_irs.insert(owner.to_string(), irs);
            tracing::debug!(owner, "dust limit order detached");
        }
        Ok(())
    }

    // -- Delegation ------------------------------------------------------

    /// Supplies credit to the vault's lending pool.
    pub fn delegate_credit(
        &mut self,
        delegator: &str,
        amount: u128,
        ledger: &mut Ledger,
    ) -> Result<u128, VaultError> {
        self.require_live()?;
        let account = self.account.clone();
        Ok(self
            .delegation
            .delegate(ledger, &account, delegator, amount)?)
    }

    /// Locks shares for undelegation. Allowed while paused.
    pub fn undelegate_credit(
        &mut self,
        delegator: &str,
        shares: u128,
        now: u64,
    ) -> Result<(), VaultError> {
        Ok(self.delegation.undelegate(delegator, shares, now)?)
    }

    /// Claims a matured undelegation. Allowed while paused.
    pub fn claim_undelegated_credit(
        &mut self,
        delegator: &str,
        now: u64,
        ledger: &mut Ledger,
    ) -> Result<u128, VaultError> {
        let account = self.account.clone();
        Ok(self.delegation.claim(ledger, &account, delegator, now)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{FixedOracle, InMemoryTokens};

    const ADMIN: &str = "obol:admin";
    const VAULT: &str = "obol:vault";
    const ALICE: &str = "obol:alice";
    const GOLD: &str = "gold";

    fn setup() -> (Vault, Ledger, FixedOracle, InMemoryTokens) {
        let mut ledger = Ledger::new(ADMIN, 1_000_000 * WAD);
        ledger
            .set_debt_ceiling(VAULT, 1_000_000 * WAD, ADMIN)
            .unwrap();

        let vault = Vault::new(
            VAULT,
            GOLD,
            ADMIN,
            VaultParams::default(),
            InterestRateModel::Static {
                rate_per_second: crate::config::RATE_5_PERCENT_PER_YEAR,
            },
            0,
        )
        .unwrap();

        let mut oracle = FixedOracle::new();
        oracle.set_price(GOLD, WAD); // 1 credit per collateral unit

        let mut tokens = InMemoryTokens::new();
        tokens.mint(GOLD, ALICE, 10_000 * WAD);

        (vault, ledger, oracle, tokens)
    }

    fn open_position(
        vault: &mut Vault,
        ledger: &mut Ledger,
        oracle: &FixedOracle,
        tokens: &mut InMemoryTokens,
        collateral: u128,
        normal_debt: u128,
    ) {
        vault.deposit(ALICE, collateral, tokens).unwrap();
        vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                ALICE,
                collateral as i128,
                normal_debt as i128,
                ALICE,
                oracle,
                ledger,
            )
            .unwrap();
    }

    #[test]
    fn borrow_mints_credit_to_creditor() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        open_position(
            &mut vault,
            &mut ledger,
            &oracle,
            &mut tokens,
            1_000 * WAD,
            500 * WAD,
        );

        let pos = vault.position_of(ALICE);
        assert_eq!(pos.collateral, 1_000 * WAD);
        assert_eq!(pos.normal_debt, 500 * WAD);
        assert_eq!(ledger.credit(ALICE), 500 * WAD);
        assert_eq!(ledger.balance(VAULT), -(500 * WAD as i128));
        assert_eq!(vault.global_irs.total_normal_debt, 500 * WAD);
    }

    #[test]
    fn collateral_cash_is_debited_exactly_once() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        vault.deposit(ALICE, 1_000 * WAD, &mut tokens).unwrap();
        vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                ALICE,
                (600 * WAD) as i128,
                (200 * WAD) as i128,
                ALICE,
                &oracle,
                &mut ledger,
            )
            .unwrap();
        assert_eq!(vault.cash_of(ALICE), 400 * WAD);
        assert_eq!(vault.position_of(ALICE).collateral, 600 * WAD);

        // Pulling more than the remaining cash fails during the check
        // phase; no cash moves and the position is untouched.
        let err = vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                ALICE,
                (500 * WAD) as i128,
                0,
                ALICE,
                &oracle,
                &mut ledger,
            )
            .unwrap_err();
        assert_eq!(
            err,
            VaultError::InsufficientCash {
                account: ALICE.to_string(),
                held: 400 * WAD,
                needed: 500 * WAD,
            }
        );
        assert_eq!(vault.cash_of(ALICE), 400 * WAD);
        assert_eq!(vault.position_of(ALICE).collateral, 600 * WAD);
    }

    #[test]
    fn withdraw_more_collateral_than_cash_fails() {
        let (mut vault, _ledger, _oracle, mut tokens) = setup();
        let err = vault.withdraw(ALICE, WAD, &mut tokens).unwrap_err();
        assert!(matches!(err, VaultError::InsufficientCash { .. }));
    }

    #[test]
    fn debt_floor_refuses_dust_positions() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        vault.deposit(ALICE, 1_000 * WAD, &mut tokens).unwrap();
        // 50 debt is below the 100 floor.
        let err = vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                ALICE,
                (1_000 * WAD) as i128,
                (50 * WAD) as i128,
                ALICE,
                &oracle,
                &mut ledger,
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::DebtFloorViolation { .. }));
    }

    #[test]
    fn unsafe_borrow_is_refused() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        vault.deposit(ALICE, 1_000 * WAD, &mut tokens).unwrap();
        // 1000 collateral at price 1.0 and ratio 1.25 supports 800 debt.
        let err = vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                ALICE,
                (1_000 * WAD) as i128,
                (900 * WAD) as i128,
                ALICE,
                &oracle,
                &mut ledger,
            )
            .unwrap_err();
        assert_eq!(err, VaultError::PositionUnsafe(ALICE.to_string()));
    }

    #[test]
    fn safety_check_skipped_when_strictly_safer() {
        let (mut vault, mut ledger, mut oracle, mut tokens) = setup();
        open_position(
            &mut vault,
            &mut ledger,
            &oracle,
            &mut tokens,
            1_000 * WAD,
            500 * WAD,
        );

        // Price collapses; the position is now unsafe, but pure repayment
        // must still be allowed — and it needs no oracle at all.
        oracle.set_price(GOLD, WAD / 10);
        oracle.invalidate(GOLD);
        vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                ALICE,
                0,
                -((100 * WAD) as i128),
                ALICE,
                &oracle,
                &mut ledger,
            )
            .unwrap();
        assert_eq!(vault.position_of(ALICE).normal_debt, 400 * WAD);
    }

    #[test]
    fn full_repay_clears_position() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        open_position(
            &mut vault,
            &mut ledger,
            &oracle,
            &mut tokens,
            1_000 * WAD,
            500 * WAD,
        );

        vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                ALICE,
                -((1_000 * WAD) as i128),
                -((500 * WAD) as i128),
                ALICE,
                &oracle,
                &mut ledger,
            )
            .unwrap();
        let pos = vault.position_of(ALICE);
        assert_eq!(pos, Position::default());
        assert_eq!(ledger.balance(ALICE), 0);
        assert_eq!(ledger.balance(VAULT), 0);
        assert_eq!(vault.cash_of(ALICE), 1_000 * WAD);
    }

    #[test]
    fn stale_oracle_blocks_risky_mutations() {
        let (mut vault, mut ledger, mut oracle, mut tokens) = setup();
        vault.deposit(ALICE, 1_000 * WAD, &mut tokens).unwrap();
        oracle.invalidate(GOLD);
        let err = vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                ALICE,
                (1_000 * WAD) as i128,
                (500 * WAD) as i128,
                ALICE,
                &oracle,
                &mut ledger,
            )
            .unwrap_err();
        assert_eq!(err, VaultError::StaleOracle(GOLD.to_string()));
    }

    #[test]
    fn pause_blocks_mutations_but_not_exits() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        open_position(
            &mut vault,
            &mut ledger,
            &oracle,
            &mut tokens,
            1_000 * WAD,
            500 * WAD,
        );
        vault.deposit(ALICE, 100 * WAD, &mut tokens).unwrap();

        vault.pause(1_000, ADMIN).unwrap();
        let err = vault
            .modify_position(1_000, ALICE, ALICE, ALICE, 0, 10, ALICE, &oracle, &mut ledger)
            .unwrap_err();
        assert_eq!(err, VaultError::EmergencyModeActive);
        let err = vault.deposit(ALICE, WAD, &mut tokens).unwrap_err();
        assert_eq!(err, VaultError::EmergencyModeActive);

        // Withdrawing free cash still works.
        vault.withdraw(ALICE, 100 * WAD, &mut tokens).unwrap();

        assert!(!vault.eligible_for_unwind(1_000));
        assert!(vault.eligible_for_unwind(1_000 + UNWIND_COOLDOWN_SECS));

        vault.unpause(ADMIN).unwrap();
        assert_eq!(vault.unpause(ADMIN).unwrap_err(), VaultError::NotPaused);
    }

    #[test]
    fn capabilities_gate_admin_surface() {
        let (mut vault, _ledger, _oracle, _tokens) = setup();
        let err = vault.set_parameter("debt_floor", WAD, ALICE).unwrap_err();
        assert!(matches!(err, VaultError::CapabilityMissing { .. }));

        vault
            .grant_capability(ALICE, Capability::SetParameter, ADMIN)
            .unwrap();
        vault.set_parameter("debt_floor", WAD, ALICE).unwrap();
        assert_eq!(vault.params.debt_floor, WAD);

        vault
            .revoke_capability(ALICE, Capability::SetParameter, ADMIN)
            .unwrap();
        assert!(vault.set_parameter("debt_floor", WAD, ALICE).is_err());
    }

    #[test]
    fn set_parameter_validates_ranges() {
        let (mut vault, _ledger, _oracle, _tokens) = setup();
        assert!(matches!(
            vault.set_parameter("liquidation_discount", WAD, ADMIN),
            Err(VaultError::InvalidParameterValue { .. })
        ));
        assert!(matches!(
            vault.set_parameter("base_rate", WAD - 1, ADMIN),
            Err(VaultError::InvalidParameterValue { .. })
        ));
        assert!(matches!(
            vault.set_parameter("no_such_knob", WAD, ADMIN),
            Err(VaultError::UnknownParameter(_))
        ));
    }

    #[test]
    fn interest_grows_virtual_debt() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        open_position(
            &mut vault,
            &mut ledger,
            &oracle,
            &mut tokens,
            1_000 * WAD,
            500 * WAD,
        );

        let year = crate::config::SECONDS_PER_YEAR;
        let debt = vault.virtual_debt(year, ALICE).unwrap();
        // ~5% growth.
        let expected = 525 * WAD;
        assert!(debt.abs_diff(expected) < WAD / 10, "debt {}", debt);

        // The view wrote nothing.
        assert_eq!(vault.global_irs.rate_accumulator, WAD);
        assert_eq!(vault.global_irs.last_updated, 0);
    }

    #[test]
    fn acting_on_foreign_position_needs_permission() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        open_position(
            &mut vault,
            &mut ledger,
            &oracle,
            &mut tokens,
            1_000 * WAD,
            500 * WAD,
        );

        let err = vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                "obol:bob",
                0,
                (100 * WAD) as i128,
                "obol:bob",
                &oracle,
                &mut ledger,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::Ledger(LedgerError::PermissionDenied { .. })
        ));

        // With delegated permission the same call succeeds.
        ledger.set_permission(ALICE, "obol:bob", true, ALICE).unwrap();
        vault
            .modify_position(
                0,
                ALICE,
                ALICE,
                "obol:bob",
                0,
                (100 * WAD) as i128,
                "obol:bob",
                &oracle,
                &mut ledger,
            )
            .unwrap();
        assert_eq!(ledger.credit("obol:bob"), 100 * WAD);
    }

    #[test]
    fn health_factor_view() {
        let (mut vault, mut ledger, oracle, mut tokens) = setup();
        assert_eq!(vault.health_factor(0, ALICE, &oracle).unwrap(), u128::MAX);

        open_position(
            &mut vault,
            &mut ledger,
            &oracle,
            &mut tokens,
            1_000 * WAD,
            500 * WAD,
        );
        // capacity = 1000 / 1.25 = 800; health = 800 / 500 = 1.6.
        let hf = vault.health_factor(0, ALICE, &oracle).unwrap();
        assert_eq!(hf, 16 * WAD / 10);
    }
}
