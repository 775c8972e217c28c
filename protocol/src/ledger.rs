//! # Ledger — Credit/Debt Manager
//!
//! The ledger is OBOL's double-entry book. Every account holds one signed
//! wad balance: positive is credit, negative is debt. There is exactly one
//! balance-moving primitive, [`Ledger::move_balance`], and it implements
//! minting, transfer, and repayment all at once — a move that drives the
//! source negative *is* a mint, bounded by that account's debt ceiling.
//! No separate mint path exists, which is what makes the conservation
//! invariant trivial to state: the sum of all balances never changes.
//!
//! ## Permissions
//!
//! Moving out of an account requires being that account, holding a
//! `(owner, delegate)` permission pair, or having been installed by the
//! owner as a permission agent (an address allowed to grant and revoke on
//! the owner's behalf). Administrative operations — ceilings, account
//! ceilings — sit behind a flat capability set of admin addresses, not an
//! inheritance hierarchy.
//!
//! ## Debt ceilings
//!
//! Two caps guard credit creation: each account's `debt_ceiling` bounds how
//! negative that one balance may go, and the ledger-wide
//! `global_debt_ceiling` bounds the sum of all negative-balance magnitudes.
//! `global_debt` is maintained incrementally on every move rather than
//! recomputed; the property tests keep the bookkeeping honest.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during ledger operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The caller has no right to move balance out of `from`.
    #[error("permission denied: {caller} may not move balance of {owner}")]
    PermissionDenied {
        /// Account whose balance was being moved.
        owner: String,
        /// The rejected caller.
        caller: String,
    },

    /// The move would drive `from` below its own debt ceiling.
    #[error("debt ceiling exceeded for {account}: ceiling {ceiling}, resulting debt {resulting}")]
    DebtCeilingExceeded {
        /// The account that would exceed its ceiling.
        account: String,
        /// That account's debt ceiling (magnitude).
        ceiling: u128,
        /// The debt magnitude the move would have produced.
        resulting: u128,
    },

    /// The move would push the sum of all debt past the global ceiling.
    #[error("global debt ceiling exceeded: ceiling {ceiling}, resulting {resulting}")]
    GlobalDebtCeilingExceeded {
        /// The ledger-wide debt ceiling.
        ceiling: u128,
        /// The global debt the move would have produced.
        resulting: u128,
    },

    /// Balance arithmetic left the representable range.
    #[error("balance overflow on account {0}")]
    BalanceOverflow(String),
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// A single ledger account: one signed balance and one debt ceiling.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Signed wad balance. Positive = credit, negative = debt.
    pub balance: i128,

    /// Maximum debt magnitude this account may reach. Zero (the default)
    /// means the balance can never go negative.
    pub debt_ceiling: u128,
}

impl Account {
    /// Magnitude of this account's debt; zero for non-negative balances.
    fn debt(&self) -> u128 {
        if self.balance < 0 {
            self.balance.unsigned_abs()
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The credit/debt manager. Owns every account balance in the system.
///
/// The vault holds its own account here and moves credit exclusively
/// through [`Ledger::move_balance`] — it never reaches into another
/// account's balance directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ledger {
    /// Accounts keyed by address. Created lazily on first touch.
    accounts: HashMap<String, Account>,

    /// `(owner, delegate)` pairs: `delegate` may move balance out of `owner`.
    permissions: HashSet<(String, String)>,

    /// `(owner, agent)` pairs: `agent` may grant/revoke permissions for `owner`.
    agents: HashSet<(String, String)>,

    /// Addresses allowed to set ceilings.
    admins: HashSet<String>,

    /// Cap on the sum of all negative-balance magnitudes.
    global_debt_ceiling: u128,

    /// Current sum of all negative-balance magnitudes. Maintained
    /// incrementally by every move.
    global_debt: u128,
}

impl Ledger {
    /// Creates a ledger with one admin and a global debt ceiling.
    pub fn new(admin: &str, global_debt_ceiling: u128) -> Self {
        let mut admins = HashSet::new();
        admins.insert(admin.to_string());
        Self {
            accounts: HashMap::new(),
            permissions: HashSet::new(),
            agents: HashSet::new(),
            admins,
            global_debt_ceiling,
            global_debt: 0,
        }
    }

    /// Returns an account's signed balance (zero for unknown accounts).
    pub fn balance(&self, account: &str) -> i128 {
        self.accounts.get(account).map(|a| a.balance).unwrap_or(0)
    }

    /// Returns an account's positive credit, clamped at zero.
    pub fn credit(&self, account: &str) -> u128 {
        let b = self.balance(account);
        if b > 0 {
            b as u128
        } else {
            0
        }
    }

    /// Current sum of all debt magnitudes.
    pub fn global_debt(&self) -> u128 {
        self.global_debt
    }

    /// The ledger-wide debt ceiling.
    pub fn global_debt_ceiling(&self) -> u128 {
        self.global_debt_ceiling
    }

    /// Returns `true` if `caller` may move balance out of `owner`.
    pub fn has_permission(&self, owner: &str, caller: &str) -> bool {
        owner == caller
            || self
                .permissions
                .contains(&(owner.to_string(), caller.to_string()))
    }

    // -- Administration -----------------------------------------------------

    /// Grants admin rights to another address. Admin-only.
    pub fn add_admin(&mut self, admin: &str, caller: &str) -> Result<(), LedgerError> {
        self.require_admin(caller)?;
        self.admins.insert(admin.to_string());
        Ok(())
    }

    /// Sets an account's debt ceiling. Admin-only.
    pub fn set_debt_ceiling(
        &mut self,
        account: &str,
        ceiling: u128,
        caller: &str,
    ) -> Result<(), LedgerError> {
        self.require_admin(caller)?;
        self.account_mut(account).debt_ceiling = ceiling;
        tracing::info!(account, ceiling, "debt ceiling set");
        Ok(())
    }

    /// Sets the global debt ceiling. Admin-only. Lowering it below the
    /// current global debt is allowed — it blocks new debt, it doesn't
    /// retroactively fail existing positions.
    pub fn set_global_debt_ceiling(
        &mut self,
        ceiling: u128,
        caller: &str,
    ) -> Result<(), LedgerError> {
        self.require_admin(caller)?;
        self.global_debt_ceiling = ceiling;
        tracing::info!(ceiling, "global debt ceiling set");
        Ok(())
    }

    fn require_admin(&self, caller: &str) -> Result<(), LedgerError> {
        if self.admins.contains(caller) {
            Ok(())
        } else {
            Err(LedgerError::PermissionDenied {
                owner: "<ledger>".to_string(),
                caller: caller.to_string(),
            })
        }
    }

    // -- Permission management ----------------------------------------------

    /// Grants or revokes `delegate`'s right to move `owner`'s balance.
    /// Callable by the owner or one of the owner's permission agents.
    pub fn set_permission(
        &mut self,
        owner: &str,
        delegate: &str,
        allowed: bool,
        caller: &str,
    ) -> Result<(), LedgerError> {
        let caller_is_agent = self
            .agents
            .contains(&(owner.to_string(), caller.to_string()));
        if caller != owner && !caller_is_agent {
            return Err(LedgerError::PermissionDenied {
                owner: owner.to_string(),
                caller: caller.to_string(),
            });
        }
        let key = (owner.to_string(), delegate.to_string());
        if allowed {
            self.permissions.insert(key);
        } else {
            self.permissions.remove(&key);
        }
        Ok(())
    }

    /// Installs or removes a permission agent for `owner`. Owner-only.
    pub fn set_permission_agent(
        &mut self,
        owner: &str,
        agent: &str,
        allowed: bool,
        caller: &str,
    ) -> Result<(), LedgerError> {
        if caller != owner {
            return Err(LedgerError::PermissionDenied {
                owner: owner.to_string(),
                caller: caller.to_string(),
            });
        }
        let key = (owner.to_string(), agent.to_string());
        if allowed {
            self.agents.insert(key);
        } else {
            self.agents.remove(&key);
        }
        Ok(())
    }

    // -- The primitive ------------------------------------------------------

    /// Moves `amount` credit from `from` to `to`.
    ///
    /// The source balance may go negative — that is how credit is minted —
    /// but never further than its debt ceiling, and never in a way that
    /// pushes global debt past the global ceiling. Checks run to completion
    /// before anything is written, so a failed move changes nothing.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::PermissionDenied`] if `caller` lacks rights on `from`.
    /// - [`LedgerError::DebtCeilingExceeded`] / [`LedgerError::GlobalDebtCeilingExceeded`].
    /// - [`LedgerError::BalanceOverflow`] on `i128` range exhaustion.
    pub fn move_balance(
        &mut self,
        from: &str,
        to: &str,
        amount: u128,
        caller: &str,
    ) -> Result<(), LedgerError> {
        if !self.has_permission(from, caller) {
            return Err(LedgerError::PermissionDenied {
                owner: from.to_string(),
                caller: caller.to_string(),
            });
        }
        if amount == 0 || from == to {
            return Ok(());
        }

        let amount_signed =
            i128::try_from(amount).map_err(|_| LedgerError::BalanceOverflow(from.to_string()))?;

        let from_acct = self.accounts.get(from).cloned().unwrap_or_default();
        let to_acct = self.accounts.get(to).cloned().unwrap_or_default();

        let new_from = from_acct
            .balance
            .checked_sub(amount_signed)
            .ok_or_else(|| LedgerError::BalanceOverflow(from.to_string()))?;
        let new_to = to_acct
            .balance
            .checked_add(amount_signed)
            .ok_or_else(|| LedgerError::BalanceOverflow(to.to_string()))?;

        if new_from < 0 {
            let resulting = new_from.unsigned_abs();
            if resulting > from_acct.debt_ceiling {
                return Err(LedgerError::DebtCeilingExceeded {
                    account: from.to_string(),
                    ceiling: from_acct.debt_ceiling,
                    resulting,
                });
            }
        }

        // Global debt is the sum of debt magnitudes; apply the delta of the
        // two touched accounts.
        let old_debt = from_acct.debt() + to_acct.debt();
        let new_debt = debt_of(new_from) + debt_of(new_to);
        let resulting_global = if new_debt >= old_debt {
            let grown = self
                .global_debt
                .checked_add(new_debt - old_debt)
                .ok_or_else(|| LedgerError::BalanceOverflow(from.to_string()))?;
            if grown > self.global_debt_ceiling {
                return Err(LedgerError::GlobalDebtCeilingExceeded {
                    ceiling: self.global_debt_ceiling,
                    resulting: grown,
                });
            }
            grown
        } else {
            self.global_debt.saturating_sub(old_debt - new_debt)
        };

        // Commit.
        self.account_mut(from).balance = new_from;
        self.account_mut(to).balance = new_to;
        self.global_debt = resulting_global;

        tracing::debug!(from, to, amount, caller, "balance moved");
        Ok(())
    }

    /// Iterates all `(address, account)` pairs. Test and snapshot helper.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Account)> {
        self.accounts.iter()
    }

    fn account_mut(&mut self, address: &str) -> &mut Account {
        self.accounts.entry(address.to_string()).or_default()
    }
}

fn debt_of(balance: i128) -> u128 {
    if balance < 0 {
        balance.unsigned_abs()
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
