//! # External Collaborators
//!
//! The vault core trusts nothing outside itself. Price feeds, the bad-debt
//! buffer, and the collateral token all sit behind traits, and every call
//! through them is an *interaction* in the checks-effects-interactions
//! sense: internal state is fully written before the call is made, so a
//! collaborator that calls back into the core only ever sees finalized
//! state.
//!
//! The in-memory implementations at the bottom are real enough for the
//! node binary and the test suite; production deployments supply their own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by price oracles.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OracleError {
    /// The oracle has no price for this token.
    #[error("no price feed for token '{0}'")]
    UnknownToken(String),
}

/// Errors surfaced by token bridges.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The source account does not hold enough tokens.
    #[error("account '{account}' holds {held} but {needed} is required")]
    InsufficientBalance {
        /// The account that came up short.
        account: String,
        /// Tokens actually held.
        held: u128,
        /// Tokens the transfer needed.
        needed: u128,
    },

    /// The receiving balance would overflow.
    #[error("balance overflow crediting '{0}'")]
    BalanceOverflow(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A spot-price feed, one price per token, in wad.
pub trait Oracle {
    /// Current spot price of `token` in credit units per collateral unit.
    fn spot(&self, token: &str) -> Result<u128, OracleError>;

    /// Whether the feed for `token` is live and trustworthy. A vault
    /// operation that needs a price refuses to run against a stale feed.
    fn is_valid(&self, token: &str) -> bool;
}

/// The bad-debt backstop. When a full liquidation leaves uncovered debt,
/// the vault asks the buffer to absorb it before socializing the rest.
pub trait Buffer {
    /// Requests `amount` of bailout credit; returns how much was granted,
    /// which may be anything from zero to `amount`.
    fn request_bailout(&mut self, amount: u128) -> u128;
}

/// Fungible-token custody for collateral entering and leaving the system.
pub trait TokenBridge {
    /// Balance of `account` in `token`.
    fn balance_of(&self, token: &str, account: &str) -> u128;

    /// Moves `amount` of `token` from `from` to `to`.
    fn transfer(
        &mut self,
        token: &str,
        from: &str,
        to: &str,
        amount: u128,
    ) -> Result<(), TokenError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// A table of fixed prices, settable at will. The workhorse of the test
/// suite and the node's scripted scenarios.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FixedOracle {
    prices: HashMap<String, u128>,
    invalid: HashMap<String, bool>,
}

impl FixedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the spot price for `token` and marks the feed live.
    pub fn set_price(&mut self, token: &str, price: u128) {
        self.prices.insert(token.to_string(), price);
        self.invalid.insert(token.to_string(), false);
    }

    /// Marks the feed for `token` stale without forgetting the last price.
    pub fn invalidate(&mut self, token: &str) {
        self.invalid.insert(token.to_string(), true);
    }
}

impl Oracle for FixedOracle {
    fn spot(&self, token: &str) -> Result<u128, OracleError> {
        self.prices
            .get(token)
            .copied()
            .ok_or_else(|| OracleError::UnknownToken(token.to_string()))
    }

    fn is_valid(&self, token: &str) -> bool {
        self.prices.contains_key(token) && !self.invalid.get(token).copied().unwrap_or(false)
    }
}

/// A buffer with a fixed reserve. Grants bailouts until the reserve runs
/// dry, then grants whatever is left.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FixedBuffer {
    reserve: u128,
    granted: u128,
}

impl FixedBuffer {
    pub fn new(reserve: u128) -> Self {
        Self {
            reserve,
            granted: 0,
        }
    }

    /// Total bailout credit granted over the buffer's lifetime.
    pub fn total_granted(&self) -> u128 {
        self.granted
    }

    /// Remaining reserve.
    pub fn remaining(&self) -> u128 {
        self.reserve
    }
}

impl Buffer for FixedBuffer {
    fn request_bailout(&mut self, amount: u128) -> u128 {
        let grant = amount.min(self.reserve);
        self.reserve -= grant;
        self.granted += grant;
        grant
    }
}

/// In-memory token balances keyed by `(token, account)`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InMemoryTokens {
    balances: HashMap<(String, String), u128>,
}

impl InMemoryTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits `amount` of `token` to `account` out of thin air. Tests and
    /// scripted scenarios only; a real bridge mints nothing.
    pub fn mint(&mut self, token: &str, account: &str, amount: u128) {
        *self
            .balances
            .entry((token.to_string(), account.to_string()))
            .or_insert(0) += amount;
    }
}

impl TokenBridge for InMemoryTokens {
    fn balance_of(&self, token: &str, account: &str) -> u128 {
        self.balances
            .get(&(token.to_string(), account.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn transfer(
        &mut self,
        token: &str,
        from: &str,
        to: &str,
        amount: u128,
    ) -> Result<(), TokenError> {
        if amount == 0 || from == to {
            return Ok(());
        }
        let held = self.balance_of(token, from);
        if held < amount {
            return Err(TokenError::InsufficientBalance {
                account: from.to_string(),
                held,
                needed: amount,
            });
        }
        let to_held = self.balance_of(token, to);
        let to_new = to_held
            .checked_add(amount)
            .ok_or_else(|| TokenError::BalanceOverflow(to.to_string()))?;

        self.balances
            .insert((token.to_string(), from.to_string()), held - amount);
        self.balances
            .insert((token.to_string(), to.to_string()), to_new);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
