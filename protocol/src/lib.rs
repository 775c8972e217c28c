// Copyright (c) 2026 Obol Labs. MIT License.
// See LICENSE for details.

//! # OBOL Protocol — Core Library
//!
//! OBOL is a credit protocol built on one deliberately boring primitive: a
//! signed-balance ledger where minting is just a balance going negative
//! against a ceiling. Everything else — interest, collateral, liquidation,
//! redemption — is machinery arranged around that primitive.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of a
//! credit system:
//!
//! - **config** — Protocol constants and default risk parameters.
//! - **math** — Checked wad (1e18) fixed-point arithmetic with 256-bit
//!   intermediates. No floats, no saturation, no surprises.
//! - **ledger** — The double-entry core: one `move_balance` primitive,
//!   debt ceilings, delegated permissions.
//! - **interest** — Rate models and the compounding rate accumulator.
//! - **external** — Traits for the untrusted outside world: oracles, the
//!   bad-debt buffer, token custody.
//! - **vault** — Positions, credit delegation, the liquidation engine, and
//!   the tick-based redemption book.
//!
//! ## Design Philosophy
//!
//! 1. Every operation is all-or-nothing. Partial state is a bug.
//! 2. Interest is lazy: compute is pure, settle is explicit.
//! 3. Rounding direction is a policy, not an accident — the protocol never
//!    under-collects.
//! 4. If it touches money, it has tests. Plural.

pub mod config;
pub mod external;
pub mod interest;
pub mod ledger;
pub mod math;
pub mod vault;
