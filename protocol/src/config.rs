//! # Protocol Configuration & Constants
//!
//! Every magic number in OBOL lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! These values are the risk DNA of the protocol. The per-vault knobs in
//! [`crate::vault::VaultParams`] can be retuned through `set_parameter`;
//! the constants below cannot, so choose wisely before launch.

// ---------------------------------------------------------------------------
// Fixed-Point Scale
// ---------------------------------------------------------------------------

/// The wad: 1e18 fixed-point scale used for every price, rate, and balance.
/// One unit of anything is `WAD`; half a unit is `WAD / 2`. The protocol
/// never touches floating point.
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Seconds in a (non-leap) year. Used to relate per-second compounding
/// rates to the annual figures humans actually reason about.
pub const SECONDS_PER_YEAR: u64 = 365 * 86_400;

// ---------------------------------------------------------------------------
// Interest Rates
// ---------------------------------------------------------------------------

/// Per-second compounding rate equivalent to ~5% per year:
/// `1.000000001547125958^31536000 ≈ 1.05`. The canonical "boring default"
/// for a freshly configured vault.
pub const RATE_5_PERCENT_PER_YEAR: u128 = 1_000_000_001_547_125_958;

/// Hard ceiling on any configured per-second rate. Roughly 400% per year —
/// beyond this, the vault is either misconfigured or under attack, and
/// `set_parameter` refuses the value.
pub const MAX_RATE_PER_SECOND: u128 = 1_000_000_051_034_942_716;

// ---------------------------------------------------------------------------
// Delegation Epochs
// ---------------------------------------------------------------------------

/// Length of one credit-delegation epoch in seconds (3 days). Undelegation
/// requests are tagged with the epoch they were made in; claims become
/// possible only after [`UNDELEGATION_DELAY_EPOCHS`] further epochs pass.
pub const EPOCH_DURATION_SECS: u64 = 3 * 86_400;

/// Number of full epochs an undelegation request must wait before the
/// locked shares can be claimed. One epoch of delay means a claim is
/// possible at most 6 days and at least 3 days after the request.
pub const UNDELEGATION_DELAY_EPOCHS: u64 = 1;

// ---------------------------------------------------------------------------
// Emergency Lifecycle
// ---------------------------------------------------------------------------

/// Fixed window between a vault entering the paused/emergency state and
/// becoming eligible for the external unwind process (14 days). The unwind
/// module itself lives outside this crate; the vault only answers the
/// "are we there yet" timestamp comparison.
pub const UNWIND_COOLDOWN_SECS: u64 = 14 * 86_400;

// ---------------------------------------------------------------------------
// Default Risk Parameters
// ---------------------------------------------------------------------------

/// Default minimum debt per position: 100 credit. Positions below the floor
/// are dust — uneconomical to liquidate and a griefing vector, so the vault
/// refuses to create them.
pub const DEFAULT_DEBT_FLOOR: u128 = 100 * WAD;

/// Default liquidation ratio: 1.25. A position must hold collateral worth
/// at least 125% of its debt to stay out of the liquidation engine's reach.
pub const DEFAULT_LIQUIDATION_RATIO: u128 = 1_250_000_000_000_000_000;

/// Default liquidation penalty: 1.05. The borrower's debt shrinks by 5%
/// more than the credit the liquidator supplies, which makes
/// self-liquidation strictly worse than orderly repayment.
pub const DEFAULT_LIQUIDATION_PENALTY: u128 = 1_050_000_000_000_000_000;

/// Default liquidation discount: 0.05. Liquidators buy collateral at 95% of
/// the oracle price; the discount is their compensation for acting fast.
pub const DEFAULT_LIQUIDATION_DISCOUNT: u128 = 50_000_000_000_000_000;

/// Default target health factor: 1.05. Partial liquidations may not push a
/// position above this — liquidate to safety, not to extraction.
pub const DEFAULT_TARGET_HEALTH_FACTOR: u128 = 1_050_000_000_000_000_000;

/// Default minimum debt for a position to keep a limit order on the book:
/// 50 credit. Orders whose position debt falls below this are detached
/// automatically so the book never fills up with dust.
pub const DEFAULT_LIMIT_ORDER_FLOOR: u128 = 50 * WAD;
