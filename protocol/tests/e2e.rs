//! End-to-end integration tests for the OBOL Protocol.
//!
//! These tests exercise full credit lifecycles through the public surface:
//! deposit, borrow, interest accrual, repayment, liquidation, redemption
//! through the order book, and credit delegation. They prove that the
//! ledger, the interest machinery, the vault, and the external trait
//! implementations compose correctly.
//!
//! Each test stands alone with its own ledger, vault, oracle, and token
//! bridge. No shared state, no test ordering dependencies, no flaky
//! failures.

use obol_protocol::config::{
    EPOCH_DURATION_SECS, RATE_5_PERCENT_PER_YEAR, SECONDS_PER_YEAR, UNWIND_COOLDOWN_SECS, WAD,
};
use obol_protocol::external::{FixedBuffer, FixedOracle, InMemoryTokens};
use obol_protocol::interest::InterestRateModel;
use obol_protocol::ledger::Ledger;
use obol_protocol::vault::{Vault, VaultError, VaultParams};

const ADMIN: &str = "obol:admin";
const TREASURY: &str = "obol:treasury";
const VAULT: &str = "obol:vault";
const ALICE: &str = "obol:alice";
const BOB: &str = "obol:bob";
const DANA: &str = "obol:dana";
const GOLD: &str = "gold";

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct World {
    vault: Vault,
    ledger: Ledger,
    oracle: FixedOracle,
    tokens: InMemoryTokens,
    buffer: FixedBuffer,
}

/// Spins up a ledger with a funded treasury, a vault on the default static
/// rate model, a live oracle at price 1.0, and collateral for the usual
/// suspects.
fn setup() -> World {
    let mut ledger = Ledger::new(ADMIN, 10_000_000 * WAD);
    ledger
        .set_debt_ceiling(VAULT, 10_000_000 * WAD, ADMIN)
        .unwrap();
    ledger
        .set_debt_ceiling(TREASURY, 10_000_000 * WAD, ADMIN)
        .unwrap();

    let vault = Vault::new(
        VAULT,
        GOLD,
        ADMIN,
        VaultParams::default(),
        InterestRateModel::Static {
            rate_per_second: RATE_5_PERCENT_PER_YEAR,
        },
        0,
    )
    .unwrap();

    let mut oracle = FixedOracle::new();
    oracle.set_price(GOLD, WAD);

    let mut tokens = InMemoryTokens::new();
    for account in [ALICE, BOB] {
        tokens.mint(GOLD, account, 100_000 * WAD);
    }

    World {
        vault,
        ledger,
        oracle,
        tokens,
        buffer: FixedBuffer::new(0),
    }
}

/// Hands `account` freshly minted credit out of the treasury.
fn fund_credit(w: &mut World, account: &str, amount: u128) {
    w.ledger
        .move_balance(TREASURY, account, amount, TREASURY)
        .unwrap();
}

/// Deposits collateral and opens a position in one go.
fn open_position(w: &mut World, now: u64, owner: &str, collateral: u128, normal_debt: u128) {
    w.vault.deposit(owner, collateral, &mut w.tokens).unwrap();
    w.vault
        .modify_position(
            now,
            owner,
            owner,
            owner,
            collateral as i128,
            normal_debt as i128,
            owner,
            &w.oracle,
            &mut w.ledger,
        )
        .unwrap();
}

/// Sum of every ledger balance — must be zero at all times.
fn ledger_balance_sum(ledger: &Ledger) -> i128 {
    ledger.iter().map(|(_, account)| account.balance).sum()
}

// ---------------------------------------------------------------------------
// 1. Open a Position
// ---------------------------------------------------------------------------

#[test]
fn open_position_mints_credit() {
    let mut w = setup();
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 500 * WAD);

    let pos = w.vault.position_of(ALICE);
    assert_eq!(pos.collateral, 1_000 * WAD);
    assert_eq!(pos.normal_debt, 500 * WAD);
    assert_eq!(w.ledger.credit(ALICE), 500 * WAD);
    assert_eq!(w.ledger.balance(VAULT), -((500 * WAD) as i128));
    assert_eq!(ledger_balance_sum(&w.ledger), 0);
}

// ---------------------------------------------------------------------------
// 2. A Year of Interest, Fully Repaid
// ---------------------------------------------------------------------------

#[test]
fn year_of_interest_then_full_repay() {
    let mut w = setup();
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 500 * WAD);

    let year = SECONDS_PER_YEAR;
    let debt = w.vault.virtual_debt(year, ALICE).unwrap();
    // ~5% compounding on 500.
    assert!(debt > 500 * WAD);
    assert!(debt.abs_diff(525 * WAD) < WAD / 10, "debt {}", debt);

    // Top Alice up with exactly the interest portion, then clear the loan.
    fund_credit(&mut w, ALICE, debt - 500 * WAD);
    w.vault
        .modify_position(
            year,
            ALICE,
            ALICE,
            ALICE,
            -((1_000 * WAD) as i128),
            -((500 * WAD) as i128),
            ALICE,
            &w.oracle,
            &mut w.ledger,
        )
        .unwrap();

    let pos = w.vault.position_of(ALICE);
    assert_eq!(pos.normal_debt, 0);
    assert_eq!(pos.collateral, 0);
    assert_eq!(w.ledger.balance(ALICE), 0);
    // No limit order was active, so no rebate existed to claim.
    assert_eq!(w.vault.irs_of(ALICE).accrued_rebate, 0);
    assert_eq!(w.vault.global_irs.total_normal_debt, 0);

    // The vault account keeps the interest as protocol surplus: it minted
    // 500 and was repaid the full grown debt.
    assert_eq!(w.ledger.balance(VAULT), (debt - 500 * WAD) as i128);
    assert_eq!(ledger_balance_sum(&w.ledger), 0);
}

// ---------------------------------------------------------------------------
// 3. Partial Liquidation Lands on the Target Health Factor
// ---------------------------------------------------------------------------

#[test]
fn partial_liquidation_hits_target_health() {
    let mut w = setup();
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 600 * WAD);
    fund_credit(&mut w, BOB, 10_000 * WAD);

    // Price drop: capacity 1000*0.72/1.25 = 576 < 600 debt.
    w.oracle.set_price(GOLD, 72 * WAD / 100);

    let results = w.vault.liquidate_positions(
        0,
        &[(ALICE.to_string(), 10_000 * WAD)],
        BOB,
        &w.oracle,
        &mut w.buffer,
        &mut w.ledger,
    );
    let outcome = results[0].as_ref().unwrap();
    assert!(!outcome.full);
    assert_eq!(outcome.bad_debt, 0);

    let hf = w.vault.health_factor(0, ALICE, &w.oracle).unwrap();
    let target = w.vault.params.target_health_factor;
    assert!(
        hf.abs_diff(target) < WAD / 1_000_000,
        "health {} vs target {}",
        hf,
        target
    );
    assert!(w.vault.position_of(ALICE).normal_debt > 0);
    assert_eq!(ledger_balance_sum(&w.ledger), 0);
}

// ---------------------------------------------------------------------------
// 4. Full Liquidation Produces Bad Debt
// ---------------------------------------------------------------------------

#[test]
fn full_liquidation_socializes_uncovered_debt() {
    let mut w = setup();
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 700 * WAD);
    fund_credit(&mut w, BOB, 10_000 * WAD);
    fund_credit(&mut w, DANA, 2_000 * WAD);
    w.vault
        .delegate_credit(DANA, 2_000 * WAD, &mut w.ledger)
        .unwrap();

    // Crash to 0.35: all the collateral is worth 350, debt is 700.
    w.oracle.set_price(GOLD, 35 * WAD / 100);

    let results = w.vault.liquidate_positions(
        0,
        &[(ALICE.to_string(), u128::MAX / WAD)],
        BOB,
        &w.oracle,
        &mut w.buffer,
        &mut w.ledger,
    );
    let outcome = results[0].as_ref().unwrap();

    assert!(outcome.full);
    let pos = w.vault.position_of(ALICE);
    assert_eq!(pos.collateral, 0);
    assert_eq!(pos.normal_debt, 0);

    // Zero-reserve buffer: the whole gap is socialized and tracked.
    assert!(outcome.bad_debt > 0);
    assert_eq!(outcome.socialized, outcome.bad_debt);
    assert_eq!(w.vault.accrued_bad_debt(), outcome.bad_debt);
    // Invariant: never more bad debt than the liquidated debt itself.
    assert!(w.vault.accrued_bad_debt() <= 700 * WAD);
    // Delegators ate the loss through the share price.
    assert!(w.vault.delegation.pool_credit < 2_000 * WAD);
    assert_eq!(ledger_balance_sum(&w.ledger), 0);
}

// ---------------------------------------------------------------------------
// 5. Redemption is FIFO Within a Tick
// ---------------------------------------------------------------------------

#[test]
fn exchange_consumes_oldest_order_first() {
    let mut w = setup();
    w.vault.add_limit_price_tick(WAD, ADMIN).unwrap();

    open_position(&mut w, 0, ALICE, 1_000 * WAD, 200 * WAD);
    open_position(&mut w, 0, BOB, 1_000 * WAD, 200 * WAD);
    w.vault.create_limit_order(0, ALICE, WAD).unwrap();
    w.vault.create_limit_order(0, BOB, WAD).unwrap();

    fund_credit(&mut w, DANA, 100 * WAD);
    let redeemed = w
        .vault
        .exchange(0, WAD, 100 * WAD, DANA, &w.oracle, &mut w.ledger)
        .unwrap();

    // At spot 1.0 and tick 1.0 the exchange is one-for-one.
    assert_eq!(redeemed, 100 * WAD);
    assert_eq!(w.vault.cash_of(DANA), 100 * WAD);

    // Only Alice — the older order — was touched.
    assert_eq!(w.vault.position_of(ALICE).normal_debt, 100 * WAD);
    assert_eq!(w.vault.position_of(ALICE).collateral, 900 * WAD);
    assert_eq!(w.vault.position_of(BOB).normal_debt, 200 * WAD);
    assert_eq!(w.vault.position_of(BOB).collateral, 1_000 * WAD);

    // Alice's debt (100) is still above the order floor (50): still queued.
    assert!(w.vault.book.order_of(ALICE).is_some());
    assert_eq!(ledger_balance_sum(&w.ledger), 0);
}

// ---------------------------------------------------------------------------
// 6. Exchange is All-or-Nothing
// ---------------------------------------------------------------------------

#[test]
fn exchange_reverts_on_insufficient_liquidity() {
    let mut w = setup();
    w.vault.add_limit_price_tick(WAD, ADMIN).unwrap();
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 200 * WAD);
    w.vault.create_limit_order(0, ALICE, WAD).unwrap();

    fund_credit(&mut w, DANA, 1_000 * WAD);
    let err = w
        .vault
        .exchange(0, WAD, 500 * WAD, DANA, &w.oracle, &mut w.ledger)
        .unwrap_err();
    assert_eq!(
        err,
        VaultError::InsufficientLiquidity {
            requested: 500 * WAD,
            available: 200 * WAD,
        }
    );

    // Nothing moved: no partial fills at the call boundary.
    assert_eq!(w.vault.position_of(ALICE).normal_debt, 200 * WAD);
    assert_eq!(w.vault.cash_of(DANA), 0);
    assert_eq!(w.ledger.credit(DANA), 1_000 * WAD);
}

// ---------------------------------------------------------------------------
// 7. Exchange Walks Ticks Cheapest-First and Prices the Premium
// ---------------------------------------------------------------------------

#[test]
fn exchange_fills_cheaper_tick_before_premium() {
    let mut w = setup();
    w.vault.add_limit_price_tick(WAD, ADMIN).unwrap();
    w.vault.add_limit_price_tick(11 * WAD / 10, ADMIN).unwrap();

    open_position(&mut w, 0, ALICE, 300 * WAD, 200 * WAD);
    open_position(&mut w, 0, BOB, 300 * WAD, 200 * WAD);
    // Bob queues first, but at the premium tick.
    w.vault.create_limit_order(0, BOB, 11 * WAD / 10).unwrap();
    w.vault.create_limit_order(0, ALICE, WAD).unwrap();

    fund_credit(&mut w, DANA, 300 * WAD);
    let redeemed = w
        .vault
        .exchange(0, 11 * WAD / 10, 300 * WAD, DANA, &w.oracle, &mut w.ledger)
        .unwrap();

    // Ticks walk lowest-first: Alice's par order clears in full before
    // Bob's premium order is touched, despite Bob queueing earlier.
    assert_eq!(w.vault.position_of(ALICE).normal_debt, 0);
    assert_eq!(w.vault.position_of(BOB).normal_debt, 100 * WAD);

    // At the premium tick one unit of credit buys 1/1.1 collateral: Bob's
    // 100-credit fill releases 90.90… collateral.
    let premium_out = 90_909_090_909_090_909_090u128;
    assert_eq!(redeemed, 200 * WAD + premium_out);
    assert_eq!(w.vault.cash_of(DANA), 200 * WAD + premium_out);
    assert_eq!(w.vault.position_of(BOB).collateral, 300 * WAD - premium_out);
    assert_eq!(ledger_balance_sum(&w.ledger), 0);
}

// ---------------------------------------------------------------------------
// 8. Limit Orders Earn an Interest Rebate
// ---------------------------------------------------------------------------

#[test]
fn limit_order_rebate_discounts_repayment() {
    let mut w = setup();
    // Tick 2.0 earns a 0.5 rebate factor.
    w.vault.add_limit_price_tick(2 * WAD, ADMIN).unwrap();
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 500 * WAD);
    w.vault.create_limit_order(0, ALICE, 2 * WAD).unwrap();

    let year = SECONDS_PER_YEAR;
    let irs = w.vault.virtual_irs(year, ALICE).unwrap();
    // Gross interest ≈ 25; half of it is rebated.
    assert!(
        irs.accrued_rebate.abs_diff(125 * WAD / 10) < WAD / 10,
        "rebate {}",
        irs.accrued_rebate
    );

    let discounted_debt = w.vault.virtual_debt(year, ALICE).unwrap();

    // A twin borrower with no order owes the full freight.
    open_position(&mut w, 0, BOB, 1_000 * WAD, 500 * WAD);
    let full_debt = w.vault.virtual_debt(year, BOB).unwrap();
    assert!(discounted_debt < full_debt);
    assert_eq!(full_debt - discounted_debt, irs.accrued_rebate);

    // Repaying in full claims the whole rebate and zeroes the books.
    fund_credit(&mut w, ALICE, discounted_debt);
    w.vault
        .modify_position(
            year,
            ALICE,
            ALICE,
            ALICE,
            0,
            -((500 * WAD) as i128),
            ALICE,
            &w.oracle,
            &mut w.ledger,
        )
        .unwrap();
    assert_eq!(w.vault.position_of(ALICE).normal_debt, 0);
    assert_eq!(w.vault.irs_of(ALICE).accrued_rebate, 0);
    assert_eq!(w.vault.global_irs.global_accrued_rebate, 0);
    // The order detached automatically once the debt hit zero.
    assert!(w.vault.book.order_of(ALICE).is_none());
}

// ---------------------------------------------------------------------------
// 9. Credit Delegation Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn delegation_epochs_and_proportional_claims() {
    let mut w = setup();
    fund_credit(&mut w, DANA, 1_000 * WAD);

    let shares = w
        .vault
        .delegate_credit(DANA, 1_000 * WAD, &mut w.ledger)
        .unwrap();
    assert_eq!(shares, 1_000 * WAD);

    // Borrowers drain most of the pool's liquidity.
    open_position(&mut w, 0, ALICE, 2_000 * WAD, 900 * WAD);
    assert_eq!(w.ledger.credit(VAULT), 100 * WAD);

    w.vault.undelegate_credit(DANA, 1_000 * WAD, 0).unwrap();
    // Too early.
    assert!(matches!(
        w.vault.claim_undelegated_credit(DANA, 100, &mut w.ledger),
        Err(VaultError::Delegation(_))
    ));

    // Matured, but only 100 of the 1000 is liquid: the claim burns and
    // pays 10%, the rest stays pending.
    let paid = w
        .vault
        .claim_undelegated_credit(DANA, EPOCH_DURATION_SECS, &mut w.ledger)
        .unwrap();
    assert_eq!(paid, 100 * WAD);
    let pending = w.vault.delegation.pending_of(DANA).unwrap();
    assert_eq!(pending.shares, 900 * WAD);

    // A repayment restores liquidity; the follow-up claim finishes the job.
    fund_credit(&mut w, ALICE, 100 * WAD);
    w.vault
        .modify_position(
            0,
            ALICE,
            ALICE,
            ALICE,
            0,
            -((900 * WAD) as i128),
            ALICE,
            &w.oracle,
            &mut w.ledger,
        )
        .unwrap();
    let paid = w
        .vault
        .claim_undelegated_credit(DANA, EPOCH_DURATION_SECS, &mut w.ledger)
        .unwrap();
    assert_eq!(paid, 900 * WAD);
    assert!(w.vault.delegation.pending_of(DANA).is_none());
    assert_eq!(w.ledger.credit(DANA), 1_000 * WAD);
    assert_eq!(ledger_balance_sum(&w.ledger), 0);
}

// ---------------------------------------------------------------------------
// 10. Utilization Model Reacts to Pool Pressure
// ---------------------------------------------------------------------------

#[test]
fn utilization_model_charges_more_under_pressure() {
    let mut w = setup();
    w.vault.rate_model = InterestRateModel::Utilization {
        min_rate: WAD,
        target_rate: WAD + 2_000_000_000,
        max_rate: WAD + 20_000_000_000,
        target_utilization: 8 * WAD / 10,
        max_utilization: WAD,
    };

    fund_credit(&mut w, DANA, 1_000 * WAD);
    w.vault
        .delegate_credit(DANA, 1_000 * WAD, &mut w.ledger)
        .unwrap();

    // Low utilization: 200/1000.
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 200 * WAD);
    let debt_low = w.vault.virtual_debt(SECONDS_PER_YEAR, ALICE).unwrap();

    // Crank utilization to 90% and measure the same horizon again.
    open_position(&mut w, 0, BOB, 2_000 * WAD, 700 * WAD);
    let debt_high = w.vault.virtual_debt(SECONDS_PER_YEAR, ALICE).unwrap();

    assert!(
        debt_high > debt_low,
        "rate should climb with utilization: {} vs {}",
        debt_high,
        debt_low
    );
}

// ---------------------------------------------------------------------------
// 11. Emergency Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn pause_and_unwind_eligibility() {
    let mut w = setup();
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 500 * WAD);

    w.vault.pause(1_000, ADMIN).unwrap();
    assert!(w.vault.is_paused());

    // Mutations refuse; withdrawing free cash still works.
    let err = w
        .vault
        .modify_position(1_000, ALICE, ALICE, ALICE, 0, WAD as i128, ALICE, &w.oracle, &mut w.ledger)
        .unwrap_err();
    assert_eq!(err, VaultError::EmergencyModeActive);

    assert!(!w.vault.eligible_for_unwind(1_000 + UNWIND_COOLDOWN_SECS - 1));
    assert!(w.vault.eligible_for_unwind(1_000 + UNWIND_COOLDOWN_SECS));

    // Unpausing resumes business.
    w.vault.unpause(ADMIN).unwrap();
    fund_credit(&mut w, ALICE, 100 * WAD);
    w.vault
        .modify_position(
            1_000,
            ALICE,
            ALICE,
            ALICE,
            0,
            -((100 * WAD) as i128),
            ALICE,
            &w.oracle,
            &mut w.ledger,
        )
        .unwrap();
}

// ---------------------------------------------------------------------------
// 12. State Snapshots Round-Trip Through JSON
// ---------------------------------------------------------------------------

#[test]
fn vault_state_survives_serialization() {
    let mut w = setup();
    w.vault.add_limit_price_tick(WAD, ADMIN).unwrap();
    open_position(&mut w, 0, ALICE, 1_000 * WAD, 500 * WAD);
    w.vault.create_limit_order(0, ALICE, WAD).unwrap();

    let json = serde_json::to_string(&w.vault).unwrap();
    let restored: Vault = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.position_of(ALICE), w.vault.position_of(ALICE));
    assert_eq!(restored.irs_of(ALICE), w.vault.irs_of(ALICE));
    assert_eq!(restored.book.order_of(ALICE), w.vault.book.order_of(ALICE));
    assert_eq!(restored.global_irs, w.vault.global_irs);

    let ledger_json = serde_json::to_string(&w.ledger).unwrap();
    let restored_ledger: Ledger = serde_json::from_str(&ledger_json).unwrap();
    assert_eq!(restored_ledger.balance(ALICE), w.ledger.balance(ALICE));
}
