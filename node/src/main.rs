// Copyright (c) 2026 Obol Labs. MIT License.
// See LICENSE for details.

//! # OBOL Operations Binary
//!
//! Entry point for the `obol-node` binary. Parses CLI arguments, initializes
//! logging, and runs scripted scenarios against an in-memory protocol engine.
//!
//! The binary supports two subcommands:
//!
//! - `demo`    — run the scripted demo scenario
//! - `version` — print build version information

mod cli;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;

use obol_protocol::config::{EPOCH_DURATION_SECS, RATE_5_PERCENT_PER_YEAR, WAD};
use obol_protocol::external::{FixedBuffer, FixedOracle, InMemoryTokens};
use obol_protocol::interest::InterestRateModel;
use obol_protocol::ledger::Ledger;
use obol_protocol::vault::{Vault, VaultParams};

use cli::{Commands, ObolNodeCli};
use logging::LogFormat;

const ROOT: &str = "obol:root";
const TREASURY: &str = "obol:treasury";
const VAULT: &str = "obol:vault:gold";
const GOLD: &str = "obol:gold";
const ALICE: &str = "obol:alice";
const BOB: &str = "obol:bob";
const CAROL: &str = "obol:carol";
const DANA: &str = "obol:dana";

fn main() -> Result<()> {
    let cli = ObolNodeCli::parse();

    match cli.command {
        Commands::Demo(args) => run_demo(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Runs the scripted demo: borrows, interest accrual, a limit-order
/// redemption, and a liquidation, narrated through the log and optionally
/// dumped as JSON at the end.
fn run_demo(args: cli::DemoArgs) -> Result<()> {
    logging::init_logging(
        "obol_node=info,obol_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        started_at = %chrono::Utc::now().to_rfc3339(),
        accrual_secs = args.accrual_secs,
        "starting demo scenario"
    );

    // --- Act 0: world setup ---
    let mut ledger = Ledger::new(ROOT, 100_000_000 * WAD);
    ledger.set_debt_ceiling(TREASURY, 10_000_000 * WAD, ROOT)?;
    ledger.set_debt_ceiling(VAULT, 10_000_000 * WAD, ROOT)?;

    let mut vault = Vault::new(
        VAULT,
        GOLD,
        ROOT,
        VaultParams::default(),
        InterestRateModel::Static {
            rate_per_second: RATE_5_PERCENT_PER_YEAR,
        },
        0,
    )?;

    let mut oracle = FixedOracle::new();
    oracle.set_price(GOLD, WAD);

    let mut tokens = InMemoryTokens::new();
    tokens.mint(GOLD, ALICE, 5_000 * WAD);
    tokens.mint(GOLD, BOB, 5_000 * WAD);

    let mut buffer = FixedBuffer::new(1_000 * WAD);

    // The treasury mints working credit for actors that start with none.
    ledger.move_balance(TREASURY, CAROL, 200 * WAD, TREASURY)?;
    ledger.move_balance(TREASURY, DANA, 500 * WAD, TREASURY)?;
    tracing::info!(
        global_debt = wad_display(ledger.global_debt()),
        "world initialized"
    );

    // --- Act 1: deposits and borrows ---
    let t0 = 0u64;
    vault.deposit(ALICE, 1_000 * WAD, &mut tokens)?;
    vault.deposit(BOB, 2_000 * WAD, &mut tokens)?;
    vault.modify_position(
        t0,
        ALICE,
        ALICE,
        ALICE,
        (1_000 * WAD) as i128,
        (600 * WAD) as i128,
        ALICE,
        &oracle,
        &mut ledger,
    )?;
    vault.modify_position(
        t0,
        BOB,
        BOB,
        BOB,
        (2_000 * WAD) as i128,
        (400 * WAD) as i128,
        BOB,
        &oracle,
        &mut ledger,
    )?;
    vault.delegate_credit(DANA, 500 * WAD, &mut ledger)?;
    tracing::info!(
        alice_credit = wad_display(ledger.credit(ALICE)),
        bob_credit = wad_display(ledger.credit(BOB)),
        pool_credit = wad_display(vault.delegation.pool_credit),
        "positions opened, credit delegated"
    );

    // --- Act 2: interest accrues ---
    let t1 = t0 + args.accrual_secs;
    let alice_debt = vault.virtual_debt(t1, ALICE)?;
    let bob_debt = vault.virtual_debt(t1, BOB)?;
    tracing::info!(
        elapsed = args.accrual_secs,
        alice_debt = wad_display(alice_debt),
        bob_debt = wad_display(bob_debt),
        "interest accrued"
    );

    // --- Act 3: limit-order redemption ---
    vault.add_limit_price_tick(WAD, ROOT)?;
    let order = vault.create_limit_order(t1, BOB, WAD)?;
    let collateral_out = vault.exchange(t1, WAD, 150 * WAD, CAROL, &oracle, &mut ledger)?;
    vault.withdraw(CAROL, collateral_out, &mut tokens)?;
    tracing::info!(
        order,
        credit_in = wad_display(150 * WAD),
        collateral_out = wad_display(collateral_out),
        bob_debt_after = wad_display(vault.virtual_debt(t1, BOB)?),
        "redeemed credit through the book"
    );

    // --- Act 4: price drop and liquidation ---
    let t2 = t1 + 86_400;
    oracle.set_price(GOLD, 720_000_000_000_000_000); // 0.72
    ledger.move_balance(TREASURY, ROOT, 1_000 * WAD, TREASURY)?;

    let hf = vault.health_factor(t2, ALICE, &oracle)?;
    tracing::warn!(health_factor = wad_display(hf), "alice is under water");

    let outcomes = vault.liquidate_positions(
        t2,
        &[(ALICE.to_string(), u128::MAX)],
        ROOT,
        &oracle,
        &mut buffer,
        &mut ledger,
    );
    for outcome in outcomes {
        let o = outcome?;
        tracing::info!(
            owner = %o.owner,
            credit_paid = wad_display(o.credit_paid),
            collateral_bought = wad_display(o.collateral_bought),
            debt_removed = wad_display(o.debt_removed),
            bad_debt = wad_display(o.bad_debt),
            full = o.full,
            "position liquidated"
        );
    }
    tracing::info!(
        health_factor = wad_display(vault.health_factor(t2, ALICE, &oracle)?),
        "alice restored to target health"
    );

    // --- Act 5: repayment and undelegation ---
    let bob_nd = vault.position_of(BOB).normal_debt;
    vault.modify_position(
        t2,
        BOB,
        BOB,
        BOB,
        0,
        -(bob_nd as i128),
        BOB,
        &oracle,
        &mut ledger,
    )?;
    tracing::info!(
        bob_debt = wad_display(vault.virtual_debt(t2, BOB)?),
        "bob repaid in full"
    );

    let shares = 250 * WAD;
    vault.undelegate_credit(DANA, shares, t2)?;
    let t3 = t2 + 2 * EPOCH_DURATION_SECS;
    let paid = vault.claim_undelegated_credit(DANA, t3, &mut ledger)?;
    tracing::info!(
        shares = wad_display(shares),
        paid = wad_display(paid),
        "undelegation matured and claimed"
    );

    // --- Final state ---
    if let Some(path) = &args.state_out {
        let state = serde_json::json!({
            "timestamp": t3,
            "vault": vault,
            "ledger": ledger,
        });
        let rendered = serde_json::to_string_pretty(&state)?;
        std::fs::write(path, rendered)
            .with_context(|| format!("failed to write state to {}", path.display()))?;
        tracing::info!(path = %path.display(), "engine state written");
    }

    tracing::info!(
        global_debt = wad_display(ledger.global_debt()),
        accrued_bad_debt = wad_display(vault.accrued_bad_debt()),
        "demo scenario complete"
    );
    Ok(())
}

/// Renders a wad quantity as a decimal string for the log.
fn wad_display(value: u128) -> String {
    let int = value / WAD;
    let frac = value % WAD / (WAD / 1_000_000);
    format!("{int}.{frac:06}")
}

fn print_version() {
    println!("obol-node {}", env!("CARGO_PKG_VERSION"));
}
