//! `product-ledger`: bootstrap and demo flow.
//!
//! Sequence:
//!   1. Parse args, load .env and config, init logger
//!   2. Enroll the default org's admin (skipped if already in the wallet)
//!   3. Register the demo user (skipped if already in the wallet)
//!   4. Connect as the demo user and resolve the contract
//!   5. Submit InitLedger unless `skipInit` / `--skip-init` is given
//!   6. Run the product transactions and print their results
//!   7. Disconnect

use product_ledger::cli;
use product_ledger::error::AppError;
use product_ledger::orchestrator::Orchestrator;
use tracing::info;

const SYNOPSIS: &str = "[skipInit|--skip-init]";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        println!("******** FAILED to run the application: {e}");
        std::process::exit(1);
    }
    println!("*** application ending");
}

async fn run() -> Result<(), AppError> {
    let args = cli::parse(std::env::args().skip(1))?;
    if args.help {
        println!("{}", cli::usage("product-ledger", SYNOPSIS));
        return Ok(());
    }

    let config = cli::startup(&args)?;
    let options = cli::parse_demo_args(&args.positionals);

    let orchestrator = Orchestrator::from_config(config).await?;
    let report = orchestrator.run_demo(options).await?;

    info!(
        admin_enrolled = report.admin,
        user_registered = report.user,
        init = ?report.init,
        steps = report.steps.len(),
        "demo finished"
    );
    Ok(())
}
