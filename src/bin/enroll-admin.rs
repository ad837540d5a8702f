//! `enroll-admin`: enroll CA administrators.
//!
//! ```text
//! enroll-admin [OPTIONS] [ORG...]
//! ```
//!
//! With no ORG every configured organisation is enrolled, in config order.
//! Admins already in the wallet are left untouched.

use product_ledger::ca::Enrollment;
use product_ledger::cli;
use product_ledger::error::AppError;
use product_ledger::orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    println!("*** application ending");
}

async fn run() -> Result<(), AppError> {
    let args = cli::parse(std::env::args().skip(1))?;
    if args.help {
        println!("{}", cli::usage("enroll-admin", "[ORG...]"));
        return Ok(());
    }
    let orgs = cli::parse_enroll_args(&args.positionals)?;
    let config = cli::startup(&args)?;

    let orchestrator = Orchestrator::from_config(config).await?;
    for (label, outcome) in orchestrator.enroll_admins(&orgs).await? {
        match outcome {
            Enrollment::Enrolled(identity) => {
                println!("Successfully enrolled admin user and imported it into the wallet: {label} ({})", identity.msp_id)
            }
            Enrollment::AlreadyEnrolled => {
                println!("An identity for the admin user {label} already exists in the wallet")
            }
        }
    }
    Ok(())
}
