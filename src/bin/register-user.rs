//! `register-user`: register and enroll an application user.
//!
//! ```text
//! register-user [OPTIONS] <username> <role> [org]
//! ```
//!
//! `org` defaults to the configured default organisation. The user gets
//! `username` and `role` attributes embedded in its certificate. The org's
//! admin must already be enrolled (see `enroll-admin`).

use product_ledger::ca::Registration;
use product_ledger::cli;
use product_ledger::error::AppError;
use product_ledger::orchestrator::Orchestrator;

const SYNOPSIS: &str = "<username> <role> [org]";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        if matches!(e, AppError::Usage(_)) {
            eprintln!("{}", cli::usage("register-user", SYNOPSIS));
        }
        std::process::exit(1);
    }
    println!("*** application ending");
}

async fn run() -> Result<(), AppError> {
    let args = cli::parse(std::env::args().skip(1))?;
    if args.help {
        println!("{}", cli::usage("register-user", SYNOPSIS));
        return Ok(());
    }
    let request = cli::parse_register_args(&args.positionals)?;
    let config = cli::startup(&args)?;

    let org = config.org(request.org)?.clone();
    println!("{}, {}, {}, {}", request.username, request.role, org.number, org.msp_id);

    let orchestrator = Orchestrator::from_config(config).await?;
    println!("Registering new user");
    match orchestrator.register_user(&request.username, &request.role, Some(org.number)).await? {
        Registration::Registered(_) => {
            println!("Successfully registered and enrolled user {} and imported it into the wallet", request.username)
        }
        Registration::AlreadyRegistered => {
            println!("An identity for the user {} already exists in the wallet", request.username)
        }
    }
    Ok(())
}
