//! Command-line parsing shared by the three binaries.
//!
//! Plain argument walking, no parser crate. Common flags:
//!
//! ```text
//! -h, --help              print usage
//! -f, --config <PATH>     configuration file (default: config/default.toml)
//! -v, -vv, -vvv, -vvvv    increase logging verbosity
//! ```
//!
//! Everything else is collected as a positional argument for the binary.

use tracing::info;
use tracing::level_filters::LevelFilter;

use crate::config::{self, Config};
use crate::error::AppError;
use crate::logger;
use crate::orchestrator::DemoOptions;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    /// Level forced by `-v` flags; `None` leaves it to config / `RUST_LOG`.
    pub log_level: Option<LevelFilter>,
    pub config_path: Option<String>,
    pub help: bool,
    pub positionals: Vec<String>,
}

/// Parse arguments, excluding the program name.
pub fn parse<I>(args: I) -> Result<CliArgs, AppError>
where
    I: IntoIterator<Item = String>,
{
    let mut verbosity = 0u8;
    let mut parsed = CliArgs::default();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--" => {
                parsed.positionals.extend(iter);
                break;
            }
            "-h" | "--help" => parsed.help = true,
            "-f" | "--config" => match iter.next() {
                Some(path) => parsed.config_path = Some(path),
                None => return Err(AppError::Usage("-f/--config requires a path argument".into())),
            },
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => parsed.positionals.push(arg),
        }
    }

    parsed.log_level = logger::verbosity_level(verbosity);
    Ok(parsed)
}

/// `product-ledger [skipInit|--skip-init]`. Other positionals are ignored.
pub fn parse_demo_args(positionals: &[String]) -> DemoOptions {
    DemoOptions {
        skip_init: positionals.iter().any(|a| a == "skipInit" || a == "--skip-init"),
        narrate: true,
    }
}

/// `enroll-admin [ORG...]`; each ORG is `N` or `orgN`. Empty means all orgs.
pub fn parse_enroll_args(positionals: &[String]) -> Result<Vec<u8>, AppError> {
    positionals.iter().map(|a| parse_org(a)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterArgs {
    pub username: String,
    pub role: String,
    pub org: Option<u8>,
}

/// `register-user <username> <role> [org]`.
pub fn parse_register_args(positionals: &[String]) -> Result<RegisterArgs, AppError> {
    match positionals {
        [username, role, rest @ ..] => Ok(RegisterArgs {
            username: username.clone(),
            role: role.clone(),
            org: rest.first().map(|o| parse_org(o)).transpose()?,
        }),
        _ => Err(AppError::Usage("Invalid number of arguments, expecting 2.".into())),
    }
}

fn parse_org(raw: &str) -> Result<u8, AppError> {
    let digits = raw.strip_prefix("org").unwrap_or(raw);
    digits
        .parse::<u8>()
        .map_err(|_| AppError::Usage(format!("invalid organisation '{raw}', expected a number such as 1 or 2")))
}

/// Usage text for `bin`, with its positional synopsis.
pub fn usage(bin: &str, synopsis: &str) -> String {
    format!(
        "Usage: {bin} [OPTIONS] {synopsis}\n\n\
         Options:\n  \
         -h, --help                 Print help\n  \
         -f, --config <PATH>        Path to configuration file (default: config/default.toml)\n  \
         -v, -vv, -vvv, -vvvv       Increase logging verbosity"
    )
}

/// Load config and initialise logging. Log level precedence:
/// `-v` flags > `PRODUCT_LEDGER_LOG_LEVEL` / `RUST_LOG` > config file.
pub fn startup(args: &CliArgs) -> Result<Config, AppError> {
    // Optional; a missing .env is not an error.
    let _ = dotenvy::dotenv();

    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level);
    logger::init(effective_log_level, args.log_level.is_some())?;

    info!(
        channel = %config.channel,
        contract = %config.contract,
        wallet = %config.wallet_path.display(),
        backend = ?config.backend,
        effective_log_level = %effective_log_level,
        "config loaded"
    );
    Ok(config)
}
