//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or the path given with `-f`), then applies
//! `PRODUCT_LEDGER_WALLET_PATH` and `PRODUCT_LEDGER_LOG_LEVEL` overrides.
//! Without any file the built-in two-organisation test-network layout is used.
//!
//! ```toml
//! [app]
//! channel = "mychannel"
//! contract = "basic"
//! default_org_msp = "Org1MSP"
//! wallet_path = "wallet"
//!
//! [[orgs]]
//! number = 1
//! msp_id = "Org1MSP"
//! ca_host = "ca.org1.example.com"
//! connection_profile = "profiles/connection-org1.json"
//! gateway_url = "http://localhost:7080"
//! affiliation = "org1.department1"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing::warn;

use crate::error::AppError;
use crate::logger;
use crate::profile::ConnectionProfile;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

// ── Public types ──────────────────────────────────────────────────────────────

/// What to do when the ledger-initialisation submit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFailurePolicy {
    /// Only the recognised "already initialised" failure is tolerated.
    TolerateRecognized,
    /// Every init failure is reported and the demo sequence continues.
    TolerateAll,
}

/// Which CA / gateway transports to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Http,
    /// In-process CA and ledger. State lives only as long as the process.
    Memory,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub init_function: String,
    /// Substring that identifies the "already initialised" contract error.
    pub init_conflict_marker: String,
    pub init_failure: InitFailurePolicy,
}

/// Per-call deadlines for external operations.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub ca: Duration,
    pub connect: Duration,
    pub submit: Duration,
    pub evaluate: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub enabled: bool,
    pub as_localhost: bool,
}

/// One organisational participant. Read-only after load.
#[derive(Debug, Clone)]
pub struct OrgProfile {
    /// Short organisation number used on the command line (`1`, `2`, …).
    pub number: u8,
    pub msp_id: String,
    /// CA endpoint name as listed in the connection profile.
    pub ca_host: String,
    /// `caname` sent to the CA server.
    pub ca_name: String,
    pub ca_url: String,
    /// PEM roots trusted for the CA's TLS endpoint.
    pub ca_tls_roots: Vec<String>,
    pub ca_verify_tls: bool,
    pub gateway_url: String,
    pub discovery: DiscoveryOptions,
    /// Default affiliation for identities registered in this org.
    pub affiliation: String,
    /// Wallet label of this org's CA administrator.
    pub admin_label: String,
    pub admin_enrollment_id: String,
    pub admin_secret: String,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub channel: String,
    pub contract: String,
    pub default_org_msp: String,
    pub wallet_path: PathBuf,
    pub log_level: LevelFilter,
    /// Label of the user registered and used by the demo flow.
    pub demo_user: String,
    pub ledger: LedgerConfig,
    pub backend: BackendKind,
    pub timeouts: Timeouts,
    pub orgs: Vec<OrgProfile>,
}

impl Config {
    /// Resolve an organisation: `None` → the org owning `default_org_msp`,
    /// `Some(n)` → the org numbered `n`.
    pub fn org(&self, number: Option<u8>) -> Result<&OrgProfile, AppError> {
        match number {
            None => self
                .orgs
                .iter()
                .find(|o| o.msp_id == self.default_org_msp)
                .ok_or_else(|| {
                    AppError::Config(format!(
                        "default_org_msp '{}' matches no configured org",
                        self.default_org_msp
                    ))
                }),
            Some(n) => self
                .orgs
                .iter()
                .find(|o| o.number == n)
                .ok_or_else(|| AppError::Config(format!("no organisation numbered {n}"))),
        }
    }

    /// Built-in defaults: the two-org local test network.
    pub fn builtin() -> Self {
        Self {
            channel: default_channel(),
            contract: default_contract(),
            default_org_msp: default_org_msp(),
            wallet_path: PathBuf::from(default_wallet_path()),
            log_level: LevelFilter::INFO,
            demo_user: default_demo_user(),
            ledger: LedgerConfig {
                init_function: default_init_function(),
                init_conflict_marker: default_init_conflict_marker(),
                init_failure: InitFailurePolicy::TolerateRecognized,
            },
            backend: BackendKind::Http,
            timeouts: RawTimeouts::default().resolve(),
            orgs: vec![builtin_org(1, 7054, 7080), builtin_org(2, 8054, 9080)],
        }
    }
}

fn builtin_org(n: u8, ca_port: u16, gateway_port: u16) -> OrgProfile {
    OrgProfile {
        number: n,
        msp_id: format!("Org{n}MSP"),
        ca_host: format!("ca.org{n}.example.com"),
        ca_name: format!("ca-org{n}"),
        ca_url: format!("https://localhost:{ca_port}"),
        ca_tls_roots: Vec::new(),
        ca_verify_tls: false,
        gateway_url: format!("http://localhost:{gateway_port}"),
        discovery: DiscoveryOptions { enabled: true, as_localhost: true },
        affiliation: format!("org{n}.department1"),
        admin_label: format!("org{n}admin"),
        admin_enrollment_id: "admin".into(),
        admin_secret: "adminpw".into(),
    }
}

// ── Raw TOML shape ────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    app: RawApp,
    #[serde(default)]
    ledger: RawLedger,
    #[serde(default)]
    backend: RawBackend,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    orgs: Vec<RawOrg>,
}

#[derive(Deserialize)]
struct RawApp {
    #[serde(default = "default_channel")]
    channel: String,
    #[serde(default = "default_contract")]
    contract: String,
    #[serde(default = "default_org_msp")]
    default_org_msp: String,
    #[serde(default = "default_wallet_path")]
    wallet_path: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_demo_user")]
    demo_user: String,
}

impl Default for RawApp {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            contract: default_contract(),
            default_org_msp: default_org_msp(),
            wallet_path: default_wallet_path(),
            log_level: default_log_level(),
            demo_user: default_demo_user(),
        }
    }
}

#[derive(Deserialize)]
struct RawLedger {
    #[serde(default = "default_init_function")]
    init_function: String,
    #[serde(default = "default_init_conflict_marker")]
    init_conflict_marker: String,
    /// `"tolerate-recognized"` or `"tolerate-all"`.
    #[serde(default = "default_init_failure")]
    init_failure: String,
}

impl Default for RawLedger {
    fn default() -> Self {
        Self {
            init_function: default_init_function(),
            init_conflict_marker: default_init_conflict_marker(),
            init_failure: default_init_failure(),
        }
    }
}

#[derive(Deserialize)]
struct RawBackend {
    /// `"http"` or `"memory"`.
    #[serde(default = "default_backend_kind")]
    kind: String,
}

impl Default for RawBackend {
    fn default() -> Self {
        Self { kind: default_backend_kind() }
    }
}

#[derive(Deserialize)]
struct RawTimeouts {
    #[serde(default = "default_ca_seconds")]
    ca_seconds: u64,
    #[serde(default = "default_connect_seconds")]
    connect_seconds: u64,
    #[serde(default = "default_submit_seconds")]
    submit_seconds: u64,
    #[serde(default = "default_evaluate_seconds")]
    evaluate_seconds: u64,
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            ca_seconds: default_ca_seconds(),
            connect_seconds: default_connect_seconds(),
            submit_seconds: default_submit_seconds(),
            evaluate_seconds: default_evaluate_seconds(),
        }
    }
}

impl RawTimeouts {
    fn resolve(&self) -> Timeouts {
        Timeouts {
            ca: Duration::from_secs(self.ca_seconds),
            connect: Duration::from_secs(self.connect_seconds),
            submit: Duration::from_secs(self.submit_seconds),
            evaluate: Duration::from_secs(self.evaluate_seconds),
        }
    }
}

#[derive(Deserialize)]
struct RawOrg {
    number: u8,
    msp_id: String,
    ca_host: String,
    /// Fabric connection profile (JSON); fills in CA details not given here.
    #[serde(default)]
    connection_profile: Option<String>,
    #[serde(default)]
    ca_name: Option<String>,
    #[serde(default)]
    ca_url: Option<String>,
    /// Path to a PEM file trusted for the CA's TLS endpoint.
    #[serde(default)]
    ca_tls_cert: Option<String>,
    #[serde(default)]
    ca_verify_tls: Option<bool>,
    gateway_url: String,
    #[serde(default = "default_true")]
    discovery_enabled: bool,
    #[serde(default = "default_true")]
    discovery_as_localhost: bool,
    affiliation: String,
    #[serde(default)]
    admin_label: Option<String>,
    #[serde(default = "default_admin_enrollment_id")]
    admin_enrollment_id: String,
    #[serde(default = "default_admin_secret")]
    admin_secret: String,
}

fn default_channel() -> String { "mychannel".to_string() }
fn default_contract() -> String { "basic".to_string() }
fn default_org_msp() -> String { "Org1MSP".to_string() }
fn default_wallet_path() -> String { "wallet".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_demo_user() -> String { "appUser".to_string() }
fn default_init_function() -> String { "InitLedger".to_string() }
fn default_init_conflict_marker() -> String { "already initialized".to_string() }
fn default_init_failure() -> String { "tolerate-recognized".to_string() }
fn default_backend_kind() -> String { "http".to_string() }
fn default_ca_seconds() -> u64 { 30 }
fn default_connect_seconds() -> u64 { 15 }
fn default_submit_seconds() -> u64 { 60 }
fn default_evaluate_seconds() -> u64 { 15 }
fn default_admin_enrollment_id() -> String { "admin".to_string() }
fn default_admin_secret() -> String { "adminpw".to_string() }
fn default_true() -> bool { true }

// ── Loading ───────────────────────────────────────────────────────────────────

/// Load config from the given path, or `config/default.toml`, then apply
/// env-var overrides. Without an explicit path and without the default file,
/// the built-in defaults are used.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let wallet_override = env::var("PRODUCT_LEDGER_WALLET_PATH").ok();
    let log_level_override = env::var("PRODUCT_LEDGER_LOG_LEVEL").ok();

    let path = match config_path {
        Some(p) => PathBuf::from(p),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => PathBuf::from(DEFAULT_CONFIG_PATH),
        None => {
            let mut config = Config::builtin();
            apply_overrides(&mut config, wallet_override.as_deref(), log_level_override.as_deref())?;
            return Ok(config);
        }
    };
    load_from(&path, wallet_override.as_deref(), log_level_override.as_deref())
}

/// Internal loader: accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    wallet_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let base_dir = path.parent().unwrap_or(Path::new("."));
    let mut config = resolve(parsed, base_dir)?;
    apply_overrides(&mut config, wallet_override, log_level_override)?;
    Ok(config)
}

fn apply_overrides(
    config: &mut Config,
    wallet_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<(), AppError> {
    if let Some(w) = wallet_override {
        config.wallet_path = expand_home(w);
    }
    if let Some(l) = log_level_override {
        config.log_level = logger::parse_level(l)?;
    }
    Ok(())
}

fn resolve(parsed: RawConfig, base_dir: &Path) -> Result<Config, AppError> {
    let init_failure = match parsed.ledger.init_failure.as_str() {
        "tolerate-recognized" => InitFailurePolicy::TolerateRecognized,
        "tolerate-all" => InitFailurePolicy::TolerateAll,
        other => {
            return Err(AppError::Config(format!(
                "ledger.init_failure must be 'tolerate-recognized' or 'tolerate-all', got '{other}'"
            )));
        }
    };
    let backend = match parsed.backend.kind.as_str() {
        "http" => BackendKind::Http,
        "memory" => BackendKind::Memory,
        other => {
            return Err(AppError::Config(format!(
                "backend.kind must be 'http' or 'memory', got '{other}'"
            )));
        }
    };

    let orgs = if parsed.orgs.is_empty() {
        Config::builtin().orgs
    } else {
        parsed
            .orgs
            .into_iter()
            .map(|o| resolve_org(o, base_dir))
            .collect::<Result<Vec<_>, _>>()?
    };

    for (i, org) in orgs.iter().enumerate() {
        if orgs[..i].iter().any(|o| o.number == org.number) {
            return Err(AppError::Config(format!("organisation number {} is configured twice", org.number)));
        }
    }

    let config = Config {
        channel: parsed.app.channel,
        contract: parsed.app.contract,
        default_org_msp: parsed.app.default_org_msp,
        wallet_path: resolve_path(&parsed.app.wallet_path, base_dir),
        log_level: logger::parse_level(&parsed.app.log_level)?,
        demo_user: parsed.app.demo_user,
        ledger: LedgerConfig {
            init_function: parsed.ledger.init_function,
            init_conflict_marker: parsed.ledger.init_conflict_marker,
            init_failure,
        },
        backend,
        timeouts: parsed.timeouts.resolve(),
        orgs,
    };
    // Fail at load time rather than in the middle of a flow.
    config.org(None)?;
    Ok(config)
}

fn resolve_org(raw: RawOrg, base_dir: &Path) -> Result<OrgProfile, AppError> {
    let profile = raw
        .connection_profile
        .as_deref()
        .map(|p| ConnectionProfile::load(&resolve_path(p, base_dir)))
        .transpose()?;
    let endpoint = profile
        .as_ref()
        .map(|p| p.certificate_authority(&raw.ca_host))
        .transpose()?;

    let ca_url = raw
        .ca_url
        .or_else(|| endpoint.as_ref().map(|e| e.url.clone()))
        .ok_or_else(|| {
            AppError::Config(format!(
                "org {}: ca_url is required when no connection_profile is given",
                raw.number
            ))
        })?;
    let ca_name = raw
        .ca_name
        .or_else(|| endpoint.as_ref().map(|e| e.ca_name.clone()))
        .unwrap_or_else(|| raw.ca_host.clone());

    let mut ca_tls_roots = endpoint.as_ref().map(|e| e.tls_roots.clone()).unwrap_or_default();
    if let Some(cert_path) = raw.ca_tls_cert {
        let path = resolve_path(&cert_path, base_dir);
        let pem = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("cannot read CA TLS cert {}: {e}", path.display())))?;
        ca_tls_roots.push(pem);
    }
    let ca_verify_tls = raw
        .ca_verify_tls
        .or_else(|| endpoint.as_ref().map(|e| e.verify))
        .unwrap_or(true);

    if let Some(p) = &profile {
        p.check_msp(&raw.msp_id)?;
        if !p.organization_cas(&raw.msp_id).contains(&raw.ca_host) {
            warn!(org = raw.number, ca_host = %raw.ca_host, "CA is not listed under the organisation in its connection profile");
        }
    }

    Ok(OrgProfile {
        number: raw.number,
        admin_label: raw.admin_label.unwrap_or_else(|| format!("org{}admin", raw.number)),
        msp_id: raw.msp_id,
        ca_host: raw.ca_host,
        ca_name,
        ca_url,
        ca_tls_roots,
        ca_verify_tls,
        gateway_url: raw.gateway_url,
        discovery: DiscoveryOptions {
            enabled: raw.discovery_enabled,
            as_localhost: raw.discovery_as_localhost,
        },
        affiliation: raw.affiliation,
        admin_enrollment_id: raw.admin_enrollment_id,
        admin_secret: raw.admin_secret,
    })
}

/// `~` expansion, then relative paths are taken from the config file's dir.
fn resolve_path(path: &str, base_dir: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── presets ───────────────────────────────────────────────────────────────────

impl Config {
    /// Built-in layout with in-memory backends and short deadlines.
    /// Used by tests and offline runs; no network calls.
    pub fn memory_default(wallet_path: &Path) -> Self {
        let mut config = Self::builtin();
        config.backend = BackendKind::Memory;
        config.wallet_path = wallet_path.to_path_buf();
        config.timeouts = Timeouts {
            ca: Duration::from_secs(5),
            connect: Duration::from_secs(5),
            submit: Duration::from_secs(5),
            evaluate: Duration::from_secs(5),
        };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const MINIMAL_TOML: &str = r#"
[app]
channel = "supply"
wallet_path = "/var/lib/ledger/wallet"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_minimal_config_uses_builtin_orgs() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.channel, "supply");
        assert_eq!(cfg.contract, "basic");
        assert_eq!(cfg.wallet_path, PathBuf::from("/var/lib/ledger/wallet"));
        assert_eq!(cfg.orgs.len(), 2);
        assert_eq!(cfg.backend, BackendKind::Http);
        assert_eq!(cfg.ledger.init_failure, InitFailurePolicy::TolerateRecognized);
    }

    #[test]
    fn org_routing_defaults_to_org1() {
        let cfg = Config::builtin();
        let default = cfg.org(None).unwrap();
        assert_eq!(default.msp_id, "Org1MSP");
        assert_eq!(default.ca_host, "ca.org1.example.com");
        assert_eq!(default.affiliation, "org1.department1");
        assert_eq!(cfg.org(Some(1)).unwrap().msp_id, "Org1MSP");

        let org2 = cfg.org(Some(2)).unwrap();
        assert_eq!(org2.msp_id, "Org2MSP");
        assert_eq!(org2.ca_host, "ca.org2.example.com");
        assert_eq!(org2.affiliation, "org2.department1");
        assert_eq!(org2.admin_label, "org2admin");

        assert!(cfg.org(Some(7)).is_err());
    }

    #[test]
    fn explicit_orgs_and_relative_paths() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ca.pem"), "-----BEGIN CERTIFICATE-----\nx\n-----END CERTIFICATE-----\n").unwrap();
        let toml = r#"
[app]
wallet_path = "wallet"
default_org_msp = "RetailMSP"

[backend]
kind = "memory"

[timeouts]
submit_seconds = 90

[[orgs]]
number = 1
msp_id = "RetailMSP"
ca_host = "ca.retail.example.com"
ca_url = "https://ca.retail:7054"
ca_tls_cert = "ca.pem"
gateway_url = "http://gw.retail:7080"
affiliation = "retail.stores"
"#;
        let path = dir.path().join("app.toml");
        std::fs::write(&path, toml).unwrap();

        let cfg = load_from(&path, None, None).unwrap();
        assert_eq!(cfg.backend, BackendKind::Memory);
        assert_eq!(cfg.wallet_path, dir.path().join("wallet"));
        assert_eq!(cfg.timeouts.submit, Duration::from_secs(90));
        assert_eq!(cfg.timeouts.evaluate, Duration::from_secs(15));

        let org = cfg.org(None).unwrap();
        assert_eq!(org.ca_name, "ca.retail.example.com");
        assert_eq!(org.admin_label, "org1admin");
        assert_eq!(org.ca_tls_roots.len(), 1);
        assert!(org.ca_verify_tls);
    }

    #[test]
    fn unknown_default_msp_is_rejected() {
        let f = write_toml("[app]\ndefault_org_msp = \"NopeMSP\"\n");
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("NopeMSP"));
    }

    #[test]
    fn bad_policy_and_backend_are_rejected() {
        let f = write_toml("[ledger]\ninit_failure = \"ignore\"\n");
        assert!(load_from(f.path(), None, None).is_err());
        let f = write_toml("[backend]\nkind = \"grpc\"\n");
        assert!(load_from(f.path(), None, None).is_err());
    }

    #[test]
    fn org_without_ca_url_or_profile_is_rejected() {
        let f = write_toml(
            r#"
[[orgs]]
number = 1
msp_id = "Org1MSP"
ca_host = "ca.org1.example.com"
gateway_url = "http://localhost:7080"
affiliation = "org1.department1"
"#,
        );
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("ca_url is required"));
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/wallet");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with("wallet"));
    }

    #[test]
    fn absolute_path_unchanged() {
        assert_eq!(expand_home("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.toml"), None, None);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("config error"));
    }

    #[test]
    fn env_overrides_apply() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("/tmp/other-wallet"), Some("debug")).unwrap();
        assert_eq!(cfg.wallet_path, PathBuf::from("/tmp/other-wallet"));
        assert_eq!(cfg.log_level, LevelFilter::DEBUG);
    }

    #[test]
    fn bad_log_level_is_rejected_at_load() {
        let f = write_toml("[app]\nlog_level = \"chatty\"\n");
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(matches!(err, AppError::Config(ref m) if m.contains("chatty")), "{err}");

        let f = write_toml(MINIMAL_TOML);
        assert!(matches!(load_from(f.path(), None, Some("loud")), Err(AppError::Config(_))));
        assert_eq!(load_from(f.path(), None, None).unwrap().log_level, LevelFilter::INFO);
    }
}
