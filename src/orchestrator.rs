//! Entry flows.
//!
//! - [`Orchestrator::run_demo`]: enroll the default org's admin, register the
//!   demo user, connect, initialise the ledger once, run a fixed sequence of
//!   product transactions, disconnect.
//! - [`Orchestrator::enroll_admins`]: bootstrap enrollment for one or more orgs.
//! - [`Orchestrator::register_user`]: register and enroll a named user with
//!   `username`/`role` attributes for a chosen org.
//!
//! Steps run strictly in order. Errors stop the flow and are returned with
//! context; the gateway session is closed on every path.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::ca::{
    Attribute, AttributeRequest, CaBackend, CaClient, Enrollment, HttpCa, Registration, RegistrationRequest,
};
use crate::config::{BackendKind, Config, InitFailurePolicy, OrgProfile};
use crate::error::AppError;
use crate::gateway::{Contract, Gateway, GatewayBackend, HttpGateway, Invocation, InvocationKind};
use crate::sandbox::Sandbox;
use crate::wallet::Wallet;

/// Transport per organisation number.
#[derive(Debug, Clone, Default)]
pub struct Backends {
    pub ca: BTreeMap<u8, CaBackend>,
    pub gateway: BTreeMap<u8, GatewayBackend>,
}

impl Backends {
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        match config.backend {
            BackendKind::Memory => Ok(Sandbox::for_config(config)?.backends()),
            BackendKind::Http => {
                let mut backends = Backends::default();
                for org in &config.orgs {
                    let ca = HttpCa::new(org, config.timeouts.ca)
                        .map_err(|e| AppError::Config(format!("CA client for {}: {e}", org.msp_id)))?;
                    backends.ca.insert(org.number, CaBackend::Http(ca));
                    let gateway = HttpGateway::new(&org.gateway_url)
                        .map_err(|e| AppError::Config(format!("gateway for {}: {e}", org.msp_id)))?;
                    backends.gateway.insert(org.number, GatewayBackend::Http(gateway));
                }
                Ok(backends)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemoOptions {
    pub skip_init: bool,
    /// Print `--> …` / `*** Result: …` lines to stdout as the flow runs.
    pub narrate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Committed,
    AlreadyInitialized,
    /// Tolerated under [`InitFailurePolicy::TolerateAll`].
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoStep {
    pub kind: InvocationKind,
    pub function: String,
    pub args: Vec<String>,
    pub payload: Vec<u8>,
}

impl DemoStep {
    pub fn pretty(&self) -> String {
        pretty_json(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoReport {
    pub admin: bool,
    pub user: bool,
    pub init: InitOutcome,
    pub steps: Vec<DemoStep>,
}

/// Re-indent a JSON payload; non-JSON payloads are returned as text.
pub fn pretty_json(payload: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
        Err(_) => String::from_utf8_lossy(payload).into_owned(),
    }
}

pub struct Orchestrator {
    config: Config,
    wallet: Wallet,
    backends: Backends,
}

impl Orchestrator {
    pub fn new(config: Config, wallet: Wallet, backends: Backends) -> Self {
        Self { config, wallet, backends }
    }

    /// Wallet and backends as the configuration describes them. The memory
    /// backend gets an in-memory wallet: its CA roots do not outlive the
    /// process, so persisted identities from it would be useless.
    pub async fn from_config(config: Config) -> Result<Self, AppError> {
        let wallet = match config.backend {
            BackendKind::Http => Wallet::open(&config.wallet_path).await?,
            BackendKind::Memory => {
                warn!("memory backend: identities and ledger state are discarded on exit");
                Wallet::in_memory()
            }
        };
        let backends = Backends::from_config(&config)?;
        Ok(Self::new(config, wallet, backends))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    fn ca_client(&self, org: &OrgProfile) -> Result<CaClient, AppError> {
        let backend = self
            .backends
            .ca
            .get(&org.number)
            .cloned()
            .ok_or_else(|| AppError::Config(format!("no CA backend for {}", org.msp_id)))?;
        Ok(CaClient::new(backend, org, self.config.timeouts.ca))
    }

    fn gateway(&self, org: &OrgProfile) -> Result<Gateway, AppError> {
        let backend = self
            .backends
            .gateway
            .get(&org.number)
            .cloned()
            .ok_or_else(|| AppError::Config(format!("no gateway backend for {}", org.msp_id)))?;
        Ok(Gateway::new(backend, self.config.timeouts, org.discovery))
    }

    // ── admin enrollment ─────────────────────────────────────────────────────

    /// Enroll the admin of org `number` (default org when `None`).
    pub async fn enroll_admin(&self, number: Option<u8>) -> Result<Enrollment, AppError> {
        let org = self.config.org(number)?;
        let client = self.ca_client(org)?;
        Ok(client.enroll_admin(&self.wallet, &org.admin_label).await?)
    }

    /// Enroll admins for `numbers`, or for every configured org when empty.
    /// Stops at the first failure.
    pub async fn enroll_admins(&self, numbers: &[u8]) -> Result<Vec<(String, Enrollment)>, AppError> {
        let numbers: Vec<u8> = if numbers.is_empty() {
            self.config.orgs.iter().map(|o| o.number).collect()
        } else {
            numbers.to_vec()
        };

        let mut outcomes = Vec::with_capacity(numbers.len());
        for n in numbers {
            let outcome = self.enroll_admin(Some(n)).await?;
            let label = self.config.org(Some(n))?.admin_label.clone();
            outcomes.push((label, outcome));
        }
        Ok(outcomes)
    }

    // ── user registration ────────────────────────────────────────────────────

    /// Register `username` in org `number` (default org when `None`) with
    /// `username` and `role` attributes, both required in the certificate.
    pub async fn register_user(&self, username: &str, role: &str, number: Option<u8>) -> Result<Registration, AppError> {
        let org = self.config.org(number)?;
        let request = RegistrationRequest::new(username)
            .affiliation(org.affiliation.clone())
            .attribute(Attribute::new("username", username, false))
            .attribute(Attribute::new("role", role, false))
            .attribute_request(AttributeRequest::required("username"))
            .attribute_request(AttributeRequest::required("role"));
        info!(username, role, msp = %org.msp_id, affiliation = %org.affiliation, "registering user");
        self.register(org, &request).await
    }

    pub async fn register(&self, org: &OrgProfile, request: &RegistrationRequest) -> Result<Registration, AppError> {
        let client = self.ca_client(org)?;
        Ok(client.register_and_enroll(&self.wallet, &org.admin_label, request).await?)
    }

    // ── demo ─────────────────────────────────────────────────────────────────

    pub async fn run_demo(&self, options: DemoOptions) -> Result<DemoReport, AppError> {
        let org = self.config.org(None)?;

        let admin = self.ca_client(org)?.enroll_admin(&self.wallet, &org.admin_label).await?;
        let user_request = RegistrationRequest::new(self.config.demo_user.as_str()).affiliation(org.affiliation.clone());
        let user = self.register(org, &user_request).await?;

        let mut report = DemoReport {
            admin: matches!(admin, Enrollment::Enrolled(_)),
            user: matches!(user, Registration::Registered(_)),
            init: InitOutcome::Skipped,
            steps: Vec::new(),
        };

        let mut gateway = self.gateway(org)?;
        let outcome = self.demo_session(&mut gateway, options, &mut report).await;
        gateway.disconnect().await;
        outcome.map(|()| report)
    }

    async fn demo_session(
        &self,
        gateway: &mut Gateway,
        options: DemoOptions,
        report: &mut DemoReport,
    ) -> Result<(), AppError> {
        gateway.connect(&self.wallet, &self.config.demo_user).await?;
        let contract = gateway.contract(&self.config.channel, &self.config.contract).await?;

        report.init = if options.skip_init {
            narrate(options, &format!("*** not executing \"{}\"", self.config.ledger.init_function));
            InitOutcome::Skipped
        } else {
            self.init_ledger(&contract, options).await?
        };

        let sequence = [
            (Invocation::evaluate("QueryAllProducts", &[]), "function returns all products"),
            (Invocation::submit("CreateProduct", &["Coca Cola", "6 packs"]), "function creates a new product"),
            (Invocation::submit("CreateProduct", &["Sprite", "6 packs"]), "function creates a new product"),
            (Invocation::evaluate("QueryProduct", &["2"]), "function gets a single product by id"),
        ];
        for (call, about) in sequence {
            narrate(options, &format!("\n--> {} Transaction: {}, {about}", kind_title(call.kind), call.function));
            let payload = contract.invoke(&call).await?;
            let step = DemoStep { kind: call.kind, function: call.function, args: call.args, payload };
            narrate(options, &format!("*** Result: {}", step.pretty()));
            report.steps.push(step);
        }
        narrate(options, "*** all tests completed");
        Ok(())
    }

    async fn init_ledger(&self, contract: &Contract<'_>, options: DemoOptions) -> Result<InitOutcome, AppError> {
        let ledger = &self.config.ledger;
        narrate(
            options,
            &format!(
                "\n--> Submit Transaction: {}, function creates the initial set of assets on the ledger",
                ledger.init_function
            ),
        );
        match contract.submit(&ledger.init_function, &[]).await {
            Ok(_) => {
                narrate(options, "*** Result: committed");
                Ok(InitOutcome::Committed)
            }
            Err(e) if e.is_already_initialized(&ledger.init_conflict_marker) => {
                info!(function = %ledger.init_function, "ledger already initialised; continuing");
                narrate(options, "*** Result: already initialized");
                Ok(InitOutcome::AlreadyInitialized)
            }
            Err(e) => match ledger.init_failure {
                InitFailurePolicy::TolerateAll => {
                    warn!(function = %ledger.init_function, error = %e, "init failed; continuing by policy");
                    narrate(options, &format!("******** {} failed :: {e}", ledger.init_function));
                    Ok(InitOutcome::Failed(e.to_string()))
                }
                InitFailurePolicy::TolerateRecognized => Err(e.into()),
            },
        }
    }
}

fn kind_title(kind: InvocationKind) -> &'static str {
    match kind {
        InvocationKind::Submit => "Submit",
        InvocationKind::Evaluate => "Evaluate",
    }
}

fn narrate(options: DemoOptions, line: &str) {
    if options.narrate {
        println!("{line}");
    }
}
