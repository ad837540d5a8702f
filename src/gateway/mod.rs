//! Ledger gateway session.
//!
//! A [`Gateway`] turns a wallet identity into a session with the ledger
//! network. From a connected gateway a [`Network`] (channel) and a
//! [`Contract`] (chaincode on that channel) are resolved, and transactions
//! are either:
//!
//! - **submitted** ([`Contract::submit`]): endorsed, ordered and committed;
//!   the call returns once the transaction is on the ledger;
//! - **evaluated** ([`Contract::evaluate`]): executed read-only against
//!   current state and never ordered.
//!
//! Every proposal carries a client-side transaction id,
//! `hex(sha256(nonce || certificate))`, and is signed with the identity's key.
//!
//! The gateway is a scoped resource. [`Gateway::disconnect`] closes the session
//! and is a no-op when nothing is open; dropping a still-connected gateway
//! releases the session synchronously.

pub mod basic;
pub mod http;
pub mod memory;

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use http::HttpGateway;
pub use memory::{Chaincode, ClientIdentity, CommittedTransaction, InMemoryLedger, TxContext};

use crate::config::{DiscoveryOptions, Timeouts};
use crate::identity::{self, CredentialError, Identity};
use crate::wallet::{Wallet, WalletError};

/// Path signed in the connect token.
pub const SESSIONS_PATH: &str = "/api/v1/sessions";

const NONCE_LEN: usize = 24;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("identity unavailable: {0}")]
    Identity(#[from] WalletError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("failed to connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("gateway is not connected")]
    NotConnected,
    #[error("cannot resolve {target}: {reason}")]
    Resolution { target: String, reason: String },
    #[error("transaction {function} ({transaction_id}) failed: {reason}")]
    Transaction { function: String, transaction_id: String, reason: String },
    #[error("query {function} failed: {reason}")]
    Query { function: String, reason: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl GatewayError {
    /// `true` for a submit failure whose reason contains `marker`.
    pub fn is_already_initialized(&self, marker: &str) -> bool {
        matches!(self, GatewayError::Transaction { reason, .. } if reason.contains(marker))
    }
}

/// Failure reported by a backend, before the gateway attaches call context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fault {
    Unreachable(String),
    Denied(String),
    NotFound(String),
    Rejected(String),
    Malformed(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Unreachable(m) => write!(f, "unreachable: {m}"),
            Fault::Denied(m) => write!(f, "access denied: {m}"),
            Fault::NotFound(m) => write!(f, "not found: {m}"),
            Fault::Rejected(m) => write!(f, "{m}"),
            Fault::Malformed(m) => write!(f, "malformed response: {m}"),
        }
    }
}

// ── Invocation & wire types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationKind {
    Submit,
    Evaluate,
}

impl fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationKind::Submit => f.write_str("submit"),
            InvocationKind::Evaluate => f.write_str("evaluate"),
        }
    }
}

/// One contract call: function name and ordered string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub function: String,
    pub args: Vec<String>,
    pub kind: InvocationKind,
}

impl Invocation {
    pub fn submit(function: impl Into<String>, args: &[&str]) -> Self {
        Self::new(function, args, InvocationKind::Submit)
    }

    pub fn evaluate(function: impl Into<String>, args: &[&str]) -> Self {
        Self::new(function, args, InvocationKind::Evaluate)
    }

    fn new(function: impl Into<String>, args: &[&str], kind: InvocationKind) -> Self {
        Self {
            function: function.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRequest {
    pub enabled: bool,
    pub as_localhost: bool,
}

/// Body of `POST /api/v1/sessions`. Authenticated by a signed token over the
/// exact serialised bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub msp_id: String,
    pub certificate: String,
    pub discovery: DiscoveryRequest,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub transaction_id: String,
    /// Base64 nonce the transaction id was derived from.
    pub nonce: String,
    pub channel: String,
    pub contract: String,
    pub function: String,
    pub args: Vec<String>,
    pub kind: InvocationKind,
    pub timestamp: i64,
}

/// Serialised proposal plus the creator's signature over those bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub proposal: String,
    pub signature: String,
}

/// `hex(sha256(nonce || certificate))`.
pub fn transaction_id(nonce: &[u8], certificate_pem: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(certificate_pem.as_bytes());
    hex::encode(hasher.finalize())
}

// ── Backend enum ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum GatewayBackend {
    Http(HttpGateway),
    Memory(InMemoryLedger),
}

impl GatewayBackend {
    pub fn endpoint(&self) -> String {
        match self {
            GatewayBackend::Http(g) => g.endpoint().to_string(),
            GatewayBackend::Memory(_) => "in-memory ledger".to_string(),
        }
    }

    async fn open(&self, body: &[u8], token: &str) -> Result<String, Fault> {
        match self {
            GatewayBackend::Http(g) => g.open(body, token).await,
            GatewayBackend::Memory(l) => l.open(body, token),
        }
    }

    async fn resolve(&self, session: &str, channel: &str, contract: Option<&str>) -> Result<(), Fault> {
        match self {
            GatewayBackend::Http(g) => g.resolve(session, channel, contract).await,
            GatewayBackend::Memory(l) => l.resolve(session, channel, contract),
        }
    }

    async fn invoke(&self, session: &str, proposal: &Proposal, signed: &SignedProposal) -> Result<Vec<u8>, Fault> {
        match self {
            GatewayBackend::Http(g) => g.invoke(session, proposal, signed).await,
            GatewayBackend::Memory(l) => l.invoke(session, signed),
        }
    }

    async fn close(&self, session: &str) -> Result<(), Fault> {
        match self {
            GatewayBackend::Http(g) => g.close(session).await,
            GatewayBackend::Memory(l) => l.close(session),
        }
    }

    /// Best-effort synchronous release, used from `Drop`.
    fn release(&self, session: &str) {
        match self {
            GatewayBackend::Http(g) => g.release(session),
            GatewayBackend::Memory(l) => {
                let _ = l.close(session);
            }
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Session {
    id: String,
    identity: Identity,
}

/// Connection to the ledger network on behalf of one wallet identity.
#[derive(Debug)]
pub struct Gateway {
    backend: GatewayBackend,
    timeouts: Timeouts,
    discovery: DiscoveryOptions,
    session: Option<Session>,
}

impl Gateway {
    pub fn new(backend: GatewayBackend, timeouts: Timeouts, discovery: DiscoveryOptions) -> Self {
        Self { backend, timeouts, discovery, session: None }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Open a session as the wallet identity stored under `label`.
    ///
    /// A missing label fails with [`GatewayError::Identity`] before the
    /// network is contacted. An already open session is closed first.
    pub async fn connect(&mut self, wallet: &Wallet, label: &str) -> Result<(), GatewayError> {
        let identity = wallet.get(label).await?;
        if self.session.is_some() {
            self.disconnect().await;
        }

        let request = ConnectRequest {
            msp_id: identity.msp_id.clone(),
            certificate: identity.credentials.certificate.clone(),
            discovery: DiscoveryRequest {
                enabled: self.discovery.enabled,
                as_localhost: self.discovery.as_localhost,
            },
            timestamp: chrono::Utc::now().timestamp(),
        };
        let body = serde_json::to_vec(&request).map_err(|e| GatewayError::Connection {
            endpoint: self.backend.endpoint(),
            reason: format!("cannot encode connect request: {e}"),
        })?;
        let token = identity::auth_token(&identity, "POST", SESSIONS_PATH, &body)?;

        let after = self.timeouts.connect;
        let id = tokio::time::timeout(after, self.backend.open(&body, &token))
            .await
            .map_err(|_| GatewayError::Timeout { operation: "connect".into(), after })?
            .map_err(|fault| GatewayError::Connection {
                endpoint: self.backend.endpoint(),
                reason: fault.to_string(),
            })?;

        info!(label, msp = %identity.msp_id, endpoint = %self.backend.endpoint(), "gateway connected");
        self.session = Some(Session { id, identity });
        Ok(())
    }

    /// Resolve a channel on the connected network.
    pub async fn network(&self, channel: &str) -> Result<Network<'_>, GatewayError> {
        let session = self.session()?;
        self.resolve(session, channel, None).await?;
        Ok(Network { gateway: self, channel: channel.to_string() })
    }

    /// Shortcut for `network(channel)` followed by `contract(name)`.
    pub async fn contract(&self, channel: &str, name: &str) -> Result<Contract<'_>, GatewayError> {
        self.network(channel).await?.contract(name).await
    }

    /// Close the session. Failures are logged, never returned, and a gateway
    /// that never connected is left as it is.
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            debug!("disconnect on an idle gateway");
            return;
        };
        let after = self.timeouts.connect;
        match tokio::time::timeout(after, self.backend.close(&session.id)).await {
            Ok(Ok(())) => info!(label = %session.identity.label, "gateway disconnected"),
            Ok(Err(fault)) => warn!(label = %session.identity.label, %fault, "gateway close failed"),
            Err(_) => warn!(label = %session.identity.label, ?after, "gateway close timed out"),
        }
    }

    fn session(&self) -> Result<&Session, GatewayError> {
        self.session.as_ref().ok_or(GatewayError::NotConnected)
    }

    async fn resolve(&self, session: &Session, channel: &str, contract: Option<&str>) -> Result<(), GatewayError> {
        let target = match contract {
            Some(name) => format!("contract '{name}' on channel '{channel}'"),
            None => format!("channel '{channel}'"),
        };
        let after = self.timeouts.connect;
        tokio::time::timeout(after, self.backend.resolve(&session.id, channel, contract))
            .await
            .map_err(|_| GatewayError::Timeout { operation: format!("resolving {target}"), after })?
            .map_err(|fault| match fault {
                Fault::Unreachable(reason) => GatewayError::Connection { endpoint: self.backend.endpoint(), reason },
                other => GatewayError::Resolution { target, reason: other.to_string() },
            })
    }

    async fn invoke(&self, channel: &str, contract: &str, call: &Invocation) -> Result<Vec<u8>, GatewayError> {
        let session = self.session()?;

        let mut nonce = [0u8; NONCE_LEN];
        openssl::rand::rand_bytes(&mut nonce).map_err(CredentialError::from)?;
        let transaction_id = transaction_id(&nonce, &session.identity.credentials.certificate);

        let proposal = Proposal {
            transaction_id: transaction_id.clone(),
            nonce: B64.encode(nonce),
            channel: channel.to_string(),
            contract: contract.to_string(),
            function: call.function.clone(),
            args: call.args.clone(),
            kind: call.kind,
            timestamp: chrono::Utc::now().timestamp(),
        };
        let bytes = serde_json::to_vec(&proposal).map_err(|e| GatewayError::Connection {
            endpoint: self.backend.endpoint(),
            reason: format!("cannot encode proposal: {e}"),
        })?;
        let signed = SignedProposal {
            signature: B64.encode(session.identity.sign(&bytes)?),
            proposal: B64.encode(&bytes),
        };

        let after = match call.kind {
            InvocationKind::Submit => self.timeouts.submit,
            InvocationKind::Evaluate => self.timeouts.evaluate,
        };
        debug!(function = %call.function, kind = %call.kind, tx = %transaction_id, "sending proposal");

        let outcome = tokio::time::timeout(after, self.backend.invoke(&session.id, &proposal, &signed))
            .await
            .map_err(|_| GatewayError::Timeout { operation: format!("{} {}", call.kind, call.function), after })?;

        outcome.map_err(|fault| match call.kind {
            InvocationKind::Submit => GatewayError::Transaction {
                function: call.function.clone(),
                transaction_id,
                reason: fault.to_string(),
            },
            InvocationKind::Evaluate => GatewayError::Query {
                function: call.function.clone(),
                reason: fault.to_string(),
            },
        })
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(label = %session.identity.label, "releasing gateway session on drop");
            self.backend.release(&session.id);
        }
    }
}

// ── Network / Contract ────────────────────────────────────────────────────────

/// A resolved channel.
#[derive(Debug)]
pub struct Network<'g> {
    gateway: &'g Gateway,
    channel: String,
}

impl<'g> Network<'g> {
    pub async fn contract(&self, name: &str) -> Result<Contract<'g>, GatewayError> {
        let session = self.gateway.session()?;
        self.gateway.resolve(session, &self.channel, Some(name)).await?;
        Ok(Contract {
            gateway: self.gateway,
            channel: self.channel.clone(),
            name: name.to_string(),
        })
    }
}

/// A resolved chaincode on a channel.
#[derive(Debug)]
pub struct Contract<'g> {
    gateway: &'g Gateway,
    channel: String,
    name: String,
}

impl Contract<'_> {
    /// Submit for ordering and wait for commit.
    pub async fn submit(&self, function: &str, args: &[&str]) -> Result<Vec<u8>, GatewayError> {
        self.invoke(&Invocation::submit(function, args)).await
    }

    /// Evaluate against current state. Never ordered, never mutates.
    pub async fn evaluate(&self, function: &str, args: &[&str]) -> Result<Vec<u8>, GatewayError> {
        self.invoke(&Invocation::evaluate(function, args)).await
    }

    pub async fn invoke(&self, call: &Invocation) -> Result<Vec<u8>, GatewayError> {
        self.gateway.invoke(&self.channel, &self.name, call).await
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ca::{CaBackend, CaClient, InMemoryCa, Registration, RegistrationRequest};
    use crate::config::Config;

    /// Org1 CA and a ledger trusting it, with `basic` deployed on `mychannel`
    /// and `appUser` enrolled in the returned wallet.
    pub(crate) async fn fixture() -> (InMemoryLedger, Wallet, Config) {
        let config = Config::memory_default(std::path::Path::new("unused"));
        let org = config.org(Some(1)).unwrap().clone();
        let ca = InMemoryCa::for_org(&org).unwrap();
        let ledger = InMemoryLedger::new();
        ledger.trust(&org.msp_id, &ca.root_certificate_pem().unwrap()).unwrap();
        ledger.deploy(&config.channel, &config.contract, Arc::new(basic::ProductContract));

        let wallet = Wallet::in_memory();
        let client = CaClient::new(CaBackend::Memory(ca), &org, Duration::from_secs(5));
        client.enroll_admin(&wallet, &org.admin_label).await.unwrap();
        let req = RegistrationRequest::new("appUser");
        let Registration::Registered(_) = client.register_and_enroll(&wallet, &org.admin_label, &req).await.unwrap()
        else {
            panic!("expected registration");
        };
        (ledger, wallet, config)
    }

    fn gateway(ledger: &InMemoryLedger, config: &Config) -> Gateway {
        Gateway::new(
            GatewayBackend::Memory(ledger.clone()),
            config.timeouts,
            DiscoveryOptions { enabled: true, as_localhost: true },
        )
    }

    #[test]
    fn transaction_id_is_hex_sha256() {
        let a = transaction_id(b"nonce", "cert");
        assert_eq!(a.len(), 64);
        assert_ne!(a, transaction_id(b"other", "cert"));
        assert_eq!(a, transaction_id(b"nonce", "cert"));
    }

    #[test]
    fn already_initialized_is_recognised_on_submit_only() {
        let tx = GatewayError::Transaction {
            function: "InitLedger".into(),
            transaction_id: "ab".into(),
            reason: "ledger already initialized".into(),
        };
        assert!(tx.is_already_initialized("already initialized"));
        let query = GatewayError::Query { function: "InitLedger".into(), reason: "already initialized".into() };
        assert!(!query.is_already_initialized("already initialized"));
    }

    #[tokio::test]
    async fn connect_requires_wallet_identity() {
        let (ledger, wallet, config) = fixture().await;
        let mut gw = gateway(&ledger, &config);
        let err = gw.connect(&wallet, "nobody").await.unwrap_err();
        assert!(matches!(err, GatewayError::Identity(WalletError::NotFound(_))));
        assert_eq!(ledger.open_sessions(), 0);
    }

    #[tokio::test]
    async fn not_connected_gateway_cannot_resolve() {
        let (ledger, _wallet, config) = fixture().await;
        let gw = gateway(&ledger, &config);
        assert!(matches!(gw.network("mychannel").await, Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn unknown_channel_and_contract_fail_resolution() {
        let (ledger, wallet, config) = fixture().await;
        let mut gw = gateway(&ledger, &config);
        gw.connect(&wallet, "appUser").await.unwrap();

        assert!(matches!(gw.network("nochannel").await, Err(GatewayError::Resolution { .. })));
        assert!(matches!(gw.contract("mychannel", "nope").await, Err(GatewayError::Resolution { .. })));
        gw.disconnect().await;
    }

    #[tokio::test]
    async fn submit_commits_and_evaluate_reads() {
        let (ledger, wallet, config) = fixture().await;
        let mut gw = gateway(&ledger, &config);
        gw.connect(&wallet, "appUser").await.unwrap();
        {
            let contract = gw.contract("mychannel", "basic").await.unwrap();
            contract.submit("CreateProduct", &["Tea", "box"]).await.unwrap();
            let got = contract.evaluate("QueryProduct", &["1"]).await.unwrap();
            let product: serde_json::Value = serde_json::from_slice(&got).unwrap();
            assert_eq!(product["name"], "Tea");
        }
        assert_eq!(ledger.committed_transactions("mychannel").len(), 1);
        gw.disconnect().await;
        assert_eq!(ledger.open_sessions(), 0);
    }

    #[tokio::test]
    async fn contract_errors_are_typed_by_kind() {
        let (ledger, wallet, config) = fixture().await;
        let mut gw = gateway(&ledger, &config);
        gw.connect(&wallet, "appUser").await.unwrap();
        let contract = gw.contract("mychannel", "basic").await.unwrap();

        let err = contract.evaluate("QueryProduct", &["99"]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Query { .. }));
        let err = contract.submit("NoSuchFunction", &[]).await.unwrap_err();
        let GatewayError::Transaction { transaction_id, .. } = err else { panic!("expected transaction error") };
        assert_eq!(transaction_id.len(), 64);
    }

    #[tokio::test]
    async fn drop_releases_session() {
        let (ledger, wallet, config) = fixture().await;
        {
            let mut gw = gateway(&ledger, &config);
            gw.connect(&wallet, "appUser").await.unwrap();
            assert_eq!(ledger.open_sessions(), 1);
        }
        assert_eq!(ledger.open_sessions(), 0);
    }

    #[tokio::test]
    async fn disconnect_is_tolerant() {
        let (ledger, wallet, config) = fixture().await;
        let mut gw = gateway(&ledger, &config);
        gw.disconnect().await;

        ledger.set_reachable(false);
        assert!(matches!(gw.connect(&wallet, "appUser").await, Err(GatewayError::Connection { .. })));
        assert!(!gw.is_connected());
        gw.disconnect().await;
    }
}
