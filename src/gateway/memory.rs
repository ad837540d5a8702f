//! In-process ledger.
//!
//! Stands in for a peer network: channels with deployed chaincode, a world
//! state per channel, an ordered commit history and per-MSP trust anchors.
//! Sessions are authenticated with the same signed token the HTTP bridge
//! uses, proposals are signature-checked against the session certificate and
//! their transaction id is recomputed from the nonce.
//!
//! Submits commit their write set; evaluations run the same chaincode and
//! discard it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use openssl::x509::X509;
use tracing::{debug, info};

use super::{ConnectRequest, Fault, InvocationKind, Proposal, SESSIONS_PATH, SignedProposal, transaction_id};
use crate::identity::{self, CredentialError};

// ── Chaincode API ─────────────────────────────────────────────────────────────

/// Contract logic hosted by the ledger.
///
/// Errors are returned as plain messages; they reach the client as the
/// transaction or query failure reason.
pub trait Chaincode: Send + Sync {
    fn invoke(&self, ctx: &mut TxContext<'_>, function: &str, args: &[String]) -> Result<Vec<u8>, String>;
}

/// Submitting identity as derived from its certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub msp_id: String,
    /// `x509::<subject>::<issuer>`.
    pub id: String,
    pub enrollment_id: String,
    pub attributes: BTreeMap<String, String>,
}

impl ClientIdentity {
    fn from_certificate(msp_id: &str, cert: &X509) -> Result<Self, CredentialError> {
        let enrollment_id = identity::common_name(cert)?;
        let issuer = cert
            .issuer_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string())
            .unwrap_or_default();
        Ok(Self {
            msp_id: msp_id.to_string(),
            id: format!("x509::CN={enrollment_id}::CN={issuer}"),
            enrollment_id,
            attributes: identity::certificate_attributes(cert)?,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// View of world state for one transaction. Reads see the transaction's own
/// writes.
pub struct TxContext<'a> {
    state: &'a BTreeMap<String, Vec<u8>>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
    client: &'a ClientIdentity,
    transaction_id: &'a str,
    timestamp: DateTime<Utc>,
}

impl<'a> TxContext<'a> {
    pub fn get_state(&self, key: &str) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(pending) => pending.clone(),
            None => self.state.get(key).cloned(),
        }
    }

    pub fn put_state(&mut self, key: &str, value: Vec<u8>) {
        self.writes.insert(key.to_string(), Some(value));
    }

    pub fn del_state(&mut self, key: &str) {
        self.writes.insert(key.to_string(), None);
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: BTreeSet<String> = self
            .state
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for (key, value) in self.writes.iter().filter(|(k, _)| k.starts_with(prefix)) {
            if value.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }
        keys.into_iter().collect()
    }

    pub fn client_identity(&self) -> &ClientIdentity {
        self.client
    }

    pub fn transaction_id(&self) -> &str {
        self.transaction_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ── Ledger state ──────────────────────────────────────────────────────────────

/// One entry of a channel's commit history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
    pub transaction_id: String,
    pub contract: String,
    pub function: String,
    pub args: Vec<String>,
    pub creator_msp: String,
    pub committed_at: DateTime<Utc>,
}

#[derive(Default)]
struct Channel {
    contracts: BTreeMap<String, Arc<dyn Chaincode>>,
    world: BTreeMap<String, Vec<u8>>,
    history: Vec<CommittedTransaction>,
}

struct SessionState {
    certificate_pem: String,
    client: ClientIdentity,
}

struct LedgerState {
    channels: BTreeMap<String, Channel>,
    trust: HashMap<String, Vec<X509>>,
    sessions: HashMap<String, SessionState>,
    reachable: bool,
}

#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryLedger")
            .field("channels", &state.channels.keys().collect::<Vec<_>>())
            .field("sessions", &state.sessions.len())
            .field("reachable", &state.reachable)
            .finish()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                channels: BTreeMap::new(),
                trust: HashMap::new(),
                sessions: HashMap::new(),
                reachable: true,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Deploy `chaincode` as `name` on `channel`, creating the channel if needed.
    pub fn deploy(&self, channel: &str, name: &str, chaincode: Arc<dyn Chaincode>) {
        let mut state = self.state();
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .contracts
            .insert(name.to_string(), chaincode);
        debug!(channel, contract = name, "chaincode deployed");
    }

    /// Accept certificates issued by `root_pem` as members of `msp_id`.
    pub fn trust(&self, msp_id: &str, root_pem: &str) -> Result<(), CredentialError> {
        let root =
            X509::from_pem(root_pem.as_bytes()).map_err(|e| CredentialError::InvalidCertificate(e.to_string()))?;
        self.state().trust.entry(msp_id.to_string()).or_default().push(root);
        Ok(())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    /// Commit history of `channel`, oldest first.
    pub fn committed_transactions(&self, channel: &str) -> Vec<CommittedTransaction> {
        self.state()
            .channels
            .get(channel)
            .map(|c| c.history.clone())
            .unwrap_or_default()
    }

    pub(super) fn open(&self, body: &[u8], token: &str) -> Result<String, Fault> {
        let mut state = self.state();
        if !state.reachable {
            return Err(Fault::Unreachable("ledger is offline".into()));
        }

        let request: ConnectRequest =
            serde_json::from_slice(body).map_err(|e| Fault::Rejected(format!("malformed connect request: {e}")))?;
        let cert = identity::verify_auth_token(token, "POST", SESSIONS_PATH, body)
            .map_err(|e| Fault::Denied(e.to_string()))?;
        let declared = X509::from_pem(request.certificate.as_bytes())
            .map_err(|e| Fault::Rejected(format!("bad certificate: {e}")))?;
        if !same_certificate(&cert, &declared) {
            return Err(Fault::Denied("token was signed for a different certificate".into()));
        }

        let trusted = state
            .trust
            .get(&request.msp_id)
            .is_some_and(|roots| roots.iter().any(|root| issued_by(&cert, root)));
        if !trusted {
            return Err(Fault::Denied(format!("certificate is not a member of {}", request.msp_id)));
        }

        let client = ClientIdentity::from_certificate(&request.msp_id, &cert).map_err(|e| Fault::Rejected(e.to_string()))?;
        let id = uuid::Uuid::new_v4().to_string();
        info!(session = %id, client = %client.id, msp = %client.msp_id, "session opened");
        state.sessions.insert(
            id.clone(),
            SessionState { certificate_pem: request.certificate, client },
        );
        Ok(id)
    }

    pub(super) fn resolve(&self, session: &str, channel: &str, contract: Option<&str>) -> Result<(), Fault> {
        let state = self.state();
        if !state.reachable {
            return Err(Fault::Unreachable("ledger is offline".into()));
        }
        if !state.sessions.contains_key(session) {
            return Err(Fault::Denied("unknown session".into()));
        }
        let ch = state
            .channels
            .get(channel)
            .ok_or_else(|| Fault::NotFound(format!("channel '{channel}'")))?;
        if let Some(name) = contract {
            if !ch.contracts.contains_key(name) {
                return Err(Fault::NotFound(format!("contract '{name}' on channel '{channel}'")));
            }
        }
        Ok(())
    }

    pub(super) fn invoke(&self, session: &str, signed: &SignedProposal) -> Result<Vec<u8>, Fault> {
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.reachable {
            return Err(Fault::Unreachable("ledger is offline".into()));
        }
        let sess = state.sessions.get(session).ok_or_else(|| Fault::Denied("unknown session".into()))?;

        let bytes = B64
            .decode(&signed.proposal)
            .map_err(|e| Fault::Rejected(format!("proposal is not base64: {e}")))?;
        let signature = B64
            .decode(&signed.signature)
            .map_err(|e| Fault::Rejected(format!("signature is not base64: {e}")))?;
        let cert = X509::from_pem(sess.certificate_pem.as_bytes()).map_err(|e| Fault::Rejected(e.to_string()))?;
        if !identity::verify_signature(&cert, &bytes, &signature).map_err(|e| Fault::Denied(e.to_string()))? {
            return Err(Fault::Denied("proposal signature does not match the session identity".into()));
        }

        let proposal: Proposal =
            serde_json::from_slice(&bytes).map_err(|e| Fault::Rejected(format!("malformed proposal: {e}")))?;
        let nonce = B64
            .decode(&proposal.nonce)
            .map_err(|e| Fault::Rejected(format!("nonce is not base64: {e}")))?;
        if transaction_id(&nonce, &sess.certificate_pem) != proposal.transaction_id {
            return Err(Fault::Rejected("transaction id does not match nonce and creator".into()));
        }

        let channel = state
            .channels
            .get_mut(&proposal.channel)
            .ok_or_else(|| Fault::NotFound(format!("channel '{}'", proposal.channel)))?;
        if channel.history.iter().any(|t| t.transaction_id == proposal.transaction_id) {
            return Err(Fault::Rejected(format!("duplicate transaction id {}", proposal.transaction_id)));
        }
        let chaincode = channel
            .contracts
            .get(&proposal.contract)
            .cloned()
            .ok_or_else(|| Fault::NotFound(format!("contract '{}'", proposal.contract)))?;

        let now = Utc::now();
        let mut ctx = TxContext {
            state: &channel.world,
            writes: BTreeMap::new(),
            client: &sess.client,
            transaction_id: &proposal.transaction_id,
            timestamp: now,
        };
        let result = chaincode
            .invoke(&mut ctx, &proposal.function, &proposal.args)
            .map_err(Fault::Rejected)?;
        let writes = ctx.writes;

        if proposal.kind == InvocationKind::Evaluate {
            debug!(function = %proposal.function, discarded = writes.len(), "evaluated");
            return Ok(result);
        }

        for (key, value) in writes {
            match value {
                Some(v) => {
                    channel.world.insert(key, v);
                }
                None => {
                    channel.world.remove(&key);
                }
            }
        }
        channel.history.push(CommittedTransaction {
            transaction_id: proposal.transaction_id.clone(),
            contract: proposal.contract.clone(),
            function: proposal.function.clone(),
            args: proposal.args.clone(),
            creator_msp: sess.client.msp_id.clone(),
            committed_at: now,
        });
        info!(channel = %proposal.channel, function = %proposal.function, tx = %proposal.transaction_id, "committed");
        Ok(result)
    }

    pub(super) fn close(&self, session: &str) -> Result<(), Fault> {
        let mut state = self.state();
        if !state.reachable {
            return Err(Fault::Unreachable("ledger is offline".into()));
        }
        if state.sessions.remove(session).is_some() {
            debug!(session, "session closed");
        }
        Ok(())
    }
}

fn same_certificate(a: &X509, b: &X509) -> bool {
    matches!((a.to_der(), b.to_der()), (Ok(x), Ok(y)) if x == y)
}

fn issued_by(cert: &X509, root: &X509) -> bool {
    root.public_key().and_then(|key| cert.verify(&key)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counter chaincode: `Inc` bumps `n`, `Get` reads it, `Peek` increments
    /// then reads within one transaction.
    struct Counter;

    fn read(ctx: &TxContext<'_>) -> u64 {
        ctx.get_state("n")
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    }

    impl Chaincode for Counter {
        fn invoke(&self, ctx: &mut TxContext<'_>, function: &str, _args: &[String]) -> Result<Vec<u8>, String> {
            match function {
                "Inc" => {
                    let n = read(ctx) + 1;
                    ctx.put_state("n", n.to_string().into_bytes());
                    Ok(n.to_string().into_bytes())
                }
                "Peek" => {
                    let n = read(ctx) + 1;
                    ctx.put_state("n", n.to_string().into_bytes());
                    Ok(read(ctx).to_string().into_bytes())
                }
                "Get" => Ok(read(ctx).to_string().into_bytes()),
                other => Err(format!("unknown function {other}")),
            }
        }
    }

    fn ctx_over<'a>(state: &'a BTreeMap<String, Vec<u8>>, client: &'a ClientIdentity) -> TxContext<'a> {
        TxContext { state, writes: BTreeMap::new(), client, transaction_id: "tx", timestamp: Utc::now() }
    }

    fn client() -> ClientIdentity {
        ClientIdentity {
            msp_id: "Org1MSP".into(),
            id: "x509::CN=u::CN=ca".into(),
            enrollment_id: "u".into(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn context_reads_its_own_writes() {
        let state = BTreeMap::new();
        let client = client();
        let mut ctx = ctx_over(&state, &client);
        let out = Counter.invoke(&mut ctx, "Peek", &[]).unwrap();
        assert_eq!(out, b"1");
    }

    #[test]
    fn prefix_scan_merges_pending_writes() {
        let mut state = BTreeMap::new();
        state.insert("p~1".to_string(), vec![1]);
        state.insert("p~2".to_string(), vec![2]);
        state.insert("q~1".to_string(), vec![3]);
        let client = client();
        let mut ctx = ctx_over(&state, &client);
        ctx.put_state("p~3", vec![4]);
        ctx.del_state("p~1");
        assert_eq!(ctx.keys_with_prefix("p~"), vec!["p~2".to_string(), "p~3".to_string()]);
    }

    #[test]
    fn deploy_creates_channel() {
        let ledger = InMemoryLedger::new();
        ledger.deploy("mychannel", "counter", Arc::new(Counter));
        assert!(ledger.committed_transactions("mychannel").is_empty());
        assert!(format!("{ledger:?}").contains("mychannel"));
    }

    #[test]
    fn untrusted_or_garbage_connects_are_denied() {
        let ledger = InMemoryLedger::new();
        assert!(matches!(ledger.open(b"{}", "x.y"), Err(Fault::Rejected(_))));
        ledger.set_reachable(false);
        assert!(matches!(ledger.open(b"{}", "x.y"), Err(Fault::Unreachable(_))));
        assert!(ledger.trust("Org1MSP", "not a pem").is_err());
    }

    #[tokio::test]
    async fn evaluate_discards_writes_and_submit_commits() {
        use crate::gateway::{Gateway, GatewayBackend};
        use crate::gateway::tests::fixture;

        let (ledger, wallet, config) = fixture().await;
        ledger.deploy("mychannel", "counter", Arc::new(Counter));
        let mut gw = Gateway::new(GatewayBackend::Memory(ledger.clone()), config.timeouts, config.orgs[0].discovery);
        gw.connect(&wallet, "appUser").await.unwrap();
        let contract = gw.contract("mychannel", "counter").await.unwrap();

        assert_eq!(contract.evaluate("Inc", &[]).await.unwrap(), b"1");
        assert_eq!(contract.evaluate("Get", &[]).await.unwrap(), b"0");
        assert_eq!(contract.submit("Inc", &[]).await.unwrap(), b"1");
        assert_eq!(contract.evaluate("Get", &[]).await.unwrap(), b"1");

        let history = ledger.committed_transactions("mychannel");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].function, "Inc");
        assert_eq!(history[0].creator_msp, "Org1MSP");
        drop(contract);
        gw.disconnect().await;
    }

    #[tokio::test]
    async fn foreign_msp_is_rejected() {
        use crate::gateway::{Gateway, GatewayBackend, GatewayError};
        use crate::gateway::tests::fixture;

        let (_ledger, wallet, config) = fixture().await;
        let stranger = InMemoryLedger::new();
        stranger.deploy("mychannel", "counter", Arc::new(Counter));
        let mut gw = Gateway::new(GatewayBackend::Memory(stranger.clone()), config.timeouts, config.orgs[0].discovery);
        let err = gw.connect(&wallet, "appUser").await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection { .. }));
        assert_eq!(stranger.open_sessions(), 0);
    }
}
