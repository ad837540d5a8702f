//! In-process certificate authority.
//!
//! Issues real P-256 certificates from its own self-signed root and applies
//! the same rules a Fabric CA server does for the calls this crate makes:
//!
//! - the bootstrap account (`admin`/`adminpw` by default) is a registrar;
//! - registration requires a token signed by a registrar certificate issued
//!   by this CA, rejects duplicate ids, unknown affiliations and reserved
//!   `hf.*` attribute names, and generates a secret when none is supplied;
//! - enrollment embeds `hf.EnrollmentID`, `hf.Type`, `hf.Affiliation` and every
//!   `ecert` attribute by default; when attribute requests are present it
//!   embeds exactly those and rejects missing non-optional ones.
//!
//! State lives only as long as the value (and its clones).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Builder, X509Extension, X509NameBuilder, X509Req};
use tracing::debug;

use super::{
    Attribute, AttributeRequest, CaError, EnrollRequest, EnrollResponse, REGISTER_PATH, RegisterRequest,
};
use crate::config::OrgProfile;
use crate::identity::{self, ATTRS_OID, CredentialError, Identity};

const CERT_VALIDITY_DAYS: u32 = 365;
const ROOT_VALIDITY_DAYS: u32 = 3650;

#[derive(Debug)]
struct Account {
    secret: String,
    identity_type: String,
    affiliation: String,
    attrs: Vec<Attribute>,
    max_enrollments: Option<i32>,
    enrollments: u32,
    registrar: bool,
}

#[derive(Debug)]
struct CaState {
    root_key: PKey<Private>,
    root_cert: X509,
    accounts: BTreeMap<String, Account>,
    affiliations: Vec<String>,
    next_serial: u32,
    reachable: bool,
}

#[derive(Debug, Clone)]
pub struct InMemoryCa {
    ca_name: String,
    state: Arc<Mutex<CaState>>,
}

impl InMemoryCa {
    /// Create a CA with a bootstrap registrar and the given affiliation tree.
    /// Parents of every listed affiliation are added implicitly.
    pub fn new(
        ca_name: &str,
        bootstrap_id: &str,
        bootstrap_secret: &str,
        affiliations: &[&str],
    ) -> Result<Self, CaError> {
        let root_key = identity::generate_key()?;
        let root_cert = self_signed_root(&root_key, ca_name)?;

        let mut tree: Vec<String> = Vec::new();
        for aff in affiliations {
            let parts: Vec<&str> = aff.split('.').collect();
            for depth in 1..=parts.len() {
                let prefix = parts[..depth].join(".");
                if !tree.contains(&prefix) {
                    tree.push(prefix);
                }
            }
        }

        let mut accounts = BTreeMap::new();
        accounts.insert(
            bootstrap_id.to_string(),
            Account {
                secret: bootstrap_secret.to_string(),
                identity_type: "client".into(),
                affiliation: String::new(),
                attrs: Vec::new(),
                max_enrollments: None,
                enrollments: 0,
                registrar: true,
            },
        );

        Ok(Self {
            ca_name: ca_name.to_string(),
            state: Arc::new(Mutex::new(CaState {
                root_key,
                root_cert,
                accounts,
                affiliations: tree,
                next_serial: 1,
                reachable: true,
            })),
        })
    }

    /// CA matching an organisation profile: its CA name, bootstrap credentials
    /// and the org's affiliation plus a second department.
    pub fn for_org(org: &OrgProfile) -> Result<Self, CaError> {
        let root = org.affiliation.split('.').next().unwrap_or_default().to_string();
        let second = format!("{root}.department2");
        Self::new(
            &org.ca_name,
            &org.admin_enrollment_id,
            &org.admin_secret,
            &[org.affiliation.as_str(), second.as_str()],
        )
    }

    pub fn ca_name(&self) -> &str {
        &self.ca_name
    }

    fn state(&self) -> MutexGuard<'_, CaState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn root_certificate_pem(&self) -> Result<String, CaError> {
        let pem = self.state().root_cert.to_pem().map_err(CredentialError::from)?;
        String::from_utf8(pem).map_err(|e| CaError::Malformed(e.to_string()))
    }

    /// Simulate the CA going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.state().accounts.contains_key(id)
    }

    pub fn enrollment_count(&self, id: &str) -> u32 {
        self.state().accounts.get(id).map(|a| a.enrollments).unwrap_or(0)
    }

    pub fn account_affiliation(&self, id: &str) -> Option<String> {
        self.state().accounts.get(id).map(|a| a.affiliation.clone())
    }

    pub(super) async fn enroll(&self, req: &EnrollRequest) -> Result<EnrollResponse, CaError> {
        let mut state = self.state();
        if !state.reachable {
            return Err(CaError::Unreachable(format!("{} is offline", self.ca_name)));
        }

        let account = state
            .accounts
            .get(&req.enrollment_id)
            .filter(|a| a.secret == req.secret)
            .ok_or_else(|| rejected(401, format!("authentication failure for '{}'", req.enrollment_id)))?;
        if let Some(max) = account.max_enrollments.filter(|m| *m > 0) {
            if account.enrollments >= max as u32 {
                return Err(rejected(401, format!("'{}' reached its enrollment limit", req.enrollment_id)));
            }
        }

        let csr = X509Req::from_pem(req.csr_pem.as_bytes())
            .map_err(|e| rejected(400, format!("invalid certificate request: {e}")))?;
        let public_key = csr.public_key().map_err(CredentialError::from)?;
        if !csr.verify(&public_key).map_err(CredentialError::from)? {
            return Err(rejected(400, "certificate request signature is invalid".into()));
        }

        let attrs = select_attributes(&req.enrollment_id, account, &req.attr_reqs)?;
        let subject_ou: Vec<String> = std::iter::once(account.identity_type.clone())
            .chain(account.affiliation.split('.').filter(|p| !p.is_empty()).map(str::to_string))
            .collect();

        let serial = state.next_serial;
        state.next_serial += 1;
        let cert = issue(&state, serial, &req.enrollment_id, &subject_ou, &public_key, &attrs)?;

        if let Some(account) = state.accounts.get_mut(&req.enrollment_id) {
            account.enrollments += 1;
        }
        debug!(ca = %self.ca_name, id = %req.enrollment_id, serial, "certificate issued");

        let certificate = pem_string(&cert)?;
        let ca_chain = Some(pem_string(&state.root_cert)?);
        Ok(EnrollResponse { certificate, ca_chain })
    }

    pub(super) async fn register(&self, registrar: &Identity, req: &RegisterRequest) -> Result<String, CaError> {
        let body = serde_json::to_vec(req).map_err(|e| CaError::Malformed(e.to_string()))?;
        let token = identity::auth_token(registrar, "POST", REGISTER_PATH, &body)?;
        self.handle_register(&token, &body)
    }

    /// Server side of `POST /api/v1/register`.
    fn handle_register(&self, token: &str, body: &[u8]) -> Result<String, CaError> {
        let mut state = self.state();
        if !state.reachable {
            return Err(CaError::Unreachable(format!("{} is offline", self.ca_name)));
        }

        let caller = identity::verify_auth_token(token, "POST", REGISTER_PATH, body)
            .map_err(|e| rejected(401, format!("invalid token: {e}")))?;
        if !caller.verify(&state.root_key).map_err(CredentialError::from)? {
            return Err(rejected(401, "caller certificate was not issued by this CA".into()));
        }
        let caller_id = identity::common_name(&caller)?;
        if !state.accounts.get(&caller_id).is_some_and(|a| a.registrar) {
            return Err(rejected(403, format!("'{caller_id}' is not a registrar")));
        }

        let req: RegisterRequest =
            serde_json::from_slice(body).map_err(|e| rejected(400, format!("malformed registration: {e}")))?;
        if state.accounts.contains_key(&req.id) {
            return Err(rejected(400, format!("identity '{}' is already registered", req.id)));
        }
        if !req.affiliation.is_empty() && !state.affiliations.contains(&req.affiliation) {
            return Err(rejected(400, format!("affiliation '{}' does not exist", req.affiliation)));
        }
        if let Some(reserved) = req.attrs.iter().find(|a| a.name.starts_with("hf.")) {
            return Err(rejected(403, format!("attribute '{}' is reserved", reserved.name)));
        }

        let secret = match req.secret.clone() {
            Some(s) => s,
            None => generate_secret()?,
        };
        debug!(ca = %self.ca_name, registrar = %caller_id, id = %req.id, "identity registered");
        state.accounts.insert(
            req.id.clone(),
            Account {
                secret: secret.clone(),
                identity_type: req.identity_type,
                affiliation: req.affiliation,
                attrs: req.attrs,
                max_enrollments: req.max_enrollments,
                enrollments: 0,
                registrar: false,
            },
        );
        Ok(secret)
    }
}

// ── internals ─────────────────────────────────────────────────────────────────

fn rejected(status: u16, message: String) -> CaError {
    CaError::Rejected { status, message }
}

fn pem_string(cert: &X509) -> Result<String, CaError> {
    let pem = cert.to_pem().map_err(CredentialError::from)?;
    String::from_utf8(pem).map_err(|e| CaError::Malformed(e.to_string()))
}

fn generate_secret() -> Result<String, CaError> {
    let mut buf = [0u8; 12];
    openssl::rand::rand_bytes(&mut buf).map_err(CredentialError::from)?;
    Ok(hex::encode(buf))
}

/// Attributes to embed, in the order they will be written.
fn select_attributes(
    id: &str,
    account: &Account,
    attr_reqs: &[AttributeRequest],
) -> Result<BTreeMap<String, String>, CaError> {
    let builtin = [
        ("hf.EnrollmentID", id.to_string()),
        ("hf.Type", account.identity_type.clone()),
        ("hf.Affiliation", account.affiliation.clone()),
    ];

    let mut selected = BTreeMap::new();
    if attr_reqs.is_empty() {
        for (name, value) in builtin {
            selected.insert(name.to_string(), value);
        }
        for attr in account.attrs.iter().filter(|a| a.ecert) {
            selected.insert(attr.name.clone(), attr.value.clone());
        }
        return Ok(selected);
    }

    for req in attr_reqs {
        let value = builtin
            .iter()
            .find(|(name, _)| *name == req.name)
            .map(|(_, v)| v.clone())
            .or_else(|| account.attrs.iter().find(|a| a.name == req.name).map(|a| a.value.clone()));
        match value {
            Some(v) => {
                selected.insert(req.name.clone(), v);
            }
            None if req.optional => {}
            None => {
                return Err(rejected(
                    400,
                    format!("attribute '{}' was requested but '{id}' does not possess it", req.name),
                ));
            }
        }
    }
    Ok(selected)
}

fn self_signed_root(key: &PKey<Private>, ca_name: &str) -> Result<X509, CredentialError> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, ca_name)?;
    let name = name.build();

    let mut b = X509Builder::new()?;
    b.set_version(2)?;
    let serial_no = BigNum::from_u32(0)?.to_asn1_integer()?;
    b.set_serial_number(&serial_no)?;
    b.set_subject_name(&name)?;
    b.set_issuer_name(&name)?;
    b.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(ROOT_VALIDITY_DAYS)?;
    b.set_not_before(&not_before)?;
    b.set_not_after(&not_after)?;
    b.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    b.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
    b.sign(key, MessageDigest::sha256())?;
    Ok(b.build())
}

fn issue(
    state: &CaState,
    serial: u32,
    id: &str,
    subject_ou: &[String],
    public_key: &PKey<openssl::pkey::Public>,
    attrs: &BTreeMap<String, String>,
) -> Result<X509, CaError> {
    let build = || -> Result<X509, CredentialError> {
        let mut name = X509NameBuilder::new()?;
        for ou in subject_ou {
            name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, ou)?;
        }
        name.append_entry_by_nid(Nid::COMMONNAME, id)?;
        let name = name.build();

        let mut b = X509Builder::new()?;
        b.set_version(2)?;
        let serial_no = BigNum::from_u32(serial)?.to_asn1_integer()?;
        b.set_serial_number(&serial_no)?;
        b.set_subject_name(&name)?;
        b.set_issuer_name(state.root_cert.subject_name())?;
        b.set_pubkey(public_key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
        b.set_not_before(&not_before)?;
        b.set_not_after(&not_after)?;
        b.append_extension(BasicConstraints::new().critical().build()?)?;
        b.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;

        let payload = serde_json::json!({ "attrs": attrs }).to_string();
        let oid = Asn1Object::from_str(ATTRS_OID)?;
        let value = Asn1OctetString::new_from_bytes(payload.as_bytes())?;
        b.append_extension(X509Extension::new_from_der(&oid, false, &value)?)?;

        b.sign(&state.root_key, MessageDigest::sha256())?;
        Ok(b.build())
    };
    Ok(build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca() -> InMemoryCa {
        InMemoryCa::new("ca-org1", "admin", "adminpw", &["org1.department1"]).unwrap()
    }

    async fn enroll(ca: &InMemoryCa, id: &str, secret: &str, reqs: Vec<AttributeRequest>) -> Result<Identity, CaError> {
        let key = identity::generate_key()?;
        let resp = ca
            .enroll(&EnrollRequest {
                enrollment_id: id.into(),
                secret: secret.into(),
                csr_pem: identity::certificate_request(&key, id)?,
                attr_reqs: reqs,
            })
            .await?;
        Ok(Identity::x509(id, "Org1MSP", resp.certificate, &key)?)
    }

    fn register_req(id: &str, attrs: Vec<Attribute>) -> RegisterRequest {
        RegisterRequest {
            id: id.into(),
            identity_type: "client".into(),
            affiliation: "org1.department1".into(),
            attrs,
            secret: None,
            max_enrollments: None,
        }
    }

    #[tokio::test]
    async fn issued_certificate_chains_to_root() {
        let ca = ca();
        let admin = enroll(&ca, "admin", "adminpw", vec![]).await.unwrap();
        let root = X509::from_pem(ca.root_certificate_pem().unwrap().as_bytes()).unwrap();
        assert!(admin.certificate().unwrap().verify(&root.public_key().unwrap()).unwrap());
        assert_eq!(admin.attributes().unwrap().get("hf.EnrollmentID").map(String::as_str), Some("admin"));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let err = enroll(&ca(), "admin", "wrong", vec![]).await.unwrap_err();
        assert!(matches!(err, CaError::Rejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn ecert_attributes_are_embedded_by_default() {
        let ca = ca();
        let admin = enroll(&ca, "admin", "adminpw", vec![]).await.unwrap();
        let secret = ca
            .register(
                &admin,
                &register_req(
                    "auditor1",
                    vec![Attribute::new("role", "auditor", true), Attribute::new("dept", "finance", false)],
                ),
            )
            .await
            .unwrap();

        let user = enroll(&ca, "auditor1", &secret, vec![]).await.unwrap();
        let attrs = user.attributes().unwrap();
        assert_eq!(attrs.get("role").map(String::as_str), Some("auditor"));
        assert_eq!(attrs.get("hf.Affiliation").map(String::as_str), Some("org1.department1"));
        assert!(!attrs.contains_key("dept"));
    }

    #[tokio::test]
    async fn requested_attributes_replace_defaults() {
        let ca = ca();
        let admin = enroll(&ca, "admin", "adminpw", vec![]).await.unwrap();
        let secret = ca
            .register(&admin, &register_req("u1", vec![Attribute::new("role", "buyer", false)]))
            .await
            .unwrap();

        let user = enroll(
            &ca,
            "u1",
            &secret,
            vec![AttributeRequest::required("role"), AttributeRequest::optional("nickname")],
        )
        .await
        .unwrap();
        let attrs = user.attributes().unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get("role").map(String::as_str), Some("buyer"));
    }

    #[tokio::test]
    async fn missing_required_attribute_rejects_enrollment() {
        let ca = ca();
        let admin = enroll(&ca, "admin", "adminpw", vec![]).await.unwrap();
        let secret = ca.register(&admin, &register_req("u2", vec![])).await.unwrap();
        let err = enroll(&ca, "u2", &secret, vec![AttributeRequest::required("role")])
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::Rejected { status: 400, .. }));
        assert_eq!(ca.enrollment_count("u2"), 0);
    }

    #[tokio::test]
    async fn only_registrars_may_register() {
        let ca = ca();
        let admin = enroll(&ca, "admin", "adminpw", vec![]).await.unwrap();
        let secret = ca.register(&admin, &register_req("u3", vec![])).await.unwrap();
        let user = enroll(&ca, "u3", &secret, vec![]).await.unwrap();

        let err = ca.register(&user, &register_req("u4", vec![])).await.unwrap_err();
        assert!(matches!(err, CaError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn foreign_certificates_are_rejected() {
        let ours = ca();
        let theirs = ca();
        let foreign_admin = enroll(&theirs, "admin", "adminpw", vec![]).await.unwrap();
        let err = ours.register(&foreign_admin, &register_req("u5", vec![])).await.unwrap_err();
        assert!(matches!(err, CaError::Rejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn duplicate_and_reserved_registrations_fail() {
        let ca = ca();
        let admin = enroll(&ca, "admin", "adminpw", vec![]).await.unwrap();
        ca.register(&admin, &register_req("dup", vec![])).await.unwrap();
        assert!(ca.register(&admin, &register_req("dup", vec![])).await.is_err());

        let reserved = register_req("sneaky", vec![Attribute::new("hf.Registrar.Roles", "*", false)]);
        assert!(ca.register(&admin, &reserved).await.is_err());
    }

    #[tokio::test]
    async fn parent_affiliations_are_known() {
        let ca = ca();
        let admin = enroll(&ca, "admin", "adminpw", vec![]).await.unwrap();
        let mut req = register_req("top", vec![]);
        req.affiliation = "org1".into();
        assert!(ca.register(&admin, &req).await.is_ok());
    }
}
