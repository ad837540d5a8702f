//! Certificate Authority enrollment client.
//!
//! [`CaClient`] is bound to one organisation and implements the two
//! credential-issuing operations:
//!
//! - [`CaClient::enroll_admin`]: bootstrap enrollment of the org's CA admin;
//! - [`CaClient::register_and_enroll`]: admin-signed registration of a new
//!   identity followed by its enrollment.
//!
//! Both consult the wallet first and return an `Already*` outcome without
//! contacting the CA when the label is present. The wallet is written only
//! after the CA has issued a certificate, so a failed call leaves it untouched.
//!
//! Transport is an enum over backends:
//! - [`HttpCa`]: Fabric CA REST API (`/api/v1/enroll`, `/api/v1/register`);
//! - [`InMemoryCa`]: self-contained CA for tests and offline runs.

pub mod http;
pub mod memory;

use std::time::Duration;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use http::HttpCa;
pub use memory::InMemoryCa;

use crate::config::OrgProfile;
use crate::identity::{self, CredentialError, Identity};
use crate::wallet::{Wallet, WalletError};

/// URL path of the registration endpoint; part of the signed token payload.
pub const REGISTER_PATH: &str = "/api/v1/register";
pub const ENROLL_PATH: &str = "/api/v1/enroll";

/// CA identity type used when a request does not name one.
pub const DEFAULT_IDENTITY_TYPE: &str = "client";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CaError {
    #[error("CA unreachable: {0}")]
    Unreachable(String),
    #[error("CA rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed CA response: {0}")]
    Malformed(String),
    #[error("CA call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// A failed enrollment step, with the organisation and label it concerned.
#[derive(Debug, Error)]
#[error("enrollment of '{label}' for {org} failed: {source}")]
pub struct EnrollmentError {
    pub org: String,
    pub label: String,
    #[source]
    pub source: CaError,
}

impl EnrollmentError {
    /// `true` when the step failed because a wallet identity was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self.source, CaError::Wallet(WalletError::NotFound(_)))
    }
}

// ── Request / outcome types ───────────────────────────────────────────────────

/// Attribute attached to a registered identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
    /// Embed in the enrollment certificate by default.
    #[serde(default)]
    pub ecert: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>, ecert: bool) -> Self {
        Self { name: name.into(), value: value.into(), ecert }
    }
}

/// Attribute that must (or may) be placed in the certificate at enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRequest {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
}

impl AttributeRequest {
    pub fn required(name: impl Into<String>) -> Self {
        Self { name: name.into(), optional: false }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self { name: name.into(), optional: true }
    }
}

/// Everything needed to register and enroll one identity.
///
/// `affiliation` falls back to the organisation's default; attributes and
/// attribute requests are forwarded to the CA in the order given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub label: String,
    pub identity_type: String,
    pub affiliation: Option<String>,
    pub secret: Option<String>,
    pub max_enrollments: Option<i32>,
    pub attrs: Vec<Attribute>,
    pub attr_reqs: Vec<AttributeRequest>,
}

impl RegistrationRequest {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            identity_type: DEFAULT_IDENTITY_TYPE.to_string(),
            affiliation: None,
            secret: None,
            max_enrollments: None,
            attrs: Vec::new(),
            attr_reqs: Vec::new(),
        }
    }

    pub fn affiliation(mut self, affiliation: impl Into<String>) -> Self {
        self.affiliation = Some(affiliation.into());
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn attribute(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn attribute_request(mut self, req: AttributeRequest) -> Self {
        self.attr_reqs.push(req);
        self
    }
}

#[derive(Debug, Clone)]
pub enum Enrollment {
    Enrolled(Identity),
    /// The label was already in the wallet; the CA was not contacted.
    AlreadyEnrolled,
}

#[derive(Debug, Clone)]
pub enum Registration {
    Registered(Identity),
    /// The label was already in the wallet; the CA was not contacted.
    AlreadyRegistered,
}

// ── Wire types shared by the backends ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub enrollment_id: String,
    pub secret: String,
    pub csr_pem: String,
    pub attr_reqs: Vec<AttributeRequest>,
}

#[derive(Debug, Clone)]
pub struct EnrollResponse {
    pub certificate: String,
    /// PEM bundle of the issuing CA's chain, when the CA sends one.
    pub ca_chain: Option<String>,
}

/// Body of `POST /api/v1/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub identity_type: String,
    pub affiliation: String,
    #[serde(default)]
    pub attrs: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_enrollments: Option<i32>,
}

// ── Backend enum ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum CaBackend {
    Http(HttpCa),
    Memory(InMemoryCa),
}

impl CaBackend {
    async fn enroll(&self, req: &EnrollRequest) -> Result<EnrollResponse, CaError> {
        match self {
            CaBackend::Http(ca) => ca.enroll(req).await,
            CaBackend::Memory(ca) => ca.enroll(req).await,
        }
    }

    /// Register `req`, authenticated as `registrar`. Returns the enrollment secret.
    async fn register(&self, registrar: &Identity, req: &RegisterRequest) -> Result<String, CaError> {
        match self {
            CaBackend::Http(ca) => ca.register(registrar, req).await,
            CaBackend::Memory(ca) => ca.register(registrar, req).await,
        }
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// CA client bound to one organisation.
#[derive(Debug, Clone)]
pub struct CaClient {
    backend: CaBackend,
    org: OrgProfile,
    timeout: Duration,
}

impl CaClient {
    pub fn new(backend: CaBackend, org: &OrgProfile, timeout: Duration) -> Self {
        Self { backend, org: org.clone(), timeout }
    }

    /// Enroll the organisation's bootstrap administrator under `admin_label`.
    pub async fn enroll_admin(&self, wallet: &Wallet, admin_label: &str) -> Result<Enrollment, EnrollmentError> {
        let ctx = |source: CaError| self.error(admin_label, source);

        if wallet.exists(admin_label).await.map_err(|e| ctx(e.into()))? {
            info!(label = admin_label, msp = %self.org.msp_id, "admin identity already in wallet");
            return Ok(Enrollment::AlreadyEnrolled);
        }

        let identity = self
            .enroll_identity(admin_label, &self.org.admin_enrollment_id, &self.org.admin_secret, &[])
            .await
            .map_err(ctx)?;
        wallet.put(&identity).await.map_err(|e| ctx(e.into()))?;

        info!(label = admin_label, msp = %self.org.msp_id, "admin enrolled and stored in wallet");
        Ok(Enrollment::Enrolled(identity))
    }

    /// Register `request.label` using the admin identity stored under
    /// `admin_label`, enroll it and store the result.
    pub async fn register_and_enroll(
        &self,
        wallet: &Wallet,
        admin_label: &str,
        request: &RegistrationRequest,
    ) -> Result<Registration, EnrollmentError> {
        let label = request.label.as_str();
        let ctx = |source: CaError| self.error(label, source);

        if wallet.exists(label).await.map_err(|e| ctx(e.into()))? {
            info!(label, msp = %self.org.msp_id, "identity already in wallet");
            return Ok(Registration::AlreadyRegistered);
        }

        // Registration must be signed by a CA admin; without one there is nothing to do.
        let admin = wallet.get(admin_label).await.map_err(|e| ctx(e.into()))?;

        let register = RegisterRequest {
            id: label.to_string(),
            identity_type: request.identity_type.clone(),
            affiliation: request
                .affiliation
                .clone()
                .unwrap_or_else(|| self.org.affiliation.clone()),
            attrs: request.attrs.clone(),
            secret: request.secret.clone(),
            max_enrollments: request.max_enrollments,
        };
        debug!(label, affiliation = %register.affiliation, attrs = register.attrs.len(), "registering identity");

        let secret = self
            .deadline(self.backend.register(&admin, &register))
            .await
            .map_err(ctx)?;

        let identity = self
            .enroll_identity(label, label, &secret, &request.attr_reqs)
            .await
            .map_err(ctx)?;
        wallet.put(&identity).await.map_err(|e| ctx(e.into()))?;

        info!(label, msp = %self.org.msp_id, "identity registered, enrolled and stored in wallet");
        Ok(Registration::Registered(identity))
    }

    /// Generate a key, send a CSR and wrap the issued certificate.
    async fn enroll_identity(
        &self,
        label: &str,
        enrollment_id: &str,
        secret: &str,
        attr_reqs: &[AttributeRequest],
    ) -> Result<Identity, CaError> {
        let key = identity::generate_key()?;
        let request = EnrollRequest {
            enrollment_id: enrollment_id.to_string(),
            secret: secret.to_string(),
            csr_pem: identity::certificate_request(&key, enrollment_id)?,
            attr_reqs: attr_reqs.to_vec(),
        };
        let response = self.deadline(self.backend.enroll(&request)).await?;
        check_issued(&response, &key)?;
        Ok(Identity::x509(label, &self.org.msp_id, response.certificate, &key)?)
    }

    async fn deadline<T>(&self, fut: impl Future<Output = Result<T, CaError>>) -> Result<T, CaError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| CaError::Timeout(self.timeout))?
    }

    fn error(&self, label: &str, source: CaError) -> EnrollmentError {
        EnrollmentError {
            org: self.org.msp_id.clone(),
            label: label.to_string(),
            source,
        }
    }
}

/// The issued certificate must carry the enrollment key and, when the CA
/// returned its chain, be signed by a certificate in that chain.
fn check_issued(response: &EnrollResponse, key: &PKey<Private>) -> Result<(), CaError> {
    let cert = X509::from_pem(response.certificate.as_bytes())
        .map_err(|e| CaError::Malformed(format!("issued certificate is not PEM: {e}")))?;
    let issued_key = cert.public_key().map_err(CredentialError::from)?;
    if !issued_key.public_eq(key) {
        return Err(CaError::Malformed("issued certificate does not carry the enrollment key".into()));
    }

    let Some(chain) = response.ca_chain.as_deref() else {
        return Ok(());
    };
    let issuers = X509::stack_from_pem(chain.as_bytes())
        .map_err(|e| CaError::Malformed(format!("CA chain is not PEM: {e}")))?;
    let signed = issuers
        .iter()
        .any(|issuer| issuer.public_key().and_then(|k| cert.verify(&k)).unwrap_or(false));
    if !signed {
        return Err(CaError::Malformed("issued certificate is not signed by the returned CA chain".into()));
    }
    Ok(())
}

// ── tests ─────────────────────────────────────────────────────────────────────
