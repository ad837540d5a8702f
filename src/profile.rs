//! Fabric connection profiles (`connection-org1.json`).
//!
//! Only the parts the client needs are read: the organisation's MSP id and
//! its certificate authorities (URL, `caName`, TLS roots, verify flag).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::AppError;

/// A certificate authority entry resolved from a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaEndpoint {
    pub url: String,
    pub ca_name: String,
    pub tls_roots: Vec<String>,
    pub verify: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    organizations: HashMap<String, RawOrganization>,
    #[serde(default, rename = "certificateAuthorities")]
    certificate_authorities: HashMap<String, RawCertificateAuthority>,
}

#[derive(Debug, Deserialize)]
struct RawOrganization {
    mspid: String,
    #[serde(default, rename = "certificateAuthorities")]
    certificate_authorities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawCertificateAuthority {
    url: String,
    #[serde(default, rename = "caName")]
    ca_name: Option<String>,
    #[serde(default, rename = "tlsCACerts")]
    tls_ca_certs: Option<RawTlsCerts>,
    #[serde(default, rename = "httpOptions")]
    http_options: Option<RawHttpOptions>,
}

#[derive(Debug, Deserialize)]
struct RawTlsCerts {
    #[serde(default)]
    pem: Option<PemList>,
}

/// Profiles use either a single PEM string or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PemList {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawHttpOptions {
    #[serde(default = "default_verify")]
    verify: bool,
}

fn default_verify() -> bool {
    true
}

impl ConnectionProfile {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read connection profile {}: {e}", path.display())))?;
        Self::parse(&raw)
            .map_err(|e| AppError::Config(format!("connection profile {}: {e}", path.display())))
    }

    pub fn parse(json: &str) -> Result<Self, AppError> {
        serde_json::from_str(json).map_err(|e| AppError::Config(format!("malformed connection profile: {e}")))
    }

    /// Look up a CA by its endpoint name (the key under `certificateAuthorities`).
    pub fn certificate_authority(&self, host: &str) -> Result<CaEndpoint, AppError> {
        let ca = self
            .certificate_authorities
            .get(host)
            .ok_or_else(|| AppError::Config(format!("connection profile has no certificate authority '{host}'")))?;
        let tls_roots = match ca.tls_ca_certs.as_ref().and_then(|t| t.pem.as_ref()) {
            Some(PemList::One(pem)) => vec![pem.clone()],
            Some(PemList::Many(pems)) => pems.clone(),
            None => Vec::new(),
        };
        Ok(CaEndpoint {
            url: ca.url.clone(),
            ca_name: ca.ca_name.clone().unwrap_or_else(|| host.to_string()),
            tls_roots,
            verify: ca.http_options.as_ref().map(|o| o.verify).unwrap_or(true),
        })
    }

    /// Ensure some organisation in the profile carries `msp_id`.
    pub fn check_msp(&self, msp_id: &str) -> Result<(), AppError> {
        if self.organizations.values().any(|o| o.mspid == msp_id) {
            Ok(())
        } else {
            Err(AppError::Config(format!("connection profile defines no organisation with MSP '{msp_id}'")))
        }
    }

    /// CA endpoint names listed for the organisation owning `msp_id`.
    pub fn organization_cas(&self, msp_id: &str) -> Vec<String> {
        self.organizations
            .values()
            .find(|o| o.mspid == msp_id)
            .map(|o| o.certificate_authorities.clone())
            .unwrap_or_default()
    }
}
