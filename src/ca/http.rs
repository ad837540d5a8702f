//! Fabric CA REST transport.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AttributeRequest, CaError, ENROLL_PATH, EnrollRequest, EnrollResponse, REGISTER_PATH, RegisterRequest};
use crate::config::OrgProfile;
use crate::identity::{self, Identity};

#[derive(Debug, Clone)]
pub struct HttpCa {
    base_url: String,
    ca_name: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EnrollBody<'a> {
    certificate_request: &'a str,
    caname: &'a str,
    #[serde(skip_serializing_if = "no_requests")]
    attr_reqs: &'a [AttributeRequest],
}

fn no_requests(reqs: &&[AttributeRequest]) -> bool {
    reqs.is_empty()
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    #[serde(flatten)]
    request: &'a RegisterRequest,
    caname: &'a str,
}

/// Response envelope shared by every Fabric CA endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ServerMessage>,
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EnrollResult {
    #[serde(rename = "Cert")]
    cert: String,
    #[serde(rename = "ServerInfo", default)]
    server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    #[serde(rename = "CAChain", default)]
    ca_chain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterResult {
    secret: String,
}

impl HttpCa {
    pub fn new(org: &OrgProfile, timeout: Duration) -> Result<Self, CaError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!org.ca_verify_tls);
        for pem in &org.ca_tls_roots {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| CaError::Malformed(format!("bad TLS root for {}: {e}", org.ca_host)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| CaError::Unreachable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: org.ca_url.trim_end_matches('/').to_string(),
            ca_name: org.ca_name.clone(),
            timeout,
            client,
        })
    }

    pub(super) async fn enroll(&self, req: &EnrollRequest) -> Result<EnrollResponse, CaError> {
        let body = EnrollBody {
            certificate_request: &req.csr_pem,
            caname: &self.ca_name,
            attr_reqs: &req.attr_reqs,
        };
        debug!(url = %self.base_url, id = %req.enrollment_id, "POST {ENROLL_PATH}");
        let resp = self
            .client
            .post(format!("{}{ENROLL_PATH}", self.base_url))
            .basic_auth(&req.enrollment_id, Some(&req.secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let result: EnrollResult = read_envelope(resp).await.map_err(|e| self.transport_error(e))??;
        let certificate = decode_pem(&result.cert)?;
        let ca_chain = match result.server_info.and_then(|s| s.ca_chain) {
            Some(chain) if !chain.is_empty() => Some(decode_pem(&chain)?),
            _ => None,
        };
        Ok(EnrollResponse { certificate, ca_chain })
    }

    pub(super) async fn register(&self, registrar: &Identity, req: &RegisterRequest) -> Result<String, CaError> {
        let body = serde_json::to_vec(&RegisterBody { request: req, caname: &self.ca_name })
            .map_err(|e| CaError::Malformed(e.to_string()))?;
        // The token signs these exact bytes, so send them as-is.
        let token = identity::auth_token(registrar, "POST", REGISTER_PATH, &body)?;

        debug!(url = %self.base_url, id = %req.id, "POST {REGISTER_PATH}");
        let resp = self
            .client
            .post(format!("{}{REGISTER_PATH}", self.base_url))
            .header(AUTHORIZATION, token)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let result: RegisterResult = read_envelope(resp).await.map_err(|e| self.transport_error(e))??;
        Ok(result.secret)
    }

    fn transport_error(&self, e: reqwest::Error) -> CaError {
        if e.is_timeout() { CaError::Timeout(self.timeout) } else { CaError::Unreachable(e.to_string()) }
    }
}

/// Outer error is transport, inner is the CA's verdict.
async fn read_envelope<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<Result<T, CaError>, reqwest::Error> {
    let status = resp.status();
    let text = resp.text().await?;
    Ok(parse_envelope(status.as_u16(), &text))
}

fn parse_envelope<T: serde::de::DeserializeOwned>(status: u16, text: &str) -> Result<T, CaError> {
    let envelope: Envelope<T> = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) if (200..300).contains(&status) => {
            return Err(CaError::Malformed(format!("unparseable response: {e}")));
        }
        Err(_) => {
            return Err(CaError::Rejected { status, message: text.trim().to_string() });
        }
    };

    if !(200..300).contains(&status) || !envelope.success || !envelope.errors.is_empty() {
        let message = if envelope.errors.is_empty() {
            format!("request failed with HTTP {status}")
        } else {
            envelope
                .errors
                .iter()
                .map(|m| format!("[{}] {}", m.code, m.message))
                .collect::<Vec<_>>()
                .join("; ")
        };
        let status = if (200..300).contains(&status) { 500 } else { status };
        return Err(CaError::Rejected { status, message });
    }

    envelope
        .result
        .ok_or_else(|| CaError::Malformed("response has no result".into()))
}

/// Fabric CA returns PEM bodies base64-encoded.
fn decode_pem(b64: &str) -> Result<String, CaError> {
    let bytes = B64
        .decode(b64.trim())
        .map_err(|e| CaError::Malformed(format!("certificate is not base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| CaError::Malformed(format!("certificate is not UTF-8: {e}")))
}
