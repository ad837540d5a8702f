//! REST bridge to a ledger gateway service.
//!
//! ```text
//! POST   /api/v1/sessions                                   → {"sessionId": …}
//! GET    /api/v1/sessions/{sid}/channels/{ch}
//! GET    /api/v1/sessions/{sid}/channels/{ch}/contracts/{cc}
//! POST   /api/v1/sessions/{sid}/channels/{ch}/contracts/{cc}/transactions  → {"result": b64}
//! POST   /api/v1/sessions/{sid}/channels/{ch}/contracts/{cc}/evaluations   → {"result": b64}
//! DELETE /api/v1/sessions/{sid}
//! ```
//!
//! Errors come back as `{"error": {"code": …, "message": …}}`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use reqwest::{StatusCode, Url};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Fault, GatewayError, InvocationKind, Proposal, SESSIONS_PATH, SignedProposal};

#[derive(Debug, Clone)]
pub struct HttpGateway {
    endpoint: String,
    base: Url,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreated {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct InvokeResult {
    #[serde(default)]
    result: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    message: String,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        let invalid = |reason: String| GatewayError::Connection { endpoint: base_url.to_string(), reason };
        let base = Url::parse(base_url).map_err(|e| invalid(format!("invalid gateway URL: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(invalid("gateway URL cannot carry a path".into()));
        }
        Ok(Self {
            endpoint: base_url.trim_end_matches('/').to_string(),
            base,
            client: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `<base>/api/v1/sessions/<tail...>`, each tail element one encoded segment.
    fn sessions_url(&self, tail: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Only fails for cannot-be-a-base URLs, which `new` rejects.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(SESSIONS_PATH.split('/').filter(|s| !s.is_empty()))
                .extend(tail);
        }
        url
    }

    pub(super) async fn open(&self, body: &[u8], token: &str) -> Result<String, Fault> {
        debug!(url = %self.endpoint, "opening gateway session");
        let resp = self
            .client
            .post(self.sessions_url(&[]))
            .header(AUTHORIZATION, token)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(transport_fault)?;
        let created: SessionCreated = read_json(resp).await?;
        Ok(created.session_id)
    }

    pub(super) async fn resolve(&self, session: &str, channel: &str, contract: Option<&str>) -> Result<(), Fault> {
        let url = match contract {
            Some(name) => self.sessions_url(&[session, "channels", channel, "contracts", name]),
            None => self.sessions_url(&[session, "channels", channel]),
        };
        let resp = self.client.get(url).send().await.map_err(transport_fault)?;
        check_status(resp).await.map(|_| ())
    }

    pub(super) async fn invoke(
        &self,
        session: &str,
        proposal: &Proposal,
        signed: &SignedProposal,
    ) -> Result<Vec<u8>, Fault> {
        let leaf = match proposal.kind {
            InvocationKind::Submit => "transactions",
            InvocationKind::Evaluate => "evaluations",
        };
        let url = self.sessions_url(&[
            session,
            "channels",
            proposal.channel.as_str(),
            "contracts",
            proposal.contract.as_str(),
            leaf,
        ]);
        let resp = self.client.post(url).json(signed).send().await.map_err(transport_fault)?;
        let out: InvokeResult = read_json(resp).await?;
        B64.decode(out.result.as_bytes())
            .map_err(|e| Fault::Malformed(format!("result is not base64: {e}")))
    }

    pub(super) async fn close(&self, session: &str) -> Result<(), Fault> {
        let resp = self
            .client
            .delete(self.sessions_url(&[session]))
            .send()
            .await
            .map_err(transport_fault)?;
        match check_status(resp).await {
            // Already gone on the server side.
            Err(Fault::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Fire-and-forget close for use outside an async context.
    pub(super) fn release(&self, session: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session, "no runtime to release gateway session; leaving it to expire");
            return;
        };
        let this = self.clone();
        let session = session.to_string();
        handle.spawn(async move {
            if let Err(fault) = this.close(&session).await {
                warn!(%session, %fault, "background session release failed");
            }
        });
    }
}

fn transport_fault(e: reqwest::Error) -> Fault {
    Fault::Unreachable(e.to_string())
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Fault> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(status_fault(status, &text))
}

async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, Fault> {
    let resp = check_status(resp).await?;
    let text = resp.text().await.map_err(transport_fault)?;
    serde_json::from_str(&text).map_err(|e| Fault::Malformed(e.to_string()))
}

fn status_fault(status: StatusCode, body: &str) -> Fault {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) if env.error.code.is_empty() => env.error.message,
        Ok(env) => format!("{}: {}", env.error.code, env.error.message),
        Err(_) if body.trim().is_empty() => format!("HTTP {status}"),
        Err(_) => body.trim().to_string(),
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Fault::Denied(message),
        StatusCode::NOT_FOUND => Fault::NotFound(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Fault::Unreachable(message)
        }
        _ => Fault::Rejected(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_is_classified() {
        let body = r#"{"error":{"code":"ENDORSEMENT","message":"ledger already initialized"}}"#;
        assert_eq!(
            status_fault(StatusCode::INTERNAL_SERVER_ERROR, body),
            Fault::Rejected("ENDORSEMENT: ledger already initialized".into())
        );
        assert!(matches!(status_fault(StatusCode::NOT_FOUND, ""), Fault::NotFound(_)));
        assert!(matches!(status_fault(StatusCode::FORBIDDEN, "nope"), Fault::Denied(m) if m == "nope"));
        assert!(matches!(status_fault(StatusCode::SERVICE_UNAVAILABLE, ""), Fault::Unreachable(_)));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let gw = HttpGateway::new("http://localhost:7080/").unwrap();
        assert_eq!(gw.endpoint(), "http://localhost:7080");
        assert_eq!(gw.sessions_url(&["abc"]).as_str(), "http://localhost:7080/api/v1/sessions/abc");
        assert_eq!(gw.sessions_url(&[]).as_str(), "http://localhost:7080/api/v1/sessions");
    }

    #[test]
    fn names_are_escaped_as_single_segments() {
        let gw = HttpGateway::new("http://localhost:7080/bridge/").unwrap();
        let url = gw.sessions_url(&["s/1", "channels", "my?chan", "contracts", "a#b"]);
        assert_eq!(
            url.as_str(),
            "http://localhost:7080/bridge/api/v1/sessions/s%2F1/channels/my%3Fchan/contracts/a%23b"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn unusable_base_urls_are_rejected() {
        assert!(matches!(HttpGateway::new("not a url"), Err(GatewayError::Connection { .. })));
        assert!(matches!(HttpGateway::new("mailto:ops@example.com"), Err(GatewayError::Connection { .. })));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_transport_fault() {
        let gw = HttpGateway::new("http://127.0.0.1:1").unwrap();
        assert!(matches!(gw.open(b"{}", "t.s").await, Err(Fault::Unreachable(_))));
        assert!(matches!(gw.close("abc").await, Err(Fault::Unreachable(_))));
    }
}
