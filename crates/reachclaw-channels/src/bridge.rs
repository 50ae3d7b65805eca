//! HTTP bridge — drives accounts through a protocol sidecar.
//!
//! Sidecar API:
//! - `POST   /sessions`                     `{account_id, session, proxy}` → `{session_id}`
//! - `POST   /sessions/{id}/messages`       `{target, text}` → `{message_id}`
//! - `GET    /sessions/{id}/updates?after=` → `{messages: [...], cursor}`
//! - `DELETE /sessions/{id}`
//!
//! Errors come back as `{"error": {"code", "message", "retry_after"}}`.
//! Anything without that body (transport errors, timeouts, a sidecar that
//! is down) is a local failure and costs the message no attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reachclaw_core::config::BridgeConfig;
use reachclaw_core::error::{ReachClawError, Result};
use reachclaw_core::traits::{
    ChatPlatform, InboundMessage, InboundStream, PlatformFailure, ProviderError, SendOutcome, SessionHandle,
};
use reachclaw_core::types::Account;
use serde::Deserialize;
use std::time::Duration;

/// HTTP bridge platform.
pub struct HttpBridgePlatform {
    base_url: String,
    api_token: String,
    poll_interval: Duration,
    request_timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<i64>,
    message: String,
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageSent {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatesPage {
    #[serde(default)]
    messages: Vec<BridgeMessage>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BridgeMessage {
    sender: String,
    chat_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

impl HttpBridgePlatform {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(100)),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        authorize(req, &self.api_token).timeout(self.request_timeout)
    }

    /// Send a request and decode a success body, mapping everything else to
    /// a `PlatformFailure`.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> std::result::Result<T, PlatformFailure> {
        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| PlatformFailure::Local(format!("bridge request failed: {e}")))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| PlatformFailure::Local(format!("bridge response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(failure_from_response(status.as_u16(), retry_after.as_deref(), &body));
        }
        serde_json::from_str(&body).map_err(|e| PlatformFailure::Local(format!("invalid bridge response: {e}")))
    }
}

fn authorize(req: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
    if token.is_empty() { req } else { req.bearer_auth(token) }
}

/// One updates poll, bounded like every other sidecar call.
fn poll_request(
    client: &reqwest::Client,
    url: &str,
    cursor: Option<&str>,
    token: &str,
    timeout: Duration,
) -> reqwest::RequestBuilder {
    let mut req = client.get(url);
    if let Some(c) = cursor {
        req = req.query(&[("after", c)]);
    }
    authorize(req, token).timeout(timeout)
}

/// Map a non-success bridge answer. A provider error body wins; a bare 429
/// is still the provider talking; anything else is the bridge's own trouble.
fn failure_from_response(status: u16, retry_after: Option<&str>, body: &str) -> PlatformFailure {
    let header_wait = retry_after.and_then(|v| v.trim().parse::<u64>().ok()).map(Duration::from_secs);
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        let mut err = ProviderError::new(envelope.error.message).with_code(envelope.error.code.unwrap_or(i64::from(status)));
        if let Some(wait) = envelope.error.retry_after.map(Duration::from_secs).or(header_wait) {
            err = err.with_retry_after(wait);
        }
        return PlatformFailure::Provider(err);
    }
    if status == 429 {
        let mut err = ProviderError::new("Too Many Requests").with_code(429);
        if let Some(wait) = header_wait {
            err = err.with_retry_after(wait);
        }
        return PlatformFailure::Provider(err);
    }
    let snippet: String = body.chars().take(200).collect();
    PlatformFailure::Local(format!("bridge error {status}: {snippet}"))
}

#[async_trait]
impl ChatPlatform for HttpBridgePlatform {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn connect(&self, account: &Account) -> std::result::Result<SessionHandle, PlatformFailure> {
        let Some(session) = account.session_credential.as_deref() else {
            return Err(PlatformFailure::Local(format!("account {} has no session credential", account.id)));
        };
        let body = serde_json::json!({
            "account_id": account.id.as_str(),
            "session": session,
            "proxy": account.proxy,
        });
        let created: SessionCreated = self.call(self.client.post(self.url("/sessions")).json(&body)).await?;
        tracing::debug!(account = %account.id, session = %created.session_id, "Bridge session opened");
        Ok(SessionHandle {
            account_id: account.id.clone(),
            tenant_id: account.tenant_id.clone(),
            session_id: created.session_id,
            connected_at: Utc::now(),
        })
    }

    async fn send(&self, session: &SessionHandle, target: &str, text: &str) -> SendOutcome {
        let body = serde_json::json!({ "target": target, "text": text });
        let req = self
            .client
            .post(self.url(&format!("/sessions/{}/messages", session.session_id)))
            .json(&body);
        match self.call::<MessageSent>(req).await {
            Ok(sent) => SendOutcome::Sent {
                provider_message_id: sent.message_id,
            },
            Err(failure) => failure.into(),
        }
    }

    async fn receive(&self, session: &SessionHandle) -> Result<InboundStream> {
        let client = self.client.clone();
        let url = self.url(&format!("/sessions/{}/updates", session.session_id));
        let token = self.api_token.clone();
        let interval = self.poll_interval;
        let timeout = self.request_timeout;
        let session = session.clone();

        let stream = async_stream::stream! {
            let mut cursor: Option<String> = None;
            let mut failures = 0u32;
            loop {
                let req = poll_request(&client, &url, cursor.as_deref(), &token, timeout);
                match req.send().await {
                    Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status() == reqwest::StatusCode::GONE => {
                        tracing::info!(account = %session.account_id, "Bridge session gone");
                        break;
                    }
                    Ok(resp) if resp.status().is_success() => match resp.json::<UpdatesPage>().await {
                        Ok(page) => {
                            failures = 0;
                            if page.cursor.is_some() {
                                cursor = page.cursor;
                            }
                            for m in page.messages {
                                yield InboundMessage {
                                    account_id: session.account_id.clone(),
                                    tenant_id: session.tenant_id.clone(),
                                    sender: m.sender,
                                    chat_id: m.chat_id,
                                    text: m.text,
                                    received_at: m.date.unwrap_or_else(Utc::now),
                                };
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::warn!(account = %session.account_id, "Invalid updates page: {e}");
                        }
                    },
                    Ok(resp) => {
                        failures += 1;
                        tracing::warn!(account = %session.account_id, "Bridge updates returned {}", resp.status());
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(account = %session.account_id, "Bridge poll failed: {e}");
                    }
                }
                // Back off while the bridge keeps failing, up to 32 poll intervals.
                tokio::time::sleep(interval * (1u32 << failures.min(5))).await;
            }
        };
        Ok(Box::new(Box::pin(stream)))
    }

    async fn disconnect(&self, session: &SessionHandle) -> Result<()> {
        let req = self
            .client
            .delete(self.url(&format!("/sessions/{}", session.session_id)));
        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| ReachClawError::platform(format!("bridge disconnect failed: {e}")))?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ReachClawError::platform(format!("bridge disconnect returned {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_body_is_provider_failure() {
        let body = r#"{"error":{"code":420,"message":"FLOOD_WAIT_30"}}"#;
        let PlatformFailure::Provider(err) = failure_from_response(420, None, body) else {
            panic!("expected provider failure");
        };
        assert_eq!(err.code, Some(420));
        assert_eq!(err.message, "FLOOD_WAIT_30");
        assert_eq!(err.retry_after, None);
    }

    #[test]
    fn test_retry_after_from_body_or_header() {
        let body = r#"{"error":{"message":"slow down","retry_after":12}}"#;
        let PlatformFailure::Provider(err) = failure_from_response(400, Some("99"), body) else {
            panic!("expected provider failure");
        };
        assert_eq!(err.retry_after, Some(Duration::from_secs(12)));
        assert_eq!(err.code, Some(400));

        let PlatformFailure::Provider(err) = failure_from_response(429, Some("7"), "rate limited") else {
            panic!("expected provider failure");
        };
        assert_eq!(err.code, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_bridge_trouble_is_local() {
        assert!(matches!(
            failure_from_response(502, None, "<html>Bad Gateway</html>"),
            PlatformFailure::Local(msg) if msg.starts_with("bridge error 502")
        ));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let platform = HttpBridgePlatform::new(&BridgeConfig {
            base_url: "http://127.0.0.1:8787/".into(),
            api_token: String::new(),
            poll_interval_ms: 10,
            request_timeout_secs: 0,
        });
        assert_eq!(platform.url("/sessions"), "http://127.0.0.1:8787/sessions");
        assert_eq!(platform.poll_interval, Duration::from_millis(100));
        assert_eq!(platform.request_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_without_credential_is_local() {
        use reachclaw_core::types::{AccountRole, TenantId};
        let platform = HttpBridgePlatform::new(&BridgeConfig {
            base_url: "http://127.0.0.1:9".into(),
            api_token: String::new(),
            poll_interval_ms: 1000,
            request_timeout_secs: 10,
        });
        let account = Account::new(TenantId::new("t1"), "a1", "+84", AccountRole::Sender, None);
        assert!(matches!(platform.connect(&account).await, Err(PlatformFailure::Local(_))));
    }

    #[test]
    fn test_update_polls_carry_request_timeout() {
        let client = reqwest::Client::new();
        let request = poll_request(&client, "http://127.0.0.1:9/sessions/s1/updates", Some("42"), "tok", Duration::from_secs(3))
            .build()
            .unwrap();
        assert_eq!(request.timeout(), Some(&Duration::from_secs(3)));
        assert_eq!(request.url().query(), Some("after=42"));
        assert!(request.headers().contains_key(reqwest::header::AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_hung_sidecar_send_fails_locally() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });
        let platform = HttpBridgePlatform::new(&BridgeConfig {
            base_url: format!("http://{addr}"),
            api_token: String::new(),
            poll_interval_ms: 1000,
            request_timeout_secs: 1,
        });
        let session = SessionHandle {
            account_id: reachclaw_core::types::AccountId::new("a1"),
            tenant_id: reachclaw_core::types::TenantId::new("t1"),
            session_id: "s1".into(),
            connected_at: Utc::now(),
        };
        let outcome = tokio::time::timeout(Duration::from_secs(5), platform.send(&session, "@lan", "hi"))
            .await
            .expect("request timeout fired first");
        assert!(matches!(outcome, SendOutcome::Local(_)));
    }
}
