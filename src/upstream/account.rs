//! Backend account API (V2Board-style panel).
//!
//! Every call takes the endpoint explicitly so it can be driven through
//! [`EndpointResolver::with_failover`](super::EndpointResolver::with_failover).

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub plan_id: Option<i64>,
    /// Unix seconds; `None` for plans without expiry.
    #[serde(default)]
    pub expired_at: Option<i64>,
    #[serde(default)]
    pub balance: Option<i64>,
    #[serde(default)]
    pub transfer_enable: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Subscribe token, distinct from the auth token.
    pub token: String,
    #[serde(default)]
    pub plan_id: Option<i64>,
    /// Bytes uploaded this period.
    #[serde(default)]
    pub u: u64,
    /// Bytes downloaded this period.
    #[serde(default)]
    pub d: u64,
    #[serde(default)]
    pub transfer_enable: u64,
    #[serde(default)]
    pub expired_at: Option<i64>,
}

impl SubscriptionInfo {
    /// A plan is attached to the account.
    pub fn has_plan(&self) -> bool {
        self.plan_id.is_some_and(|id| id > 0)
    }

    pub fn used_bytes(&self) -> u64 {
        self.u.saturating_add(self.d)
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.transfer_enable.saturating_sub(self.used_bytes())
    }
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    auth_data: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// `<endpoint><path><token>&flag=clash`.
pub fn subscribe_url(endpoint: &str, path: &str, token: &str) -> String {
    format!("{}{path}{token}&flag=clash", endpoint.trim_end_matches('/'))
}

/// Ask the panel for the Clash flavour of the profile.
fn with_clash_flag(url: &str) -> String {
    if url.contains("flag=clash") || url.contains("clash") {
        url.to_string()
    } else if url.contains('?') {
        format!("{url}&flag=clash")
    } else {
        format!("{url}?flag=clash")
    }
}

#[derive(Debug, Clone)]
pub struct AccountClient {
    http: reqwest::Client,
    user_agent: String,
}

impl AccountClient {
    /// `user_agent` is sent on profile downloads; panels pick the output
    /// format from it.
    pub fn new(user_agent: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            user_agent: user_agent.into(),
        }
    }

    /// Returns the auth token.
    pub async fn login(
        &self,
        endpoint: &str,
        email: &str,
        password: &str,
    ) -> Result<String, UpstreamError> {
        let url = format!("{endpoint}/api/v1/passport/auth/login");
        let req = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "email": email, "password": password }));
        let data: LoginData = self.call(&url, req).await?;
        data.auth_data
            .or(data.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| UpstreamError::Decode {
                url,
                reason: "login response carries no token".into(),
            })
    }

    pub async fn user_info(&self, endpoint: &str, token: &str) -> Result<UserInfo, UpstreamError> {
        let url = format!("{endpoint}/api/v1/user/info");
        let req = self.authorized(&url, token);
        self.call(&url, req).await
    }

    pub async fn subscription(
        &self,
        endpoint: &str,
        token: &str,
    ) -> Result<SubscriptionInfo, UpstreamError> {
        let url = format!("{endpoint}/api/v1/user/getSubscribe");
        let req = self.authorized(&url, token);
        self.call(&url, req).await
    }

    /// Download the proxy profile at `subscribe_url` as text.
    ///
    /// Every failure maps to `ConfigFetch`, which the caller treats as a
    /// reason to try another mirror.
    pub async fn download_config(&self, subscribe_url: &str) -> Result<String, UpstreamError> {
        let url = with_clash_flag(subscribe_url);
        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| UpstreamError::ConfigFetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::ConfigFetch(format!("HTTP {status}")));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| UpstreamError::ConfigFetch(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(UpstreamError::ConfigFetch("empty profile".into()));
        }
        tracing::info!("downloaded profile ({} bytes)", text.len());
        Ok(text)
    }

    /// The panel reads the raw token from `Authorization` (no `Bearer`);
    /// some deployments strip that header, so it also goes in the query.
    fn authorized(&self, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token)
            .query(&[("auth_data", token)])
    }

    async fn call<T: DeserializeOwned>(
        &self,
        url: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<T, UpstreamError> {
        let resp = req.send().await.map_err(|source| UpstreamError::Request {
            url: url.to_string(),
            source,
        })?;
        let status = resp.status();
        let body = resp.text().await.map_err(|source| UpstreamError::Request {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            // A JSON message means the panel itself refused the request.
            return Err(match serde_json::from_str::<ErrorBody>(&body) {
                Ok(err) if status.is_client_error() || status.as_u16() == 500 => {
                    UpstreamError::Rejected {
                        url: url.to_string(),
                        message: err.message,
                    }
                }
                _ => UpstreamError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                    message: body.chars().take(200).collect(),
                },
            });
        }
        decode_data(url, &body)
    }
}

/// Responses wrap the payload in `{"data": ...}`; accept a bare payload too.
fn decode_data<T: DeserializeOwned>(url: &str, body: &str) -> Result<T, UpstreamError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| UpstreamError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let payload = match value {
        serde_json::Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    };
    serde_json::from_value(payload).map_err(|e| UpstreamError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clash_flag_is_appended_once() {
        assert_eq!(with_clash_flag("https://x/sub?token=a"), "https://x/sub?token=a&flag=clash");
        assert_eq!(with_clash_flag("https://x/sub"), "https://x/sub?flag=clash");
        assert_eq!(with_clash_flag("https://x/s/a&flag=clash"), "https://x/s/a&flag=clash");
    }

    #[test]
    fn subscribe_url_format() {
        assert_eq!(
            subscribe_url("https://new.ednovas.dev/", "/2cvme3wa8i/", "abc"),
            "https://new.ednovas.dev/2cvme3wa8i/abc&flag=clash"
        );
    }

    #[test]
    fn plan_detection() {
        let mut sub = SubscriptionInfo {
            token: "t".into(),
            u: 10,
            d: 20,
            transfer_enable: 100,
            ..SubscriptionInfo::default()
        };
        assert!(!sub.has_plan());
        sub.plan_id = Some(3);
        assert!(sub.has_plan());
        assert_eq!(sub.remaining_bytes(), 70);
    }

    #[test]
    fn envelope_and_bare_payloads() {
        let wrapped: SubscriptionInfo =
            decode_data("u", r#"{"data":{"token":"t","plan_id":1}}"#).unwrap();
        assert_eq!(wrapped.token, "t");
        let bare: SubscriptionInfo = decode_data("u", r#"{"token":"b"}"#).unwrap();
        assert_eq!(bare.token, "b");
        assert!(decode_data::<SubscriptionInfo>("u", "<html>").is_err());
    }
}
