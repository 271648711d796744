//! Stream endpoint provisioning.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::tls::install_rustls_provider;

/// Obtains a streaming endpoint for a zone.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Returns the WebSocket URL to stream `zone` from.
    async fn provision(&self, zone: &str) -> Result<String>;
}

/// Fields requested from the edge for every event.
pub const LOG_FIELDS: &str = "ClientIP,ClientRequestHost,ClientRequestMethod,ClientRequestURI,EdgeResponseStatus,EdgeStartTimestamp";

/// Only blocked (403) requests are streamed.
pub const BLOCKED_FILTER: &str =
    r#"{"where":{"and":[{"key":"EdgeResponseStatus","operator":"eq","value":403}]}}"#;

#[derive(Debug, Clone)]
pub struct CloudflareCredentials {
    pub email: String,
    pub api_key: String,
}

#[derive(Debug, Serialize)]
struct InstantLogsJob<'a> {
    fields: &'a str,
    sample: u32,
    filter: &'a str,
    kind: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<JobResult>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct JobResult {
    destination_conf: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

/// Creates instant-logs jobs through the Cloudflare v4 API.
pub struct CloudflareProvisioner {
    client: reqwest::Client,
    api_base: String,
    credentials: CloudflareCredentials,
}

impl CloudflareProvisioner {
    pub fn new(
        api_base: impl Into<String>,
        credentials: CloudflareCredentials,
        request_timeout: Duration,
    ) -> Result<Self> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn jobs_url(&self, zone: &str) -> String {
        format!("{}/zones/{zone}/logpush/edge/jobs", self.api_base)
    }
}

/// The edge hands back a WebSocket URL; anything else cannot be streamed.
fn stream_url(zone: &str, raw: String) -> Result<String> {
    let parsed = Url::parse(&raw)
        .map_err(|e| Error::provisioning(zone, format!("invalid stream URL {raw:?}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(raw),
        other => Err(Error::provisioning(
            zone,
            format!("unsupported stream URL scheme {other:?}"),
        )),
    }
}

#[async_trait]
impl Provisioner for CloudflareProvisioner {
    async fn provision(&self, zone: &str) -> Result<String> {
        let url = self.jobs_url(zone);
        debug!(zone, %url, "Requesting instant-logs job");

        let body = InstantLogsJob {
            fields: LOG_FIELDS,
            sample: 1,
            filter: BLOCKED_FILTER,
            kind: "instant-logs",
        };

        let response = self
            .client
            .post(&url)
            .header("X-Auth-Email", &self.credentials.email)
            .header("X-Auth-Key", &self.credentials.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provisioning(zone, e.to_string()))?;

        let status = response.status();
        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::provisioning(zone, format!("HTTP {status}: {e}")))?;

        match parsed {
            ApiResponse {
                success: true,
                result:
                    Some(JobResult {
                        destination_conf: Some(url),
                    }),
                ..
            } if !url.is_empty() => stream_url(zone, url),
            ApiResponse { errors, .. } => {
                let reason = errors
                    .into_iter()
                    .next()
                    .map(|e| e.message)
                    .unwrap_or_else(|| format!("Unknown error (HTTP {status})"));
                Err(Error::provisioning(zone, reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    async fn jobs(
        Path(zone): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let authed = headers.get("x-auth-email").is_some_and(|v| v == "ops@example.com")
            && headers.get("x-auth-key").is_some_and(|v| v == "secret");
        if !authed {
            return Json(json!({
                "success": false,
                "result": null,
                "errors": [{"code": 10000, "message": "Authentication error"}]
            }));
        }
        assert_eq!(body["kind"], "instant-logs");
        assert_eq!(body["sample"], 1);
        assert_eq!(body["fields"], LOG_FIELDS);
        assert_eq!(body["filter"], BLOCKED_FILTER);
        Json(json!({
            "success": true,
            "errors": [],
            "result": {"destination_conf": format!("wss://logs.example.com/instant-logs/ws/sessions/{zone}")}
        }))
    }

    async fn serve() -> String {
        let app = Router::new().route("/client/v4/zones/{zone}/logpush/edge/jobs", post(jobs));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/client/v4/")
    }

    fn provisioner(base: &str, api_key: &str) -> CloudflareProvisioner {
        CloudflareProvisioner::new(
            base,
            CloudflareCredentials {
                email: "ops@example.com".into(),
                api_key: api_key.into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_provision_returns_destination() {
        let base = serve().await;
        let url = provisioner(&base, "secret").provision("zone-a").await.unwrap();
        assert_eq!(url, "wss://logs.example.com/instant-logs/ws/sessions/zone-a");
    }

    #[tokio::test]
    async fn test_provision_surfaces_api_error() {
        let base = serve().await;
        let err = provisioner(&base, "wrong").provision("zone-a").await.unwrap_err();
        match err {
            Error::Provisioning { zone, reason } => {
                assert_eq!(zone, "zone-a");
                assert_eq!(reason, "Authentication error");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stream_url_scheme() {
        assert!(stream_url("z", "ws://127.0.0.1:9/logs".into()).is_ok());
        assert!(matches!(
            stream_url("z", "https://logs.example.com".into()),
            Err(Error::Provisioning { .. })
        ));
        assert!(stream_url("z", "not a url".into()).is_err());
    }

    #[tokio::test]
    async fn test_provision_unreachable_api() {
        let err = provisioner("http://127.0.0.1:1", "secret")
            .provision("zone-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provisioning { .. }));
    }
}
