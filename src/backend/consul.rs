//! Consul agent HTTP API.
//!
//! Listings come from `/v1/health/service/<name>?passing=true`. Long-polls add the
//! `index` and `wait` blocking-query parameters and read the new index back from the
//! `X-Consul-Index` response header.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};

use super::{Listing, Registry};
use crate::error::{Error, Result};
use crate::service::{Check, Index, Service};

const INDEX_HEADER: &str = "X-Consul-Index";

/// Registry backed by a Consul agent.
#[derive(Clone, Debug)]
pub struct ConsulRegistry {
    http: Client,
    base: Url,
    timeout: Option<Duration>,
    wait: Duration,
}

impl ConsulRegistry {
    /// Creates a client for the agent at `base_url`.
    ///
    /// `timeout` bounds ordinary requests (`None` leaves them unbounded); long-polls ask
    /// the agent to wait up to `wait`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] when `base_url` is not an absolute HTTP URL, or
    /// an error when the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Option<Duration>, wait: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| Error::InvalidAddress(base_url.to_string()))?;

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            base,
            timeout,
            wait,
        })
    }

    /// Agent base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// Checks that the agent answers.
    ///
    /// # Errors
    ///
    /// Returns the transport or status error of `/v1/agent/self`.
    pub async fn ping(&self) -> Result<()> {
        let url = self.url(&["v1", "agent", "self"]);
        let resp = self.bounded(self.http.get(url.clone())).send().await?;

        ensure_success(resp, &url)?;
        Ok(())
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Checked in `new`: the base can carry path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn bounded(&self, request: RequestBuilder) -> RequestBuilder {
        match self.timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    async fn health(&self, name: &str, index: Index) -> Result<Listing> {
        let url = self.url(&["v1", "health", "service", name]);
        let mut request = self.http.get(url.clone()).query(&[("passing", "true")]);

        if index > 0 {
            // The agent adds up to wait/16 of jitter to blocking queries.
            let jittered = self.wait + self.wait / 16;
            request = request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", self.wait.as_secs())),
                ])
                .timeout(jittered + self.timeout.unwrap_or_default());
        } else {
            request = self.bounded(request);
        }

        let resp = ensure_success(request.send().await?, &url)?;
        let index = parse_index(resp.headers())?;
        let entries: Vec<HealthEntry> = resp.json().await?;

        Ok((into_services(name, entries), index))
    }
}

impl Registry for ConsulRegistry {
    async fn register(&self, service: &Service, check: Option<&Check>) -> Result<()> {
        let url = self.url(&["v1", "agent", "service", "register"]);
        let payload = Registration::new(service, check);

        let resp = self
            .bounded(self.http.put(url.clone()))
            .json(&payload)
            .send()
            .await?;

        ensure_success(resp, &url)?;
        tracing::debug!("registered {service} as {}", service.id());
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let url = self.url(&["v1", "agent", "service", "deregister", service_id]);
        let resp = self.bounded(self.http.put(url.clone())).send().await?;

        ensure_success(resp, &url)?;
        tracing::debug!("deregistered {service_id}");
        Ok(())
    }

    async fn fetch_service(&self, name: &str) -> Result<Listing> {
        self.health(name, 0).await
    }

    async fn watch_service(&self, name: &str, index: Index) -> Result<Listing> {
        self.health(name, index).await
    }
}

fn ensure_success(resp: Response, url: &Url) -> Result<Response> {
    let status = resp.status();

    if status.is_success() {
        Ok(resp)
    } else {
        Err(Error::Status {
            status: status.as_u16(),
            path: url.path().to_string(),
        })
    }
}

fn parse_index(headers: &HeaderMap) -> Result<Index> {
    headers
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::Protocol(format!("missing or invalid {INDEX_HEADER} header")))
}

fn into_services(name: &str, entries: Vec<HealthEntry>) -> Vec<Service> {
    entries
        .into_iter()
        .map(|entry| {
            let HealthEntry { node, service } = entry;

            // An empty service address means "use the node address".
            let host = if service.address.is_empty() {
                node.address
            } else {
                service.address
            };

            Service::new(name, host, service.port)
                .with_id(service.id)
                .with_kind(service.kind.unwrap_or_default())
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: NodeInfo,
    service: AgentService,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    address: String,
    port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Registration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    kind: &'a str,
    address: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentCheck<'a>>,
}

impl<'a> Registration<'a> {
    fn new(service: &'a Service, check: Option<&'a Check>) -> Self {
        Self {
            id: service.id(),
            name: service.name(),
            kind: service.kind(),
            address: service.host(),
            port: service.port(),
            check: check.and_then(AgentCheck::new),
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck<'a> {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<&'a str>,
    #[serde(rename = "GRPC", skip_serializing_if = "Option::is_none")]
    grpc: Option<&'a str>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    tcp: Option<&'a str>,
    #[serde(skip_serializing_if = "str::is_empty")]
    timeout: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    interval: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    deregister_critical_service_after: &'a str,
}

impl<'a> AgentCheck<'a> {
    fn new(check: &'a Check) -> Option<Self> {
        let mut agent = Self {
            timeout: &check.timeout,
            interval: &check.interval,
            deregister_critical_service_after: &check.interval,
            ..Default::default()
        };

        let target = Some(check.target.as_str());
        match check.kind.to_ascii_lowercase().as_str() {
            "http" => agent.http = target,
            "grpc" => agent.grpc = target,
            "tcp" => agent.tcp = target,
            other => {
                tracing::warn!("unsupported check type {other:?}, registering without check");
                return None;
            }
        }

        Some(agent)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;
    use serde_json::json;

    use super::*;

    fn entries(value: serde_json::Value) -> Vec<HealthEntry> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn health_entries_become_services() {
        let entries = entries(json!([
            {
                "Node": { "Node": "n1", "Address": "192.168.1.10" },
                "Service": {
                    "ID": "api-1",
                    "Service": "api",
                    "Kind": "",
                    "Address": "10.0.0.1",
                    "Port": 8080
                },
                "Checks": []
            },
            {
                "Node": { "Node": "n2", "Address": "192.168.1.11" },
                "Service": { "ID": "api-2", "Service": "api", "Address": "10.0.0.2", "Port": 8081 }
            }
        ]));

        let services = into_services("api", entries);

        assert_eq!(services.len(), 2);
        assert_eq!(services[0].id(), "api-1");
        assert_eq!(services[0].address(), "10.0.0.1:8080");
        assert_eq!(services[1].address(), "10.0.0.2:8081");
        assert_eq!(services[1].name(), "api");
    }

    #[test]
    fn empty_service_address_falls_back_to_node() {
        let entries = entries(json!([
            {
                "Node": { "Address": "192.168.1.10" },
                "Service": { "ID": "api-1", "Address": "", "Port": 8080, "Kind": null }
            }
        ]));

        let services = into_services("api", entries);
        assert_eq!(services[0].address(), "192.168.1.10:8080");
    }

    #[test]
    fn index_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(INDEX_HEADER, HeaderValue::from_static("4711"));

        assert_eq!(parse_index(&headers).unwrap(), 4711);
    }

    #[test]
    fn missing_index_header_is_a_protocol_error() {
        assert!(matches!(
            parse_index(&HeaderMap::new()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn registration_payload_with_http_check() {
        let service = Service::new("api", "10.0.0.1", 8080).with_id("api-1");
        let check = Check::new("HTTP", "http://10.0.0.1:8080/health")
            .timeout("5s")
            .interval("10s");

        let payload = serde_json::to_value(Registration::new(&service, Some(&check))).unwrap();

        assert_eq!(
            payload,
            json!({
                "ID": "api-1",
                "Name": "api",
                "Address": "10.0.0.1",
                "Port": 8080,
                "Check": {
                    "HTTP": "http://10.0.0.1:8080/health",
                    "Timeout": "5s",
                    "Interval": "10s",
                    "DeregisterCriticalServiceAfter": "10s"
                }
            })
        );
    }

    #[test]
    fn registration_payload_with_grpc_and_tcp_checks() {
        let service = Service::new("api", "10.0.0.1", 50051);

        let grpc = Check::new("grpc", "10.0.0.1:50051");
        let payload = serde_json::to_value(Registration::new(&service, Some(&grpc))).unwrap();
        assert_eq!(payload["Check"], json!({ "GRPC": "10.0.0.1:50051" }));

        let tcp = Check::new("tcp", "10.0.0.1:50051").interval("3s");
        let payload = serde_json::to_value(Registration::new(&service, Some(&tcp))).unwrap();
        assert_eq!(
            payload["Check"],
            json!({
                "TCP": "10.0.0.1:50051",
                "Interval": "3s",
                "DeregisterCriticalServiceAfter": "3s"
            })
        );
    }

    #[test]
    fn unknown_check_type_is_dropped() {
        let service = Service::new("api", "10.0.0.1", 8080).with_kind("mesh-gateway");
        let check = Check::new("script", "/bin/true");

        let payload = serde_json::to_value(Registration::new(&service, Some(&check))).unwrap();

        assert!(payload.get("Check").is_none());
        assert_eq!(payload["Kind"], "mesh-gateway");
    }

    #[test]
    fn path_segments_are_percent_encoded() {
        let registry =
            ConsulRegistry::new("http://127.0.0.1:8500", None, Duration::from_secs(60)).unwrap();

        let url = registry.url(&["v1", "health", "service", "a/b?c#d"]);

        assert_eq!(url.as_str(), "http://127.0.0.1:8500/v1/health/service/a%2Fb%3Fc%23d");
    }

    #[test]
    fn base_path_prefix_is_kept() {
        let registry =
            ConsulRegistry::new("http://gateway/consul/", None, Duration::from_secs(60)).unwrap();

        let url = registry.url(&["v1", "agent", "service", "deregister", "api 1"]);

        assert_eq!(url.as_str(), "http://gateway/consul/v1/agent/service/deregister/api%201");
    }

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(matches!(
            ConsulRegistry::new("127.0.0.1:8500/", None, Duration::from_secs(60)),
            Err(Error::InvalidAddress(_))
        ));
    }
}
