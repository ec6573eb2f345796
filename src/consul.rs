//! Consul HTTP API client.
//!
//! Wraps the agent's HTTP API with typed payloads and routes every call
//! through the retry engine. After each attempt the response status is
//! classified (see [`classify`]): ACL denials and enterprise-only
//! endpoints become their distinguished non-retryable kinds, other 4xx
//! (except 429) become plain non-retryable, and everything else is left
//! retryable.
//!
//! The agent is assumed reachable at the configured address (default
//! `http://localhost:8500`); the same client instance is shared by the
//! dependency watcher and by self-registration.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConsulConfig;
use crate::errors::{
    BoxError, MissingConsulAclError, NonEnterpriseConsulError, NonRetryableError,
};
use crate::retry::{Retry, RetryPolicy};

// ── API payloads ──────────────────────────────────────────────────────────────

/// Body for `agent/service/register`.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<AgentServiceCheck>,
}

/// One health check attached to a service registration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    #[serde(rename = "HTTP")]
    pub http: String,
    pub interval: String,
    pub timeout: String,
    #[serde(rename = "TLSSkipVerify")]
    pub tls_skip_verify: bool,
}

/// One service instance as returned by `agent/services`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    pub tags: Vec<String>,
    pub port: u16,
    pub address: String,
}

/// One check as returned by `health/checks/{service}`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct HealthCheck {
    pub node: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    pub status: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    pub service_name: String,
    pub service_tags: Vec<String>,
}

/// One entry from `health/service/{service}`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceEntry {
    pub service: AgentService,
    pub checks: Vec<HealthCheck>,
}

impl ServiceEntry {
    /// True if every check on the instance is passing.
    pub fn passing(&self) -> bool {
        self.checks.iter().all(|c| c.status == "passing")
    }
}

/// A key-value pair with its value already base64-decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvPair {
    pub key: String,
    pub value: Option<String>,
    pub modify_index: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawKvPair {
    key: String,
    value: Option<String>,
    #[serde(default)]
    modify_index: u64,
}

/// Body for `session/create`.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct SessionEntry {
    pub name: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    pub behavior: String,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

// ── Errors and classification ─────────────────────────────────────────────────

/// Non-2xx response. The Display format carries the status in the
/// `Unexpected response code: NNN` phrasing so text-level status
/// recovery ([`crate::errors::status_from_error`]) also works.
#[derive(Debug, Error, Clone)]
#[error("Unexpected response code: {status} ({body}) during {operation}")]
pub struct UnexpectedResponseCode {
    pub operation: &'static str,
    pub status: u16,
    pub body: String,
}

/// Which API operation produced an error; drives classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Register,
    Deregister,
    QueryServices,
    HealthChecks,
    HealthService,
    CatalogServices,
    KvGet,
    SessionCreate,
    License,
}

impl OpKind {
    /// Operations where a 403 means the configured token lacks an ACL.
    fn acl_sensitive(&self) -> bool {
        matches!(
            self,
            OpKind::Register
                | OpKind::Deregister
                | OpKind::HealthChecks
                | OpKind::HealthService
                | OpKind::KvGet
                | OpKind::SessionCreate
        )
    }
}

/// Wraps a non-2xx response into its error kind:
///
/// - 403 on an ACL-sensitive operation → [`MissingConsulAclError`]
/// - 404 on the license endpoint → [`NonEnterpriseConsulError`]
/// - other 4xx except 429 → [`NonRetryableError`]
/// - 429, 5xx and everything else → the raw error (retryable)
pub fn classify(op: OpKind, err: UnexpectedResponseCode) -> BoxError {
    let status = err.status;
    let classified: BoxError = if status == 403 && op.acl_sensitive() {
        Box::new(MissingConsulAclError::new(Box::new(err)))
    } else if status == 404 && op == OpKind::License {
        Box::new(NonEnterpriseConsulError::new(Box::new(err)))
    } else if (400..500).contains(&status) && status != 429 {
        Box::new(NonRetryableError::new(Box::new(err)))
    } else {
        Box::new(err)
    };
    debug!(
        op = ?op,
        status = status,
        error = %classified,
        "Classified Consul response"
    );
    classified
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Shared, retried Consul client. Stateless aside from the HTTP
/// connection pool and the retry PRNG.
#[derive(Debug)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
    namespace: Option<String>,
    retry: Retry,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Result<Self, BoxError> {
        let http = reqwest::Client::builder()
            .timeout(config.transport_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            namespace: config.namespace.clone(),
            retry: Retry::new(RetryPolicy {
                max_attempts: config.retries,
                ..RetryPolicy::default()
            }),
        })
    }

    /// Test constructor: 1 ns retry waits against an arbitrary base URL.
    pub fn test_client(base_url: &str, max_attempts: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            datacenter: None,
            namespace: None,
            retry: Retry::test_retry(max_attempts),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/{}", self.base_url, path);
        let mut req = self.http.request(method, url);
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        if let Some(dc) = &self.datacenter {
            req = req.query(&[("dc", dc)]);
        }
        if let Some(ns) = &self.namespace {
            req = req.query(&[("ns", ns)]);
        }
        req
    }

    /// Sends one attempt and classifies any non-2xx response.
    async fn attempt(
        &self,
        op: OpKind,
        operation: &'static str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BoxError> {
        debug!(op = ?op, operation = operation, "Consul request");
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(
            op,
            UnexpectedResponseCode {
                operation,
                status: status.as_u16(),
                body,
            },
        ))
    }

    /// `GET operator/license?signed=1`. Enterprise only; community
    /// servers yield a `NonEnterpriseConsulError`.
    pub async fn get_license(&self, cancel: &CancellationToken) -> Result<String, BoxError> {
        const OPERATION: &str = "get license";
        self.retry
            .run(
                cancel,
                || async move {
                    let req = self
                        .request(reqwest::Method::GET, "operator/license")
                        .query(&[("signed", "1")]);
                    let resp = self.attempt(OpKind::License, OPERATION, req).await?;
                    Ok(resp.text().await?)
                },
                OPERATION,
            )
            .await
    }

    /// `PUT agent/service/register`.
    pub async fn register_service(
        &self,
        cancel: &CancellationToken,
        registration: &AgentServiceRegistration,
    ) -> Result<(), BoxError> {
        const OPERATION: &str = "register service";
        self.retry
            .run(
                cancel,
                || async move {
                    let req = self
                        .request(reqwest::Method::PUT, "agent/service/register")
                        .json(registration);
                    self.attempt(OpKind::Register, OPERATION, req).await?;
                    Ok(())
                },
                OPERATION,
            )
            .await
    }

    /// `PUT agent/service/deregister/{id}`.
    pub async fn deregister_service(
        &self,
        cancel: &CancellationToken,
        service_id: &str,
    ) -> Result<(), BoxError> {
        const OPERATION: &str = "deregister service";
        self.retry
            .run(
                cancel,
                || async move {
                    let path = format!("agent/service/deregister/{}", service_id);
                    let req = self.request(reqwest::Method::PUT, &path);
                    self.attempt(OpKind::Deregister, OPERATION, req).await?;
                    Ok(())
                },
                OPERATION,
            )
            .await
    }

    /// `GET agent/services`, optionally filtered with the API's filter
    /// expression language.
    pub async fn query_services(
        &self,
        cancel: &CancellationToken,
        filter: Option<&str>,
    ) -> Result<HashMap<String, AgentService>, BoxError> {
        const OPERATION: &str = "query services";
        self.retry
            .run(
                cancel,
                || async move {
                    let mut req = self.request(reqwest::Method::GET, "agent/services");
                    if let Some(filter) = filter {
                        req = req.query(&[("filter", filter)]);
                    }
                    let resp = self.attempt(OpKind::QueryServices, OPERATION, req).await?;
                    Ok(resp.json().await?)
                },
                OPERATION,
            )
            .await
    }

    /// `GET health/checks/{service}`.
    pub async fn get_health_checks(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<HealthCheck>, BoxError> {
        const OPERATION: &str = "get health checks";
        self.retry
            .run(
                cancel,
                || async move {
                    let path = format!("health/checks/{}", service);
                    let req = self.request(reqwest::Method::GET, &path);
                    let resp = self.attempt(OpKind::HealthChecks, OPERATION, req).await?;
                    Ok(resp.json().await?)
                },
                OPERATION,
            )
            .await
    }

    /// `GET health/service/{service}`: instances with their checks.
    pub async fn get_health_service(
        &self,
        cancel: &CancellationToken,
        service: &str,
    ) -> Result<Vec<ServiceEntry>, BoxError> {
        const OPERATION: &str = "get health service";
        self.retry
            .run(
                cancel,
                || async move {
                    let path = format!("health/service/{}", service);
                    let req = self.request(reqwest::Method::GET, &path);
                    let resp = self.attempt(OpKind::HealthService, OPERATION, req).await?;
                    Ok(resp.json().await?)
                },
                OPERATION,
            )
            .await
    }

    /// `GET catalog/services`: service name → tags, feeding the
    /// catalog-services dependency.
    pub async fn catalog_services(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Vec<String>>, BoxError> {
        const OPERATION: &str = "catalog services";
        self.retry
            .run(
                cancel,
                || async move {
                    let req = self.request(reqwest::Method::GET, "catalog/services");
                    let resp = self
                        .attempt(OpKind::CatalogServices, OPERATION, req)
                        .await?;
                    Ok(resp.json().await?)
                },
                OPERATION,
            )
            .await
    }

    /// `GET kv/{path}`. A 404 on a single key is a normal "key absent"
    /// answer, not an error; recurse lists every key under the prefix.
    pub async fn kv_get(
        &self,
        cancel: &CancellationToken,
        path: &str,
        recurse: bool,
    ) -> Result<Vec<KvPair>, BoxError> {
        const OPERATION: &str = "kv get";
        self.retry
            .run(
                cancel,
                || async move {
                    let api_path = format!("kv/{}", path);
                    let mut req = self.request(reqwest::Method::GET, &api_path);
                    if recurse {
                        req = req.query(&[("recurse", "true")]);
                    }
                    debug!(op = ?OpKind::KvGet, operation = OPERATION, "Consul request");
                    let resp = req.send().await?;
                    let status = resp.status();
                    if status.as_u16() == 404 {
                        return Ok(Vec::new());
                    }
                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(classify(
                            OpKind::KvGet,
                            UnexpectedResponseCode {
                                operation: OPERATION,
                                status: status.as_u16(),
                                body,
                            },
                        ));
                    }
                    let raw: Vec<RawKvPair> = resp.json().await?;
                    let mut pairs = Vec::with_capacity(raw.len());
                    for pair in raw {
                        let value = match pair.value {
                            Some(encoded) => {
                                let bytes = BASE64.decode(encoded.as_bytes())?;
                                Some(String::from_utf8_lossy(&bytes).into_owned())
                            }
                            None => None,
                        };
                        pairs.push(KvPair {
                            key: pair.key,
                            value,
                            modify_index: pair.modify_index,
                        });
                    }
                    Ok(pairs)
                },
                OPERATION,
            )
            .await
    }

    /// `PUT session/create`.
    pub async fn session_create(
        &self,
        cancel: &CancellationToken,
        session: &SessionEntry,
    ) -> Result<String, BoxError> {
        const OPERATION: &str = "create session";
        self.retry
            .run(
                cancel,
                || async move {
                    let req = self
                        .request(reqwest::Method::PUT, "session/create")
                        .json(session);
                    let resp = self.attempt(OpKind::SessionCreate, OPERATION, req).await?;
                    let created: SessionCreated = resp.json().await?;
                    Ok(created.id)
                },
                OPERATION,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{is_missing_acl, is_non_enterprise, is_non_retryable};

    fn code(op: &'static str, status: u16) -> UnexpectedResponseCode {
        UnexpectedResponseCode {
            operation: op,
            status,
            body: String::new(),
        }
    }

    #[test]
    fn forbidden_on_register_is_missing_acl() {
        let err = classify(OpKind::Register, code("register service", 403));
        assert!(is_missing_acl(err.as_ref()));
        assert!(is_non_retryable(err.as_ref()));
    }

    #[test]
    fn forbidden_on_deregister_is_missing_acl() {
        let err = classify(OpKind::Deregister, code("deregister service", 403));
        assert!(is_missing_acl(err.as_ref()));
    }

    #[test]
    fn forbidden_on_kv_and_session_and_health_is_missing_acl() {
        for op in [OpKind::KvGet, OpKind::SessionCreate, OpKind::HealthChecks] {
            let err = classify(op, code("op", 403));
            assert!(is_missing_acl(err.as_ref()), "op {:?}", op);
        }
    }

    #[test]
    fn not_found_on_license_is_non_enterprise() {
        let err = classify(OpKind::License, code("get license", 404));
        assert!(is_non_enterprise(err.as_ref()));
        assert!(is_non_retryable(err.as_ref()));
    }

    #[test]
    fn not_found_elsewhere_is_plain_non_retryable() {
        let err = classify(OpKind::QueryServices, code("query services", 404));
        assert!(!is_non_enterprise(err.as_ref()));
        assert!(!is_missing_acl(err.as_ref()));
        assert!(is_non_retryable(err.as_ref()));
    }

    #[test]
    fn too_many_requests_is_retryable() {
        let err = classify(OpKind::QueryServices, code("query services", 429));
        assert!(!is_non_retryable(err.as_ref()));
    }

    #[test]
    fn server_errors_are_retryable() {
        for status in [500, 502, 503] {
            let err = classify(OpKind::Register, code("register service", status));
            assert!(!is_non_retryable(err.as_ref()), "status {}", status);
        }
    }

    #[test]
    fn classified_error_text_carries_status_phrase() {
        let err = classify(OpKind::Register, code("register service", 403));
        assert_eq!(crate::errors::status_from_error(err.as_ref()), Some(403));
    }

    #[test]
    fn registration_serializes_pascal_case() {
        let reg = AgentServiceRegistration {
            id: "cts-1".to_string(),
            name: "Consul-Terraform-Sync".to_string(),
            tags: vec!["cts".to_string()],
            port: 8558,
            namespace: None,
            checks: vec![AgentServiceCheck {
                check_id: "cts-health".to_string(),
                name: "CTS Health Status".to_string(),
                http: "http://localhost:8558/v1/health".to_string(),
                interval: "10s".to_string(),
                timeout: "2s".to_string(),
                tls_skip_verify: true,
            }],
        };
        let json = serde_json::to_value(&reg).unwrap();
        assert_eq!(json["ID"], "cts-1");
        assert_eq!(json["Name"], "Consul-Terraform-Sync");
        assert_eq!(json["Checks"][0]["HTTP"], "http://localhost:8558/v1/health");
        assert_eq!(json["Checks"][0]["TLSSkipVerify"], true);
        assert!(json.get("Namespace").is_none());
    }

    #[test]
    fn kv_pair_value_decoding() {
        let raw: Vec<RawKvPair> = serde_json::from_str(
            r#"[{"Key":"config/app","Value":"aGVsbG8=","ModifyIndex":42}]"#,
        )
        .unwrap();
        assert_eq!(raw[0].key, "config/app");
        let decoded = BASE64.decode(raw[0].value.as_ref().unwrap().as_bytes()).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "hello");
    }
}
