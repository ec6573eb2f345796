//! Self-registration: the daemon registers itself as a Consul service.
//!
//! At start the manager registers a service named
//! `Consul-Terraform-Sync` (tag `cts`) on the daemon's HTTP port, with
//! one HTTP health check polling `/v1/health` every 10 seconds. It then
//! blocks until shutdown and deregisters on the way out. A missing ACL
//! on deregister is logged and swallowed so a token rotated during the
//! daemon's lifetime cannot turn shutdown into a failure.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::consul::{AgentServiceCheck, AgentServiceRegistration, ConsulClient};
use crate::errors::{is_missing_acl, BoxError};

/// Default tag attached to the registration.
pub const SERVICE_TAG: &str = "cts";

/// How often Consul polls the daemon's health endpoint.
const CHECK_INTERVAL: &str = "10s";
const CHECK_TIMEOUT: &str = "2s";

pub struct SelfRegistrationManager {
    client: Arc<ConsulClient>,
    service_id: String,
    service_name: String,
    namespace: Option<String>,
    port: u16,
    check: Option<AgentServiceCheck>,
}

impl SelfRegistrationManager {
    pub fn new(client: Arc<ConsulClient>, config: &Config) -> Self {
        let registration = &config.service_registration;
        let check = registration.default_check.then(|| {
            let address = registration
                .check_address
                .clone()
                .unwrap_or_else(|| format!("{}://localhost:{}", config.scheme(), config.port));
            AgentServiceCheck {
                check_id: format!("{}-health", config.id),
                name: "CTS Health Status".to_string(),
                http: format!("{}/v1/health", address),
                interval: CHECK_INTERVAL.to_string(),
                timeout: CHECK_TIMEOUT.to_string(),
                tls_skip_verify: true,
            }
        });
        Self {
            client,
            service_id: config.id.clone(),
            service_name: registration.service_name.clone(),
            namespace: registration.namespace.clone(),
            port: config.port,
            check,
        }
    }

    /// Registers, blocks until `cancel` fires, then deregisters.
    ///
    /// A registration failure is returned immediately. On deregister,
    /// a missing ACL is swallowed: the likeliest cause is a token
    /// change since startup, and failing shutdown over it helps nobody.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
        let registration = AgentServiceRegistration {
            id: self.service_id.clone(),
            name: self.service_name.clone(),
            tags: vec![SERVICE_TAG.to_string()],
            port: self.port,
            namespace: self.namespace.clone(),
            checks: self.check.clone().into_iter().collect(),
        };

        self.client.register_service(cancel, &registration).await?;
        info!(
            service = %self.service_name,
            id = %self.service_id,
            port = self.port,
            "Registered with Consul"
        );

        cancel.cancelled().await;
        self.deregister().await
    }

    async fn deregister(&self) -> Result<(), BoxError> {
        // The shutdown token is already cancelled; deregistration gets
        // its own so the call itself is not aborted mid-flight.
        let deregister_cancel = CancellationToken::new();
        match self
            .client
            .deregister_service(&deregister_cancel, &self.service_id)
            .await
        {
            Ok(()) => {
                info!(id = %self.service_id, "Deregistered from Consul");
                Ok(())
            }
            Err(e) if is_missing_acl(e.as_ref()) => {
                error!(
                    id = %self.service_id,
                    error = %e,
                    "Deregistration denied; leaving the service registered"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
