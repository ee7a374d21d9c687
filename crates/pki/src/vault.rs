//! HashiCorp Vault PKI secrets engine client.
//!
//! Speaks the `issue`, `revoke` and `tidy` endpoints of a PKI mount over the
//! Vault HTTP API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client as HttpClient, Response};
use serde::{Deserialize, Serialize};
use sidecar_types::{Result, RotationError, Serial};
use std::time::Duration;
use tracing::{debug, info};

use crate::authority::{CertificateAuthority, IssueRequest, IssuedBundle};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Connection settings for a Vault PKI mount.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    /// Vault address, e.g. `https://vault:8200`
    pub addr: String,
    pub token: String,
    /// PKI mount path, `pki` by default
    pub mount: String,
    /// Role used on the issue endpoint
    pub role: String,
    /// PEM CA bundle for the Vault endpoint itself
    pub ca_cert_pem: Option<String>,
    pub timeout: Duration,
    /// How long expired certificates are kept before tidy removes them
    pub tidy_safety_buffer: Duration,
}

#[derive(Serialize)]
struct IssueBody<'a> {
    common_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    alt_names: Option<String>,
    ttl: String,
}

#[derive(Serialize)]
struct RevokeBody<'a> {
    serial_number: &'a str,
}

#[derive(Serialize)]
struct TidyBody {
    tidy_cert_store: bool,
    tidy_revocation_list: bool,
    safety_buffer: String,
}

#[derive(Deserialize)]
struct SecretResponse<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaChain {
    List(Vec<String>),
    Single(String),
}

impl CaChain {
    fn into_pem(self) -> String {
        match self {
            CaChain::List(certs) => certs.join("\n"),
            CaChain::Single(pem) => pem,
        }
    }
}

#[derive(Deserialize)]
struct IssueData {
    certificate: Option<String>,
    private_key: Option<String>,
    ca_chain: Option<CaChain>,
    issuing_ca: Option<String>,
    serial_number: Option<String>,
}

impl IssueData {
    /// Prefer the full chain, fall back to the issuing CA alone.
    fn chain_pem(&mut self) -> Option<String> {
        self.ca_chain
            .take()
            .map(CaChain::into_pem)
            .filter(|pem| !pem.trim().is_empty())
            .or_else(|| self.issuing_ca.take().filter(|pem| !pem.trim().is_empty()))
    }
}

#[derive(Deserialize)]
struct RevokeData {
    revocation_time: i64,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Vault duration string in whole seconds.
fn vault_duration(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    field.filter(|v| !v.is_empty()).ok_or_else(|| {
        RotationError::Issuance(format!("Issue response is missing '{}'", name))
    })
}

/// Authority client backed by a Vault PKI mount.
#[derive(Clone)]
pub struct VaultPkiClient {
    settings: VaultSettings,
    client: HttpClient,
}

impl VaultPkiClient {
    pub fn new(settings: VaultSettings) -> Result<Self> {
        let mut builder = HttpClient::builder().timeout(settings.timeout);

        if let Some(pem) = &settings.ca_cert_pem {
            let ca = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| {
                RotationError::Config(format!("Invalid Vault CA certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(ca);
        }

        let client = builder
            .build()
            .map_err(|e| RotationError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { settings, client })
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/{}",
            self.settings.addr.trim_end_matches('/'),
            self.settings.mount.trim_matches('/'),
            path
        )
    }

    /// POST `body` to `path` under the mount, mapping non-2xx answers to
    /// Vault's error list.
    async fn write<B: Serialize>(&self, path: &str, body: &B) -> std::result::Result<Response, String> {
        let url = self.url(path);
        debug!("Vault write {}", url);

        let response = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, &self.settings.token)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("Request to {} failed: {}", url, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let errors = response.json::<ErrorBody>().await.unwrap_or_default();
        if errors.errors.is_empty() {
            Err(format!("Vault returned {}", status))
        } else {
            Err(format!("Vault returned {}: {}", status, errors.errors.join("; ")))
        }
    }
}

#[async_trait]
impl CertificateAuthority for VaultPkiClient {
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle> {
        let alt_names = if request.alt_names.is_empty() {
            None
        } else {
            Some(request.alt_names.join(","))
        };
        let body = IssueBody {
            common_name: &request.common_name,
            alt_names,
            ttl: vault_duration(request.ttl),
        };

        let response = self
            .write(&format!("issue/{}", self.settings.role), &body)
            .await
            .map_err(RotationError::Issuance)?;

        let secret: SecretResponse<IssueData> = response
            .json()
            .await
            .map_err(|e| RotationError::Issuance(format!("Malformed issue response: {}", e)))?;
        let mut data = secret
            .data
            .ok_or_else(|| RotationError::Issuance("Issue response has no data".to_string()))?;

        let chain_pem = data.chain_pem().ok_or_else(|| {
            RotationError::Issuance(
                "Issue response is missing both 'ca_chain' and 'issuing_ca'".to_string(),
            )
        })?;
        let certificate = required(data.certificate, "certificate")?;
        let private_key = required(data.private_key, "private_key")?;
        let serial = Serial::from(required(data.serial_number, "serial_number")?);

        debug!("Vault issued certificate {} for {}", serial, request.common_name);

        IssuedBundle::from_pem(&certificate, &private_key, &chain_pem, serial)
    }

    async fn revoke(&self, serial: &Serial) -> Result<DateTime<Utc>> {
        let revocation_error = |reason: String| RotationError::Revocation {
            serial: serial.clone(),
            reason,
        };

        let body = RevokeBody {
            serial_number: serial.as_str(),
        };
        let response = self.write("revoke", &body).await.map_err(revocation_error)?;

        let secret: SecretResponse<RevokeData> = response
            .json()
            .await
            .map_err(|e| revocation_error(format!("Malformed revoke response: {}", e)))?;
        let data = secret
            .data
            .ok_or_else(|| revocation_error("Revoke response has no data".to_string()))?;

        let revoked_at = DateTime::<Utc>::from_timestamp(data.revocation_time, 0)
            .ok_or_else(|| revocation_error(format!("Invalid revocation time {}", data.revocation_time)))?;

        info!("Certificate {} revoked at {}", serial, revoked_at);
        Ok(revoked_at)
    }

    async fn tidy(&self) -> Result<()> {
        let body = TidyBody {
            tidy_cert_store: true,
            tidy_revocation_list: true,
            safety_buffer: vault_duration(self.settings.tidy_safety_buffer),
        };

        self.write("tidy", &body).await.map_err(RotationError::Tidy)?;
        debug!("Vault tidy requested");
        Ok(())
    }
}
