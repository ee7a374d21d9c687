use serde::{Deserialize, Serialize};
use sidecar_pki::{IssueRequest, VaultSettings};
use sidecar_rotation::RefreshPolicy;
use sidecar_types::RotationError;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub identity: IdentityConfig,
    pub rotation: RotationConfig,
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub addr: String,
    pub token: Option<String>,
    pub token_file: String,
    pub mount: String,
    /// Defaults to the identity's common name
    pub role: Option<String>,
    pub ca_cert_path: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Falls back to the subcommand's own name when unset
    pub common_name: Option<String>,
    pub alt_names: Vec<String>,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub period_secs: u64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub tidy_safety_buffer_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub target_scheme: Option<String>,
    pub target_host: Option<String>,
    pub context_root: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            addr: "https://127.0.0.1:8200".to_string(),
            token: None,
            token_file: "/run/secrets/vault_token".to_string(),
            mount: "pki".to_string(),
            role: None,
            ca_cert_path: None,
            timeout_secs: 30,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            common_name: None,
            alt_names: vec!["localhost".to_string()],
            ttl_secs: 300,
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            period_secs: 60,
            jitter_min: 0.7,
            jitter_max: 0.9,
            tidy_safety_buffer_secs: 300,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_port: 443 }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            target_scheme: None,
            target_host: None,
            context_root: String::new(),
        }
    }
}

/// Where the proxy forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: String,
    pub host: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, RotationError> {
        let mut app_config = AppConfig::default();

        // Try to load from file if exists
        if Path::new("config/default.toml").exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name("config/default"))
                .build()
                .map_err(|e| RotationError::Config(format!("Failed to load config file: {}", e)))?;

            app_config = settings
                .try_deserialize::<AppConfig>()
                .map_err(|e| RotationError::Config(format!("Invalid config file: {}", e)))?;
        }

        Self::override_from_env(&mut app_config, |key| std::env::var(key).ok())?;
        app_config.resolve_token()?;

        Ok(app_config)
    }

    fn override_from_env<F>(config: &mut AppConfig, var: F) -> Result<(), RotationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = var("VAULT_ADDR") {
            config.vault.addr = addr;
        }

        if let Some(token) = var("VAULT_TOKEN") {
            if !token.trim().is_empty() {
                config.vault.token = Some(token.trim().to_string());
            }
        }

        if let Some(token_file) = var("VAULT_TOKEN_FILE") {
            config.vault.token_file = token_file;
        }

        if let Some(mount) = var("VAULT_PKI_MOUNT") {
            config.vault.mount = mount;
        }

        if let Some(role) = var("VAULT_PKI_ROLE") {
            config.vault.role = Some(role);
        }

        if let Some(ca_cert) = var("VAULT_CACERT") {
            config.vault.ca_cert_path = Some(ca_cert);
        }

        if let Some(timeout) = var("VAULT_TIMEOUT_SECS") {
            config.vault.timeout_secs = parse_var("VAULT_TIMEOUT_SECS", &timeout)?;
        }

        if let Some(common_name) = var("COMMON_NAME") {
            config.identity.common_name = Some(common_name);
        }

        if let Some(alt_names) = var("ALT_NAMES") {
            config.identity.alt_names = alt_names
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(ttl) = var("CERT_TTL_SECS") {
            config.identity.ttl_secs = parse_var("CERT_TTL_SECS", &ttl)?;
        }

        if let Some(period) = var("REFRESH_PERIOD_SECS") {
            config.rotation.period_secs = parse_var("REFRESH_PERIOD_SECS", &period)?;
        }

        if let Some(jitter_min) = var("REFRESH_JITTER_MIN") {
            config.rotation.jitter_min = parse_var("REFRESH_JITTER_MIN", &jitter_min)?;
        }

        if let Some(jitter_max) = var("REFRESH_JITTER_MAX") {
            config.rotation.jitter_max = parse_var("REFRESH_JITTER_MAX", &jitter_max)?;
        }

        if let Some(buffer) = var("TIDY_SAFETY_BUFFER_SECS") {
            config.rotation.tidy_safety_buffer_secs = parse_var("TIDY_SAFETY_BUFFER_SECS", &buffer)?;
        }

        // Older deployments spell these in camelCase; the upper-case name wins.
        if let Some(port) = var("LISTEN_PORT") {
            let port = parse_var("LISTEN_PORT", &port)?;
            config.server.listen_port = port;
            config.proxy.listen_port = port;
        } else if let Some(port) = var("listenPort") {
            config.server.listen_port = parse_var("listenPort", &port)?;
        }

        if let Some(scheme) = var("TARGET_SCHEME").or_else(|| var("targetScheme")) {
            config.proxy.target_scheme = Some(scheme);
        }

        if let Some(host) = var("TARGET_HOST").or_else(|| var("targetHost")) {
            config.proxy.target_host = Some(host);
        }

        if let Some(context_root) = var("CONTEXT_ROOT").or_else(|| var("contextRoot")) {
            config.proxy.context_root = context_root;
        }

        Ok(())
    }

    /// Fall back to the token file when no token was configured directly.
    fn resolve_token(&mut self) -> Result<(), RotationError> {
        if self.vault.token.is_some() {
            return Ok(());
        }

        let path = Path::new(&self.vault.token_file);
        if path.exists() {
            let token = std::fs::read_to_string(path).map_err(|e| {
                RotationError::Config(format!(
                    "Failed to read Vault token from {}: {}",
                    self.vault.token_file, e
                ))
            })?;
            let token = token.trim();
            if !token.is_empty() {
                self.vault.token = Some(token.to_string());
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), RotationError> {
        if self.vault.addr.is_empty() {
            return Err(RotationError::Config("vault.addr cannot be empty".to_string()));
        }

        if self.vault.token.is_none() {
            return Err(RotationError::Config(format!(
                "No Vault token: set VAULT_TOKEN or provide {}",
                self.vault.token_file
            )));
        }

        if self.identity.ttl_secs == 0 {
            return Err(RotationError::Config("ttl_secs cannot be 0".to_string()));
        }

        let policy = self.refresh_policy()?;

        // A certificate must outlive the longest wait for its replacement.
        if Duration::from_secs(self.identity.ttl_secs) <= policy.max_delay() {
            return Err(RotationError::Config(format!(
                "Certificate TTL {}s must exceed the longest refresh delay {:?}",
                self.identity.ttl_secs,
                policy.max_delay()
            )));
        }

        Ok(())
    }

    pub fn refresh_policy(&self) -> Result<RefreshPolicy, RotationError> {
        RefreshPolicy::new(
            Duration::from_secs(self.rotation.period_secs),
            self.rotation.jitter_min,
            self.rotation.jitter_max,
        )
    }

    /// Common name to request, given the subcommand's fallback.
    pub fn common_name(&self, fallback: &str) -> String {
        self.identity
            .common_name
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn issue_request(&self, common_name: &str) -> IssueRequest {
        IssueRequest::new(
            common_name,
            self.identity.alt_names.clone(),
            Duration::from_secs(self.identity.ttl_secs),
        )
    }

    pub fn vault_settings(&self, common_name: &str) -> Result<VaultSettings, RotationError> {
        let token = self
            .vault
            .token
            .clone()
            .ok_or_else(|| RotationError::Config("No Vault token configured".to_string()))?;

        let ca_cert_pem = match &self.vault.ca_cert_path {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                RotationError::Config(format!("Failed to read Vault CA cert {}: {}", path, e))
            })?),
            None => None,
        };

        Ok(VaultSettings {
            addr: self.vault.addr.clone(),
            token,
            mount: self.vault.mount.clone(),
            role: self
                .vault
                .role
                .clone()
                .unwrap_or_else(|| common_name.to_string()),
            ca_cert_pem,
            timeout: Duration::from_secs(self.vault.timeout_secs),
            tidy_safety_buffer: Duration::from_secs(self.rotation.tidy_safety_buffer_secs),
        })
    }

    pub fn proxy_target(&self) -> Result<ProxyTarget, RotationError> {
        let scheme = self
            .proxy
            .target_scheme
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RotationError::Config("TARGET_SCHEME is required".to_string()))?;
        let host = self
            .proxy
            .target_host
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RotationError::Config("TARGET_HOST is required".to_string()))?;

        if scheme != "https" && scheme != "http" {
            return Err(RotationError::Config(format!(
                "Unsupported TARGET_SCHEME: {}",
                scheme
            )));
        }

        Ok(ProxyTarget { scheme, host })
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, RotationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RotationError::Config(format!("Invalid {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_env(pairs: &[(&str, &str)]) -> Result<AppConfig, RotationError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = AppConfig::default();
        AppConfig::override_from_env(&mut config, |key| env.get(key).cloned())?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.vault.addr, "https://127.0.0.1:8200");
        assert_eq!(config.vault.mount, "pki");
        assert_eq!(config.identity.alt_names, vec!["localhost".to_string()]);
        assert_eq!(config.identity.ttl_secs, 300);
        assert_eq!(config.server.listen_port, 443);
        assert_eq!(config.proxy.listen_port, 8080);
        assert_eq!(config.common_name("dumbserver"), "dumbserver");
    }

    #[test]
    fn test_env_overrides() {
        let config = with_env(&[
            ("VAULT_ADDR", "https://vault:8200"),
            ("VAULT_TOKEN", " s.abc \n"),
            ("COMMON_NAME", "svc-a"),
            ("ALT_NAMES", "svc-a.local, localhost,,"),
            ("LISTEN_PORT", "9443"),
            ("REFRESH_JITTER_MIN", "0.5"),
        ])
        .unwrap();

        assert_eq!(config.vault.addr, "https://vault:8200");
        assert_eq!(config.vault.token.as_deref(), Some("s.abc"));
        assert_eq!(config.common_name("dumbserver"), "svc-a");
        assert_eq!(
            config.identity.alt_names,
            vec!["svc-a.local".to_string(), "localhost".to_string()]
        );
        assert_eq!(config.server.listen_port, 9443);
        assert_eq!(config.proxy.listen_port, 9443);
        assert_eq!(config.rotation.jitter_min, 0.5);
    }

    #[test]
    fn test_invalid_number_rejected() {
        let err = with_env(&[("CERT_TTL_SECS", "five minutes")]).unwrap_err();
        assert!(matches!(err, RotationError::Config(msg) if msg.contains("CERT_TTL_SECS")));
    }

    #[test]
    fn test_validate_requires_token() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());

        let config = with_env(&[("VAULT_TOKEN", "s.abc")]).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ttl_exceeds_refresh_delay() {
        let config = with_env(&[("VAULT_TOKEN", "s.abc"), ("CERT_TTL_SECS", "54")]).unwrap();
        assert!(config.validate().is_err());

        let config = with_env(&[("VAULT_TOKEN", "s.abc"), ("CERT_TTL_SECS", "55")]).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_jitter() {
        let config = with_env(&[("VAULT_TOKEN", "s.abc"), ("REFRESH_JITTER_MAX", "1e300")]).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RotationError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_inverted_jitter() {
        let config = with_env(&[
            ("VAULT_TOKEN", "s.abc"),
            ("REFRESH_JITTER_MIN", "0.9"),
            ("REFRESH_JITTER_MAX", "0.7"),
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_defaults_to_common_name() {
        let config = with_env(&[("VAULT_TOKEN", "s.abc")]).unwrap();
        let settings = config.vault_settings("outproxy").unwrap();
        assert_eq!(settings.role, "outproxy");
        assert_eq!(settings.tidy_safety_buffer, Duration::from_secs(300));

        let config = with_env(&[("VAULT_TOKEN", "s.abc"), ("VAULT_PKI_ROLE", "sidecars")]).unwrap();
        assert_eq!(config.vault_settings("outproxy").unwrap().role, "sidecars");
    }

    #[test]
    fn test_proxy_target_required() {
        let config = AppConfig::default();
        assert!(config.proxy_target().is_err());

        let config = with_env(&[("TARGET_SCHEME", "https"), ("TARGET_HOST", "localhost:443")]).unwrap();
        assert_eq!(
            config.proxy_target().unwrap(),
            ProxyTarget {
                scheme: "https".to_string(),
                host: "localhost:443".to_string(),
            }
        );

        let config = with_env(&[("TARGET_SCHEME", "ftp"), ("TARGET_HOST", "x")]).unwrap();
        assert!(config.proxy_target().is_err());
    }

    #[test]
    fn test_camel_case_variable_names_accepted() {
        let config = with_env(&[
            ("targetScheme", "http"),
            ("targetHost", "backend:8080"),
            ("contextRoot", "/api"),
            ("listenPort", "8443"),
        ])
        .unwrap();
        assert_eq!(
            config.proxy_target().unwrap(),
            ProxyTarget {
                scheme: "http".to_string(),
                host: "backend:8080".to_string(),
            }
        );
        assert_eq!(config.proxy.context_root, "/api");
        assert_eq!(config.server.listen_port, 8443);
        assert_eq!(config.proxy.listen_port, 8080);

        let config = with_env(&[
            ("TARGET_HOST", "primary:443"),
            ("targetHost", "ignored:443"),
            ("LISTEN_PORT", "9443"),
            ("listenPort", "1"),
        ])
        .unwrap();
        assert_eq!(config.proxy.target_host.as_deref(), Some("primary:443"));
        assert_eq!(config.server.listen_port, 9443);
        assert_eq!(config.proxy.listen_port, 9443);
    }
}
