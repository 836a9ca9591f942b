//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

/// SII environment selection for SOAP endpoints.
/// - Certification: the `maullin` host, where new issuers run their test sets.
/// - Production: the `palena` host.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use dte_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("prod")?;
/// assert_eq!(env, EnvironmentType::Production);
/// # Ok::<(), dte_core::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnvironmentType {
    #[default]
    Certification,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "cert" | "certification" | "maullin" => Ok(EnvironmentType::Certification),
            "prod" | "production" | "palena" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Certification => "cert",
            EnvironmentType::Production => "prod",
        }
    }

    pub fn host(&self) -> &'static str {
        match self {
            EnvironmentType::Certification => "maullin.sii.cl",
            EnvironmentType::Production => "palena.sii.cl",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Certification => "https://maullin.sii.cl/",
            EnvironmentType::Production => "https://palena.sii.cl/",
        }
    }
}

/// Errors raised while assembling a [`Config`] from the process environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Environment(#[from] EnvironmentParseError),
    #[error("missing environment variable {0}")]
    MissingVariable(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Where the client certificate container comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateSource {
    Path(PathBuf),
    Base64(String),
}

/// PKCS#12 container plus its passphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateConfig {
    source: CertificateSource,
    password: String,
}

impl CertificateConfig {
    pub fn new(source: CertificateSource, password: impl Into<String>) -> Self {
        Self {
            source,
            password: password.into(),
        }
    }

    pub fn source(&self) -> &CertificateSource {
        &self.source
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

/// Identity fields printed in the envelope cover (`Caratula`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    rut_emisor: String,
    rut_envia: String,
    resolution_date: String,
    resolution_number: u32,
}

impl SenderConfig {
    pub fn new(rut_emisor: impl Into<String>, rut_envia: impl Into<String>) -> Self {
        Self {
            rut_emisor: rut_emisor.into(),
            rut_envia: rut_envia.into(),
            resolution_date: DEFAULT_RESOLUTION_DATE.to_string(),
            resolution_number: 0,
        }
    }

    pub fn with_resolution(mut self, date: impl Into<String>, number: u32) -> Self {
        self.resolution_date = date.into();
        self.resolution_number = number;
        self
    }

    pub fn rut_emisor(&self) -> &str {
        &self.rut_emisor
    }

    pub fn rut_envia(&self) -> &str {
        &self.rut_envia
    }

    pub fn resolution_date(&self) -> &str {
        &self.resolution_date
    }

    pub fn resolution_number(&self) -> u32 {
        self.resolution_number
    }
}

const DEFAULT_RESOLUTION_DATE: &str = "2014-01-01";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the SII client.
///
/// Without a certificate the client runs in dry-run mode: the token handshake
/// returns a placeholder and no mutual TLS identity is presented.
///
/// # Examples
/// ```rust
/// use dte_core::config::{Config, EnvironmentType, SenderConfig};
///
/// let config = Config::new(EnvironmentType::Production)
///     .with_sender(SenderConfig::new("76086428-5", "11111111-1"));
/// assert!(config.certificate().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: EnvironmentType,
    base_url: Option<String>,
    timeout: Duration,
    certificate: Option<CertificateConfig>,
    sender: Option<SenderConfig>,
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            certificate: None,
            sender: None,
        }
    }

    /// Build a configuration from `SII_*` and `BILLING_RUT` variables.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a variable is present but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = match var("SII_ENV") {
            Some(value) => EnvironmentType::from_str(&value)?,
            None => EnvironmentType::default(),
        };
        let mut config = Config::new(env);

        if let Some(url) = var("SII_BASE_URL") {
            config = config.with_base_url(url);
        }
        if let Some(secs) = var("SII_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                name: "SII_TIMEOUT_SECS",
                value: secs.clone(),
            })?;
            config = config.with_timeout(Duration::from_secs(secs));
        }

        let source = var("SII_CERT_P12_B64")
            .map(CertificateSource::Base64)
            .or_else(|| var("SII_CERT_P12_PATH").map(|p| CertificateSource::Path(p.into())));
        if let (Some(source), Some(password)) = (source, var("SII_CERT_PASSWORD")) {
            config = config.with_certificate(CertificateConfig::new(source, password));
        }

        if let Some(rut_emisor) = var("BILLING_RUT") {
            let rut_envia = var("SII_RUT_ENVIA").unwrap_or_else(|| rut_emisor.clone());
            let mut sender = SenderConfig::new(rut_emisor, rut_envia);
            let date = var("SII_FCH_RESOL").unwrap_or_else(|| DEFAULT_RESOLUTION_DATE.into());
            let number = match var("SII_NRO_RESOL") {
                Some(n) => n.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                    name: "SII_NRO_RESOL",
                    value: n.clone(),
                })?,
                None => 0,
            };
            sender = sender.with_resolution(date, number);
            config = config.with_sender(sender);
        }

        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.base_url = Some(if url.ends_with('/') {
            url
        } else {
            format!("{url}/")
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_certificate(mut self, certificate: CertificateConfig) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn with_sender(mut self, sender: SenderConfig) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    /// Base URL with a trailing slash; the override wins over the environment host.
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.env.endpoint_url())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn certificate(&self) -> Option<&CertificateConfig> {
        self.certificate.as_ref()
    }

    pub fn sender(&self) -> Option<&SenderConfig> {
        self.sender.as_ref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(EnvironmentType::Certification)
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_aliases() {
        assert_eq!(
            EnvironmentType::from_str("CERT").expect("cert"),
            EnvironmentType::Certification
        );
        assert_eq!(
            EnvironmentType::from_str("palena").expect("palena"),
            EnvironmentType::Production
        );
        let err = EnvironmentType::from_str("staging").expect_err("invalid");
        assert_eq!(
            err,
            EnvironmentParseError::Invalid {
                input: "staging".into()
            }
        );
    }

    #[test]
    fn hosts_follow_environment() {
        assert_eq!(EnvironmentType::Certification.host(), "maullin.sii.cl");
        assert_eq!(
            EnvironmentType::Production.endpoint_url(),
            "https://palena.sii.cl/"
        );
    }

    #[test]
    fn base_url_override_gets_trailing_slash() {
        let config = Config::default().with_base_url("http://127.0.0.1:8080");
        assert_eq!(config.base_url(), "http://127.0.0.1:8080/");
        assert_eq!(Config::default().base_url(), "https://maullin.sii.cl/");
    }

    #[test]
    fn sender_defaults_resolution() {
        let sender = SenderConfig::new("76086428-5", "11111111-1");
        assert_eq!(sender.resolution_date(), "2014-01-01");
        assert_eq!(sender.resolution_number(), 0);
    }
}
