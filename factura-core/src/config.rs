//! Configuration, environment selection and credentials.
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Default bound on one billService exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable that overrides the billService endpoint.
pub const BASE_URL_ENV: &str = "FACTURA_SUNAT_BASE_URL";

/// SUNAT environment selection for the billService endpoint.
/// - Beta: the public test environment, accepts the sandbox credential rule.
/// - Homologation: the certification environment used before going live.
/// - Production: the live environment.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use factura_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("beta")?;
/// assert_eq!(env, EnvironmentType::Beta);
/// # Ok::<(), factura_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentType {
    Beta,
    Homologation,
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
        match env.to_ascii_lowercase().as_str() {
            "beta" => Ok(EnvironmentType::Beta),
            "homologation" => Ok(EnvironmentType::Homologation),
            "production" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Beta => "beta",
            EnvironmentType::Homologation => "homologation",
            EnvironmentType::Production => "production",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Beta => {
                "https://e-beta.sunat.gob.pe/ol-ti-itcpfegem-beta/billService"
            }
            EnvironmentType::Homologation => {
                "https://www.sunat.gob.pe/ol-ti-itcpgem-sqa/billService"
            }
            EnvironmentType::Production => {
                "https://e-factura.sunat.gob.pe/ol-ti-itcpfegem/billService"
            }
        }
    }
}

/// Configuration for the transport client.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use factura_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Beta).with_timeout(Duration::from_secs(10));
/// assert_eq!(config.timeout(), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: EnvironmentType,
    timeout: Duration,
    endpoint: Option<String>,
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            timeout: DEFAULT_TIMEOUT,
            endpoint: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send to `endpoint` instead of the environment's URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Endpoint resolution order: explicit override, then [`BASE_URL_ENV`],
    /// then the environment's fixed URL.
    pub fn endpoint(&self) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.clone();
        }
        std::env::var(BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.env.endpoint_url().to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(EnvironmentType::Beta)
    }
}

/// Operator token SUNAT publishes for the beta environment.
pub const SANDBOX_OPERATOR: &str = "MODDATOS";

/// Username/password pair sent in the WS-Security header.
///
/// # Examples
/// ```rust
/// use factura_core::config::SolCredentials;
///
/// let creds = SolCredentials::sandbox("20601546913", "MODDATOS");
/// assert_eq!(creds.username(), "20601546913MODDATOS");
/// assert_eq!(creds.password(), "20601546913");
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolCredentials {
    issuer_id: String,
    username: String,
    password: String,
}

impl SolCredentials {
    /// Beta convention: username is the issuer id followed by the operator
    /// token, password is the issuer id.
    pub fn sandbox(issuer_id: impl Into<String>, operator: &str) -> Self {
        let issuer_id = issuer_id.into();
        Self {
            username: format!("{issuer_id}{operator}"),
            password: issuer_id.clone(),
            issuer_id,
        }
    }

    pub fn new(
        issuer_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            issuer_id: issuer_id.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for SolCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolCredentials")
            .field("issuer_id", &self.issuer_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Locations of the PEM encoded signing key (PKCS#8) and certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningMaterialPaths {
    key: PathBuf,
    certificate: PathBuf,
}

impl SigningMaterialPaths {
    pub fn new(key: impl Into<PathBuf>, certificate: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            certificate: certificate.into(),
        }
    }

    pub fn key(&self) -> &Path {
        &self.key
    }

    pub fn certificate(&self) -> &Path {
        &self.certificate
    }
}

impl Default for SigningMaterialPaths {
    fn default() -> Self {
        Self::new("./certs/private_pkcs8.key", "./certs/public.pem")
    }
}
