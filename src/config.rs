//! Controller configuration
//!
//! Loaded once at startup from a YAML file and handed to the actuator. The
//! file carries the metal-api credentials, the accounting API endpoint with
//! its client TLS material, and an optional registry pull credential.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Kind expected in the configuration file header
pub const CONFIGURATION_KIND: &str = "ControllerConfiguration";

/// Auth type sent with HMAC signed metal-api requests when none is configured
pub const DEFAULT_METAL_AUTH_TYPE: &str = "Metal-Admin";

/// Top-level controller configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfiguration {
    /// Header apiVersion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Header kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Inventory and accounting API settings
    pub accounting: AccountingSettings,

    /// Health check settings; parsed and carried, not acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_config: Option<HealthCheckConfig>,

    /// Optional registry credential for the exporter image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<ImagePullSecret>,
}

/// Connection settings for the metal-api and the accounting API
#[derive(Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct AccountingSettings {
    /// Base URL of the metal-api
    #[serde(rename = "metalURL", default)]
    pub metal_url: String,

    /// HMAC key for the metal-api; requests are unsigned when empty
    #[serde(rename = "metalHMAC", default)]
    pub metal_hmac: String,

    /// Auth type prefix of the metal-api Authorization header
    #[serde(rename = "metalAuthType", default)]
    pub metal_auth_type: String,

    /// Hostname of the accounting API
    #[serde(default)]
    pub hostname: String,

    /// Port of the accounting API
    #[serde(default)]
    pub port: String,

    /// CA certificate (PEM) of the accounting API
    #[serde(default)]
    pub ca: String,

    /// Client certificate (PEM) presented by the exporter
    #[serde(default)]
    pub cert: String,

    /// Client key (PEM) presented by the exporter
    #[serde(default)]
    pub key: String,
}

impl fmt::Debug for AccountingSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountingSettings")
            .field("metal_url", &self.metal_url)
            .field("metal_hmac", &redacted(&self.metal_hmac))
            .field("metal_auth_type", &self.metal_auth_type)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("ca", &redacted(&self.ca))
            .field("cert", &redacted(&self.cert))
            .field("key", &redacted(&self.key))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

impl AccountingSettings {
    /// Auth type for signed requests, falling back to [`DEFAULT_METAL_AUTH_TYPE`]
    pub fn auth_type(&self) -> &str {
        if self.metal_auth_type.is_empty() {
            DEFAULT_METAL_AUTH_TYPE
        } else {
            &self.metal_auth_type
        }
    }

    /// Accounting API port as a number
    pub fn port_number(&self) -> Result<u16, Error> {
        self.port.parse().map_err(|_| {
            Error::config(format!("accounting.port {:?} is not a valid port", self.port))
        })
    }
}

/// Health check settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// How often health checks run, e.g. "30s" or "1m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_period: Option<String>,
}

impl HealthCheckConfig {
    /// Parsed sync period, if one is set
    pub fn sync_period(&self) -> Result<Option<Duration>, Error> {
        self.sync_period.as_deref().map(parse_duration).transpose()
    }
}

/// Registry pull credential
#[derive(Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct ImagePullSecret {
    /// Base64 encoded `.dockerconfigjson` document
    #[serde(rename = "encodedDockerConfigJSON", default)]
    pub encoded_docker_config_json: String,
}

impl fmt::Debug for ImagePullSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePullSecret")
            .field(
                "encoded_docker_config_json",
                &redacted(&self.encoded_docker_config_json),
            )
            .finish()
    }
}

impl ControllerConfiguration {
    /// Read, parse and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a configuration document
    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that everything the actuator needs is present
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(kind) = &self.kind {
            if kind != CONFIGURATION_KIND {
                return Err(Error::config(format!(
                    "unexpected kind {kind:?}, expected {CONFIGURATION_KIND}"
                )));
            }
        }

        let accounting = &self.accounting;
        if accounting.metal_url.is_empty() {
            return Err(Error::config("accounting.metalURL must be set"));
        }
        reqwest::Url::parse(&accounting.metal_url).map_err(|e| {
            Error::config(format!(
                "accounting.metalURL {:?} is not a valid URL: {e}",
                accounting.metal_url
            ))
        })?;

        for (field, value) in [
            ("hostname", &accounting.hostname),
            ("ca", &accounting.ca),
            ("cert", &accounting.cert),
            ("key", &accounting.key),
        ] {
            if value.is_empty() {
                return Err(Error::config(format!("accounting.{field} must be set")));
            }
        }
        accounting.port_number()?;

        if let Some(health) = &self.health_check_config {
            health.sync_period()?;
        }
        Ok(())
    }

    /// Registry pull credential, if a non-empty one is configured
    pub fn pull_credentials(&self) -> Option<&str> {
        self.image_pull_secret
            .as_ref()
            .map(|s| s.encoded_docker_config_json.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Parse durations in the "90s", "5m", "1h" or "1h30m" form
fn parse_duration(raw: &str) -> Result<Duration, Error> {
    let invalid = || Error::config(format!("invalid duration {raw:?}"));
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in raw.trim().chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        let secs = value.checked_mul(unit).ok_or_else(invalid)?;
        total = total
            .checked_add(Duration::from_secs(secs))
            .ok_or_else(invalid)?;
    }
    if !digits.is_empty() || total.is_zero() {
        return Err(invalid());
    }
    Ok(total)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    use rstest::rstest;

    pub(crate) const SAMPLE: &str = r#"
apiVersion: accounting.fits.extensions.config.gardener.cloud/v1alpha1
kind: ControllerConfiguration
accounting:
  metalURL: https://metal.example.com/metal
  metalHMAC: change-me
  metalAuthType: Metal-Edit
  hostname: accounting.example.com
  port: "9000"
  ca: CA-PEM
  cert: CERT-PEM
  key: KEY-PEM
healthCheckConfig:
  syncPeriod: 30s
"#;

    pub(crate) fn sample_config() -> ControllerConfiguration {
        ControllerConfiguration::from_yaml(SAMPLE).unwrap()
    }

    #[test]
    fn parses_full_document() {
        let config = sample_config();
        assert_eq!(config.accounting.metal_url, "https://metal.example.com/metal");
        assert_eq!(config.accounting.auth_type(), "Metal-Edit");
        assert_eq!(config.accounting.port_number().unwrap(), 9000);
        assert_eq!(
            config.health_check_config.unwrap().sync_period().unwrap(),
            Some(Duration::from_secs(30))
        );
        assert!(config.image_pull_secret.is_none());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ControllerConfiguration::load(file.path()).unwrap();
        assert_eq!(config.accounting.hostname, "accounting.example.com");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ControllerConfiguration::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn auth_type_defaults_when_empty() {
        let settings = AccountingSettings::default();
        assert_eq!(settings.auth_type(), DEFAULT_METAL_AUTH_TYPE);
    }

    #[test]
    fn pull_credentials_ignore_empty_blob() {
        let mut config = sample_config();
        assert_eq!(config.pull_credentials(), None);

        config.image_pull_secret = Some(ImagePullSecret::default());
        assert_eq!(config.pull_credentials(), None);

        config.image_pull_secret = Some(ImagePullSecret {
            encoded_docker_config_json: "e30=".to_string(),
        });
        assert_eq!(config.pull_credentials(), Some("e30="));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let rendered = format!("{:?}", sample_config());
        assert!(!rendered.contains("change-me"));
        assert!(!rendered.contains("KEY-PEM"));
        assert!(rendered.contains("<redacted>"));
    }

    #[rstest]
    #[case("metalURL: https://metal.example.com/metal", "metalURL: \"\"", "metalURL")]
    #[case("metalURL: https://metal.example.com/metal", "metalURL: not a url", "metalURL")]
    #[case("hostname: accounting.example.com", "hostname: \"\"", "hostname")]
    #[case("port: \"9000\"", "port: \"ninety\"", "port")]
    #[case("key: KEY-PEM", "key: \"\"", "key")]
    #[case("kind: ControllerConfiguration", "kind: Other", "kind")]
    #[case("syncPeriod: 30s", "syncPeriod: soon", "duration")]
    fn invalid_documents_are_rejected(
        #[case] find: &str,
        #[case] replace: &str,
        #[case] mentions: &str,
    ) {
        let raw = SAMPLE.replacen(find, replace, 1);
        match ControllerConfiguration::from_yaml(&raw) {
            Err(Error::Config(msg)) => assert!(msg.contains(mentions), "{msg}"),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[rstest]
    #[case("30s", 30)]
    #[case("5m", 300)]
    #[case("1h30m", 5400)]
    fn durations_parse(#[case] raw: &str, #[case] secs: u64) {
        assert_eq!(parse_duration(raw).unwrap(), Duration::from_secs(secs));
    }

    #[rstest]
    #[case("")]
    #[case("0s")]
    #[case("10")]
    #[case("5d")]
    #[case("99999999999999999h")]
    #[case("18446744073709551615s1s")]
    fn bad_durations_are_config_errors(#[case] raw: &str) {
        let err = parse_duration(raw).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("invalid duration")));
    }
}
