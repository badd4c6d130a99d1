//! Rule types and field validation.

use chrono::{DateTime, Utc};
use common::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

/// A routing rule: URL path prefix mapped to a backend host and port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Rule {
    #[serde(deserialize_with = "id_from_scalar")]
    pub id: String,

    #[validate(custom = "validate_route_path")]
    pub path: String,

    #[serde(default = "default_target_host")]
    #[validate(custom = "validate_target_host")]
    pub target_host: String,

    #[validate(range(min = 1))]
    pub target_port: u16,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Carried as metadata. Probes are transport-level and ignore it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom = "validate_health_check_path")]
    pub health_check_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// `host:port` of the backend.
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// Informational URL of the backend.
    pub fn target_url(&self) -> String {
        format!("http://{}:{}", self.target_host, self.target_port)
    }
}

/// Input for creating a rule.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewRule {
    /// Assigned by the store when absent.
    #[serde(default)]
    pub id: Option<String>,

    #[validate(custom = "validate_route_path")]
    pub path: String,

    #[serde(default = "default_target_host")]
    #[validate(custom = "validate_target_host")]
    pub target_host: String,

    #[validate(range(min = 1, max = 65535))]
    pub target_port: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    #[validate(custom = "validate_health_check_path")]
    pub health_check_path: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl NewRule {
    pub fn new(path: impl Into<String>, target_port: u32) -> Self {
        Self {
            id: None,
            path: path.into(),
            target_host: default_target_host(),
            target_port,
            enabled: true,
            health_check_path: None,
            description: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = host.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate fields and produce a rule with the given id and timestamps.
    pub(crate) fn into_rule(self, id: String, now: DateTime<Utc>) -> Result<Rule> {
        self.validate().map_err(Error::validation)?;
        let target_port = narrow_port(self.target_port)?;
        Ok(Rule {
            id,
            path: self.path,
            target_host: self.target_host,
            target_port,
            enabled: self.enabled,
            health_check_path: self.health_check_path,
            description: self.description,
            created_at: Some(now),
            updated_at: Some(now),
        })
    }
}

/// Partial update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RuleUpdate {
    #[serde(default)]
    #[validate(custom = "validate_route_path")]
    pub path: Option<String>,

    #[serde(default)]
    #[validate(custom = "validate_target_host")]
    pub target_host: Option<String>,

    #[serde(default)]
    #[validate(range(min = 1, max = 65535))]
    pub target_port: Option<u32>,

    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    #[validate(custom = "validate_health_check_path")]
    pub health_check_path: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl RuleUpdate {
    pub(crate) fn apply(self, rule: &mut Rule, now: DateTime<Utc>) -> Result<()> {
        self.validate().map_err(Error::validation)?;
        if let Some(path) = self.path {
            rule.path = path;
        }
        if let Some(host) = self.target_host {
            rule.target_host = host;
        }
        if let Some(port) = self.target_port {
            rule.target_port = narrow_port(port)?;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        if let Some(hc) = self.health_check_path {
            rule.health_check_path = Some(hc);
        }
        if let Some(description) = self.description {
            rule.description = Some(description);
        }
        rule.updated_at = Some(now);
        Ok(())
    }
}

fn narrow_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(Error::validation(format!(
            "target_port {} out of range 1..=65535",
            port
        ))),
    }
}

fn default_target_host() -> String {
    "localhost".to_string()
}

fn default_enabled() -> bool {
    true
}

// Hand-edited documents may carry numeric ids.
fn id_from_scalar<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Int(u64),
        Str(String),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Int(n) => n.to_string(),
        Scalar::Str(s) => s,
    })
}

// Custom validators

// Rule fields are substituted into proxy config text, so none of them may
// carry a token the proxy's config parser treats as syntax.
fn has_config_syntax(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ';' | '{' | '}' | '#' | '"' | '\'' | '\\'))
}

pub(crate) fn validate_route_path(path: &str) -> std::result::Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::new("path_must_start_with_slash"));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("path_contains_whitespace"));
    }
    if has_config_syntax(path) {
        return Err(ValidationError::new("path_contains_reserved_character"));
    }
    Ok(())
}

/// Hostname, IPv4 address or bracketed IPv6 address. No port, no scheme.
fn validate_target_host(host: &str) -> std::result::Result<(), ValidationError> {
    if host.is_empty() || host.len() > 253 {
        return Err(ValidationError::new("target_host_length"));
    }
    if has_config_syntax(host) {
        return Err(ValidationError::new("target_host_contains_reserved_character"));
    }

    let valid = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(v6) => v6.parse::<std::net::Ipv6Addr>().is_ok(),
        None => {
            host.parse::<std::net::Ipv4Addr>().is_ok()
                || host.split('.').all(|label| {
                    !label.is_empty()
                        && label.len() <= 63
                        && !label.starts_with('-')
                        && !label.ends_with('-')
                        && label
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                })
        }
    };
    if !valid {
        return Err(ValidationError::new("target_host_not_a_hostname_or_ip"));
    }
    Ok(())
}

fn validate_health_check_path(path: &str) -> std::result::Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::new("health_check_path_must_start_with_slash"));
    }
    if has_config_syntax(path) {
        return Err(ValidationError::new("health_check_path_contains_reserved_character"));
    }
    Ok(())
}
