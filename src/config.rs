//! Configuration types for the SOAP pipeline.

use crate::header::{QName, ROLE_NEXT, ROLE_ULTIMATE_RECEIVER};
use crate::parser::{SOAP_11_NS, SOAP_12_NS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Main configuration for a SOAP endpoint or client proxy pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// SOAP binding configuration (roles and understood headers)
    pub binding: BindingConfig,

    /// Wire encoding configuration
    pub codec: CodecConfig,

    /// Tubeline pooling configuration
    pub pool: PoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            binding: BindingConfig::default(),
            codec: CodecConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// SOAP version spoken by the binding
    pub soap_version: SoapVersion,

    /// Maximum encoded message size to decode (bytes)
    pub max_message_size: usize,

    /// Insert a dump tube that logs every message
    pub dump_messages: bool,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            soap_version: SoapVersion::Soap11,
            max_message_size: 1_048_576, // 1MB
            dump_messages: false,
        }
    }
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

impl SoapVersion {
    /// Envelope namespace URI.
    pub fn ns_uri(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }

    /// Resolve a version from an envelope namespace URI.
    pub fn from_ns_uri(ns: &str) -> Option<Self> {
        match ns {
            SOAP_11_NS => Some(Self::Soap11),
            SOAP_12_NS => Some(Self::Soap12),
            _ => None,
        }
    }

    /// Name of the header attribute carrying the targeted role.
    pub fn role_attribute_name(&self) -> &'static str {
        match self {
            Self::Soap11 => "actor",
            Self::Soap12 => "role",
        }
    }

    /// Role assumed for a header without a role/actor attribute.
    ///
    /// Roles are always expressed with SOAP 1.2 URIs, SOAP 1.1 actors are
    /// normalized on parse.
    pub fn implicit_role(&self) -> &'static str {
        ROLE_ULTIMATE_RECEIVER
    }

    /// Roles every SOAP node implementing this binding plays.
    pub fn required_roles(&self) -> [&'static str; 2] {
        [ROLE_NEXT, ROLE_ULTIMATE_RECEIVER]
    }

    /// MIME type of an XML-encoded envelope.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Soap11 => "text/xml",
            Self::Soap12 => "application/soap+xml",
        }
    }

    /// MIME type of a Fast Infoset encoded envelope.
    pub fn fast_infoset_content_type(&self) -> &'static str {
        match self {
            Self::Soap11 => "application/fastinfoset",
            Self::Soap12 => "application/soap+fastinfoset",
        }
    }

    /// Qualified fault code signalling a MustUnderstand violation.
    pub fn must_understand_fault_code(&self) -> QName {
        QName::new(self.ns_uri(), "MustUnderstand")
    }
}

/// SOAP binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Additional roles (beyond next and ultimateReceiver) this node plays
    pub roles: Vec<String>,

    /// Header blocks the port understands
    pub understood_headers: Vec<QNameConfig>,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            roles: Vec::new(),
            understood_headers: Vec::new(),
        }
    }
}

/// A qualified name as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QNameConfig {
    /// Namespace URI
    #[serde(default)]
    pub namespace: String,
    /// Local name
    pub local_name: String,
}

impl From<&QNameConfig> for QName {
    fn from(q: &QNameConfig) -> Self {
        QName::new(q.namespace.clone(), q.local_name.clone())
    }
}

/// Wire encoding selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Encoding used for outbound messages
    pub encoding: Encoding,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Soap,
        }
    }
}

/// Supported wire encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Plain XML payload, no envelope
    Xml,
    /// SOAP envelope as XML
    #[default]
    Soap,
    /// SOAP envelope as Fast Infoset
    FastInfoset,
}

/// Tubeline pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of idle tubeline clones kept for reuse
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 16 }
    }
}

/// Roles and understood headers active for a binding.
///
/// Immutable once built. Servers share one instance for their lifetime, client
/// proxies may swap in a new one per request through the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfiguration {
    roles: HashSet<String>,
    known_headers: HashSet<QName>,
}

impl HandlerConfiguration {
    /// Build from the roles of the binding and the headers understood by the
    /// port and by the handler chain.
    pub fn new(
        version: SoapVersion,
        roles: impl IntoIterator<Item = String>,
        port_understood_headers: impl IntoIterator<Item = QName>,
        handler_understood_headers: impl IntoIterator<Item = QName>,
    ) -> Self {
        let mut all_roles: HashSet<String> = roles
            .into_iter()
            .map(|r| crate::header::normalize_role(version, &r))
            .collect();
        all_roles.extend(version.required_roles().iter().map(|r| r.to_string()));

        let mut known_headers: HashSet<QName> = port_understood_headers.into_iter().collect();
        known_headers.extend(handler_understood_headers);

        Self {
            roles: all_roles,
            known_headers,
        }
    }

    /// Build from configuration, adding the headers declared by a handler chain.
    pub fn from_config(config: &PipelineConfig, handler_headers: impl IntoIterator<Item = QName>) -> Self {
        Self::new(
            config.settings.soap_version,
            config.binding.roles.iter().cloned(),
            config.binding.understood_headers.iter().map(QName::from),
            handler_headers,
        )
    }

    /// Roles played by this node, as SOAP 1.2 role URIs.
    pub fn roles(&self) -> &HashSet<String> {
        &self.roles
    }

    /// Header blocks this node understands.
    pub fn known_headers(&self) -> &HashSet<QName> {
        &self.known_headers
    }
}
