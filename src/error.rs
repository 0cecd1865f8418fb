//! Error types for the SOAP pipeline.

use crate::config::SoapVersion;
use crate::header::QName;
use thiserror::Error;

/// Reason text used for MustUnderstand faults.
pub const MUST_UNDERSTAND_FAULT_MESSAGE: &str = "One or more mandatory SOAP header blocks not understood";

/// SOAP pipeline errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("Invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Message payload has already been consumed")]
    PayloadConsumed,

    #[error("Undefined property {0}")]
    UndefinedProperty(String),

    #[error("Property {name} expects a {expected} value")]
    PropertyType { name: String, expected: &'static str },

    #[error("{0} does not support copying")]
    UnsupportedCopy(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Invalid tube graph: {0}")]
    InvalidGraph(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("SOAP fault: {}", .0.reason)]
    Fault(Box<SoapFault>),

    #[error("Handler {handler} failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Wrap an error raised by application-supplied handler code.
    pub fn handler(
        handler: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Handler {
            handler: handler.into(),
            source: source.into(),
        }
    }

    /// Whether this error is expected to be reported to the peer as a SOAP fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_) | Self::Handler { .. })
    }

    /// Convert a fault-oriented error into the fault to send back.
    ///
    /// Returns `None` for errors that indicate a defect in the pipeline itself.
    pub fn to_fault(&self, version: SoapVersion) -> Option<SoapFault> {
        match self {
            Self::Fault(fault) => Some((**fault).clone()),
            Self::Handler { source, .. } => Some(SoapFault::server(version, source.to_string())),
            _ => None,
        }
    }
}

impl From<quick_xml::Error> for PipelineError {
    fn from(e: quick_xml::Error) -> Self {
        Self::XmlParse(e.to_string())
    }
}

impl From<quick_xml::DeError> for PipelineError {
    fn from(e: quick_xml::DeError) -> Self {
        Self::XmlParse(e.to_string())
    }
}

impl From<SoapFault> for PipelineError {
    fn from(fault: SoapFault) -> Self {
        Self::Fault(Box::new(fault))
    }
}

/// A SOAP fault, independent of its wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    /// SOAP version the fault is expressed in
    pub version: SoapVersion,
    /// Fault code (`faultcode` / `Code/Value`)
    pub code: QName,
    /// Human-readable reason (`faultstring` / `Reason/Text`)
    pub reason: String,
    /// Header blocks that were not understood, if this is a MustUnderstand fault
    pub not_understood: Vec<QName>,
    /// Raw XML placed inside the detail element
    pub detail: Option<String>,
}

impl SoapFault {
    /// Fault blaming the receiving node.
    pub fn server(version: SoapVersion, reason: impl Into<String>) -> Self {
        let local = match version {
            SoapVersion::Soap11 => "Server",
            SoapVersion::Soap12 => "Receiver",
        };
        Self {
            version,
            code: QName::new(version.ns_uri(), local),
            reason: reason.into(),
            not_understood: Vec::new(),
            detail: None,
        }
    }

    /// Fault blaming the sender of the message.
    pub fn client(version: SoapVersion, reason: impl Into<String>) -> Self {
        let local = match version {
            SoapVersion::Soap11 => "Client",
            SoapVersion::Soap12 => "Sender",
        };
        Self {
            version,
            code: QName::new(version.ns_uri(), local),
            reason: reason.into(),
            not_understood: Vec::new(),
            detail: None,
        }
    }

    /// MustUnderstand fault listing every header that was not understood.
    ///
    /// SOAP 1.1 carries the list in the fault string and as one
    /// `NotUnderstood` detail entry per header. SOAP 1.2 carries it as
    /// `NotUnderstood` headers added by the server tube.
    pub fn must_understand(version: SoapVersion, not_understood: impl IntoIterator<Item = QName>) -> Self {
        let not_understood: Vec<QName> = not_understood.into_iter().collect();
        let detail = match version {
            SoapVersion::Soap11 if !not_understood.is_empty() => {
                Some(not_understood.iter().map(not_understood_entry).collect::<String>())
            }
            _ => None,
        };
        let reason = match version {
            SoapVersion::Soap11 => format!(
                "{}: {}",
                MUST_UNDERSTAND_FAULT_MESSAGE,
                not_understood
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            SoapVersion::Soap12 => MUST_UNDERSTAND_FAULT_MESSAGE.to_string(),
        };
        Self {
            version,
            code: version.must_understand_fault_code(),
            reason,
            not_understood,
            detail,
        }
    }

    /// Attach raw detail XML.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Render the `Fault` element (the body payload, not a full envelope).
    pub fn to_xml(&self) -> String {
        match self.version {
            SoapVersion::Soap11 => self.soap_11_fault(),
            SoapVersion::Soap12 => self.soap_12_fault(),
        }
    }

    /// Fault code as a prefixed name plus the namespace declaration it needs.
    fn code_value(&self) -> (String, String) {
        if self.code.namespace() == self.version.ns_uri() {
            (format!("S:{}", self.code.local_name()), String::new())
        } else if self.code.namespace().is_empty() {
            (self.code.local_name().to_string(), String::new())
        } else {
            (
                format!("fc:{}", self.code.local_name()),
                format!(" xmlns:fc=\"{}\"", xml_escape(self.code.namespace())),
            )
        }
    }

    fn soap_11_fault(&self) -> String {
        let (code, code_ns) = self.code_value();
        let detail = self
            .detail
            .as_ref()
            .map(|d| format!("<detail>{}</detail>", d))
            .unwrap_or_default();

        format!(
            r#"<S:Fault xmlns:S="{}"{}><faultcode>{}</faultcode><faultstring>{}</faultstring>{}</S:Fault>"#,
            SoapVersion::Soap11.ns_uri(),
            code_ns,
            code,
            xml_escape(&self.reason),
            detail
        )
    }

    fn soap_12_fault(&self) -> String {
        let (code, code_ns) = self.code_value();
        let detail = self
            .detail
            .as_ref()
            .map(|d| format!("<S:Detail>{}</S:Detail>", d))
            .unwrap_or_default();

        format!(
            r#"<S:Fault xmlns:S="{}"{}><S:Code><S:Value>{}</S:Value></S:Code><S:Reason><S:Text xml:lang="en">{}</S:Text></S:Reason>{}</S:Fault>"#,
            SoapVersion::Soap12.ns_uri(),
            code_ns,
            code,
            xml_escape(&self.reason),
            detail
        )
    }
}

impl std::fmt::Display for SoapFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.reason)
    }
}

/// `NotUnderstood` entry naming `qname`, its namespace bound to `abc`.
fn not_understood_entry(qname: &QName) -> String {
    if qname.namespace().is_empty() {
        format!(r#"<NotUnderstood qname="{}"/>"#, xml_escape(qname.local_name()))
    } else {
        format!(
            r#"<NotUnderstood xmlns:abc="{}" qname="abc:{}"/>"#,
            xml_escape(qname.namespace()),
            xml_escape(qname.local_name())
        )
    }
}

pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
