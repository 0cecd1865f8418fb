//! SOAP header blocks.
//!
//! A [`Header`] knows its qualified name and the SOAP processing attributes
//! (`mustUnderstand`, `role`/`actor`, `relay`) as soon as it is created. Those
//! are sniffed from the first start element of the block; the rest of the
//! block stays as a self-contained XML fragment until someone reads it.

use crate::config::SoapVersion;
use crate::error::PipelineError;
use crate::parser::{SOAP_11_NS, SOAP_12_NS};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// SOAP 1.1 actor URI for the next node.
pub const ACTOR_NEXT: &str = "http://schemas.xmlsoap.org/soap/actor/next";
/// SOAP 1.2 role URI for the next node.
pub const ROLE_NEXT: &str = "http://www.w3.org/2003/05/soap-envelope/role/next";
/// SOAP 1.2 role URI that no node plays.
pub const ROLE_NONE: &str = "http://www.w3.org/2003/05/soap-envelope/role/none";
/// SOAP 1.2 role URI for the ultimate receiver.
pub const ROLE_ULTIMATE_RECEIVER: &str = "http://www.w3.org/2003/05/soap-envelope/role/ultimateReceiver";

/// Qualified XML name.
///
/// Both parts are reference counted so clones share storage and equality checks
/// on clones short-circuit on pointer identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QName {
    namespace: Arc<str>,
    local_name: Arc<str>,
}

impl QName {
    pub fn new(namespace: impl Into<Arc<str>>, local_name: impl Into<Arc<str>>) -> Self {
        Self {
            namespace: namespace.into(),
            local_name: local_name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn matches(&self, namespace: &str, local_name: &str) -> bool {
        &*self.local_name == local_name && &*self.namespace == namespace
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.local_name)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local_name)
        }
    }
}

/// Map a role or actor URI onto the SOAP 1.2 role vocabulary.
pub fn normalize_role(version: SoapVersion, role: &str) -> String {
    match version {
        SoapVersion::Soap11 if role == ACTOR_NEXT => ROLE_NEXT.to_string(),
        _ => role.to_string(),
    }
}

/// An attribute found on the header block's root element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderAttribute {
    pub namespace: String,
    pub local_name: String,
    pub value: String,
}

/// One SOAP header block.
#[derive(Debug, Clone)]
pub struct Header {
    version: SoapVersion,
    name: QName,
    must_understand: bool,
    role: String,
    relay: bool,
    attributes: Vec<HeaderAttribute>,
    xml: Arc<str>,
}

impl Header {
    /// Create a header from a self-contained XML fragment.
    ///
    /// Only the first start element is scanned.
    pub fn parse(version: SoapVersion, xml: impl Into<Arc<str>>) -> Result<Self, PipelineError> {
        let xml: Arc<str> = xml.into();
        let (name, attributes) = {
            let mut reader = NsReader::from_str(&xml);
            loop {
                match reader.read_event()? {
                    Event::Start(e) | Event::Empty(e) => break sniff_element(&reader, &e)?,
                    Event::Eof => {
                        return Err(PipelineError::XmlParse("header fragment has no element".into()));
                    }
                    _ => {}
                }
            }
        };
        Ok(Self::from_parts(version, name, attributes, xml))
    }

    /// Assemble a header from an already sniffed root element.
    pub(crate) fn from_parts(
        version: SoapVersion,
        name: QName,
        attributes: Vec<HeaderAttribute>,
        xml: Arc<str>,
    ) -> Self {
        let mut must_understand = false;
        let mut role = version.implicit_role().to_string();
        let mut relay = false;

        let soap_ns = match version {
            SoapVersion::Soap11 => SOAP_11_NS,
            SoapVersion::Soap12 => SOAP_12_NS,
        };
        for attr in attributes.iter().filter(|a| a.namespace == soap_ns) {
            match (version, attr.local_name.as_str()) {
                (_, "mustUnderstand") => must_understand = parse_bool(&attr.value),
                (SoapVersion::Soap11, "actor") | (SoapVersion::Soap12, "role") => {
                    if !attr.value.is_empty() {
                        role = normalize_role(version, &attr.value);
                    }
                }
                (SoapVersion::Soap12, "relay") => relay = parse_bool(&attr.value),
                _ => {}
            }
        }

        Self {
            version,
            name,
            must_understand,
            role,
            relay,
            attributes,
            xml,
        }
    }

    pub fn version(&self) -> SoapVersion {
        self.version
    }

    pub fn name(&self) -> &QName {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        self.name.namespace()
    }

    pub fn local_name(&self) -> &str {
        self.name.local_name()
    }

    pub fn is_must_understand(&self) -> bool {
        self.must_understand
    }

    /// Targeted role, normalized to SOAP 1.2 URIs.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Always false for SOAP 1.1 headers.
    pub fn is_relay(&self) -> bool {
        self.relay
    }

    /// Whether a node playing `roles` may skip this header during
    /// MustUnderstand processing.
    pub fn is_ignorable(&self, roles: &HashSet<String>) -> bool {
        if !self.must_understand {
            return true;
        }
        if self.role == ROLE_NONE {
            return true;
        }
        !roles.contains(&self.role)
    }

    pub fn attribute(&self, namespace: &str, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .rev()
            .find(|a| a.local_name == local_name && a.namespace == namespace)
            .map(|a| a.value.as_str())
    }

    pub fn attributes(&self) -> &[HeaderAttribute] {
        &self.attributes
    }

    /// The complete header block as XML.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// Stream over the full header block.
    pub fn reader(&self) -> NsReader<&[u8]> {
        NsReader::from_reader(self.xml.as_bytes())
    }

    /// Deserialize the header block.
    pub fn read_as<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        Ok(quick_xml::de::from_str(&self.xml)?)
    }
}

/// Resolve an element's name and attributes against the reader's namespace scope.
pub(crate) fn sniff_element<R>(
    reader: &NsReader<R>,
    e: &BytesStart<'_>,
) -> Result<(QName, Vec<HeaderAttribute>), PipelineError> {
    let (ns, local) = reader.resolve_element(e.name());
    let name = QName::new(namespace_str(ns)?, utf8(local.as_ref())?);

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| PipelineError::XmlParse(err.to_string()))?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let (ns, local) = reader.resolve_attribute(attr.key);
        let raw = utf8(&attr.value)?;
        let value = quick_xml::escape::unescape(raw)
            .map_err(|err| PipelineError::XmlParse(err.to_string()))?;
        attributes.push(HeaderAttribute {
            namespace: namespace_str(ns)?,
            local_name: utf8(local.as_ref())?.to_string(),
            value: value.into_owned(),
        });
    }
    Ok((name, attributes))
}

fn namespace_str(ns: ResolveResult<'_>) -> Result<String, PipelineError> {
    match ns {
        ResolveResult::Bound(ns) => Ok(utf8(ns.as_ref())?.to_string()),
        ResolveResult::Unbound => Ok(String::new()),
        ResolveResult::Unknown(prefix) => Err(PipelineError::XmlParse(format!(
            "undeclared namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, PipelineError> {
    std::str::from_utf8(bytes).map_err(|e| PipelineError::XmlParse(format!("Invalid UTF-8: {}", e)))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim_start().chars().next(), Some('t') | Some('1'))
}

/// Ordered header blocks of one message plus per-block "understood" marks.
#[derive(Debug, Clone, Default)]
pub struct HeaderList {
    headers: Vec<Header>,
    understood: Vec<bool>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Header> {
        self.headers.get(index)
    }

    /// First header with the given name.
    pub fn find(&self, namespace: &str, local_name: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.name.matches(namespace, local_name))
    }

    /// All headers with the given name, in document order.
    pub fn find_all<'a>(&'a self, namespace: &'a str, local_name: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.headers.iter().filter(move |h| h.name.matches(namespace, local_name))
    }

    /// All headers in the given namespace, in document order.
    pub fn in_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.headers.iter().filter(move |h| h.namespace() == namespace)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    pub fn add(&mut self, header: Header) {
        self.headers.push(header);
        self.understood.push(false);
    }

    pub fn remove(&mut self, index: usize) -> Option<Header> {
        if index >= self.headers.len() {
            return None;
        }
        self.understood.remove(index);
        Some(self.headers.remove(index))
    }

    /// Remove every header with the given name, returning how many were removed.
    pub fn remove_all(&mut self, namespace: &str, local_name: &str) -> usize {
        let before = self.headers.len();
        let mut i = 0;
        while i < self.headers.len() {
            if self.headers[i].name.matches(namespace, local_name) {
                self.remove(i);
            } else {
                i += 1;
            }
        }
        before - self.headers.len()
    }

    /// Record that some processing stage understood the header at `index`.
    pub fn mark_understood(&mut self, index: usize) {
        if let Some(flag) = self.understood.get_mut(index) {
            *flag = true;
        }
    }

    /// Mark every header with the given name as understood.
    pub fn mark_understood_by_name(&mut self, name: &QName) {
        for (header, flag) in self.headers.iter().zip(self.understood.iter_mut()) {
            if &header.name == name {
                *flag = true;
            }
        }
    }

    pub fn is_understood(&self, index: usize) -> bool {
        self.understood.get(index).copied().unwrap_or(false)
    }
}

impl<'a> IntoIterator for &'a HeaderList {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}
