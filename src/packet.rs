//! Invocation envelope passed through the pipeline.
//!
//! A [`Packet`] carries at most one [`Message`] plus the invocation-scoped
//! properties tubes need: SOAP action, reply expectation, endpoint address,
//! transport headers and the active [`HandlerConfiguration`]. Typed fields are
//! also reachable through string keys via a static accessor table, see
//! [`Packet::get_property`].

use crate::config::HandlerConfiguration;
use crate::error::PipelineError;
use crate::message::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Multi-valued transport header map, keyed by header name.
pub type TransportHeaders = HashMap<String, Vec<String>>;

/// Property keys understood by [`Packet::get_property`] / [`Packet::set_property`].
pub mod keys {
    pub const HTTP_REQUEST_HEADERS: &str = "javax.xml.ws.http.request.headers";
    pub const HTTP_RESPONSE_HEADERS: &str = "javax.xml.ws.http.response.headers";
    pub const ENDPOINT_ADDRESS: &str = "javax.xml.ws.service.endpoint.address";
    pub const SOAP_ACTION: &str = "SOAPAction";
    pub const ONE_WAY_OPERATION: &str = "com.sun.xml.ws.server.OneWayOperation";
    pub const TRANSPORT_SECURE: &str = "com.sun.xml.ws.transport.secure";
}

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Value read from or written to the string-keyed property view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Null,
    String(String),
    Bool(bool),
    Headers(TransportHeaders),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

struct PropertyAccessor {
    name: &'static str,
    get: fn(&Packet) -> PropertyValue,
    set: fn(&mut Packet, PropertyValue) -> Result<(), PipelineError>,
}

fn opt_string(value: &Option<String>) -> PropertyValue {
    value.clone().map(PropertyValue::String).unwrap_or(PropertyValue::Null)
}

fn expect_opt_string(name: &str, value: PropertyValue) -> Result<Option<String>, PipelineError> {
    match value {
        PropertyValue::Null => Ok(None),
        PropertyValue::String(s) => Ok(Some(s)),
        _ => Err(PipelineError::PropertyType {
            name: name.to_string(),
            expected: "string",
        }),
    }
}

fn expect_headers(name: &str, value: PropertyValue) -> Result<TransportHeaders, PipelineError> {
    match value {
        PropertyValue::Null => Ok(TransportHeaders::new()),
        PropertyValue::Headers(h) => Ok(h),
        _ => Err(PipelineError::PropertyType {
            name: name.to_string(),
            expected: "header map",
        }),
    }
}

static PROPERTIES: &[PropertyAccessor] = &[
    PropertyAccessor {
        name: keys::HTTP_REQUEST_HEADERS,
        get: |p| PropertyValue::Headers(p.transport_request_headers.clone()),
        set: |p, v| {
            p.transport_request_headers = expect_headers(keys::HTTP_REQUEST_HEADERS, v)?;
            Ok(())
        },
    },
    PropertyAccessor {
        name: keys::HTTP_RESPONSE_HEADERS,
        get: |p| PropertyValue::Headers(p.transport_response_headers.clone()),
        set: |p, v| {
            p.transport_response_headers = expect_headers(keys::HTTP_RESPONSE_HEADERS, v)?;
            Ok(())
        },
    },
    PropertyAccessor {
        name: keys::ENDPOINT_ADDRESS,
        get: |p| opt_string(&p.endpoint_address),
        set: |p, v| {
            p.endpoint_address = expect_opt_string(keys::ENDPOINT_ADDRESS, v)?;
            Ok(())
        },
    },
    PropertyAccessor {
        name: keys::SOAP_ACTION,
        get: |p| opt_string(&p.soap_action),
        set: |p, v| {
            p.soap_action = expect_opt_string(keys::SOAP_ACTION, v)?;
            Ok(())
        },
    },
    PropertyAccessor {
        name: keys::ONE_WAY_OPERATION,
        get: |p| match p.expect_reply {
            Some(expect) => PropertyValue::Bool(!expect),
            None => PropertyValue::Null,
        },
        set: |p, v| {
            p.expect_reply = match v {
                PropertyValue::Null => None,
                PropertyValue::Bool(one_way) => Some(!one_way),
                _ => {
                    return Err(PipelineError::PropertyType {
                        name: keys::ONE_WAY_OPERATION.to_string(),
                        expected: "bool",
                    })
                }
            };
            Ok(())
        },
    },
    PropertyAccessor {
        name: keys::TRANSPORT_SECURE,
        get: |p| PropertyValue::Bool(p.was_transport_secure),
        set: |p, v| match v {
            PropertyValue::Bool(b) => {
                p.was_transport_secure = b;
                Ok(())
            }
            _ => Err(PipelineError::PropertyType {
                name: keys::TRANSPORT_SECURE.to_string(),
                expected: "bool",
            }),
        },
    },
];

fn accessor(name: &str) -> Result<&'static PropertyAccessor, PipelineError> {
    PROPERTIES
        .iter()
        .find(|a| a.name == name)
        .ok_or_else(|| PipelineError::UndefinedProperty(name.to_string()))
}

/// One request or one response travelling through a tubeline.
#[derive(Debug)]
pub struct Packet {
    id: u64,
    responding_to: Option<u64>,
    message: Option<Message>,

    /// SOAPAction value, unquoted. `None` if the transport carried none.
    pub soap_action: Option<String>,

    /// `Some(false)` for a known one-way request, `None` when unknown.
    pub expect_reply: Option<bool>,

    /// Address the message is sent to.
    pub endpoint_address: Option<String>,

    /// Transport headers received with the request.
    pub transport_request_headers: TransportHeaders,

    /// Transport headers to send (or received) with the response.
    pub transport_response_headers: TransportHeaders,

    /// Set by transports that received the message over a secure channel.
    pub was_transport_secure: bool,

    handler_config: Option<Arc<HandlerConfiguration>>,
    invocation_properties: HashMap<String, String>,
}

impl Packet {
    /// Packet wrapping a message.
    pub fn new(message: Message) -> Self {
        let mut packet = Self::empty();
        packet.message = Some(message);
        packet
    }

    /// Packet without a message.
    pub fn empty() -> Self {
        Self {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            responding_to: None,
            message: None,
            soap_action: None,
            expect_reply: None,
            endpoint_address: None,
            transport_request_headers: TransportHeaders::new(),
            transport_response_headers: TransportHeaders::new(),
            was_transport_secure: false,
            handler_config: None,
            invocation_properties: HashMap::new(),
        }
    }

    /// Process-unique packet id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the request this packet answers, if it is a response.
    pub fn responding_to(&self) -> Option<u64> {
        self.responding_to
    }

    /// Whether this packet is the response built for `request`.
    pub fn is_response_to(&self, request_id: u64) -> bool {
        self.responding_to == Some(request_id)
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    pub fn message_mut(&mut self) -> Option<&mut Message> {
        self.message.as_mut()
    }

    pub fn set_message(&mut self, message: Option<Message>) {
        self.message = message;
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take()
    }

    pub fn handler_config(&self) -> Option<&Arc<HandlerConfiguration>> {
        self.handler_config.as_ref()
    }

    /// Replace the handler configuration for this invocation.
    pub fn set_handler_config(&mut self, config: Arc<HandlerConfiguration>) {
        self.handler_config = Some(config);
    }

    pub fn invocation_property(&self, name: &str) -> Option<&str> {
        self.invocation_properties.get(name).map(String::as_str)
    }

    /// Set a free-form property that lives for the whole invocation.
    pub fn set_invocation_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.invocation_properties.insert(name.into(), value.into());
    }

    pub fn invocation_properties(&self) -> &HashMap<String, String> {
        &self.invocation_properties
    }

    /// Read a typed field through its string key.
    pub fn get_property(&self, name: &str) -> Result<PropertyValue, PipelineError> {
        Ok((accessor(name)?.get)(self))
    }

    /// Write a typed field through its string key.
    pub fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), PipelineError> {
        (accessor(name)?.set)(self, value)
    }

    pub fn supports_property(&self, name: &str) -> bool {
        PROPERTIES.iter().any(|a| a.name == name)
    }

    pub fn property_names() -> impl Iterator<Item = &'static str> {
        PROPERTIES.iter().map(|a| a.name)
    }

    /// Build the response packet for this request.
    ///
    /// The response gets its own id, records this packet as the request it
    /// answers, echoes the SOAP action and shares the handler configuration
    /// and invocation properties. The request is left untouched.
    pub fn create_response(&self, message: Option<Message>) -> Packet {
        let mut response = Packet::empty();
        response.responding_to = Some(self.id);
        response.message = message;
        response.soap_action = self.soap_action.clone();
        response.handler_config = self.handler_config.clone();
        response.invocation_properties = self.invocation_properties.clone();
        response
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoapVersion;

    #[test]
    fn test_packet_ids_are_unique() {
        let a = Packet::empty();
        let b = Packet::empty();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_property_view_matches_fields() {
        let mut packet = Packet::empty();
        packet.soap_action = Some("urn:GetPrice".to_string());
        assert_eq!(
            packet.get_property(keys::SOAP_ACTION).unwrap(),
            PropertyValue::String("urn:GetPrice".to_string())
        );

        packet
            .set_property(keys::ENDPOINT_ADDRESS, PropertyValue::String("http://localhost/ws".into()))
            .unwrap();
        assert_eq!(packet.endpoint_address.as_deref(), Some("http://localhost/ws"));

        packet.set_property(keys::ENDPOINT_ADDRESS, PropertyValue::Null).unwrap();
        assert!(packet.endpoint_address.is_none());
    }

    #[test]
    fn test_one_way_is_inverse_of_expect_reply() {
        let mut packet = Packet::empty();
        assert!(packet.get_property(keys::ONE_WAY_OPERATION).unwrap().is_null());

        packet.set_property(keys::ONE_WAY_OPERATION, PropertyValue::Bool(true)).unwrap();
        assert_eq!(packet.expect_reply, Some(false));
    }

    #[test]
    fn test_transport_headers_property() {
        let mut packet = Packet::empty();
        let mut headers = TransportHeaders::new();
        headers.insert("Content-Type".into(), vec!["text/xml".into()]);
        packet
            .set_property(keys::HTTP_REQUEST_HEADERS, PropertyValue::Headers(headers.clone()))
            .unwrap();
        assert_eq!(packet.transport_request_headers, headers);
    }

    #[test]
    fn test_undefined_property_fails() {
        let mut packet = Packet::empty();
        assert!(matches!(
            packet.get_property("no.such.property"),
            Err(PipelineError::UndefinedProperty(_))
        ));
        assert!(packet.set_property("no.such.property", PropertyValue::Null).is_err());
        assert!(!packet.supports_property("no.such.property"));
    }

    #[test]
    fn test_property_type_mismatch() {
        let mut packet = Packet::empty();
        let result = packet.set_property(keys::SOAP_ACTION, PropertyValue::Bool(true));
        assert!(matches!(result, Err(PipelineError::PropertyType { .. })));
    }

    #[test]
    fn test_create_response() {
        let config = Arc::new(HandlerConfiguration::new(
            SoapVersion::Soap11,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ));
        let mut request = Packet::new(Message::empty(SoapVersion::Soap11));
        request.soap_action = Some("urn:Ping".into());
        request.expect_reply = Some(true);
        request.set_handler_config(config.clone());
        request.set_invocation_property("tenant", "acme");

        let response = request.create_response(Some(Message::empty(SoapVersion::Soap11)));
        assert!(response.is_response_to(request.id()));
        assert_ne!(response.id(), request.id());
        assert_eq!(response.soap_action.as_deref(), Some("urn:Ping"));
        assert_eq!(response.invocation_property("tenant"), Some("acme"));
        assert!(Arc::ptr_eq(response.handler_config().unwrap(), &config));
        assert!(request.message().is_some());
        assert!(request.responding_to().is_none());
    }
}
