//! Wire encoding and decoding of packets.
//!
//! A [`Codec`] turns the message of a [`Packet`] into bytes and back. Codecs
//! keep per-instance scratch state, so they are not shared between threads;
//! each invocation takes its own instance with [`Codec::copy`].

use crate::config::{Encoding, PipelineConfig, SoapVersion};
use crate::error::{PipelineError, SoapFault};
use crate::fastinfoset::FastInfosetCodec;
use crate::header::QName;
use crate::message::Message;
use crate::packet::Packet;
use crate::parser::{check_xxe_patterns, parse_soap_action, parse_soap_envelope};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use std::collections::HashMap;
use std::io::{Read, Write};
use tracing::{debug, trace};

/// MIME type of plain XML messages.
pub const XML_CONTENT_TYPE: &str = "application/xml";

/// Transport-level content type of an encoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Full `Content-Type` value, parameters included
    pub content_type: String,
    /// `SOAPAction` header value (quoted), for bindings that send one
    pub soap_action: Option<String>,
    /// `Accept` header value, for bindings that negotiate a response encoding
    pub accept: Option<String>,
}

impl ContentType {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            soap_action: None,
            accept: None,
        }
    }
}

/// Media type without parameters, lowercased.
pub fn base_mime_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Value of parameter `name` in a content type, unquoted.
pub fn content_type_param(content_type: &str, name: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Encoder/decoder between packets and a byte stream.
pub trait Codec: Send {
    /// MIME type this codec produces and accepts.
    fn mime_type(&self) -> &str;

    /// Content type of `packet` once encoded, if it can be known before
    /// encoding. `None` means it is only known after [`Codec::encode`].
    fn static_content_type(&self, packet: &Packet) -> Option<ContentType>;

    /// Write the packet's message to `out`. The message payload is consumed.
    fn encode(&mut self, packet: &mut Packet, out: &mut dyn Write) -> Result<ContentType, PipelineError>;

    /// Read a message from `input` into `packet`.
    fn decode(&mut self, input: &mut dyn Read, content_type: &str, packet: &mut Packet) -> Result<(), PipelineError>;

    /// Encode into a caller-owned buffer without an intermediate stream.
    /// Reserved for zero-copy transports.
    fn encode_buffer(&mut self, packet: &mut Packet, buffer: &mut Vec<u8>) -> Result<ContentType, PipelineError> {
        let _ = (packet, buffer);
        Err(PipelineError::Unsupported("buffer-based encode"))
    }

    /// Decode from a caller-owned buffer without an intermediate stream.
    /// Reserved for zero-copy transports.
    fn decode_buffer(&mut self, buffer: &[u8], content_type: &str, packet: &mut Packet) -> Result<(), PipelineError> {
        let _ = (buffer, content_type, packet);
        Err(PipelineError::Unsupported("buffer-based decode"))
    }

    /// Fresh instance with the same configuration and no shared state.
    fn copy(&self) -> Box<dyn Codec>;
}

/// Read at most `max` bytes, failing if the input is larger.
pub(crate) fn read_limited(input: &mut dyn Read, max: usize) -> Result<Vec<u8>, PipelineError> {
    let mut data = Vec::new();
    input.take((max as u64).saturating_add(1)).read_to_end(&mut data)?;
    if data.len() > max {
        return Err(PipelineError::InvalidEnvelope(format!(
            "message exceeds maximum size of {} bytes",
            max
        )));
    }
    Ok(data)
}

fn check_mime(expected: &str, content_type: &str) -> Result<(), PipelineError> {
    let actual = base_mime_type(content_type);
    if actual != expected {
        return Err(PipelineError::InvalidEnvelope(format!(
            "unsupported content type '{}', expected '{}'",
            content_type, expected
        )));
    }
    Ok(())
}

/// Plain XML: the payload alone, without envelope or headers.
#[derive(Debug, Clone)]
pub struct XmlCodec {
    max_message_size: usize,
}

impl XmlCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Codec for XmlCodec {
    fn mime_type(&self) -> &str {
        XML_CONTENT_TYPE
    }

    fn static_content_type(&self, _packet: &Packet) -> Option<ContentType> {
        Some(ContentType::new(format!("{}; charset=utf-8", XML_CONTENT_TYPE)))
    }

    fn encode(&mut self, packet: &mut Packet, out: &mut dyn Write) -> Result<ContentType, PipelineError> {
        if let Some(message) = packet.message_mut() {
            message.write_payload_to(out)?;
        }
        Ok(ContentType::new(format!("{}; charset=utf-8", XML_CONTENT_TYPE)))
    }

    fn decode(&mut self, input: &mut dyn Read, content_type: &str, packet: &mut Packet) -> Result<(), PipelineError> {
        check_mime(XML_CONTENT_TYPE, content_type)?;
        let data = read_limited(input, self.max_message_size)?;
        let xml = String::from_utf8(data).map_err(|e| PipelineError::XmlParse(format!("Invalid UTF-8: {}", e)))?;
        check_xxe_patterns(&xml)?;
        packet.set_message(Some(Message::plain_xml(xml)?));
        Ok(())
    }

    fn copy(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

/// SOAP envelope as XML.
#[derive(Debug, Clone)]
pub struct SoapCodec {
    version: SoapVersion,
    max_message_size: usize,
}

impl SoapCodec {
    pub fn new(version: SoapVersion, max_message_size: usize) -> Self {
        Self {
            version,
            max_message_size,
        }
    }

    pub fn version(&self) -> SoapVersion {
        self.version
    }

    pub(crate) fn content_type_for(&self, mime: &str, packet: &Packet) -> ContentType {
        let action = packet.soap_action.as_deref().unwrap_or_default();
        match self.version {
            SoapVersion::Soap11 => ContentType {
                content_type: format!("{}; charset=utf-8", mime),
                soap_action: Some(format!("\"{}\"", action)),
                accept: None,
            },
            SoapVersion::Soap12 => {
                let content_type = if action.is_empty() {
                    format!("{}; charset=utf-8", mime)
                } else {
                    format!("{}; charset=utf-8; action=\"{}\"", mime, action)
                };
                ContentType::new(content_type)
            }
        }
    }

    /// Write the envelope of `packet` to `out`.
    pub(crate) fn write_envelope(&self, packet: &mut Packet, out: &mut dyn Write) -> Result<(), PipelineError> {
        let Some(message) = packet.message_mut() else {
            return Ok(());
        };
        if let Some(version) = message.version() {
            if version != self.version {
                return Err(PipelineError::IllegalState(format!(
                    "cannot encode a {:?} message with a {:?} codec",
                    version, self.version
                )));
            }
        }

        let mut writer = Writer::new(out);
        writer.write_event(Event::Start(
            BytesStart::new("S:Envelope").with_attributes([("xmlns:S", self.version.ns_uri())]),
        ))?;
        if message.has_headers() {
            writer.write_event(Event::Start(BytesStart::new("S:Header")))?;
            for header in message.headers() {
                writer.get_mut().write_all(header.xml().as_bytes())?;
            }
            writer.write_event(Event::End(BytesEnd::new("S:Header")))?;
        }
        writer.write_event(Event::Start(BytesStart::new("S:Body")))?;
        if message.has_payload() {
            message.write_payload_to(writer.get_mut())?;
        }
        writer.write_event(Event::End(BytesEnd::new("S:Body")))?;
        writer.write_event(Event::End(BytesEnd::new("S:Envelope")))?;
        Ok(())
    }

    /// Parse envelope bytes into `packet`.
    pub(crate) fn read_envelope(&self, data: &[u8], content_type: &str, packet: &mut Packet) -> Result<(), PipelineError> {
        let message = parse_soap_envelope(data)?;
        if message.version() != Some(self.version) {
            let mut fault = SoapFault::client(
                self.version,
                format!("expected a SOAP {:?} envelope", self.version),
            );
            fault.code = QName::new(self.version.ns_uri(), "VersionMismatch");
            return Err(fault.into());
        }

        let action = match self.version {
            SoapVersion::Soap11 => packet
                .transport_request_headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("SOAPAction"))
                .and_then(|(_, values)| values.first())
                .map(|v| parse_soap_action(v)),
            SoapVersion::Soap12 => content_type_param(content_type, "action"),
        };
        if action.is_some() {
            packet.soap_action = action;
        }

        trace!(
            soap_version = ?self.version,
            headers = message.headers().len(),
            soap_action = ?packet.soap_action,
            "Decoded SOAP envelope"
        );
        packet.set_message(Some(message));
        Ok(())
    }
}

impl Codec for SoapCodec {
    fn mime_type(&self) -> &str {
        self.version.content_type()
    }

    fn static_content_type(&self, packet: &Packet) -> Option<ContentType> {
        Some(self.content_type_for(self.version.content_type(), packet))
    }

    fn encode(&mut self, packet: &mut Packet, out: &mut dyn Write) -> Result<ContentType, PipelineError> {
        self.write_envelope(packet, out)?;
        Ok(self.content_type_for(self.version.content_type(), packet))
    }

    fn decode(&mut self, input: &mut dyn Read, content_type: &str, packet: &mut Packet) -> Result<(), PipelineError> {
        check_mime(self.version.content_type(), content_type)?;
        let data = read_limited(input, self.max_message_size)?;
        self.read_envelope(&data, content_type, packet)
    }

    fn copy(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

/// Explicit registry of codec prototypes.
///
/// Built once from configuration and passed to whatever needs codecs. Every
/// lookup hands out a fresh copy of the registered prototype.
pub struct CodecRegistry {
    default_encoding: Encoding,
    codecs: HashMap<Encoding, Box<dyn Codec>>,
}

impl CodecRegistry {
    /// Registry without codecs.
    pub fn new(default_encoding: Encoding) -> Self {
        Self {
            default_encoding,
            codecs: HashMap::new(),
        }
    }

    /// Registry with the XML, SOAP and Fast Infoset codecs for the configured
    /// binding.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let version = config.settings.soap_version;
        let max = config.settings.max_message_size;

        let mut registry = Self::new(config.codec.encoding);
        registry.register(Encoding::Xml, Box::new(XmlCodec::new(max)));
        registry.register(Encoding::Soap, Box::new(SoapCodec::new(version, max)));
        registry.register(Encoding::FastInfoset, Box::new(FastInfosetCodec::new(version, max)));
        debug!(soap_version = ?version, default = ?config.codec.encoding, "Codec registry initialized");
        registry
    }

    /// Register (or replace) the prototype for `encoding`.
    pub fn register(&mut self, encoding: Encoding, codec: Box<dyn Codec>) {
        self.codecs.insert(encoding, codec);
    }

    pub fn default_encoding(&self) -> Encoding {
        self.default_encoding
    }

    /// New codec instance for `encoding`.
    pub fn create(&self, encoding: Encoding) -> Result<Box<dyn Codec>, PipelineError> {
        self.codecs
            .get(&encoding)
            .map(|c| c.copy())
            .ok_or(PipelineError::Unsupported("no codec registered for encoding"))
    }

    /// New codec instance for the default encoding.
    pub fn create_default(&self) -> Result<Box<dyn Codec>, PipelineError> {
        self.create(self.default_encoding)
    }

    /// New codec instance accepting `content_type`, if one is registered.
    pub fn for_content_type(&self, content_type: &str) -> Option<Box<dyn Codec>> {
        let mime = base_mime_type(content_type);
        self.codecs
            .values()
            .find(|c| c.mime_type() == mime)
            .map(|c| c.copy())
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("default_encoding", &self.default_encoding)
            .field("encodings", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    const PAYLOAD: &str = r#"<m:GetPrice xmlns:m="http://example.org/stock"><m:Item>Apples</m:Item></m:GetPrice>"#;

    fn soap_packet(version: SoapVersion) -> Packet {
        let mut message = Message::from_payload(version, PAYLOAD).unwrap();
        let soap = version.ns_uri();
        message.headers_mut().add(
            Header::parse(
                version,
                format!(r#"<t:Trans xmlns:t="urn:t" xmlns:S="{soap}" S:mustUnderstand="1">5</t:Trans>"#),
            )
            .unwrap(),
        );
        let mut packet = Packet::new(message);
        packet.soap_action = Some("urn:GetPrice".into());
        packet
    }

    #[test]
    fn test_content_type_helpers() {
        let ct = r#"application/soap+xml; charset=utf-8; action="urn:Ping""#;
        assert_eq!(base_mime_type(ct), "application/soap+xml");
        assert_eq!(content_type_param(ct, "action").as_deref(), Some("urn:Ping"));
        assert_eq!(content_type_param(ct, "boundary"), None);
        assert_eq!(base_mime_type("TEXT/XML"), "text/xml");
    }

    #[test]
    fn test_soap11_encode_decode() {
        let mut codec = SoapCodec::new(SoapVersion::Soap11, 1024 * 1024);
        let mut packet = soap_packet(SoapVersion::Soap11);
        let mut out = Vec::new();
        let ct = codec.encode(&mut packet, &mut out).unwrap();
        assert_eq!(ct.content_type, "text/xml; charset=utf-8");
        assert_eq!(ct.soap_action.as_deref(), Some("\"urn:GetPrice\""));
        assert!(packet.message().unwrap().is_payload_consumed());

        let mut decoded = Packet::empty();
        decoded
            .transport_request_headers
            .insert("soapaction".into(), vec!["\"urn:GetPrice\"".into()]);
        codec
            .decode(&mut out.as_slice(), &ct.content_type, &mut decoded)
            .unwrap();
        assert_eq!(decoded.soap_action.as_deref(), Some("urn:GetPrice"));

        let message = decoded.message_mut().unwrap();
        assert_eq!(message.headers().len(), 1);
        assert!(message.headers().get(0).unwrap().is_must_understand());
        assert!(message.read_payload().unwrap().as_str().contains("Apples"));
    }

    #[test]
    fn test_soap12_action_in_content_type() {
        let mut codec = SoapCodec::new(SoapVersion::Soap12, 1024 * 1024);
        let mut packet = soap_packet(SoapVersion::Soap12);
        let static_ct = codec.static_content_type(&packet).unwrap();
        let mut out = Vec::new();
        let ct = codec.encode(&mut packet, &mut out).unwrap();
        assert_eq!(static_ct, ct);
        assert!(ct.content_type.contains("action=\"urn:GetPrice\""));
        assert!(ct.soap_action.is_none());

        let mut decoded = Packet::empty();
        codec.decode(&mut out.as_slice(), &ct.content_type, &mut decoded).unwrap();
        assert_eq!(decoded.soap_action.as_deref(), Some("urn:GetPrice"));
    }

    #[test]
    fn test_version_mismatch_is_a_fault() {
        let mut out = Vec::new();
        SoapCodec::new(SoapVersion::Soap12, 4096)
            .encode(&mut soap_packet(SoapVersion::Soap12), &mut out)
            .unwrap();

        let mut codec11 = SoapCodec::new(SoapVersion::Soap11, 4096);
        let mut packet = Packet::empty();
        match codec11.decode(&mut out.as_slice(), "text/xml", &mut packet) {
            Err(PipelineError::Fault(fault)) => assert_eq!(fault.code.local_name(), "VersionMismatch"),
            other => panic!("expected VersionMismatch fault, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_content_type_rejected() {
        let mut codec = SoapCodec::new(SoapVersion::Soap11, 4096);
        let mut packet = Packet::empty();
        let result = codec.decode(&mut "<x/>".as_bytes(), "application/json", &mut packet);
        assert!(matches!(result, Err(PipelineError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_max_message_size() {
        let mut codec = XmlCodec::new(8);
        let mut packet = Packet::empty();
        let result = codec.decode(&mut "<too-long-for-limit/>".as_bytes(), "application/xml", &mut packet);
        assert!(matches!(result, Err(PipelineError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_unbounded_message_size() {
        let data = read_limited(&mut "<a/>".as_bytes(), usize::MAX).unwrap();
        assert_eq!(data, b"<a/>");

        let mut codec = XmlCodec::new(usize::MAX);
        let mut packet = Packet::empty();
        codec.decode(&mut "<a/>".as_bytes(), "application/xml", &mut packet).unwrap();
        assert!(packet.message().unwrap().has_payload());
    }

    #[test]
    fn test_xml_codec_payload_only() {
        let mut codec = XmlCodec::new(4096);
        let mut packet = Packet::new(Message::plain_xml(PAYLOAD).unwrap());
        let mut out = Vec::new();
        codec.encode(&mut packet, &mut out).unwrap();
        assert_eq!(out, PAYLOAD.as_bytes());

        let mut decoded = Packet::empty();
        codec
            .decode(&mut out.as_slice(), "application/xml; charset=utf-8", &mut decoded)
            .unwrap();
        let message = decoded.message().unwrap();
        assert!(message.version().is_none());
        assert_eq!(message.payload_name().unwrap().local_name(), "GetPrice");
    }

    #[test]
    fn test_one_way_encodes_nothing() {
        let mut codec = SoapCodec::new(SoapVersion::Soap11, 4096);
        let mut out = Vec::new();
        codec.encode(&mut Packet::empty(), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_buffer_io_is_reserved() {
        let mut codec = SoapCodec::new(SoapVersion::Soap11, 4096);
        let mut packet = Packet::empty();
        assert!(matches!(
            codec.encode_buffer(&mut packet, &mut Vec::new()),
            Err(PipelineError::Unsupported(_))
        ));
        assert!(matches!(
            codec.decode_buffer(b"", "text/xml", &mut packet),
            Err(PipelineError::Unsupported(_))
        ));
    }

    #[test]
    fn test_registry_from_config() {
        let mut config = PipelineConfig::default();
        config.settings.soap_version = SoapVersion::Soap12;
        config.codec.encoding = Encoding::FastInfoset;
        let registry = CodecRegistry::from_config(&config);

        assert_eq!(registry.create_default().unwrap().mime_type(), "application/soap+fastinfoset");
        assert_eq!(registry.create(Encoding::Soap).unwrap().mime_type(), "application/soap+xml");
        assert!(registry.for_content_type("application/xml; charset=utf-8").is_some());
        assert!(registry.for_content_type("application/json").is_none());

        let empty = CodecRegistry::new(Encoding::Soap);
        assert!(empty.create_default().is_err());
    }
}
