//! SOAP over a compact binary XML infoset.
//!
//! The envelope is first written as XML by an inner [`SoapCodec`], then
//! re-encoded as a stream of items in which element names, attribute names
//! and character data are indexed: the first occurrence of a string is sent
//! literally and added to a vocabulary table, later occurrences are sent as
//! their table index. Decoding reverses this and hands the XML to the normal
//! envelope parser.
//!
//! Building the vocabulary tables is the costly part, so a codec instance keeps
//! its serializer and parser state between calls and clears it at the start
//! of every encode and decode. Nothing from one message is visible while
//! processing the next.

use crate::codec::{read_limited, Codec, ContentType, SoapCodec};
use crate::config::SoapVersion;
use crate::error::PipelineError;
use crate::packet::Packet;
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::io::{Read, Write};
use tracing::trace;

/// Document header: identification bytes followed by version 1.
const MAGIC: [u8; 4] = [0xE0, 0x00, 0x00, 0x01];

const ITEM_START: u8 = 0x01;
const ITEM_END: u8 = 0x02;
const ITEM_TEXT: u8 = 0x03;
const ITEM_CDATA: u8 = 0x04;
const ITEM_END_DOCUMENT: u8 = 0xF0;

/// String table shared by both directions of one stream.
#[derive(Debug, Default)]
struct Vocabulary {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    fn reset(&mut self) {
        self.strings.clear();
        self.index.clear();
    }

    fn lookup(&self, s: &str) -> Option<u32> {
        self.index.get(s).copied()
    }

    /// Indexes start at 1, 0 marks a literal.
    fn add(&mut self, s: &str) -> u32 {
        self.strings.push(s.to_string());
        let id = self.strings.len() as u32;
        self.index.insert(s.to_string(), id);
        id
    }

    fn get(&self, id: u32) -> Result<&str, PipelineError> {
        id.checked_sub(1)
            .and_then(|i| self.strings.get(i as usize))
            .map(String::as_str)
            .ok_or_else(|| PipelineError::XmlParse(format!("fast infoset: unknown vocabulary index {}", id)))
    }
}

/// Names and character data are kept in separate tables.
#[derive(Debug, Default)]
struct InfosetState {
    names: Vocabulary,
    values: Vocabulary,
}

impl InfosetState {
    fn reset(&mut self) {
        self.names.reset();
        self.values.reset();
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_string(out: &mut Vec<u8>, table: &mut Vocabulary, s: &str) {
    match table.lookup(s) {
        Some(id) => write_varint(out, id),
        None => {
            write_varint(out, 0);
            write_varint(out, s.len() as u32);
            out.extend_from_slice(s.as_bytes());
            table.add(s);
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, PipelineError> {
    std::str::from_utf8(bytes).map_err(|e| PipelineError::XmlParse(format!("Invalid UTF-8: {}", e)))
}

/// Serializer: XML text to binary items.
fn serialize(state: &mut InfosetState, xml: &[u8], out: &mut Vec<u8>) -> Result<(), PipelineError> {
    state.reset();
    out.extend_from_slice(&MAGIC);

    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => serialize_start(state, &e, out)?,
            Event::Empty(e) => {
                serialize_start(state, &e, out)?;
                out.push(ITEM_END);
            }
            Event::End(_) => out.push(ITEM_END),
            Event::Text(t) => {
                out.push(ITEM_TEXT);
                write_string(out, &mut state.values, utf8(&t)?);
            }
            Event::CData(c) => {
                out.push(ITEM_CDATA);
                write_string(out, &mut state.values, utf8(&c)?);
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions are not carried.
            _ => {}
        }
        buf.clear();
    }
    out.push(ITEM_END_DOCUMENT);
    Ok(())
}

fn serialize_start(state: &mut InfosetState, e: &BytesStart<'_>, out: &mut Vec<u8>) -> Result<(), PipelineError> {
    out.push(ITEM_START);
    write_string(out, &mut state.names, utf8(e.name().as_ref())?);

    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| PipelineError::XmlParse(err.to_string()))?;
        attrs.push((utf8(attr.key.as_ref())?.to_string(), utf8(&attr.value)?.to_string()));
    }
    write_varint(out, attrs.len() as u32);
    for (key, value) in &attrs {
        write_string(out, &mut state.names, key);
        write_string(out, &mut state.values, value);
    }
    Ok(())
}

/// Cursor over an encoded document.
struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn byte(&mut self) -> Result<u8, PipelineError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| PipelineError::XmlParse("fast infoset: unexpected end of document".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u32, PipelineError> {
        let mut value = 0u32;
        for shift in (0..35).step_by(7) {
            let b = self.byte()?;
            value |= u32::from(b & 0x7F) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(PipelineError::XmlParse("fast infoset: integer too long".into()))
    }

    fn string(&mut self, table: &mut Vocabulary) -> Result<String, PipelineError> {
        let id = self.varint()?;
        if id != 0 {
            return table.get(id).map(str::to_string);
        }
        let len = self.varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| PipelineError::XmlParse("fast infoset: string overruns document".into()))?;
        let s = utf8(&self.data[self.pos..end])?.to_string();
        self.pos = end;
        table.add(&s);
        Ok(s)
    }
}

/// Parser: binary items back to XML text.
fn parse(state: &mut InfosetState, data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    state.reset();
    if data.len() < MAGIC.len() || data[..MAGIC.len()] != MAGIC {
        return Err(PipelineError::XmlParse("fast infoset: bad document header".into()));
    }

    let mut input = Input {
        data,
        pos: MAGIC.len(),
    };
    let mut writer = Writer::new(Vec::new());
    let mut open: Vec<String> = Vec::new();

    loop {
        match input.byte()? {
            ITEM_START => {
                let name = input.string(&mut state.names)?;
                let count = input.varint()?;
                let mut start = BytesStart::new(name.clone());
                for _ in 0..count {
                    let key = input.string(&mut state.names)?;
                    let value = input.string(&mut state.values)?;
                    // Values are stored escaped, push them through untouched
                    start.push_attribute((key.as_bytes(), value.as_bytes()));
                }
                writer.write_event(Event::Start(start))?;
                open.push(name);
            }
            ITEM_END => {
                let name = open
                    .pop()
                    .ok_or_else(|| PipelineError::XmlParse("fast infoset: unbalanced end item".into()))?;
                writer.write_event(Event::End(BytesEnd::new(name)))?;
            }
            ITEM_TEXT => {
                let text = input.string(&mut state.values)?;
                writer.write_event(Event::Text(BytesText::from_escaped(text)))?;
            }
            ITEM_CDATA => {
                let text = input.string(&mut state.values)?;
                writer.write_event(Event::CData(BytesCData::new(text)))?;
            }
            ITEM_END_DOCUMENT => break,
            other => {
                return Err(PipelineError::XmlParse(format!("fast infoset: unknown item 0x{:02x}", other)));
            }
        }
    }

    if !open.is_empty() {
        return Err(PipelineError::XmlParse("fast infoset: document ends inside an element".into()));
    }
    Ok(writer.into_inner())
}

/// SOAP envelope as a binary infoset.
///
/// Not thread-safe; use [`Codec::copy`] to obtain an instance per thread.
#[derive(Debug)]
pub struct FastInfosetCodec {
    soap: SoapCodec,
    max_message_size: usize,
    serializer: InfosetState,
    parser: InfosetState,
    xml_buffer: Vec<u8>,
}

impl FastInfosetCodec {
    pub fn new(version: SoapVersion, max_message_size: usize) -> Self {
        Self {
            soap: SoapCodec::new(version, max_message_size),
            max_message_size,
            serializer: InfosetState::default(),
            parser: InfosetState::default(),
            xml_buffer: Vec::new(),
        }
    }

    fn mime(&self) -> &'static str {
        self.soap.version().fast_infoset_content_type()
    }
}

impl Codec for FastInfosetCodec {
    fn mime_type(&self) -> &str {
        self.mime()
    }

    fn static_content_type(&self, packet: &Packet) -> Option<ContentType> {
        Some(self.soap.content_type_for(self.mime(), packet))
    }

    fn encode(&mut self, packet: &mut Packet, out: &mut dyn Write) -> Result<ContentType, PipelineError> {
        self.xml_buffer.clear();
        self.soap.write_envelope(packet, &mut self.xml_buffer)?;

        let mut encoded = Vec::with_capacity(self.xml_buffer.len());
        if !self.xml_buffer.is_empty() {
            serialize(&mut self.serializer, &self.xml_buffer, &mut encoded)?;
        }
        out.write_all(&encoded)?;
        trace!(
            xml_bytes = self.xml_buffer.len(),
            encoded_bytes = encoded.len(),
            "Encoded fast infoset envelope"
        );
        Ok(self.soap.content_type_for(self.mime(), packet))
    }

    fn decode(&mut self, input: &mut dyn Read, content_type: &str, packet: &mut Packet) -> Result<(), PipelineError> {
        let mime = crate::codec::base_mime_type(content_type);
        if mime != self.mime() {
            return Err(PipelineError::InvalidEnvelope(format!(
                "unsupported content type '{}', expected '{}'",
                content_type,
                self.mime()
            )));
        }
        let data = read_limited(input, self.max_message_size)?;
        let xml = parse(&mut self.parser, &data)?;
        self.soap.read_envelope(&xml, content_type, packet)
    }

    fn copy(&self) -> Box<dyn Codec> {
        Box::new(Self::new(self.soap.version(), self.max_message_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::message::Message;

    fn packet(version: SoapVersion, item: &str) -> Packet {
        let mut message = Message::from_payload(
            version,
            format!(r#"<m:GetPrice xmlns:m="urn:stock"><m:Item a="x &amp; y">{item}</m:Item><m:Item>{item}</m:Item></m:GetPrice>"#),
        )
        .unwrap();
        let soap = version.ns_uri();
        message.headers_mut().add(
            Header::parse(
                version,
                format!(r#"<t:Trans xmlns:t="urn:t" xmlns:S="{soap}" S:mustUnderstand="1">7</t:Trans>"#),
            )
            .unwrap(),
        );
        Packet::new(message)
    }

    fn encode(codec: &mut FastInfosetCodec, version: SoapVersion, item: &str) -> Vec<u8> {
        let mut out = Vec::new();
        codec.encode(&mut packet(version, item), &mut out).unwrap();
        out
    }

    #[test]
    fn test_encode_decode() {
        let mut codec = FastInfosetCodec::new(SoapVersion::Soap12, 1024 * 1024);
        let bytes = encode(&mut codec, SoapVersion::Soap12, "Apples");
        assert_eq!(&bytes[..4], &MAGIC);

        let mut decoded = Packet::empty();
        codec
            .decode(&mut bytes.as_slice(), "application/soap+fastinfoset", &mut decoded)
            .unwrap();
        let message = decoded.message_mut().unwrap();
        assert!(message.headers().get(0).unwrap().is_must_understand());
        let payload = message.read_payload().unwrap().into_string();
        assert!(payload.contains(r#"a="x &amp; y""#));
        assert_eq!(payload.matches("Apples").count(), 2);
    }

    #[test]
    fn test_repeated_strings_are_indexed() {
        let mut codec = FastInfosetCodec::new(SoapVersion::Soap11, 1024 * 1024);
        let bytes = encode(&mut codec, SoapVersion::Soap11, "Apples");
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("m:Item").count(), 1);
        assert_eq!(text.matches("Apples").count(), 1);
    }

    #[test]
    fn test_state_is_reset_between_messages() {
        let mut reused = FastInfosetCodec::new(SoapVersion::Soap11, 1024 * 1024);
        encode(&mut reused, SoapVersion::Soap11, "Apples");
        let second = encode(&mut reused, SoapVersion::Soap11, "Pears");

        let mut fresh = FastInfosetCodec::new(SoapVersion::Soap11, 1024 * 1024);
        assert_eq!(second, encode(&mut fresh, SoapVersion::Soap11, "Pears"));

        let mut decoded = Packet::empty();
        reused
            .decode(&mut second.as_slice(), "application/fastinfoset", &mut decoded)
            .unwrap();
        let mut other = Packet::empty();
        reused
            .decode(&mut second.as_slice(), "application/fastinfoset", &mut other)
            .unwrap();
        let payload = other.message_mut().unwrap().read_payload().unwrap().into_string();
        assert!(payload.contains("Pears"));
        assert!(!payload.contains("Apples"));
    }

    #[test]
    fn test_copy_has_independent_state() {
        let codec = FastInfosetCodec::new(SoapVersion::Soap11, 4096);
        let copy = codec.copy();
        assert_eq!(copy.mime_type(), "application/fastinfoset");
    }

    #[test]
    fn test_truncated_document_rejected() {
        let mut codec = FastInfosetCodec::new(SoapVersion::Soap11, 1024 * 1024);
        let bytes = encode(&mut codec, SoapVersion::Soap11, "Apples");
        let truncated = &bytes[..bytes.len() / 2];
        let mut packet = Packet::empty();
        assert!(codec
            .decode(&mut &truncated[..], "application/fastinfoset", &mut packet)
            .is_err());
    }

    #[test]
    fn test_bad_header_rejected() {
        let mut codec = FastInfosetCodec::new(SoapVersion::Soap11, 4096);
        let mut packet = Packet::empty();
        let result = codec.decode(&mut "<xml/>".as_bytes(), "application/fastinfoset", &mut packet);
        assert!(matches!(result, Err(PipelineError::XmlParse(_))));
    }
}
