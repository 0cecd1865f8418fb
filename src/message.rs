//! SOAP/XML message abstraction.
//!
//! A [`Message`] owns its header list, an optional body payload and its
//! attachments. The payload can be consumed exactly once: any of
//! [`Message::read_payload`], [`Message::read_payload_as`] or
//! [`Message::write_payload_to`] takes it, and subsequent reads fail with
//! [`PipelineError::PayloadConsumed`]. Use [`Message::copy`] first when more
//! than one consumer needs to see the payload.

use crate::config::SoapVersion;
use crate::error::{PipelineError, SoapFault};
use crate::header::{sniff_element, HeaderList, QName};
use quick_xml::events::Event;
use quick_xml::NsReader;
use serde::de::DeserializeOwned;
use std::io::Write;

/// A MIME attachment carried alongside the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Attachments of one message.
#[derive(Debug, Clone, Default)]
pub struct AttachmentSet {
    attachments: Vec<Attachment>,
}

impl AttachmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn get(&self, content_id: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.content_id == content_id)
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter()
    }
}

/// Body content taken out of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    xml: String,
}

impl Payload {
    pub fn as_str(&self) -> &str {
        &self.xml
    }

    pub fn into_string(self) -> String {
        self.xml
    }

    /// Stream over the payload.
    pub fn reader(&self) -> NsReader<&[u8]> {
        NsReader::from_reader(self.xml.as_bytes())
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        Ok(quick_xml::de::from_str(&self.xml)?)
    }
}

#[derive(Debug, Clone)]
enum PayloadState {
    Empty,
    Unread(String),
    Consumed,
}

/// One SOAP (or plain XML) infoset.
#[derive(Debug)]
pub struct Message {
    version: Option<SoapVersion>,
    headers: HeaderList,
    payload: PayloadState,
    payload_name: Option<QName>,
    attachments: AttachmentSet,
    fault: bool,
}

impl Message {
    /// Message with neither headers nor payload.
    pub fn empty(version: SoapVersion) -> Self {
        Self {
            version: Some(version),
            headers: HeaderList::new(),
            payload: PayloadState::Empty,
            payload_name: None,
            attachments: AttachmentSet::new(),
            fault: false,
        }
    }

    /// SOAP message whose body holds the given self-contained XML fragment.
    pub fn from_payload(version: SoapVersion, xml: impl Into<String>) -> Result<Self, PipelineError> {
        Self::with_payload(Some(version), xml.into())
    }

    /// Plain XML message: a payload without envelope or headers.
    pub fn plain_xml(xml: impl Into<String>) -> Result<Self, PipelineError> {
        Self::with_payload(None, xml.into())
    }

    /// Message carrying the given fault as its payload.
    pub fn from_fault(fault: &SoapFault) -> Self {
        Self {
            version: Some(fault.version),
            headers: HeaderList::new(),
            payload: PayloadState::Unread(fault.to_xml()),
            payload_name: Some(QName::new(fault.version.ns_uri(), "Fault")),
            attachments: AttachmentSet::new(),
            fault: true,
        }
    }

    fn with_payload(version: Option<SoapVersion>, xml: String) -> Result<Self, PipelineError> {
        let payload_name = first_element_name(&xml)?;
        let mut message = Self::from_parts(version, HeaderList::new(), None, AttachmentSet::new());
        match payload_name {
            Some(name) => message.set_payload(xml, name),
            None if !xml.trim().is_empty() => {
                return Err(PipelineError::InvalidEnvelope(
                    "payload must contain an element, found character data only".into(),
                ));
            }
            None => {}
        }
        Ok(message)
    }

    /// Used by decoders that already know the payload's root element.
    pub(crate) fn from_parts(
        version: Option<SoapVersion>,
        headers: HeaderList,
        payload: Option<(String, QName)>,
        attachments: AttachmentSet,
    ) -> Self {
        let mut message = Self {
            version,
            headers,
            payload: PayloadState::Empty,
            payload_name: None,
            attachments,
            fault: false,
        };
        if let Some((xml, name)) = payload {
            message.set_payload(xml, name);
        }
        message
    }

    fn set_payload(&mut self, xml: String, name: QName) {
        self.fault = match self.version {
            Some(version) => name.matches(version.ns_uri(), "Fault"),
            None => false,
        };
        self.payload = PayloadState::Unread(xml);
        self.payload_name = Some(name);
    }

    /// `None` for plain XML messages.
    pub fn version(&self) -> Option<SoapVersion> {
        self.version
    }

    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    /// The same list for the whole life of the message.
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderList {
        &mut self.headers
    }

    pub fn attachments(&self) -> &AttachmentSet {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut AttachmentSet {
        &mut self.attachments
    }

    /// Whether the message has a payload, consumed or not.
    pub fn has_payload(&self) -> bool {
        self.payload_name.is_some()
    }

    /// Name of the payload's root element, available without consuming it.
    pub fn payload_name(&self) -> Option<&QName> {
        self.payload_name.as_ref()
    }

    pub fn is_payload_consumed(&self) -> bool {
        matches!(self.payload, PayloadState::Consumed)
    }

    /// True iff the payload is a SOAP Fault element. Does not consume the payload.
    pub fn is_fault(&self) -> bool {
        self.fault
    }

    /// Take the payload. A message without a payload yields an empty one.
    pub fn read_payload(&mut self) -> Result<Payload, PipelineError> {
        match std::mem::replace(&mut self.payload, PayloadState::Consumed) {
            PayloadState::Unread(xml) => Ok(Payload { xml }),
            PayloadState::Empty => Ok(Payload { xml: String::new() }),
            PayloadState::Consumed => Err(PipelineError::PayloadConsumed),
        }
    }

    /// Take the payload and deserialize it.
    pub fn read_payload_as<T: DeserializeOwned>(&mut self) -> Result<T, PipelineError> {
        self.read_payload()?.deserialize()
    }

    /// Take the payload and write it out.
    pub fn write_payload_to(&mut self, out: &mut dyn Write) -> Result<(), PipelineError> {
        let payload = self.read_payload()?;
        out.write_all(payload.as_str().as_bytes())?;
        Ok(())
    }

    /// Independent message with the same logical content.
    pub fn copy(&self) -> Result<Self, PipelineError> {
        if self.is_payload_consumed() {
            return Err(PipelineError::PayloadConsumed);
        }
        Ok(Self {
            version: self.version,
            headers: self.headers.clone(),
            payload: self.payload.clone(),
            payload_name: self.payload_name.clone(),
            attachments: self.attachments.clone(),
            fault: self.fault,
        })
    }
}

/// Name of the first element of a fragment, `None` if it has none.
fn first_element_name(xml: &str) -> Result<Option<QName>, PipelineError> {
    let mut reader = NsReader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => return Ok(Some(sniff_element(&reader, &e)?.0)),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}
