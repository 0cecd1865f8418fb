//! SOAP envelope parsing.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand entities).
//! Every header block and body child is cut out of the document as a
//! self-contained fragment: namespace declarations inherited from the
//! `Envelope`, `Header` and `Body` elements are copied onto the fragment's root
//! element so the fragment can be read or re-serialized on its own.

use crate::config::SoapVersion;
use crate::error::PipelineError;
use crate::header::{sniff_element, Header, HeaderList, QName};
use crate::message::{AttachmentSet, Message};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{NsReader, Writer};
use std::sync::Arc;

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Envelope,
    Header,
    Body,
    Done,
}

/// Parse raw bytes as a SOAP envelope.
pub fn parse_soap_envelope(data: &[u8]) -> Result<Message, PipelineError> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| PipelineError::XmlParse(format!("Invalid UTF-8: {}", e)))?;

    // Pre-scan for XXE patterns (belt-and-suspenders with quick-xml's safety)
    check_xxe_patterns(xml_str)?;

    let mut reader = NsReader::from_str(xml_str);

    let mut version: Option<SoapVersion> = None;
    let mut section = Section::Envelope;
    let mut has_body = false;
    let mut depth = 0u32;

    // Declarations in scope for header blocks / body children
    let mut envelope_scope: Vec<(String, String)> = Vec::new();
    let mut section_scope: Vec<(String, String)> = Vec::new();

    let mut headers = HeaderList::new();
    let mut payload = String::new();
    let mut payload_name: Option<QName> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                match depth {
                    1 => {
                        version = Some(envelope_version(&reader, &e)?);
                        envelope_scope = namespace_declarations(&e)?;
                    }
                    2 => {
                        section = enter_section(&reader, &e, version, section)?;
                        has_body |= section == Section::Body;
                        section_scope = merge_scope(&envelope_scope, namespace_declarations(&e)?);
                    }
                    3 => {
                        let after_start = reader.buffer_position() as usize;
                        let (name, attributes) = sniff_element(&reader, &e)?;
                        reader.read_to_end(e.name())?;
                        let end = reader.buffer_position() as usize;
                        depth -= 1;

                        let fragment = self_contained(&e, &section_scope, &xml_str[after_start..end], false)?;
                        accept_child(
                            section,
                            version,
                            name,
                            attributes,
                            fragment,
                            &mut headers,
                            &mut payload,
                            &mut payload_name,
                        );
                    }
                    _ => {
                        return Err(PipelineError::IllegalState(
                            "nested element escaped read_to_end".into(),
                        ));
                    }
                }
            }

            Event::Empty(e) => match depth {
                0 => {
                    return Err(PipelineError::InvalidEnvelope("Envelope element is empty".into()));
                }
                1 => {
                    section = enter_section(&reader, &e, version, section)?;
                    has_body |= section == Section::Body;
                    section = match section {
                        Section::Header => Section::Envelope,
                        _ => Section::Done,
                    };
                }
                _ => {
                    let (name, attributes) = sniff_element(&reader, &e)?;
                    let fragment = self_contained(&e, &section_scope, "", true)?;
                    accept_child(
                        section,
                        version,
                        name,
                        attributes,
                        fragment,
                        &mut headers,
                        &mut payload,
                        &mut payload_name,
                    );
                }
            },

            Event::End(_) => {
                if depth == 2 {
                    section = match section {
                        Section::Header => Section::Envelope,
                        _ => Section::Done,
                    };
                }
                depth = depth.saturating_sub(1);
            }

            Event::Text(ref t) if depth > 0 => {
                if t.iter().any(|b| !b.is_ascii_whitespace()) {
                    return Err(PipelineError::InvalidEnvelope(
                        "character data is not allowed directly inside Envelope, Header or Body".into(),
                    ));
                }
            }

            Event::Eof => break,

            _ => {}
        }
    }

    let version = version.ok_or_else(|| {
        PipelineError::InvalidEnvelope("No valid SOAP Envelope found with recognized namespace".into())
    })?;
    if !has_body {
        return Err(PipelineError::InvalidEnvelope("Envelope has no Body".into()));
    }

    let payload = payload_name.map(|name| (payload, name));
    Ok(Message::from_parts(Some(version), headers, payload, AttachmentSet::new()))
}

#[allow(clippy::too_many_arguments)]
fn accept_child(
    section: Section,
    version: Option<SoapVersion>,
    name: QName,
    attributes: Vec<crate::header::HeaderAttribute>,
    fragment: String,
    headers: &mut HeaderList,
    payload: &mut String,
    payload_name: &mut Option<QName>,
) {
    match (section, version) {
        (Section::Header, Some(version)) => {
            headers.add(Header::from_parts(version, name, attributes, Arc::from(fragment)));
        }
        (Section::Body, _) => {
            if payload_name.is_none() {
                *payload_name = Some(name);
            }
            payload.push_str(&fragment);
        }
        _ => {}
    }
}

fn envelope_version<R>(reader: &NsReader<R>, e: &BytesStart<'_>) -> Result<SoapVersion, PipelineError> {
    let (name, _) = sniff_element(reader, e)?;
    if name.local_name() != "Envelope" {
        return Err(PipelineError::InvalidEnvelope(format!(
            "expected Envelope as document element, found {}",
            name
        )));
    }
    SoapVersion::from_ns_uri(name.namespace()).ok_or_else(|| {
        PipelineError::InvalidEnvelope(format!("unsupported envelope namespace '{}'", name.namespace()))
    })
}

fn enter_section<R>(
    reader: &NsReader<R>,
    e: &BytesStart<'_>,
    version: Option<SoapVersion>,
    current: Section,
) -> Result<Section, PipelineError> {
    let version = version.ok_or_else(|| PipelineError::InvalidEnvelope("missing Envelope".into()))?;
    let (name, _) = sniff_element(reader, e)?;
    if name.namespace() != version.ns_uri() {
        return Err(PipelineError::InvalidEnvelope(format!("unexpected element {} in Envelope", name)));
    }
    match (name.local_name(), current) {
        ("Header", Section::Envelope) => Ok(Section::Header),
        ("Body", Section::Envelope) => Ok(Section::Body),
        _ => Err(PipelineError::InvalidEnvelope(format!("unexpected element {} in Envelope", name))),
    }
}

/// `xmlns` / `xmlns:p` declarations on an element, with unescaped values.
fn namespace_declarations(e: &BytesStart<'_>) -> Result<Vec<(String, String)>, PipelineError> {
    let mut decls = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| PipelineError::XmlParse(err.to_string()))?;
        if attr.key.as_namespace_binding().is_none() {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        let value = quick_xml::escape::unescape(&raw)
            .map_err(|err| PipelineError::XmlParse(err.to_string()))?
            .into_owned();
        decls.push((key, value));
    }
    Ok(decls)
}

fn merge_scope(outer: &[(String, String)], inner: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut scope: Vec<(String, String)> = outer
        .iter()
        .filter(|(k, _)| !inner.iter().any(|(ik, _)| ik == k))
        .cloned()
        .collect();
    scope.extend(inner);
    scope
}

/// Re-emit a start tag with the inherited declarations it does not override,
/// followed by the untouched remainder of the element.
fn self_contained(
    e: &BytesStart<'_>,
    scope: &[(String, String)],
    rest: &str,
    empty: bool,
) -> Result<String, PipelineError> {
    let own: Vec<Vec<u8>> = e
        .attributes()
        .flatten()
        .map(|a| a.key.as_ref().to_vec())
        .collect();

    let mut start = e.clone().into_owned();
    for (key, value) in scope {
        if !own.iter().any(|k| k.as_slice() == key.as_bytes()) {
            start.push_attribute((key.as_str(), value.as_str()));
        }
    }

    let mut writer = Writer::new(Vec::new());
    if empty {
        writer.write_event(Event::Empty(start))?;
    } else {
        writer.write_event(Event::Start(start))?;
    }
    let mut out = String::from_utf8(writer.into_inner())
        .map_err(|e| PipelineError::XmlParse(format!("Invalid UTF-8: {}", e)))?;
    out.push_str(rest);
    Ok(out)
}

/// Check for XXE attack patterns.
pub(crate) fn check_xxe_patterns(xml: &str) -> Result<(), PipelineError> {
    let lowered = xml.to_ascii_lowercase();

    // DOCTYPE detection
    if lowered.contains("<!doctype") {
        return Err(PipelineError::XmlParse("DOCTYPE declarations are not allowed".into()));
    }

    // External entity patterns
    if lowered.contains("<!entity") {
        return Err(PipelineError::XmlParse("Entity declarations are not allowed".into()));
    }

    Ok(())
}

/// Extract SOAPAction from HTTP header value (removes quotes).
pub fn parse_soap_action(header_value: &str) -> String {
    header_value.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{ROLE_NEXT, ROLE_ULTIMATE_RECEIVER};

    const SOAP_11_SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header>
    <m:Trans xmlns:m="http://example.org/trans" soap:mustUnderstand="1">234</m:Trans>
    <m:Hop xmlns:m="http://example.org/trans" soap:actor="http://schemas.xmlsoap.org/soap/actor/next"/>
  </soap:Header>
  <soap:Body>
    <m:GetPrice xmlns:m="http://example.org/stock">
      <m:Item>Apples</m:Item>
    </m:GetPrice>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_12_SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <m:GetUser xmlns:m="http://example.org/users">
      <m:UserId>123</m:UserId>
    </m:GetUser>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_soap_11() {
        let message = parse_soap_envelope(SOAP_11_SAMPLE.as_bytes()).unwrap();
        assert_eq!(message.version(), Some(SoapVersion::Soap11));
        assert_eq!(message.headers().len(), 2);

        let trans = message.headers().get(0).unwrap();
        assert_eq!(trans.local_name(), "Trans");
        assert!(trans.is_must_understand());
        assert_eq!(trans.role(), ROLE_ULTIMATE_RECEIVER);

        let hop = message.headers().get(1).unwrap();
        assert_eq!(hop.role(), ROLE_NEXT);

        assert_eq!(message.payload_name().unwrap().local_name(), "GetPrice");
        assert!(!message.is_fault());
    }

    #[test]
    fn test_parse_soap_12() {
        let message = parse_soap_envelope(SOAP_12_SAMPLE.as_bytes()).unwrap();
        assert_eq!(message.version(), Some(SoapVersion::Soap12));
        assert!(!message.has_headers());
        assert_eq!(message.payload_name().unwrap().local_name(), "GetUser");
    }

    #[test]
    fn test_header_fragment_is_self_contained() {
        let message = parse_soap_envelope(SOAP_11_SAMPLE.as_bytes()).unwrap();
        let trans = message.headers().get(0).unwrap();
        assert!(trans.xml().contains("xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\""));

        let reparsed = Header::parse(SoapVersion::Soap11, trans.xml()).unwrap();
        assert!(reparsed.is_must_understand());
        assert_eq!(reparsed.name(), trans.name());
    }

    #[test]
    fn test_payload_keeps_inherited_namespaces() {
        let xml = r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/" xmlns:m="urn:m">
  <S:Body><m:Ping><m:Seq>1</m:Seq></m:Ping></S:Body>
</S:Envelope>"#;
        let mut message = parse_soap_envelope(xml.as_bytes()).unwrap();
        let payload = message.read_payload().unwrap();
        assert!(payload.as_str().starts_with("<m:Ping"));
        assert!(payload.as_str().contains("xmlns:m=\"urn:m\""));
        assert!(payload.as_str().ends_with("</m:Ping>"));
    }

    #[test]
    fn test_parse_fault_body() {
        let xml = r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/"><S:Body><S:Fault><faultcode>S:Server</faultcode><faultstring>x</faultstring></S:Fault></S:Body></S:Envelope>"#;
        let message = parse_soap_envelope(xml.as_bytes()).unwrap();
        assert!(message.is_fault());
    }

    #[test]
    fn test_empty_body() {
        let xml = r#"<S:Envelope xmlns:S="http://www.w3.org/2003/05/soap-envelope"><S:Body/></S:Envelope>"#;
        let message = parse_soap_envelope(xml.as_bytes()).unwrap();
        assert!(!message.has_payload());
    }

    #[test]
    fn test_unknown_envelope_namespace() {
        let xml = r#"<S:Envelope xmlns:S="urn:not-soap"><S:Body/></S:Envelope>"#;
        assert!(matches!(
            parse_soap_envelope(xml.as_bytes()),
            Err(PipelineError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_header_after_body_rejected() {
        let xml = r#"<S:Envelope xmlns:S="http://www.w3.org/2003/05/soap-envelope"><S:Body/><S:Header/></S:Envelope>"#;
        assert!(parse_soap_envelope(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_xxe_detection() {
        let xxe_payload = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>&xxe;</soap:Body>
</soap:Envelope>"#;

        let result = parse_soap_envelope(xxe_payload.as_bytes());
        assert!(matches!(result, Err(PipelineError::XmlParse(_))));
    }

    #[test]
    fn test_xxe_detection_ignores_case() {
        assert!(check_xxe_patterns("<!DocType foo>").is_err());
        assert!(check_xxe_patterns(r#"<!Entity x "y">"#).is_err());
        assert!(check_xxe_patterns("<S:Envelope/>").is_ok());
    }

    #[test]
    fn test_missing_body_rejected() {
        let header_only = r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/"><S:Header/></S:Envelope>"#;
        assert!(matches!(
            parse_soap_envelope(header_only.as_bytes()),
            Err(PipelineError::InvalidEnvelope(_))
        ));

        let bare = r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/"></S:Envelope>"#;
        assert!(matches!(
            parse_soap_envelope(bare.as_bytes()),
            Err(PipelineError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_parse_soap_action() {
        assert_eq!(parse_soap_action("\"GetUser\""), "GetUser");
        assert_eq!(parse_soap_action("GetUser"), "GetUser");
        assert_eq!(parse_soap_action("  \"GetUser\"  "), "GetUser");
    }
}
