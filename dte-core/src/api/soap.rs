//! SOAP wrapping and response unpacking for the SII `.jws` services.
use quick_xml::{escape::unescape, events::Event, reader::Reader};

use super::HandshakeError;
use crate::document::xml::constants::{SOAP_ENV_NS, XML_DECLARATION};
use crate::document::xml::parse::{build_context, parse_document, xpath_text_optional};
use crate::document::xml::strip_xml_declaration;

pub(crate) const SEED_PATH: &str = "/DTEWS/CrSeed.jws";
pub(crate) const TOKEN_PATH: &str = "/DTEWS/GetTokenFromSeed.jws";
pub(crate) const UPLOAD_FILE_NAME: &str = "SetDTE.xml";

/// Wrap a body element in the fixed SOAP 1.1 envelope.
pub fn envelope(inner: &str) -> String {
    format!(
        r#"{XML_DECLARATION}<soapenv:Envelope xmlns:soapenv="{SOAP_ENV_NS}"><soapenv:Body>{inner}</soapenv:Body></soapenv:Envelope>"#
    )
}

pub(crate) fn seed_request() -> String {
    envelope("<getSeed/>")
}

pub(crate) fn token_request(signed_seed: &str) -> String {
    envelope(&format!(
        r#"<SII:getToken xmlns:SII="http://www.sii.cl/SiiDte"><pszXml><![CDATA[{}]]></pszXml></SII:getToken>"#,
        strip_xml_declaration(signed_seed)
    ))
}

pub(crate) fn upload_request(signed_envelope: &str) -> String {
    envelope(&format!(
        "<upload><fileName>{UPLOAD_FILE_NAME}</fileName><contentFile><![CDATA[{signed_envelope}]]></contentFile></upload>"
    ))
}

/// Text of the `<{element}>` return value, with its embedded XML unescaped.
pub(crate) fn return_text(response: &str, element: &'static str) -> Result<String, HandshakeError> {
    let missing = || HandshakeError::MissingElement {
        element,
        head: head(response, 200),
    };
    let doc = parse_document(response).map_err(|_| missing())?;
    let ctx = build_context(&doc).map_err(|_| missing())?;
    xpath_text_optional(&ctx, &format!("//*[local-name()='{element}']"))
        .ok()
        .flatten()
        .ok_or_else(missing)
}

/// Text of the first element named `tag` (any prefix, any case) inside a
/// decoded return payload.
pub(crate) fn inner_field(payload: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(payload);
    loop {
        match reader.read_event() {
            Ok(Event::Start(start))
                if start.local_name().as_ref().eq_ignore_ascii_case(tag.as_bytes()) =>
            {
                let end = start.to_end().into_owned();
                let raw = reader.read_text(end.name()).ok()?;
                let text = unescape(&raw).ok()?.trim().to_string();
                return (!text.is_empty()).then_some(text);
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// `inner_field`, failing with the element name and payload head.
pub(crate) fn required_inner_field(
    payload: &str,
    tag: &'static str,
) -> Result<String, HandshakeError> {
    inner_field(payload, tag).ok_or_else(|| HandshakeError::MissingElement {
        element: tag,
        head: head(payload, 200),
    })
}

pub(crate) fn is_html(body: &str) -> bool {
    body.trim_start()
        .get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("<html"))
}

/// First `limit` characters of `text`.
pub(crate) fn head(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
