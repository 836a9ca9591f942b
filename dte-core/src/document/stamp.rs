//! TED stamping: the CAF-signed digest embedded in every DTE.
use chrono::NaiveDateTime;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

use crate::caf::Authorization;
use crate::credential::Credential;
use crate::document::sign::{rsa_sha1_base64, sign_enveloped, SignatureError, SignedDocument};
use crate::document::xml::parse::{parse_document_header, DocumentHeader, ParseError};
use crate::document::xml::{encode_latin1, find_element, to_xml_with_format, XmlFormat};

/// `TSTED` / `TmstFirma` layout.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const ITEM_DIGEST_CHARS: usize = 40;

#[derive(Debug, Error)]
pub enum StampError {
    #[error("document is missing required field {0}")]
    MissingField(&'static str),
    #[error("folio {folio} is outside the authorized range {start}..={end}")]
    FolioOutOfRange { folio: u64, start: u64, end: u64 },
    #[error("failed to sign digest record: {0}")]
    Signing(String),
    #[error("XML error: {0}")]
    Xml(String),
}

impl From<ParseError> for StampError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::MissingField(field) => StampError::MissingField(field),
            other => StampError::Xml(other.to_string()),
        }
    }
}

/// The signed digest block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ted {
    digest_record: String,
    signature: String,
}

impl Ted {
    /// The `<DD>` fragment exactly as signed.
    pub fn digest_record(&self) -> &str {
        &self.digest_record
    }

    /// Base64 `FRMT` value.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn to_xml(&self) -> String {
        format!(
            r#"<TED version="1.0">{}<FRMT algoritmo="SHA1withRSA">{}</FRMT></TED>"#,
            self.digest_record, self.signature
        )
    }
}

/// A DTE carrying its TED, ready for the XML signature.
#[derive(Debug, Clone)]
pub struct StampedDocument {
    xml: String,
    header: DocumentHeader,
    ted: Ted,
    timestamp: String,
}

impl StampedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn header(&self) -> &DocumentHeader {
        &self.header
    }

    pub fn ted(&self) -> &Ted {
        &self.ted
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn reference_id(&self) -> String {
        format!("R{}", self.header.folio)
    }

    /// Sign the `<Documento>` with the taxpayer credential.
    pub fn sign(self, credential: &Credential) -> Result<SignedDocument, SignatureError> {
        let reference_id = self.reference_id();
        let xml = sign_enveloped(&self.xml, &reference_id, credential)?;
        Ok(SignedDocument::new(xml, self.header.document_type, reference_id))
    }
}

/// Stamps documents with one CAF.
///
/// # Examples
/// ```rust,no_run
/// use chrono::NaiveDate;
/// use dte_core::caf::CafSource;
/// use dte_core::document::stamp::Stamper;
///
/// let caf = CafSource::Path("caf_39.xml".into()).load()?;
/// let xml = std::fs::read_to_string("dte.xml")?;
/// let at = NaiveDate::from_ymd_opt(2024, 5, 1).and_then(|d| d.and_hms_opt(10, 0, 0)).expect("ts");
/// let stamped = Stamper::new(&caf).with_folio_check(true).stamp_at(&xml, at)?;
/// assert!(stamped.xml().contains("<TED version=\"1.0\">"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Stamper<'a> {
    authorization: &'a Authorization,
    folio_check: bool,
}

impl<'a> Stamper<'a> {
    pub fn new(authorization: &'a Authorization) -> Self {
        Self {
            authorization,
            folio_check: false,
        }
    }

    /// Reject folios outside the CAF range. Off by default.
    pub fn with_folio_check(mut self, enabled: bool) -> Self {
        self.folio_check = enabled;
        self
    }

    /// Stamp with the local clock.
    pub fn stamp(&self, xml: &str) -> Result<StampedDocument, StampError> {
        self.stamp_at(xml, chrono::Local::now().naive_local())
    }

    /// Deterministic stamp at a fixed generation time.
    pub fn stamp_at(&self, xml: &str, at: NaiveDateTime) -> Result<StampedDocument, StampError> {
        let header = parse_document_header(xml)?;
        if self.folio_check && !self.authorization.covers(header.folio) {
            return Err(StampError::FolioOutOfRange {
                folio: header.folio,
                start: self.authorization.folio_start(),
                end: self.authorization.folio_end(),
            });
        }

        let timestamp = at.format(TIMESTAMP_FORMAT).to_string();
        let digest_record = digest_record(&header, self.authorization.caf_fragment(), &timestamp)?;
        let signature = rsa_sha1_base64(
            self.authorization.private_key(),
            &encode_latin1(&digest_record),
        )
        .map_err(|e| StampError::Signing(e.to_string()))?;
        let ted = Ted {
            digest_record,
            signature,
        };

        let documento = find_element(xml, |start| start.local_name().as_ref() == b"Documento")
            .map_err(|e| StampError::Xml(e.to_string()))?
            .and_then(|span| span.close_start)
            .ok_or(StampError::MissingField("Documento"))?;
        let mut out = String::with_capacity(xml.len() + 2048);
        out.push_str(&xml[..documento]);
        out.push_str(&ted.to_xml());
        out.push_str("<TmstFirma>");
        out.push_str(&timestamp);
        out.push_str("</TmstFirma>");
        out.push_str(&xml[documento..]);

        tracing::debug!(
            document_type = header.document_type,
            folio = header.folio,
            "document stamped"
        );
        Ok(StampedDocument {
            xml: out,
            header,
            ted,
            timestamp,
        })
    }
}

/// Stamp with the local clock and no folio-range check.
pub fn stamp(xml: &str, authorization: &Authorization) -> Result<StampedDocument, StampError> {
    Stamper::new(authorization).stamp(xml)
}

/// Deterministic variant of [`stamp`].
pub fn stamp_at(
    xml: &str,
    authorization: &Authorization,
    at: NaiveDateTime,
) -> Result<StampedDocument, StampError> {
    Stamper::new(authorization).stamp_at(xml, at)
}

/// Compact `<DD>` with the CAF spliced in verbatim before `TSTED`.
fn digest_record(
    header: &DocumentHeader,
    caf_fragment: &str,
    timestamp: &str,
) -> Result<String, StampError> {
    let dd = to_xml_with_format(
        &DdXml { header, timestamp },
        XmlFormat::Compact,
        false,
    )
    .map_err(|e| StampError::Xml(e.to_string()))?;
    let at = dd
        .rfind("<TSTED>")
        .ok_or_else(|| StampError::Xml("digest record lost its TSTED".into()))?;
    Ok(format!("{}{}{}", &dd[..at], caf_fragment, &dd[at..]))
}

struct DdXml<'a> {
    header: &'a DocumentHeader,
    timestamp: &'a str,
}

impl Serialize for DdXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let header = self.header;
        let first_item: String = header.first_item.chars().take(ITEM_DIGEST_CHARS).collect();
        let mut st = serializer.serialize_struct("DD", 9)?;
        st.serialize_field("RE", &header.issuer_rut)?;
        st.serialize_field("TD", &header.document_type)?;
        st.serialize_field("F", &header.folio)?;
        st.serialize_field("FE", &header.issue_date)?;
        st.serialize_field("RR", &header.recipient_rut)?;
        st.serialize_field("RSR", &header.recipient_name)?;
        st.serialize_field("MNT", &header.total)?;
        st.serialize_field("IT1", &first_item)?;
        st.serialize_field("TSTED", self.timestamp)?;
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> DocumentHeader {
        DocumentHeader {
            document_type: 39,
            folio: 1,
            issue_date: "2024-05-01".into(),
            issuer_rut: "76086428-5".into(),
            recipient_rut: "66666666-6".into(),
            recipient_name: "Cliente".into(),
            total: 2380,
            first_item: "Un nombre de producto bastante largo que supera el limite".into(),
        }
    }

    #[test]
    fn digest_record_is_compact_and_embeds_caf_before_timestamp() {
        let caf = "<CAF version=\"1.0\">\n<DA>x</DA>\n</CAF>";
        let dd = digest_record(&header(), caf, "2024-05-01T10:00:00").expect("dd");
        assert_eq!(
            dd,
            "<DD><RE>76086428-5</RE><TD>39</TD><F>1</F><FE>2024-05-01</FE>\
             <RR>66666666-6</RR><RSR>Cliente</RSR><MNT>2380</MNT>\
             <IT1>Un nombre de producto bastante largo que</IT1>\
             <CAF version=\"1.0\">\n<DA>x</DA>\n</CAF><TSTED>2024-05-01T10:00:00</TSTED></DD>"
        );
    }

    #[test]
    fn ted_wraps_digest_and_signature() {
        let ted = Ted {
            digest_record: "<DD/>".into(),
            signature: "c2ln".into(),
        };
        assert_eq!(
            ted.to_xml(),
            r#"<TED version="1.0"><DD/><FRMT algoritmo="SHA1withRSA">c2ln</FRMT></TED>"#
        );
    }
}
