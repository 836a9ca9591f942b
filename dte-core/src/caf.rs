//! Folio authorization records (CAF).
//!
//! A CAF is issued by the SII for one document type and a folio range. It
//! carries the RSA keypair used to sign the TED stamp, and its `<CAF>` element
//! must be copied byte for byte into every stamp.
use base64ct::{Base64, Encoding};
use quick_xml::{events::Event, reader::Reader};
use rsa::{
    pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, traits::PublicKeyParts, BigUint,
    RsaPrivateKey, RsaPublicKey,
};
use std::{ops::RangeInclusive, path::PathBuf};
use thiserror::Error;

use crate::document::xml::decode_latin1;
use crate::document::xml::parse::{
    build_context, parse_document, parse_number, xpath_text_required, ParseError,
};
use crate::document::DocumentType;

/// Errors raised while reading or parsing a CAF.
#[derive(Debug, Error)]
pub enum AuthorizationParseError {
    #[error("CAF source not configured: set CAF_{0}_B64 or CAF_{0}_PATH")]
    NotConfigured(u16),
    #[error("failed to read CAF '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CAF blob is not valid base64")]
    Base64,
    #[error("CAF XML parse error: {0}")]
    XmlParse(String),
    #[error("missing required CAF field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for CAF field {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid folio range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },
    #[error("invalid CAF key: {0}")]
    InvalidKey(String),
    #[error("RSASK private key does not match the RSAPK public key")]
    KeyMismatch,
}

impl From<ParseError> for AuthorizationParseError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::MissingField(field) => AuthorizationParseError::MissingField(field),
            ParseError::InvalidValue { field, value } => {
                AuthorizationParseError::InvalidValue { field, value }
            }
            other => AuthorizationParseError::XmlParse(other.to_string()),
        }
    }
}

/// Where a CAF is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CafSource {
    Path(PathBuf),
    Base64(String),
}

impl CafSource {
    /// Look up `CAF_<type>_B64`, falling back to `CAF_<type>_PATH`.
    pub fn from_env(document_type: DocumentType) -> Result<Self, AuthorizationParseError> {
        let code = document_type.code();
        let read = |name: String| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(b64) = read(format!("CAF_{code}_B64")) {
            return Ok(CafSource::Base64(b64));
        }
        read(format!("CAF_{code}_PATH"))
            .map(|p| CafSource::Path(p.into()))
            .ok_or(AuthorizationParseError::NotConfigured(code))
    }

    /// Raw CAF text. CAF files are ISO-8859-1, so bytes map straight to chars.
    pub fn read(&self) -> Result<String, AuthorizationParseError> {
        let bytes = match self {
            CafSource::Base64(b64) => {
                let compact: String = b64.split_whitespace().collect();
                Base64::decode_vec(&compact).map_err(|_| AuthorizationParseError::Base64)?
            }
            CafSource::Path(path) => {
                std::fs::read(path).map_err(|source| AuthorizationParseError::Io {
                    path: path.clone(),
                    source,
                })?
            }
        };
        Ok(decode_latin1(&bytes))
    }

    pub fn load(&self) -> Result<Authorization, AuthorizationParseError> {
        Authorization::parse(&self.read()?)
    }
}

/// Parsed CAF. Immutable; the raw text is kept verbatim.
#[derive(Clone)]
pub struct Authorization {
    issuer_rut: String,
    issuer_name: String,
    document_type: u16,
    folio_start: u64,
    folio_end: u64,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    raw_record: String,
    caf_span: std::ops::Range<usize>,
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("issuer_rut", &self.issuer_rut)
            .field("issuer_name", &self.issuer_name)
            .field("document_type", &self.document_type)
            .field("folios", &self.folios())
            .finish_non_exhaustive()
    }
}

impl Authorization {
    /// Parse a CAF from its native XML.
    ///
    /// # Errors
    /// Returns [`AuthorizationParseError::MissingField`] naming the first
    /// absent element, or a key error when `RSASK` does not decode or does not
    /// match `RSAPK`.
    ///
    /// # Examples
    /// ```rust,no_run
    /// use dte_core::caf::Authorization;
    ///
    /// let xml = std::fs::read_to_string("caf_39.xml")?;
    /// let caf = Authorization::parse(&xml)?;
    /// assert!(caf.covers(1));
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn parse(raw: &str) -> Result<Self, AuthorizationParseError> {
        let caf_span = locate_caf_element(raw)?;

        let doc = parse_document(raw)?;
        let ctx = build_context(&doc)?;

        let issuer_rut = xpath_text_required(&ctx, &da_path(&["RE"]), "RE")?;
        let issuer_name = xpath_text_required(&ctx, &da_path(&["RS"]), "RS")?;
        let document_type: u16 =
            parse_number(&xpath_text_required(&ctx, &da_path(&["TD"]), "TD")?, "TD")?;
        let folio_start: u64 =
            parse_number(&xpath_text_required(&ctx, &da_path(&["RNG", "D"]), "D")?, "D")?;
        let folio_end: u64 =
            parse_number(&xpath_text_required(&ctx, &da_path(&["RNG", "H"]), "H")?, "H")?;
        if folio_start > folio_end {
            return Err(AuthorizationParseError::InvalidRange {
                start: folio_start,
                end: folio_end,
            });
        }

        let modulus = decode_big(&xpath_text_required(&ctx, &da_path(&["RSAPK", "M"]), "M")?, "M")?;
        let exponent = decode_big(&xpath_text_required(&ctx, &da_path(&["RSAPK", "E"]), "E")?, "E")?;
        let public_key = RsaPublicKey::new(modulus, exponent)
            .map_err(|e| AuthorizationParseError::InvalidKey(e.to_string()))?;

        let rsask = xpath_text_required(&ctx, "//*[local-name()='RSASK']", "RSASK")?;
        let private_key = RsaPrivateKey::from_pkcs1_pem(&rsask)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&rsask))
            .map_err(|e| AuthorizationParseError::InvalidKey(e.to_string()))?;
        if private_key.n() != public_key.n() || private_key.e() != public_key.e() {
            return Err(AuthorizationParseError::KeyMismatch);
        }

        Ok(Self {
            issuer_rut,
            issuer_name,
            document_type,
            folio_start,
            folio_end,
            private_key,
            public_key,
            raw_record: raw.to_string(),
            caf_span,
        })
    }

    pub fn issuer_rut(&self) -> &str {
        &self.issuer_rut
    }

    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    pub fn document_type(&self) -> u16 {
        self.document_type
    }

    pub fn folio_start(&self) -> u64 {
        self.folio_start
    }

    pub fn folio_end(&self) -> u64 {
        self.folio_end
    }

    pub fn folios(&self) -> RangeInclusive<u64> {
        self.folio_start..=self.folio_end
    }

    pub fn covers(&self, folio: u64) -> bool {
        self.folios().contains(&folio)
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// The complete record as it was read.
    pub fn raw_record(&self) -> &str {
        &self.raw_record
    }

    /// The `<CAF ...>...</CAF>` element exactly as it appears in the record.
    pub fn caf_fragment(&self) -> &str {
        &self.raw_record[self.caf_span.clone()]
    }
}

/// `//DA/a/b/...` expressed with `local-name()` steps.
fn da_path(steps: &[&str]) -> String {
    let mut path = String::from("//*[local-name()='DA']");
    for step in steps {
        path.push_str("/*[local-name()='");
        path.push_str(step);
        path.push_str("']");
    }
    path
}

fn decode_big(value: &str, field: &'static str) -> Result<BigUint, AuthorizationParseError> {
    let compact: String = value.split_whitespace().collect();
    let bytes = Base64::decode_vec(&compact).map_err(|_| AuthorizationParseError::InvalidValue {
        field,
        value: value.to_string(),
    })?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// Byte span of the first `<CAF>` element, located with a streaming reader
/// so the fragment is never re-serialized.
fn locate_caf_element(raw: &str) -> Result<std::ops::Range<usize>, AuthorizationParseError> {
    let mut reader = Reader::from_str(raw);
    loop {
        let before = reader.buffer_position();
        let event = reader
            .read_event()
            .map_err(|e| AuthorizationParseError::XmlParse(e.to_string()))?;
        match event {
            Event::Start(start) if start.local_name().as_ref() == b"CAF" => {
                let end = start.to_end().into_owned();
                reader
                    .read_to_end(end.name())
                    .map_err(|e| AuthorizationParseError::XmlParse(e.to_string()))?;
                let start_at = to_index(before)?;
                let end_at = to_index(reader.buffer_position())?;
                // leading whitespace may be folded into the position before '<'
                let start_at = raw[start_at..end_at]
                    .find('<')
                    .map(|offset| start_at + offset)
                    .ok_or(AuthorizationParseError::MissingField("CAF"))?;
                return Ok(start_at..end_at);
            }
            Event::Eof => return Err(AuthorizationParseError::MissingField("CAF")),
            _ => {}
        }
    }
}

fn to_index(position: u64) -> Result<usize, AuthorizationParseError> {
    usize::try_from(position).map_err(|_| AuthorizationParseError::XmlParse("offset overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name);
        CafSource::Path(path).read().expect("fixture")
    }

    #[test]
    fn parses_fixture_record() {
        let caf = Authorization::parse(&fixture("caf_39.xml")).expect("caf");
        assert_eq!(caf.issuer_rut(), "76086428-5");
        assert_eq!(caf.issuer_name(), "COMERCIAL DE PRUEBA SPA");
        assert_eq!(caf.document_type(), 39);
        assert_eq!(caf.folios(), 1..=100);
        assert!(caf.covers(1));
        assert!(caf.covers(100));
        assert!(!caf.covers(101));
    }

    #[test]
    fn caf_fragment_is_verbatim() {
        let raw = fixture("caf_39.xml");
        let caf = Authorization::parse(&raw).expect("caf");
        let fragment = caf.caf_fragment();
        assert!(fragment.starts_with("<CAF version=\"1.0\">"));
        assert!(fragment.ends_with("</CAF>"));
        assert!(raw.contains(fragment));
        assert!(!fragment.contains("RSASK"));
    }

    #[test]
    fn missing_private_key_is_reported_by_name() {
        let raw = fixture("caf_39.xml");
        let start = raw.find("<RSASK>").expect("rsask");
        let end = raw.find("</RSASK>").expect("rsask end") + "</RSASK>".len();
        let stripped = format!("{}{}", &raw[..start], &raw[end..]);
        let err = Authorization::parse(&stripped).expect_err("missing RSASK");
        assert!(matches!(err, AuthorizationParseError::MissingField("RSASK")));
    }

    #[test]
    fn missing_caf_element_is_reported() {
        let err = Authorization::parse("<AUTORIZACION><RSASK>x</RSASK></AUTORIZACION>")
            .expect_err("no CAF");
        assert!(matches!(err, AuthorizationParseError::MissingField("CAF")));
    }

    #[test]
    fn mismatched_keypair_is_rejected() {
        let err = Authorization::parse(&fixture("caf_39_mismatched_key.xml"))
            .expect_err("mismatch");
        assert!(matches!(err, AuthorizationParseError::KeyMismatch));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let raw = fixture("caf_39.xml").replace("<D>1</D><H>100</H>", "<D>50</D><H>10</H>");
        let err = Authorization::parse(&raw).expect_err("range");
        assert!(matches!(
            err,
            AuthorizationParseError::InvalidRange { start: 50, end: 10 }
        ));
    }

    #[test]
    fn base64_source_round_trips_latin1() {
        let source = CafSource::Base64(Base64::encode_string("<CAF>\u{f1}</CAF>".as_bytes()));
        // UTF-8 bytes read back one char per byte
        assert_eq!(source.read().expect("read").chars().count(), 13);
    }
}
