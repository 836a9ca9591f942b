//! XML serialization and byte-exact editing helpers for SII documents.
pub(crate) mod constants;
pub mod parse;

use super::builder::{BuiltDocument, DocumentData};
use super::{LineItem, Totals};
use constants::{SII_NS, XML_DECLARATION};
use helpers::{DateText, ShortDecimal};
use quick_xml::{
    events::{BytesStart, Event},
    reader::Reader,
    se::{SeError, Serializer as QuickXmlSerializer},
};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

/// XML serialization or scanning error.
#[derive(Debug, Error)]
pub enum DocumentXmlError {
    #[error("failed to serialize document to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
    #[error("failed to read XML: {0}")]
    Read(String),
}

/// XML formatting options.
#[derive(Debug, Clone, Copy, Default)]
pub enum XmlFormat {
    #[default]
    Compact,
    Pretty {
        indent_char: char,
        indent_size: usize,
    },
}

mod helpers {
    use serde::ser::{Serialize, Serializer};
    use std::fmt::{self, Display, Formatter};

    /// Shortest decimal rendering: `2`, `1.5`.
    pub(super) struct ShortDecimal(pub(super) f64);

    impl Display for ShortDecimal {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Serialize for ShortDecimal {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    pub(super) struct DateText(pub(super) chrono::NaiveDate);

    impl Serialize for DateText {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(&self.0.format("%Y-%m-%d"))
        }
    }
}

/// Serialize to XML text with a leading ISO-8859-1 declaration.
///
/// # Examples
/// ```rust
/// use chrono::NaiveDate;
/// use dte_core::document::{xml::ToXml, DocumentBuilder, DocumentType, Issuer, LineItem};
///
/// let issuer = Issuer::new(
///     "76086428-5".into(),
///     "Comercial de Prueba SpA".into(),
///     "Venta al por menor".into(),
///     "Av. Siempre Viva 123".into(),
///     "Santiago".into(),
/// )?;
/// let date = NaiveDate::from_ymd_opt(2024, 5, 1).expect("date");
/// let built = DocumentBuilder::new(DocumentType::Receipt, 1, date, issuer)
///     .line_item(LineItem::new("Cafe", 2.0, 1000.0))
///     .build()?;
/// let xml = built.to_xml()?;
/// assert!(xml.contains(r#"<Documento ID="R1">"#));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub trait ToXml {
    fn to_xml_with_format(&self, format: XmlFormat) -> Result<String, DocumentXmlError>;

    fn to_xml(&self) -> Result<String, DocumentXmlError> {
        self.to_xml_with_format(XmlFormat::Pretty {
            indent_char: ' ',
            indent_size: 2,
        })
    }
}

impl ToXml for BuiltDocument {
    fn to_xml_with_format(&self, format: XmlFormat) -> Result<String, DocumentXmlError> {
        to_xml_with_format(&DteXml::new(self.data(), self.totals()), format, true)
    }
}

pub(crate) fn to_xml_with_format<T: Serialize>(
    value: &T,
    format: XmlFormat,
    with_declaration: bool,
) -> Result<String, DocumentXmlError> {
    let mut buffer = String::with_capacity(2048);
    if with_declaration {
        buffer.push_str(XML_DECLARATION);
        buffer.push('\n');
    }

    {
        let mut serializer = QuickXmlSerializer::new(&mut buffer);
        if let XmlFormat::Pretty {
            indent_char,
            indent_size,
        } = format
        {
            serializer.indent(indent_char, indent_size);
        }
        value.serialize(serializer)?;
    }

    Ok(buffer)
}

pub(crate) struct DteXml<'a> {
    data: &'a DocumentData,
    totals: &'a Totals,
}

impl<'a> DteXml<'a> {
    pub(crate) fn new(data: &'a DocumentData, totals: &'a Totals) -> Self {
        Self { data, totals }
    }
}

impl Serialize for DteXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut root = serializer.serialize_struct("DTE", 3)?;
        root.serialize_field("@xmlns", SII_NS)?;
        root.serialize_field("@version", "1.0")?;
        root.serialize_field("Documento", &DocumentoXml(self))?;
        root.end()
    }
}

struct DocumentoXml<'a>(&'a DteXml<'a>);

impl Serialize for DocumentoXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.0.data;
        let mut st = serializer.serialize_struct("Documento", 2 + data.items.len())?;
        st.serialize_field("@ID", &format!("R{}", data.folio))?;
        st.serialize_field("Encabezado", &EncabezadoXml(self.0))?;
        for (index, item) in data.items.iter().enumerate() {
            st.serialize_field(
                "Detalle",
                &DetalleXml {
                    line: index + 1,
                    item,
                    exempt: data.document_type.is_exempt() || item.exempt(),
                },
            )?;
        }
        st.end()
    }
}

struct EncabezadoXml<'a>(&'a DteXml<'a>);

impl Serialize for EncabezadoXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.0.data;
        let mut st = serializer.serialize_struct("Encabezado", 4)?;
        st.serialize_field("IdDoc", &IdDocXml(data))?;
        st.serialize_field("Emisor", &EmisorXml(data))?;
        st.serialize_field("Receptor", &ReceptorXml(data))?;
        st.serialize_field("Totales", &TotalesXml(self.0.totals))?;
        st.end()
    }
}

struct IdDocXml<'a>(&'a DocumentData);

impl Serialize for IdDocXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("IdDoc", 3)?;
        st.serialize_field("TipoDTE", &self.0.document_type.code())?;
        st.serialize_field("Folio", &self.0.folio)?;
        st.serialize_field("FchEmis", &DateText(self.0.issue_date))?;
        st.end()
    }
}

struct EmisorXml<'a>(&'a DocumentData);

impl Serialize for EmisorXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let issuer = &self.0.issuer;
        let mut st = serializer.serialize_struct("Emisor", 5)?;
        st.serialize_field("RUTEmisor", issuer.rut())?;
        st.serialize_field("RznSoc", issuer.business_name())?;
        st.serialize_field("GiroEmis", issuer.activity())?;
        st.serialize_field("DirOrigen", issuer.address())?;
        st.serialize_field("CmnaOrigen", issuer.commune())?;
        st.end()
    }
}

struct ReceptorXml<'a>(&'a DocumentData);

impl Serialize for ReceptorXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let recipient = &self.0.recipient;
        let mut st = serializer.serialize_struct("Receptor", 2)?;
        st.serialize_field("RUTRecep", recipient.rut())?;
        st.serialize_field("RznSocRecep", recipient.name())?;
        st.end()
    }
}

struct TotalesXml<'a>(&'a Totals);

impl Serialize for TotalesXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let totals = self.0;
        let mut st = serializer.serialize_struct("Totales", 4)?;
        if totals.net() > 0 {
            st.serialize_field("MntNeto", &totals.net())?;
            st.serialize_field("IVA", &totals.iva())?;
        }
        if totals.exempt() > 0 {
            st.serialize_field("MntExe", &totals.exempt())?;
        }
        st.serialize_field("MntTotal", &totals.total())?;
        st.end()
    }
}

struct DetalleXml<'a> {
    line: usize,
    item: &'a LineItem,
    exempt: bool,
}

impl Serialize for DetalleXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("Detalle", 5)?;
        st.serialize_field("NroLinDet", &self.line)?;
        st.serialize_field("NmbItem", self.item.name())?;
        st.serialize_field("QtyItem", &ShortDecimal(self.item.quantity()))?;
        if self.exempt {
            st.serialize_field("IndExe", &1u8)?;
        }
        st.serialize_field("PrcItem", &ShortDecimal(self.item.unit_price()))?;
        st.end()
    }
}

/// Encode text as ISO-8859-1; characters outside the charset become `?`.
pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Decode ISO-8859-1 bytes. Every byte maps to the code point of equal value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Drop a leading `<?xml ...?>` declaration and surrounding whitespace.
pub fn strip_xml_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

/// Byte offsets of one element inside a larger text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ElementSpan {
    /// Position of the `<` opening the start tag.
    pub(crate) start: usize,
    /// Position just past the start tag's `>`.
    pub(crate) start_tag_end: usize,
    /// Position of the `</` of the closing tag, `None` for `<x/>`.
    pub(crate) close_start: Option<usize>,
    /// Position just past the element.
    pub(crate) end: usize,
    pub(crate) qname: String,
    /// `xmlns` declarations made by ancestors, still in scope and not
    /// redeclared on the element itself.
    pub(crate) inherited_namespaces: Vec<(String, String)>,
}

/// Locate the first element whose start tag satisfies `matches` without
/// re-serializing anything.
pub(crate) fn find_element<F>(xml: &str, mut matches: F) -> Result<Option<ElementSpan>, DocumentXmlError>
where
    F: FnMut(&BytesStart<'_>) -> bool,
{
    let mut reader = Reader::from_str(xml);
    let mut scopes: Vec<Vec<(String, String)>> = Vec::new();
    loop {
        let before = to_index(reader.buffer_position())?;
        let event = reader
            .read_event()
            .map_err(|e| DocumentXmlError::Read(e.to_string()))?;
        match event {
            Event::Start(start) => {
                if matches(&start) {
                    let inherited_namespaces = inherited(&scopes, &start)?;
                    let start_at = markup_start(xml, before)?;
                    let start_tag_end = to_index(reader.buffer_position())?;
                    let end_tag = start.to_end().into_owned();
                    reader
                        .read_to_end(end_tag.name())
                        .map_err(|e| DocumentXmlError::Read(e.to_string()))?;
                    let end = to_index(reader.buffer_position())?;
                    let close_start = xml[..end]
                        .rfind("</")
                        .filter(|pos| *pos >= start_tag_end)
                        .ok_or_else(|| DocumentXmlError::Read("unterminated element".into()))?;
                    return Ok(Some(ElementSpan {
                        start: start_at,
                        start_tag_end,
                        close_start: Some(close_start),
                        end,
                        qname: qualified_name(&start),
                        inherited_namespaces,
                    }));
                }
                scopes.push(namespace_declarations(&start)?);
            }
            Event::Empty(start) => {
                if matches(&start) {
                    let end = to_index(reader.buffer_position())?;
                    return Ok(Some(ElementSpan {
                        start: markup_start(xml, before)?,
                        start_tag_end: end,
                        close_start: None,
                        end,
                        qname: qualified_name(&start),
                        inherited_namespaces: inherited(&scopes, &start)?,
                    }));
                }
            }
            Event::End(_) => {
                scopes.pop();
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Unescaped value of an attribute, if present.
pub(crate) fn attribute_value(start: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

fn namespace_declarations(start: &BytesStart<'_>) -> Result<Vec<(String, String)>, DocumentXmlError> {
    let mut out = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| DocumentXmlError::Read(e.to_string()))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            let value = attr
                .unescape_value()
                .map_err(|e| DocumentXmlError::Read(e.to_string()))?;
            out.push((String::from_utf8_lossy(key).into_owned(), value.into_owned()));
        }
    }
    Ok(out)
}

fn inherited(
    scopes: &[Vec<(String, String)>],
    start: &BytesStart<'_>,
) -> Result<Vec<(String, String)>, DocumentXmlError> {
    let own = namespace_declarations(start)?;
    Ok(flatten_scopes(scopes)
        .into_iter()
        .filter(|(name, _)| !own.iter().any(|(declared, _)| declared == name))
        .collect())
}

fn flatten_scopes(scopes: &[Vec<(String, String)>]) -> Vec<(String, String)> {
    let mut in_scope: Vec<(String, String)> = Vec::new();
    for (name, value) in scopes.iter().flatten() {
        match in_scope.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1 = value.clone(),
            None => in_scope.push((name.clone(), value.clone())),
        }
    }
    in_scope
}

fn qualified_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn markup_start(xml: &str, from: usize) -> Result<usize, DocumentXmlError> {
    xml[from..]
        .find('<')
        .map(|offset| from + offset)
        .ok_or_else(|| DocumentXmlError::Read("markup not found".into()))
}

fn to_index(position: u64) -> Result<usize, DocumentXmlError> {
    usize::try_from(position).map_err(|_| DocumentXmlError::Read("offset overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_round_trip_replaces_unmappable() {
        let bytes = encode_latin1("Año €");
        assert_eq!(bytes, vec![b'A', 0xF1, b'o', b' ', b'?']);
        assert_eq!(decode_latin1(&bytes), "Año ?");
    }

    #[test]
    fn finds_element_with_inherited_namespaces() {
        let xml = r#"<?xml version="1.0"?>
<a xmlns="urn:a" xmlns:x="urn:x"><b xmlns="urn:b"><c ID="T">text</c></b><c ID="U"/></a>"#;
        let span = find_element(xml, |s| attribute_value(s, b"ID").as_deref() == Some("T"))
            .expect("scan")
            .expect("found");
        assert_eq!(&xml[span.start..span.end], r#"<c ID="T">text</c>"#);
        assert_eq!(&xml[span.start_tag_end..span.close_start.expect("close")], "text");
        assert_eq!(span.qname, "c");
        assert_eq!(
            span.inherited_namespaces,
            vec![
                ("xmlns".to_string(), "urn:b".to_string()),
                ("xmlns:x".to_string(), "urn:x".to_string()),
            ]
        );

        let empty = find_element(xml, |s| attribute_value(s, b"ID").as_deref() == Some("U"))
            .expect("scan")
            .expect("found");
        assert_eq!(&xml[empty.start..empty.end], r#"<c ID="U"/>"#);
        assert!(empty.close_start.is_none());
        assert_eq!(
            empty.inherited_namespaces,
            vec![
                ("xmlns".to_string(), "urn:a".to_string()),
                ("xmlns:x".to_string(), "urn:x".to_string()),
            ]
        );
    }

    #[test]
    fn missing_element_is_none() {
        let found = find_element("<a><b/></a>", |s| s.local_name().as_ref() == b"z").expect("scan");
        assert!(found.is_none());
    }

    #[test]
    fn strips_declaration() {
        assert_eq!(
            strip_xml_declaration("<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n<a/>"),
            "<a/>"
        );
        assert_eq!(strip_xml_declaration("  <a/>"), "<a/>");
    }
}
