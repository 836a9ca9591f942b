//! Field extraction from already rendered DTE documents.
use super::strip_xml_declaration;
use libxml::{parser::Parser, tree::Document, xpath};
use thiserror::Error;

/// Errors emitted while reading fields back out of a document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML parse error: {0}")]
    XmlParse(String),
    #[error("XPath error: {0}")]
    XPath(String),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// The header fields a TED digest is computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHeader {
    pub document_type: u16,
    pub folio: u64,
    pub issue_date: String,
    pub issuer_rut: String,
    pub recipient_rut: String,
    pub recipient_name: String,
    pub total: i64,
    pub first_item: String,
}

/// Read the stamp header from a DTE.
///
/// Paths match on local names so both prefixed and default-namespace
/// documents are accepted.
///
/// # Examples
/// ```rust
/// use dte_core::document::xml::parse::parse_document_header;
///
/// let xml = r#"<DTE xmlns="http://www.sii.cl/SiiDte"><Documento ID="R5"><Encabezado>
///   <IdDoc><TipoDTE>39</TipoDTE><Folio>5</Folio><FchEmis>2024-05-01</FchEmis></IdDoc>
///   <Emisor><RUTEmisor>76086428-5</RUTEmisor></Emisor>
///   <Receptor><RUTRecep>66666666-6</RUTRecep><RznSocRecep>Cliente</RznSocRecep></Receptor>
///   <Totales><MntTotal>1190</MntTotal></Totales></Encabezado>
///   <Detalle><NmbItem>Cafe</NmbItem></Detalle></Documento></DTE>"#;
/// let header = parse_document_header(xml)?;
/// assert_eq!(header.folio, 5);
/// assert_eq!(header.first_item, "Cafe");
/// # Ok::<(), dte_core::document::xml::parse::ParseError>(())
/// ```
pub fn parse_document_header(xml: &str) -> Result<DocumentHeader, ParseError> {
    let doc = parse_document(xml)?;
    let ctx = build_context(&doc)?;

    let document_type = xpath_text_required(&ctx, &documento_path(&["Encabezado", "IdDoc", "TipoDTE"]), "TipoDTE")?;
    let folio = xpath_text_required(&ctx, &documento_path(&["Encabezado", "IdDoc", "Folio"]), "Folio")?;
    let total = xpath_text_required(&ctx, &documento_path(&["Encabezado", "Totales", "MntTotal"]), "MntTotal")?;

    Ok(DocumentHeader {
        document_type: parse_number(&document_type, "TipoDTE")?,
        folio: parse_number(&folio, "Folio")?,
        issue_date: xpath_text_required(
            &ctx,
            &documento_path(&["Encabezado", "IdDoc", "FchEmis"]),
            "FchEmis",
        )?,
        issuer_rut: xpath_text_required(
            &ctx,
            &documento_path(&["Encabezado", "Emisor", "RUTEmisor"]),
            "RUTEmisor",
        )?,
        recipient_rut: xpath_text_required(
            &ctx,
            &documento_path(&["Encabezado", "Receptor", "RUTRecep"]),
            "RUTRecep",
        )?,
        recipient_name: xpath_text_required(
            &ctx,
            &documento_path(&["Encabezado", "Receptor", "RznSocRecep"]),
            "RznSocRecep",
        )?,
        total: parse_number(&total, "MntTotal")?,
        first_item: xpath_text_required(&ctx, &documento_path(&["Detalle", "NmbItem"]), "NmbItem")?,
    })
}

/// `TipoDTE` of the first document found anywhere in `xml`.
pub fn parse_document_type(xml: &str) -> Result<u16, ParseError> {
    let doc = parse_document(xml)?;
    let ctx = build_context(&doc)?;
    let value = xpath_text_required(&ctx, "//*[local-name()='TipoDTE']", "TipoDTE")?;
    parse_number(&value, "TipoDTE")
}

/// Parse a complete document, ignoring its declared encoding since the text
/// is already decoded.
pub(crate) fn parse_document(xml: &str) -> Result<Document, ParseError> {
    Parser::default()
        .parse_string(strip_xml_declaration(xml))
        .map_err(|e| ParseError::XmlParse(format!("{e:?}")))
}

pub(crate) fn build_context(doc: &Document) -> Result<xpath::Context, ParseError> {
    xpath::Context::new(doc).map_err(|e| ParseError::XPath(format!("{e:?}")))
}

pub(crate) fn xpath_text_required(
    ctx: &xpath::Context,
    expr: &str,
    label: &'static str,
) -> Result<String, ParseError> {
    xpath_text_optional(ctx, expr)?.ok_or(ParseError::MissingField(label))
}

pub(crate) fn xpath_text_optional(
    ctx: &xpath::Context,
    expr: &str,
) -> Result<Option<String>, ParseError> {
    let nodes = ctx
        .evaluate(expr)
        .map_err(|e| ParseError::XPath(format!("{e:?}")))?
        .get_nodes_as_vec();
    let node = match nodes.first() {
        Some(node) => node,
        None => return Ok(None),
    };
    let value = node.get_content().trim().to_string();
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(value))
}

pub(crate) fn parse_number<T: std::str::FromStr>(
    value: &str,
    field: &'static str,
) -> Result<T, ParseError> {
    value.parse::<T>().map_err(|_| ParseError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// `//Documento/a/b/...` expressed with `local-name()` steps.
fn documento_path(steps: &[&str]) -> String {
    let mut path = String::from("//*[local-name()='Documento']");
    for step in steps {
        path.push_str("/*[local-name()='");
        path.push_str(step);
        path.push_str("']");
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<DTE xmlns="http://www.sii.cl/SiiDte" version="1.0">
  <Documento ID="R12">
    <Encabezado>
      <IdDoc><TipoDTE>41</TipoDTE><Folio>12</Folio><FchEmis>2024-05-01</FchEmis></IdDoc>
      <Emisor><RUTEmisor>76086428-5</RUTEmisor><RznSoc>Comercial Ñandú</RznSoc></Emisor>
      <Receptor><RUTRecep>66666666-6</RUTRecep><RznSocRecep>Cliente</RznSocRecep></Receptor>
      <Totales><MntExe>1500</MntExe><MntTotal>1500</MntTotal></Totales>
    </Encabezado>
    <Detalle><NroLinDet>1</NroLinDet><NmbItem>Servicio</NmbItem></Detalle>
    <Detalle><NroLinDet>2</NroLinDet><NmbItem>Otro</NmbItem></Detalle>
  </Documento>
</DTE>"#;

    #[test]
    fn reads_header_fields() {
        let header = parse_document_header(SAMPLE).expect("header");
        assert_eq!(
            header,
            DocumentHeader {
                document_type: 41,
                folio: 12,
                issue_date: "2024-05-01".into(),
                issuer_rut: "76086428-5".into(),
                recipient_rut: "66666666-6".into(),
                recipient_name: "Cliente".into(),
                total: 1500,
                first_item: "Servicio".into(),
            }
        );
    }

    #[test]
    fn reports_first_missing_field() {
        let xml = SAMPLE.replace("<RUTEmisor>76086428-5</RUTEmisor>", "");
        let err = parse_document_header(&xml).expect_err("missing issuer");
        assert!(matches!(err, ParseError::MissingField("RUTEmisor")));
    }

    #[test]
    fn rejects_non_numeric_total() {
        let xml = SAMPLE.replace("<MntTotal>1500</MntTotal>", "<MntTotal>mil</MntTotal>");
        let err = parse_document_header(&xml).expect_err("bad total");
        assert!(matches!(err, ParseError::InvalidValue { field: "MntTotal", .. }));
    }

    #[test]
    fn reads_document_type_from_envelope() {
        let envelope = format!("<EnvioBOLETA><SetDTE>{}</SetDTE></EnvioBOLETA>", strip_xml_declaration(SAMPLE));
        assert_eq!(parse_document_type(&envelope).expect("type"), 41);
    }
}
