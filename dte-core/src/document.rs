//! Tax document domain types and builders.
mod builder;
pub mod sign;
pub mod stamp;
pub mod xml;

pub use builder::{BuiltDocument, DocumentBuilder};

use dte_derive::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// IVA rate applied to the net amount.
pub const IVA_RATE: f64 = 0.19;

/// Document-related errors.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document has no line items")]
    MissingLineItems,
    #[error("folio must be positive")]
    InvalidFolio,
    #[error("line item {index} has an empty name")]
    EmptyItemName { index: usize },
    #[error("line item {index} has a non-finite {field}")]
    InvalidAmount { index: usize, field: &'static str },
    #[error("unsupported document type code {0}")]
    UnsupportedType(u16),
    #[error("invalid party data: {0}")]
    Invalid(String),
    #[error(transparent)]
    Xml(#[from] xml::DocumentXmlError),
}

impl From<String> for DocumentError {
    fn from(message: String) -> Self {
        DocumentError::Invalid(message)
    }
}

/// SII document type (`TipoDTE`).
///
/// # Examples
/// ```rust
/// use dte_core::document::DocumentType;
///
/// let receipt = DocumentType::try_from(39)?;
/// assert!(receipt.is_receipt());
/// assert_eq!(receipt.envelope_root(), "EnvioBOLETA");
/// # Ok::<(), dte_core::DocumentError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum DocumentType {
    /// Factura electrónica (33).
    Invoice,
    /// Factura no afecta o exenta (34).
    ExemptInvoice,
    /// Boleta electrónica (39).
    Receipt,
    /// Boleta exenta (41).
    ExemptReceipt,
    /// Nota de débito (56).
    DebitNote,
    /// Nota de crédito (61).
    CreditNote,
}

impl DocumentType {
    pub fn code(self) -> u16 {
        match self {
            DocumentType::Invoice => 33,
            DocumentType::ExemptInvoice => 34,
            DocumentType::Receipt => 39,
            DocumentType::ExemptReceipt => 41,
            DocumentType::DebitNote => 56,
            DocumentType::CreditNote => 61,
        }
    }

    /// Receipts travel in `EnvioBOLETA` envelopes to their own endpoint.
    pub fn is_receipt(self) -> bool {
        matches!(self, DocumentType::Receipt | DocumentType::ExemptReceipt)
    }

    /// Exempt types mark every line `IndExe=1` whatever the caller asked for.
    pub fn is_exempt(self) -> bool {
        matches!(self, DocumentType::ExemptInvoice | DocumentType::ExemptReceipt)
    }

    pub fn envelope_root(self) -> &'static str {
        if self.is_receipt() {
            "EnvioBOLETA"
        } else {
            "EnvioDTE"
        }
    }

    pub fn upload_path(self) -> &'static str {
        if self.is_receipt() {
            "/DTEWS/EnvioBOLETA.jws"
        } else {
            "/DTEWS/EnvioDTE.jws"
        }
    }
}

impl TryFrom<u16> for DocumentType {
    type Error = DocumentError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            33 => Ok(DocumentType::Invoice),
            34 => Ok(DocumentType::ExemptInvoice),
            39 => Ok(DocumentType::Receipt),
            41 => Ok(DocumentType::ExemptReceipt),
            56 => Ok(DocumentType::DebitNote),
            61 => Ok(DocumentType::CreditNote),
            other => Err(DocumentError::UnsupportedType(other)),
        }
    }
}

impl From<DocumentType> for u16 {
    fn from(value: DocumentType) -> Self {
        value.code()
    }
}

impl FromStr for DocumentType {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s
            .trim()
            .parse::<u16>()
            .map_err(|_| DocumentError::Invalid(format!("document type must be numeric, got '{s}'")))?;
        DocumentType::try_from(code)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Issuing taxpayer as printed in `<Emisor>`.
///
/// # Examples
/// ```rust
/// use dte_core::document::Issuer;
///
/// let issuer = Issuer::new(
///     "76086428-5".into(),
///     "Comercial de Prueba SpA".into(),
///     "Venta al por menor".into(),
///     "Av. Siempre Viva 123".into(),
///     "Santiago".into(),
/// )?;
/// assert_eq!(issuer.rut(), "76086428-5");
/// # Ok::<(), dte_core::DocumentError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
#[validate_error(DocumentError)]
#[validate(non_empty)]
pub struct Issuer {
    #[validate(is_rut)]
    rut: String,
    business_name: String,
    activity: String,
    address: String,
    commune: String,
}

impl Issuer {
    pub fn rut(&self) -> &str {
        &self.rut
    }

    pub fn business_name(&self) -> &str {
        &self.business_name
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn commune(&self) -> &str {
        &self.commune
    }
}

/// Receiving party. Anonymous receipts use [`Recipient::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
#[validate_error(DocumentError)]
pub struct Recipient {
    #[validate(is_rut)]
    rut: String,
    #[validate(non_empty)]
    name: String,
}

impl Recipient {
    pub const ANONYMOUS_RUT: &'static str = "66666666-6";
    pub const ANONYMOUS_NAME: &'static str = "Cliente";

    pub fn rut(&self) -> &str {
        &self.rut
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for Recipient {
    fn default() -> Self {
        Self {
            rut: Self::ANONYMOUS_RUT.to_string(),
            name: Self::ANONYMOUS_NAME.to_string(),
        }
    }
}

/// Single document line.
///
/// # Examples
/// ```rust
/// use dte_core::document::LineItem;
///
/// let item = LineItem::new("Cafe", 2.0, 1000.0);
/// assert_eq!(item.amount(), 2000.0);
/// assert!(!item.exempt());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    name: String,
    quantity: f64,
    unit_price: f64,
    #[serde(default)]
    exempt: bool,
}

impl LineItem {
    pub fn new(name: impl Into<String>, quantity: f64, unit_price: f64) -> Self {
        Self {
            name: name.into(),
            quantity,
            unit_price,
            exempt: false,
        }
    }

    pub fn with_exempt(mut self, exempt: bool) -> Self {
        self.exempt = exempt;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn unit_price(&self) -> f64 {
        self.unit_price
    }

    pub fn exempt(&self) -> bool {
        self.exempt
    }

    /// Unrounded `quantity × unit_price`.
    pub fn amount(&self) -> f64 {
        self.quantity * self.unit_price
    }
}

/// Document totals in whole pesos.
///
/// Rounding happens once per aggregate, never per line.
///
/// # Examples
/// ```rust
/// use dte_core::document::{DocumentType, LineItem, Totals};
///
/// let totals = Totals::compute(DocumentType::Receipt, &[LineItem::new("Cafe", 2.0, 1000.0)]);
/// assert_eq!((totals.net(), totals.iva(), totals.total()), (2000, 380, 2380));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Totals {
    net: i64,
    exempt: i64,
    iva: i64,
    total: i64,
}

impl Totals {
    pub fn compute(document_type: DocumentType, items: &[LineItem]) -> Self {
        let (taxed, exempt) = items.iter().fold((0.0_f64, 0.0_f64), |(taxed, exempt), item| {
            if document_type.is_exempt() || item.exempt() {
                (taxed, exempt + item.amount())
            } else {
                (taxed + item.amount(), exempt)
            }
        });
        let net = round_half_up(taxed);
        let exempt = round_half_up(exempt);
        let iva = round_half_up(net as f64 * IVA_RATE);
        Self {
            net,
            exempt,
            iva,
            total: net + iva + exempt,
        }
    }

    pub fn net(&self) -> i64 {
        self.net
    }

    pub fn exempt(&self) -> i64 {
        self.exempt
    }

    pub fn iva(&self) -> i64 {
        self.iva
    }

    pub fn total(&self) -> i64 {
        self.total
    }
}

/// Halves round toward positive infinity, so `-2.5` becomes `-2`.
fn round_half_up(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_codes_round_trip() {
        for code in [33, 34, 39, 41, 56, 61] {
            let doc_type = DocumentType::try_from(code).expect("known code");
            assert_eq!(doc_type.code(), code);
            assert_eq!(doc_type.to_string(), code.to_string());
        }
        assert!(matches!(
            DocumentType::try_from(52),
            Err(DocumentError::UnsupportedType(52))
        ));
        assert!("abc".parse::<DocumentType>().is_err());
    }

    #[test]
    fn receipt_types_route_to_boleta_endpoint() {
        assert_eq!(DocumentType::Receipt.upload_path(), "/DTEWS/EnvioBOLETA.jws");
        assert_eq!(DocumentType::ExemptReceipt.envelope_root(), "EnvioBOLETA");
        assert_eq!(DocumentType::Invoice.upload_path(), "/DTEWS/EnvioDTE.jws");
        assert_eq!(DocumentType::CreditNote.envelope_root(), "EnvioDTE");
    }

    #[test]
    fn issuer_validation_rejects_bad_rut_and_blank_fields() {
        let err = Issuer::new(
            "76086428-4".into(),
            "Comercial".into(),
            "Giro".into(),
            "Calle 1".into(),
            "Santiago".into(),
        )
        .expect_err("bad check digit");
        assert!(matches!(err, DocumentError::Invalid(message) if message.contains("rut")));

        let err = Issuer::new(
            "76086428-5".into(),
            "Comercial".into(),
            " ".into(),
            "Calle 1".into(),
            "Santiago".into(),
        )
        .expect_err("blank activity");
        assert!(matches!(err, DocumentError::Invalid(message) if message.contains("activity")));
    }

    #[test]
    fn recipient_defaults_to_anonymous_customer() {
        let recipient = Recipient::default();
        assert_eq!(recipient.rut(), "66666666-6");
        assert_eq!(recipient.name(), "Cliente");
        assert!(Recipient::new("60803000-K".into(), "SII".into()).is_ok());
        assert!(Recipient::new("60803000-1".into(), "SII".into()).is_err());
    }

    #[test]
    fn totals_round_the_sum_not_each_line() {
        // rounding each 1.5 line first would give a net of 6
        let items = vec![LineItem::new("A", 1.0, 1.5); 3];
        let totals = Totals::compute(DocumentType::Receipt, &items);
        assert_eq!(totals.net(), 5);
        assert_eq!(totals.iva(), 1);
        assert_eq!(totals.total(), 6);
    }

    #[test]
    fn negative_halves_round_toward_positive_infinity() {
        let items = vec![
            LineItem::new("Cafe", 1.0, 10.0),
            LineItem::new("Descuento", 1.0, -2.5).with_exempt(true),
        ];
        let totals = Totals::compute(DocumentType::Receipt, &items);
        assert_eq!(totals.exempt(), -2);
        assert_eq!(totals.net(), 10);
        assert_eq!(totals.iva(), 2);
        assert_eq!(totals.total(), 10);
    }

    #[test]
    fn totals_split_exempt_lines() {
        let items = vec![
            LineItem::new("Afecto", 1.0, 1000.0),
            LineItem::new("Exento", 2.0, 250.0).with_exempt(true),
        ];
        let totals = Totals::compute(DocumentType::Receipt, &items);
        assert_eq!(totals.net(), 1000);
        assert_eq!(totals.exempt(), 500);
        assert_eq!(totals.iva(), 190);
        assert_eq!(totals.total(), 1690);
    }

    #[test]
    fn exempt_types_carry_no_iva() {
        let items = vec![LineItem::new("Servicio", 1.0, 1000.0)];
        let totals = Totals::compute(DocumentType::ExemptReceipt, &items);
        assert_eq!(totals.net(), 0);
        assert_eq!(totals.iva(), 0);
        assert_eq!(totals.exempt(), 1000);
        assert_eq!(totals.total(), 1000);
    }
}
