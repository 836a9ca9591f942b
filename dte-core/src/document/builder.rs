use super::xml::{ToXml, XmlFormat};
use super::{DocumentError, DocumentType, Issuer, LineItem, Recipient, Totals};
use chrono::NaiveDate;

/// Logical document content.
#[derive(Debug, Clone)]
pub(crate) struct DocumentData {
    pub(crate) document_type: DocumentType,
    pub(crate) folio: u64,
    pub(crate) issue_date: NaiveDate,
    pub(crate) issuer: Issuer,
    pub(crate) recipient: Recipient,
    pub(crate) items: Vec<LineItem>,
}

/// Canonical DTE text plus the totals it declares.
#[derive(Debug, Clone)]
pub struct BuiltDocument {
    data: DocumentData,
    totals: Totals,
    xml: String,
}

pub struct DocumentBuilder {
    document: DocumentData,
}

impl DocumentBuilder {
    pub fn new(
        document_type: DocumentType,
        folio: u64,
        issue_date: NaiveDate,
        issuer: Issuer,
    ) -> Self {
        Self {
            document: DocumentData {
                document_type,
                folio,
                issue_date,
                issuer,
                recipient: Recipient::default(),
                items: Vec::new(),
            },
        }
    }

    pub fn recipient(mut self, recipient: Recipient) -> Self {
        self.document.recipient = recipient;
        self
    }

    pub fn line_item(mut self, item: LineItem) -> Self {
        self.document.items.push(item);
        self
    }

    pub fn line_items(mut self, items: impl IntoIterator<Item = LineItem>) -> Self {
        self.document.items.extend(items);
        self
    }

    /// Compute totals and render the canonical document.
    ///
    /// # Errors
    /// Returns [`DocumentError`] when the folio is zero, there are no lines,
    /// or a line has a blank name or a non-finite amount.
    pub fn build(self) -> Result<BuiltDocument, DocumentError> {
        let document = self.document;
        if document.folio == 0 {
            return Err(DocumentError::InvalidFolio);
        }
        if document.items.is_empty() {
            return Err(DocumentError::MissingLineItems);
        }
        for (index, item) in document.items.iter().enumerate() {
            if item.name().trim().is_empty() {
                return Err(DocumentError::EmptyItemName { index });
            }
            if !item.quantity().is_finite() {
                return Err(DocumentError::InvalidAmount {
                    index,
                    field: "quantity",
                });
            }
            if !item.unit_price().is_finite() {
                return Err(DocumentError::InvalidAmount {
                    index,
                    field: "unit_price",
                });
            }
        }

        let totals = Totals::compute(document.document_type, &document.items);
        let mut built = BuiltDocument {
            data: document,
            totals,
            xml: String::new(),
        };
        built.xml = built.to_xml()?;
        tracing::debug!(
            document_type = built.data.document_type.code(),
            folio = built.data.folio,
            total = built.totals.total(),
            "document built"
        );
        Ok(built)
    }
}

impl BuiltDocument {
    pub(crate) fn data(&self) -> &DocumentData {
        &self.data
    }

    pub fn document_type(&self) -> DocumentType {
        self.data.document_type
    }

    pub fn folio(&self) -> u64 {
        self.data.folio
    }

    pub fn issue_date(&self) -> NaiveDate {
        self.data.issue_date
    }

    pub fn issuer(&self) -> &Issuer {
        &self.data.issuer
    }

    pub fn recipient(&self) -> &Recipient {
        &self.data.recipient
    }

    pub fn items(&self) -> &[LineItem] {
        &self.data.items
    }

    pub fn totals(&self) -> &Totals {
        &self.totals
    }

    /// Identifier of the `<Documento>` element, `R<folio>`.
    pub fn reference_id(&self) -> String {
        format!("R{}", self.data.folio)
    }

    /// Canonical document text, two-space indented.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn to_compact_xml(&self) -> Result<String, DocumentError> {
        Ok(self.to_xml_with_format(XmlFormat::Compact)?)
    }
}
