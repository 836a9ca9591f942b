use chrono::{NaiveDate, NaiveDateTime};
use dte_core::caf::Authorization;
use dte_core::credential::Credential;
use dte_core::document::{DocumentBuilder, DocumentType, Issuer, LineItem};
use std::path::{Path, PathBuf};

#[allow(dead_code)]
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[allow(dead_code)]
pub fn credential() -> Credential {
    let p12 = std::fs::read(fixture_path("credential.p12")).expect("read credential fixture");
    Credential::derive(&p12, "test1234").expect("credential")
}

#[allow(dead_code)]
pub fn receipt_authorization() -> Authorization {
    let raw = std::fs::read_to_string(fixture_path("caf_39.xml")).expect("read caf fixture");
    Authorization::parse(&raw).expect("caf")
}

#[allow(dead_code)]
pub fn issuer() -> Issuer {
    Issuer::new(
        "76086428-5".into(),
        "Comercial de Prueba SpA".into(),
        "Venta al por menor".into(),
        "Av. Siempre Viva 123".into(),
        "Santiago".into(),
    )
    .expect("issuer")
}

#[allow(dead_code)]
pub fn issue_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).expect("date")
}

#[allow(dead_code)]
pub fn stamp_time() -> NaiveDateTime {
    issue_date().and_hms_opt(10, 15, 30).expect("time")
}

/// Two coffees at 1000 each, folio `folio`.
#[allow(dead_code)]
pub fn receipt_xml(folio: u64) -> String {
    DocumentBuilder::new(DocumentType::Receipt, folio, issue_date(), issuer())
        .line_item(LineItem::new("Cafe", 2.0, 1000.0))
        .build()
        .expect("build receipt")
        .into_xml()
}

/// Text between `<tag>` and `</tag>`, first occurrence.
#[allow(dead_code)]
pub fn between<'a>(xml: &'a str, open: &str, close: &str) -> &'a str {
    let start = xml.find(open).expect("open tag") + open.len();
    let end = start + xml[start..].find(close).expect("close tag");
    &xml[start..end]
}
