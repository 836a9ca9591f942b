//! Enveloped XML-DSig signatures (RSA-SHA1, exclusive c14n).
//!
//! The signature is spliced into the original text so nothing outside the
//! inserted `<Signature>` changes.
use base64ct::{Base64, Encoding};
use libxml::{parser::Parser, tree::c14n};
use quick_xml::escape::escape;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::credential::Credential;
use crate::document::xml::constants::{
    DS_NS, ENVELOPED_SIGNATURE_TRANSFORM, EXC_C14N_ALGORITHM, RSA_SHA1_ALGORITHM, SHA1_ALGORITHM,
};
use crate::document::xml::{attribute_value, find_element, to_xml_with_format, XmlFormat};

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("no element carries ID or Id \"{id}\"")]
    TargetNotFound { id: String },
    #[error("XML error: {0}")]
    Xml(String),
    #[error("canonicalization failed: {0}")]
    Canonicalization(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A DTE carrying both its TED stamp and its XML signature.
#[derive(Debug, Clone)]
pub struct SignedDocument {
    xml: String,
    document_type: u16,
    reference_id: String,
}

impl SignedDocument {
    pub(crate) fn new(xml: String, document_type: u16, reference_id: String) -> Self {
        Self {
            xml,
            document_type,
            reference_id,
        }
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn document_type(&self) -> u16 {
        self.document_type
    }

    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }
}

/// Sign the element whose `ID` or `Id` attribute equals `target_id` and
/// append the `<Signature>` as its last child.
///
/// # Errors
/// Returns [`SignatureError::TargetNotFound`] when no element carries the id.
///
/// # Examples
/// ```rust,no_run
/// use dte_core::credential::Credential;
/// use dte_core::document::sign::sign_enveloped;
///
/// let p12 = std::fs::read("credential.p12")?;
/// let credential = Credential::derive(&p12, "secret")?;
/// let xml = r#"<getToken xmlns="http://www.sii.cl/SiiDte" ID="GT"><item><Semilla>1</Semilla></item></getToken>"#;
/// let signed = sign_enveloped(xml, "GT", &credential)?;
/// assert!(signed.contains("<Reference URI=\"#GT\">"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn sign_enveloped(
    xml: &str,
    target_id: &str,
    credential: &Credential,
) -> Result<String, SignatureError> {
    let span = find_element(xml, |start| {
        attribute_value(start, b"ID").as_deref() == Some(target_id)
            || attribute_value(start, b"Id").as_deref() == Some(target_id)
    })
    .map_err(|e| SignatureError::Xml(e.to_string()))?
    .ok_or_else(|| SignatureError::TargetNotFound {
        id: target_id.to_string(),
    })?;

    let element = &xml[span.start..span.end];
    let standalone = with_namespaces(element, &span.qname, &span.inherited_namespaces);
    let digest = Base64::encode_string(&Sha1::digest(exclusive_c14n(&standalone)?.as_bytes()));

    let signed_info = to_xml_with_format(
        &SignedInfoXml {
            reference_uri: format!("#{target_id}"),
            digest_value: &digest,
        },
        XmlFormat::Compact,
        false,
    )
    .map_err(|e| SignatureError::Xml(e.to_string()))?;
    let canonical_signed_info = exclusive_c14n(&with_namespaces(
        &signed_info,
        "SignedInfo",
        &[("xmlns".to_string(), DS_NS.to_string())],
    ))?;
    let signature_value = rsa_sha1_base64(credential.private_key(), canonical_signed_info.as_bytes())
        .map_err(|e| SignatureError::Signing(e.to_string()))?;

    let key_info = to_xml_with_format(&KeyInfoXml(credential), XmlFormat::Compact, false)
        .map_err(|e| SignatureError::Xml(e.to_string()))?;
    let signature = format!(
        r#"<Signature xmlns="{DS_NS}">{signed_info}<SignatureValue>{signature_value}</SignatureValue>{key_info}</Signature>"#
    );

    tracing::debug!(target_id, digest = %digest, "enveloped signature computed");

    let mut out = String::with_capacity(xml.len() + signature.len() + span.qname.len() + 3);
    match span.close_start {
        Some(close_start) => {
            out.push_str(&xml[..close_start]);
            out.push_str(&signature);
            out.push_str(&xml[close_start..]);
        }
        None => {
            // `<x .../>` becomes `<x ...>{signature}</x>`
            let tag_body = xml[span.start..span.end]
                .trim_end_matches('>')
                .trim_end_matches('/')
                .trim_end();
            out.push_str(&xml[..span.start]);
            out.push_str(tag_body);
            out.push('>');
            out.push_str(&signature);
            out.push_str("</");
            out.push_str(&span.qname);
            out.push('>');
            out.push_str(&xml[span.end..]);
        }
    }
    Ok(out)
}

/// PKCS#1 v1.5 signature over SHA-1 of `data`, base64 encoded.
pub(crate) fn rsa_sha1_base64(key: &RsaPrivateKey, data: &[u8]) -> Result<String, rsa::Error> {
    let hashed = Sha1::digest(data);
    let signature = key.sign(Pkcs1v15Sign::new::<Sha1>(), &hashed)?;
    Ok(Base64::encode_string(&signature))
}

/// Exclusive XML canonicalization 1.0 without comments.
pub(crate) fn exclusive_c14n(xml: &str) -> Result<String, SignatureError> {
    let doc = Parser::default()
        .parse_string(xml)
        .map_err(|e| SignatureError::Canonicalization(format!("XML parse error: {e:?}")))?;
    let canon_opts = c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::ExclusiveCanonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    };
    doc.canonicalize(canon_opts, None)
        .map_err(|e| SignatureError::Canonicalization(format!("Failed to canonicalize xml: {e:?}")))
}

/// Re-declare inherited namespaces on a detached element so it parses with
/// the same names it had in place.
fn with_namespaces(element: &str, qname: &str, namespaces: &[(String, String)]) -> String {
    if namespaces.is_empty() {
        return element.to_string();
    }
    let insert_at = 1 + qname.len();
    let mut out = String::with_capacity(element.len() + 64 * namespaces.len());
    out.push_str(&element[..insert_at]);
    for (name, value) in namespaces {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape(value.as_str()));
        out.push('"');
    }
    out.push_str(&element[insert_at..]);
    out
}

struct AlgorithmXml(&'static str, &'static str);

impl Serialize for AlgorithmXml {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct(self.0, 1)?;
        st.serialize_field("@Algorithm", self.1)?;
        st.end()
    }
}

struct SignedInfoXml<'a> {
    reference_uri: String,
    digest_value: &'a str,
}

impl Serialize for SignedInfoXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("SignedInfo", 3)?;
        st.serialize_field(
            "CanonicalizationMethod",
            &AlgorithmXml("CanonicalizationMethod", EXC_C14N_ALGORITHM),
        )?;
        st.serialize_field(
            "SignatureMethod",
            &AlgorithmXml("SignatureMethod", RSA_SHA1_ALGORITHM),
        )?;
        st.serialize_field("Reference", &ReferenceXml(self))?;
        st.end()
    }
}

struct ReferenceXml<'a>(&'a SignedInfoXml<'a>);

impl Serialize for ReferenceXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("Reference", 4)?;
        st.serialize_field("@URI", &self.0.reference_uri)?;
        st.serialize_field("Transforms", &TransformsXml)?;
        st.serialize_field("DigestMethod", &AlgorithmXml("DigestMethod", SHA1_ALGORITHM))?;
        st.serialize_field("DigestValue", self.0.digest_value)?;
        st.end()
    }
}

struct TransformsXml;

impl Serialize for TransformsXml {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("Transforms", 2)?;
        st.serialize_field(
            "Transform",
            &AlgorithmXml("Transform", ENVELOPED_SIGNATURE_TRANSFORM),
        )?;
        st.serialize_field("Transform", &AlgorithmXml("Transform", EXC_C14N_ALGORITHM))?;
        st.end()
    }
}

/// Plain, unprefixed key material: RSA key value then the certificate.
struct KeyInfoXml<'a>(&'a Credential);

impl Serialize for KeyInfoXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("KeyInfo", 2)?;
        st.serialize_field("KeyValue", &KeyValueXml(self.0))?;
        st.serialize_field("X509Data", &X509DataXml(self.0))?;
        st.end()
    }
}

struct KeyValueXml<'a>(&'a Credential);

impl Serialize for KeyValueXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("KeyValue", 1)?;
        st.serialize_field("RSAKeyValue", &RsaKeyValueXml(self.0))?;
        st.end()
    }
}

struct RsaKeyValueXml<'a>(&'a Credential);

impl Serialize for RsaKeyValueXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("RSAKeyValue", 2)?;
        st.serialize_field("Modulus", &self.0.modulus_base64())?;
        st.serialize_field("Exponent", &self.0.exponent_base64())?;
        st.end()
    }
}

struct X509DataXml<'a>(&'a Credential);

impl Serialize for X509DataXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("X509Data", 1)?;
        st.serialize_field("X509Certificate", &self.0.certificate_base64())?;
        st.end()
    }
}
