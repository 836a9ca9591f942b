//! `EnvioDTE` / `EnvioBOLETA` submission envelopes.
use chrono::{Local, NaiveDateTime};
use serde::ser::{Serialize, SerializeStruct, Serializer};

use super::{soap, HandshakeError, SiiClient, SubmissionError, Token, TrackId};
use crate::config::SenderConfig;
use crate::credential::Credential;
use crate::document::sign::{sign_enveloped, SignatureError};
use crate::document::stamp::TIMESTAMP_FORMAT;
use crate::document::xml::constants::SII_NS;
use crate::document::xml::parse::parse_document_type;
use crate::document::xml::{find_element, strip_xml_declaration, to_xml_with_format, XmlFormat};
use crate::document::DocumentType;

/// Identifier the envelope signature references.
pub const ENVELOPE_ID: &str = "ENV";

const SET_ID: &str = "SetDoc";
/// The SII itself is always the addressee of a submission.
const SII_RUT: &str = "60803000-K";

/// Wrap one signed DTE in an unsigned envelope.
///
/// The root element follows the document type found inside `signed_dte`,
/// which is embedded byte for byte minus its XML declaration.
pub fn build_envelope(
    signed_dte: &str,
    sender: &SenderConfig,
    signed_at: NaiveDateTime,
) -> Result<String, SubmissionError> {
    let code = parse_document_type(signed_dte).map_err(|e| SubmissionError::Envelope(e.to_string()))?;
    let document_type = DocumentType::try_from(code)?;
    let timestamp = signed_at.format(TIMESTAMP_FORMAT).to_string();

    let shell = to_xml_with_format(
        &EnvelopeXml {
            document_type,
            sender,
            timestamp: &timestamp,
        },
        XmlFormat::Pretty {
            indent_char: ' ',
            indent_size: 2,
        },
        true,
    )
    .map_err(|e| SubmissionError::Envelope(e.to_string()))?;

    let set_close = find_element(&shell, |start| start.local_name().as_ref() == b"SetDTE")
        .map_err(|e| SubmissionError::Envelope(e.to_string()))?
        .and_then(|span| span.close_start)
        .ok_or_else(|| SubmissionError::Envelope("envelope has no SetDTE".into()))?;

    let dte = strip_xml_declaration(signed_dte).trim();
    let mut out = String::with_capacity(shell.len() + dte.len() + 8);
    out.push_str(&shell[..set_close]);
    out.push_str(dte);
    out.push('\n');
    out.push_str(&shell[set_close..]);
    Ok(out)
}

/// Sign an envelope against [`ENVELOPE_ID`].
pub fn sign_envelope(envelope: &str, credential: &Credential) -> Result<String, SignatureError> {
    sign_enveloped(envelope, ENVELOPE_ID, credential)
}

/// SOAP `upload` body carrying a signed envelope.
pub fn upload_body(signed_envelope: &str) -> String {
    soap::upload_request(signed_envelope)
}

/// Build and sign the envelope for `signed_dte`, then wrap it for upload.
pub fn prepare_upload(
    signed_dte: &str,
    sender: &SenderConfig,
    credential: &Credential,
    signed_at: NaiveDateTime,
) -> Result<String, SubmissionError> {
    let envelope = build_envelope(signed_dte, sender, signed_at)?;
    let signed = sign_envelope(&envelope, credential)?;
    Ok(upload_body(&signed))
}

/// Tracking number from an `upload` response.
///
/// # Errors
/// [`SubmissionError::NoTrackId`] carries the `ESTADO` and `GLOSA` the SII
/// sent back instead. Without a `GLOSA`, the head of the reply stands in.
pub fn extract_track_id(response: &str) -> Result<TrackId, SubmissionError> {
    let payload = soap::return_text(response, "uploadReturn")?;
    match soap::inner_field(&payload, "TRACKID") {
        Some(id) if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) => Ok(TrackId::new(id)),
        _ => Err(SubmissionError::NoTrackId {
            estado: soap::inner_field(&payload, "ESTADO"),
            glosa: soap::inner_field(&payload, "GLOSA")
                .or_else(|| Some(soap::head(&payload, 200))),
        }),
    }
}

pub(crate) async fn submit(
    client: &SiiClient,
    signed_dte: &str,
    token: &Token,
) -> Result<TrackId, SubmissionError> {
    let sender = client.config().sender().ok_or(SubmissionError::MissingSender)?;
    let credential = client
        .credential()
        .await?
        .ok_or(HandshakeError::MissingCredential)?;

    let code = parse_document_type(signed_dte).map_err(|e| SubmissionError::Envelope(e.to_string()))?;
    let path = DocumentType::try_from(code)?.upload_path();
    let body = prepare_upload(signed_dte, sender, credential, Local::now().naive_local())?;

    let response = client.post_soap(path, &body, Some(token)).await?;
    let track_id = extract_track_id(&response)?;
    tracing::info!(track_id = %track_id, path, "envelope accepted");
    Ok(track_id)
}

struct EnvelopeXml<'a> {
    document_type: DocumentType,
    sender: &'a SenderConfig,
    timestamp: &'a str,
}

impl Serialize for EnvelopeXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct(self.document_type.envelope_root(), 5)?;
        st.serialize_field("@xmlns", SII_NS)?;
        st.serialize_field("@version", "1.0")?;
        st.serialize_field("@ID", ENVELOPE_ID)?;
        st.serialize_field("@Id", ENVELOPE_ID)?;
        st.serialize_field("SetDTE", &SetDteXml(self))?;
        st.end()
    }
}

struct SetDteXml<'a>(&'a EnvelopeXml<'a>);

impl Serialize for SetDteXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("SetDTE", 3)?;
        st.serialize_field("@ID", SET_ID)?;
        st.serialize_field("@Id", SET_ID)?;
        st.serialize_field("Caratula", &CaratulaXml(self.0))?;
        st.end()
    }
}

struct CaratulaXml<'a>(&'a EnvelopeXml<'a>);

impl Serialize for CaratulaXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let envelope = self.0;
        let mut st = serializer.serialize_struct("Caratula", 8)?;
        st.serialize_field("@version", "1.0")?;
        st.serialize_field("RutEmisor", envelope.sender.rut_emisor())?;
        st.serialize_field("RutEnvia", envelope.sender.rut_envia())?;
        st.serialize_field("RutReceptor", SII_RUT)?;
        st.serialize_field("FchResol", envelope.sender.resolution_date())?;
        st.serialize_field("NroResol", &envelope.sender.resolution_number())?;
        st.serialize_field("TmstFirmaEnv", envelope.timestamp)?;
        st.serialize_field(
            "SubTotDTE",
            &SubTotalXml {
                document_type: envelope.document_type,
            },
        )?;
        st.end()
    }
}

struct SubTotalXml {
    document_type: DocumentType,
}

impl Serialize for SubTotalXml {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("SubTotDTE", 2)?;
        st.serialize_field("TpoDTE", &self.document_type.code())?;
        st.serialize_field("NroDTE", &1u32)?;
        st.end()
    }
}
