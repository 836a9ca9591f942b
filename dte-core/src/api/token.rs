//! Seed → signed seed → token handshake.
use serde::ser::{Serialize, SerializeStruct, Serializer};

use super::{soap, HandshakeError, SiiClient, Token};
use crate::document::sign::sign_enveloped;
use crate::document::xml::constants::SII_NS;
use crate::document::xml::{to_xml_with_format, XmlFormat};

/// Token returned when no client certificate is configured.
pub const DRY_RUN_TOKEN: &str = "TOKEN_FAKE_CERT";

const SEED_DOCUMENT_ID: &str = "GT";

/// Where a [`TokenExchange`] currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Unauthenticated,
    SeedObtained { seed: String },
    SeedSigned { signed_xml: String },
    TokenObtained { token: Token },
}

impl HandshakeState {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::Unauthenticated => "Unauthenticated",
            HandshakeState::SeedObtained { .. } => "SeedObtained",
            HandshakeState::SeedSigned { .. } => "SeedSigned",
            HandshakeState::TokenObtained { .. } => "TokenObtained",
        }
    }
}

/// Step-by-step token handshake. Each step only runs from the state the
/// previous one leaves behind.
///
/// # Examples
/// ```rust,no_run
/// use dte_core::api::{HandshakeState, SiiClient, TokenExchange};
/// use dte_core::config::Config;
///
/// # async fn run() -> Result<(), dte_core::api::HandshakeError> {
/// let client = SiiClient::new(Config::from_env().expect("config"));
/// let mut exchange = TokenExchange::new(&client);
/// exchange.request_seed().await?;
/// exchange.sign_seed().await?;
/// let token = exchange.request_token().await?;
/// assert!(matches!(exchange.state(), HandshakeState::TokenObtained { .. }));
/// # let _ = token;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TokenExchange<'a> {
    client: &'a SiiClient,
    state: HandshakeState,
}

impl<'a> TokenExchange<'a> {
    pub fn new(client: &'a SiiClient) -> Self {
        Self {
            client,
            state: HandshakeState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// `Unauthenticated → SeedObtained`.
    pub async fn request_seed(&mut self) -> Result<String, HandshakeError> {
        if !matches!(self.state, HandshakeState::Unauthenticated) {
            return Err(HandshakeError::OutOfOrder {
                step: "request_seed",
                expected: "Unauthenticated",
                current: self.state.name(),
            });
        }
        let response = self
            .client
            .post_soap(soap::SEED_PATH, &soap::seed_request(), None)
            .await?;
        let payload = soap::return_text(&response, "getSeedReturn")?;
        let seed = soap::required_inner_field(&payload, "SEMILLA")?;
        tracing::info!(seed_len = seed.len(), "seed obtained");

        self.state = HandshakeState::SeedObtained { seed: seed.clone() };
        Ok(seed)
    }

    /// `SeedObtained → SeedSigned`.
    pub async fn sign_seed(&mut self) -> Result<String, HandshakeError> {
        let seed = match &self.state {
            HandshakeState::SeedObtained { seed } => seed.clone(),
            other => {
                return Err(HandshakeError::OutOfOrder {
                    step: "sign_seed",
                    expected: "SeedObtained",
                    current: other.name(),
                })
            }
        };
        let credential = self
            .client
            .credential()
            .await?
            .ok_or(HandshakeError::MissingCredential)?;
        let signed_xml = sign_enveloped(&seed_document(&seed)?, SEED_DOCUMENT_ID, credential)?;

        self.state = HandshakeState::SeedSigned {
            signed_xml: signed_xml.clone(),
        };
        Ok(signed_xml)
    }

    /// `SeedSigned → TokenObtained`.
    pub async fn request_token(&mut self) -> Result<Token, HandshakeError> {
        let signed_xml = match &self.state {
            HandshakeState::SeedSigned { signed_xml } => signed_xml,
            other => {
                return Err(HandshakeError::OutOfOrder {
                    step: "request_token",
                    expected: "SeedSigned",
                    current: other.name(),
                })
            }
        };
        let response = self
            .client
            .post_soap(soap::TOKEN_PATH, &soap::token_request(signed_xml), None)
            .await?;
        let payload = soap::return_text(&response, "getTokenReturn")?;
        let token = Token::new(soap::required_inner_field(&payload, "TOKEN")?);
        tracing::info!(token_len = token.as_str().len(), "token obtained");

        self.state = HandshakeState::TokenObtained {
            token: token.clone(),
        };
        Ok(token)
    }

    /// Run every step. Without a configured certificate this returns
    /// [`DRY_RUN_TOKEN`] and never touches the network.
    pub async fn run(mut self) -> Result<Token, HandshakeError> {
        if self.client.credential().await?.is_none() {
            tracing::warn!("no client certificate configured; using dry-run token");
            return Ok(Token::new(DRY_RUN_TOKEN));
        }
        self.request_seed().await?;
        self.sign_seed().await?;
        self.request_token().await
    }
}

/// `<getToken ID="GT">` request document carrying the seed.
pub(crate) fn seed_document(seed: &str) -> Result<String, HandshakeError> {
    to_xml_with_format(&SeedDocumentXml(seed), XmlFormat::Compact, false)
        .map_err(|e| HandshakeError::Xml(e.to_string()))
}

struct SeedDocumentXml<'a>(&'a str);

impl Serialize for SeedDocumentXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("getToken", 4)?;
        st.serialize_field("@xmlns", SII_NS)?;
        st.serialize_field("@ID", SEED_DOCUMENT_ID)?;
        st.serialize_field("@Id", SEED_DOCUMENT_ID)?;
        st.serialize_field("item", &SeedItemXml(self.0))?;
        st.end()
    }
}

struct SeedItemXml<'a>(&'a str);

impl Serialize for SeedItemXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = serializer.serialize_struct("item", 1)?;
        st.serialize_field("Semilla", self.0)?;
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credential::Credential;
    use httpmock::{Method::POST, MockServer};
    use std::path::Path;

    fn try_start_server() -> Option<MockServer> {
        std::panic::catch_unwind(MockServer::start).ok()
    }

    fn credential() -> Credential {
        let p12 = std::fs::read(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/credential.p12"),
        )
        .expect("fixture");
        Credential::derive(&p12, "test1234").expect("credential")
    }

    fn soap_return(element: &str, payload: &str) -> String {
        let escaped = payload.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;");
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"><soapenv:Body><ns1:response xmlns:ns1="http://DefaultNamespace"><{element}>{escaped}</{element}></ns1:response></soapenv:Body></soapenv:Envelope>"#
        )
    }

    #[test]
    fn seed_document_has_fixed_identifier() {
        assert_eq!(
            seed_document("0123").expect("seed"),
            r#"<getToken xmlns="http://www.sii.cl/SiiDte" ID="GT" Id="GT"><item><Semilla>0123</Semilla></item></getToken>"#
        );
    }

    #[test]
    fn dry_run_returns_placeholder_without_network() {
        // port 9 discards; any request attempt would fail the exchange
        let client = SiiClient::new(Config::default().with_base_url("http://127.0.0.1:9"));
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let token = rt.block_on(client.token()).expect("token");
        assert_eq!(token.as_str(), DRY_RUN_TOKEN);
        assert!(token.is_placeholder());
    }

    #[test]
    fn steps_out_of_order_are_rejected() {
        let client = SiiClient::new(Config::default());
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut exchange = TokenExchange::new(&client);
            let err = exchange.request_token().await.expect_err("out of order");
            assert!(matches!(
                err,
                HandshakeError::OutOfOrder {
                    step: "request_token",
                    expected: "SeedSigned",
                    current: "Unauthenticated"
                }
            ));
            let err = exchange.sign_seed().await.expect_err("out of order");
            assert!(matches!(err, HandshakeError::OutOfOrder { step: "sign_seed", .. }));
            assert_eq!(exchange.state(), &HandshakeState::Unauthenticated);
        });
    }

    #[test]
    fn full_handshake_walks_every_state() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let seed_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/DTEWS/CrSeed.jws")
                .body_contains("<getSeed/>");
            then.status(200).header("content-type", "text/xml").body(soap_return(
                "getSeedReturn",
                r#"<?xml version="1.0" encoding="UTF-8"?><SII:RESPUESTA xmlns:SII="http://www.sii.cl/XMLSchema"><SII:RESP_BODY><SEMILLA>035297642145</SEMILLA></SII:RESP_BODY><SII:RESP_HDR><ESTADO>00</ESTADO></SII:RESP_HDR></SII:RESPUESTA>"#,
            ));
        });
        let token_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/DTEWS/GetTokenFromSeed.jws")
                .body_contains("<pszXml><![CDATA[<getToken xmlns=\"http://www.sii.cl/SiiDte\" ID=\"GT\" Id=\"GT\"><item><Semilla>035297642145</Semilla></item><Signature")
                .body_contains("<Reference URI=\"#GT\">");
            then.status(200).header("content-type", "text/xml").body(soap_return(
                "getTokenReturn",
                r#"<?xml version="1.0" encoding="UTF-8"?><SII:RESPUESTA xmlns:SII="http://www.sii.cl/XMLSchema"><SII:RESP_BODY><TOKEN>ABCDEF123456</TOKEN></SII:RESP_BODY><SII:RESP_HDR><ESTADO>00</ESTADO></SII:RESP_HDR></SII:RESPUESTA>"#,
            ));
        });

        let client = SiiClient::with_credential(
            Config::default().with_base_url(server.base_url()),
            credential(),
        );
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut exchange = TokenExchange::new(&client);
            assert_eq!(exchange.request_seed().await.expect("seed"), "035297642145");
            assert_eq!(exchange.state().name(), "SeedObtained");

            let signed = exchange.sign_seed().await.expect("signed");
            assert!(signed.ends_with("</Signature></getToken>"));
            assert_eq!(exchange.state().name(), "SeedSigned");

            let token = exchange.request_token().await.expect("token");
            assert_eq!(token.as_str(), "ABCDEF123456");
            assert_eq!(
                exchange.state(),
                &HandshakeState::TokenObtained { token }
            );
        });
        seed_mock.assert();
        token_mock.assert();
    }

    #[test]
    fn missing_token_is_reported_with_payload_head() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        server.mock(|when, then| {
            when.method(POST).path("/DTEWS/CrSeed.jws");
            then.status(200)
                .body(soap_return("getSeedReturn", "<RESP><SEMILLA>1</SEMILLA></RESP>"));
        });
        server.mock(|when, then| {
            when.method(POST).path("/DTEWS/GetTokenFromSeed.jws");
            then.status(200).body(soap_return(
                "getTokenReturn",
                "<RESP><ESTADO>-07</ESTADO><GLOSA>Firma no valida</GLOSA></RESP>",
            ));
        });

        let client = SiiClient::with_credential(
            Config::default().with_base_url(server.base_url()),
            credential(),
        );
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt.block_on(client.token()).expect_err("no token");
        match err {
            HandshakeError::MissingElement { element, head } => {
                assert_eq!(element, "TOKEN");
                assert!(head.contains("Firma no valida"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
