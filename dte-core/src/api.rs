//! SII SOAP client: seed/token handshake and envelope upload.
pub mod envelope;
pub mod soap;
pub mod token;

pub use token::{HandshakeState, TokenExchange, DRY_RUN_TOKEN};

use reqwest::{
    header::{ACCEPT, CONTENT_TYPE, COOKIE},
    redirect, Client, Identity,
};
use std::fmt;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{
    config::Config,
    credential::{Credential, CredentialError},
    document::{
        sign::{SignatureError, SignedDocument},
        xml::{decode_latin1, encode_latin1},
        DocumentError,
    },
};

/// Failures while talking to the SII or preparing the handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("SII answered {path} with an HTML page: likely missing mutual authentication or wrong endpoint")]
    HtmlResponse { path: String },
    #[error("SII answered {path} with status {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
    #[error("SII response has no <{element}> element; head: {head}")]
    MissingElement { element: &'static str, head: String },
    #[error("malformed SII response: {0}")]
    Xml(String),
    #[error("no client certificate configured")]
    MissingCredential,
    #[error("handshake step {step} needs state {expected}, current state is {current}")]
    OutOfOrder {
        step: &'static str,
        expected: &'static str,
        current: &'static str,
    },
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Failures while building or uploading a submission envelope.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(
        "upload response has no TRACKID (ESTADO={}, GLOSA={})",
        .estado.as_deref().unwrap_or("?"),
        .glosa.as_deref().unwrap_or("?")
    )]
    NoTrackId {
        estado: Option<String>,
        glosa: Option<String>,
    },
    #[error("sender identity not configured: set BILLING_RUT")]
    MissingSender,
    #[error("envelope error: {0}")]
    Envelope(String),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Session token issued by `GetTokenFromSeed`.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the dry-run sentinel.
    pub fn is_placeholder(&self) -> bool {
        self.0 == DRY_RUN_TOKEN
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(len={})", self.0.len())
    }
}

/// Submission tracking number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackId(String);

impl TrackId {
    pub(crate) fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SII web-service client.
///
/// The mutually authenticated transport and the credential are built once,
/// on first use, and shared by every later call.
///
/// # Examples
/// ```rust,no_run
/// use dte_core::api::SiiClient;
/// use dte_core::config::Config;
///
/// # async fn run() -> Result<(), dte_core::api::HandshakeError> {
/// let client = SiiClient::new(Config::from_env().expect("config"));
/// let token = client.token().await?;
/// # let _ = token;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SiiClient {
    config: Config,
    transport: OnceCell<Client>,
    credential: OnceCell<Option<Credential>>,
}

// Public API
impl SiiClient {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: OnceCell::new(),
            credential: OnceCell::new(),
        }
    }

    /// Use an already derived credential instead of the configured source.
    pub fn with_credential(config: Config, credential: Credential) -> Self {
        Self {
            config,
            transport: OnceCell::new(),
            credential: OnceCell::new_with(Some(Some(credential))),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The signing credential, derived on first call. `None` in dry-run mode.
    ///
    /// # Errors
    /// Returns [`HandshakeError::Credential`] when the configured container
    /// cannot be read or lacks a key or certificate.
    pub async fn credential(&self) -> Result<Option<&Credential>, HandshakeError> {
        let credential = self
            .credential
            .get_or_try_init(|| async {
                match self.config.certificate() {
                    Some(certificate) => {
                        let credential = Credential::load(certificate)?;
                        tracing::info!(subject = credential.subject(), "client certificate loaded");
                        Ok::<_, HandshakeError>(Some(credential))
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(credential.as_ref())
    }

    /// Run the full seed → sign → token handshake.
    pub async fn token(&self) -> Result<Token, HandshakeError> {
        TokenExchange::new(self).run().await
    }

    /// Wrap, sign and upload one signed DTE.
    pub async fn submit(&self, signed_dte: &str, token: &Token) -> Result<TrackId, SubmissionError> {
        envelope::submit(self, signed_dte, token).await
    }

    /// Obtain a token and upload the document with it.
    pub async fn send_document(&self, document: &SignedDocument) -> Result<TrackId, SubmissionError> {
        let token = self.token().await?;
        self.submit(document.xml(), &token).await
    }
}

// Private API
impl SiiClient {
    fn build_endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path.trim_start_matches('/'))
    }

    async fn transport(&self) -> Result<&Client, HandshakeError> {
        self.transport
            .get_or_try_init(|| async {
                let mut builder = Client::builder()
                    .timeout(self.config.timeout())
                    .redirect(redirect::Policy::none());
                if let Some(credential) = self.credential().await? {
                    builder = builder.identity(Identity::from_pem(&credential.identity_pem())?);
                }
                Ok::<_, HandshakeError>(builder.build()?)
            })
            .await
    }

    /// POST a SOAP envelope and return the decoded response text.
    pub(crate) async fn post_soap(
        &self,
        path: &str,
        envelope: &str,
        token: Option<&Token>,
    ) -> Result<String, HandshakeError> {
        let url = self.build_endpoint(path);
        let mut request = self
            .transport()
            .await?
            .post(&url)
            .header(CONTENT_TYPE, "text/xml; charset=ISO-8859-1")
            .header(ACCEPT, "text/xml,application/xml,text/plain")
            .header("SOAPAction", "")
            .body(encode_latin1(envelope));
        if let Some(token) = token {
            request = request.header(COOKIE, format!("TOKEN={}", token.as_str()));
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let body = match std::str::from_utf8(&bytes) {
            Ok(text) => text.to_string(),
            Err(_) => decode_latin1(&bytes),
        };
        tracing::debug!(path, status = status.as_u16(), bytes = body.len(), "SOAP response");

        if soap::is_html(&body) {
            tracing::warn!(path, head = %soap::head(&body, 200), "SII returned HTML");
            return Err(HandshakeError::HtmlResponse {
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            return Err(HandshakeError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: soap::head(&body, 400),
            });
        }
        Ok(body)
    }
}
