use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use dte_core::api::envelope;
use dte_core::api::SiiClient;
use dte_core::caf::{Authorization, CafSource};
use dte_core::config::Config;
use dte_core::credential::Credential;
use dte_core::document::stamp::{Stamper, TIMESTAMP_FORMAT};
use dte_core::document::xml::{decode_latin1, encode_latin1};
use dte_core::document::{
    BuiltDocument, DocumentBuilder, DocumentType, Issuer, LineItem, Recipient,
};
use dte_core::document::sign::SignedDocument;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dte")]
#[command(about = "Build, stamp, sign and submit SII electronic tax documents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the unsigned DTE for an invoice JSON file.
    Build {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Build, stamp with the CAF and sign with the configured certificate.
    Stamp {
        #[command(flatten)]
        stamp: StampArgs,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the seed/token handshake and print the token.
    Token,
    /// Build, stamp, sign and upload; prints the track id.
    Send {
        #[command(flatten)]
        stamp: StampArgs,
    },
    /// Print the SOAP upload body for an already signed DTE.
    Envelope {
        #[arg(long)]
        signed: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct StampArgs {
    #[arg(long)]
    input: PathBuf,
    /// CAF file; defaults to CAF_<type>_B64 / CAF_<type>_PATH.
    #[arg(long)]
    caf: Option<PathBuf>,
    /// Reject folios outside the CAF range.
    #[arg(long)]
    folio_check: bool,
    /// Stamp time as YYYY-MM-DDTHH:MM:SS; defaults to now.
    #[arg(long, value_parser = parse_timestamp)]
    timestamp: Option<NaiveDateTime>,
}

/// Invoice payload accepted by `build`, `stamp` and `send`.
#[derive(Debug, Deserialize)]
struct InvoiceInput {
    document_type: DocumentType,
    folio: u64,
    issue_date: Option<NaiveDate>,
    issuer: IssuerInput,
    recipient: Option<RecipientInput>,
    items: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
struct IssuerInput {
    rut: String,
    business_name: String,
    activity: String,
    address: String,
    commune: String,
}

#[derive(Debug, Deserialize)]
struct RecipientInput {
    rut: String,
    name: String,
}

impl InvoiceInput {
    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading invoice {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing invoice {}", path.display()))
    }

    fn build(self) -> Result<BuiltDocument> {
        let issuer = Issuer::new(
            self.issuer.rut,
            self.issuer.business_name,
            self.issuer.activity,
            self.issuer.address,
            self.issuer.commune,
        )
        .context("invalid issuer")?;
        let recipient = match self.recipient {
            Some(recipient) => {
                Recipient::new(recipient.rut, recipient.name).context("invalid recipient")?
            }
            None => Recipient::default(),
        };
        let issue_date = self.issue_date.unwrap_or_else(|| Local::now().date_naive());

        DocumentBuilder::new(self.document_type, self.folio, issue_date, issuer)
            .recipient(recipient)
            .line_items(self.items)
            .build()
            .context("building document")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build { input, output } => {
            let built = InvoiceInput::read(&input)?.build()?;
            let totals = built.totals();
            eprintln!(
                "net={} exempt={} iva={} total={}",
                totals.net(),
                totals.exempt(),
                totals.iva(),
                totals.total()
            );
            write_output(output.as_deref(), built.xml())?;
        }
        Commands::Stamp { stamp, output } => {
            let client = SiiClient::new(load_config()?);
            let signed = stamp_and_sign(&client, &stamp).await?;
            write_output(output.as_deref(), signed.xml())?;
        }
        Commands::Token => {
            let client = SiiClient::new(load_config()?);
            let token = client.token().await.context("token handshake failed")?;
            tracing::info!(
                token_len = token.as_str().len(),
                dry_run = token.is_placeholder(),
                "token ready"
            );
            println!("{}", token.as_str());
        }
        Commands::Send { stamp } => {
            let client = SiiClient::new(load_config()?);
            let signed = stamp_and_sign(&client, &stamp).await?;
            let track_id = client
                .send_document(&signed)
                .await
                .context("submission failed")?;
            tracing::info!(
                track_id = %track_id,
                reference_id = signed.reference_id(),
                "document submitted"
            );
            println!("{track_id}");
        }
        Commands::Envelope { signed, output } => {
            let client = SiiClient::new(load_config()?);
            let bytes = std::fs::read(&signed)
                .with_context(|| format!("reading signed DTE {}", signed.display()))?;
            let sender = client
                .config()
                .sender()
                .context("sender identity not configured: set BILLING_RUT")?;
            let credential = require_credential(&client).await?;
            let body = envelope::prepare_upload(
                &decode_latin1(&bytes),
                sender,
                credential,
                Local::now().naive_local(),
            )
            .context("preparing upload body")?;
            write_output(output.as_deref(), &body)?;
        }
    }

    Ok(())
}

fn load_config() -> Result<Config> {
    Config::from_env().context("reading configuration from the environment")
}

async fn require_credential(client: &SiiClient) -> Result<&Credential> {
    match client.credential().await.context("loading client certificate")? {
        Some(credential) => Ok(credential),
        None => bail!("no client certificate configured: set SII_CERT_P12_PATH or SII_CERT_P12_B64 and SII_CERT_PASSWORD"),
    }
}

async fn stamp_and_sign(client: &SiiClient, args: &StampArgs) -> Result<SignedDocument> {
    let built = InvoiceInput::read(&args.input)?.build()?;
    let caf = load_caf(args.caf.as_deref(), built.document_type())?;
    if caf.document_type() != built.document_type().code() {
        bail!(
            "CAF authorizes type {}, document is type {}",
            caf.document_type(),
            built.document_type()
        );
    }

    let stamper = Stamper::new(&caf).with_folio_check(args.folio_check);
    let stamped = match args.timestamp {
        Some(at) => stamper.stamp_at(built.xml(), at),
        None => stamper.stamp(built.xml()),
    }
    .context("stamping document")?;

    let credential = require_credential(client).await?;
    stamped.sign(credential).context("signing document")
}

fn load_caf(path: Option<&Path>, document_type: DocumentType) -> Result<Authorization> {
    let source = match path {
        Some(path) => CafSource::Path(path.to_path_buf()),
        None => CafSource::from_env(document_type).context("locating CAF")?,
    };
    source.load().context("loading CAF")
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
}

/// Output is written as ISO-8859-1 to match the XML declaration.
fn write_output(path: Option<&Path>, xml: &str) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, encode_latin1(xml))
            .with_context(|| format!("writing {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&encode_latin1(xml))?;
            stdout.write_all(b"\n")?;
            stdout.flush().context("writing to stdout")
        }
    }
}
