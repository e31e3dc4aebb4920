use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use factura_core::config::{
    Config, EnvironmentType, SigningMaterialPaths, SolCredentials, SANDBOX_OPERATOR,
};
use factura_core::invoice::sign::{certificate_from_pem, verify_document};
use factura_core::invoice::{DocumentSigner, Invoice};
use factura_core::pipeline::{DocumentProcessor, ProcessorOptions};
use factura_core::transport::{response::extract_receipt, SunatClient};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "factura")]
#[command(about = "SUNAT electronic invoice CLI: sign, verify and send UBL documents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SigningArgs {
    #[arg(long, default_value = "./certs/private_pkcs8.key")]
    key: PathBuf,
    #[arg(long, default_value = "./certs/public.pem")]
    cert: PathBuf,
    #[arg(long)]
    stylesheet: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, sign and render an invoice given as JSON.
    Sign {
        #[arg(long)]
        invoice: PathBuf,
        #[command(flatten)]
        signing: SigningArgs,
        /// Write the signed document here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check the enveloped signature of a signed document.
    Verify {
        #[arg(long)]
        xml: PathBuf,
        #[arg(long)]
        cert: Option<PathBuf>,
    },
    /// Sign an invoice and submit it with sendBill.
    Send {
        #[arg(long)]
        invoice: PathBuf,
        #[command(flatten)]
        signing: SigningArgs,
        #[arg(long, default_value = "beta")]
        env: EnvironmentType,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Defaults to the beta sandbox username.
        #[arg(long, requires = "password")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
        /// Write the receipt here instead of stdout.
        #[arg(long)]
        receipt: Option<PathBuf>,
    },
    /// Extract the receipt from a saved sendBill response.
    Extract {
        #[arg(long)]
        response: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_invoice(path: &Path) -> Result<Invoice> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading invoice {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing invoice {}", path.display()))
}

fn processor(signing: &SigningArgs, client: SunatClient) -> Result<DocumentProcessor> {
    let signer = DocumentSigner::from_files(&SigningMaterialPaths::new(
        &signing.key,
        &signing.cert,
    ))?;
    let mut options = ProcessorOptions::default();
    if let Some(href) = &signing.stylesheet {
        options = options.with_stylesheet(href.clone());
    }
    Ok(DocumentProcessor::new(Arc::new(signer), client).with_options(options))
}

fn write_output(path: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, bytes)
            .with_context(|| format!("writing {}", path.display()))?,
        None => std::io::stdout().write_all(bytes)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sign {
            invoice,
            signing,
            output,
        } => {
            let invoice = read_invoice(&invoice)?;
            // Never contacted; prepare() only builds, signs and renders.
            let client = SunatClient::new(Config::default())?;
            let prepared = processor(&signing, client)?.prepare(&invoice)?;
            match output {
                Some(path) => {
                    write_output(Some(&path), prepared.bytes())?;
                    let summary = serde_json::json!({
                        "documentId": prepared.document_id(),
                        "fileName": prepared.xml_file_name(),
                        "digestValue": prepared.digest_value(),
                        "contentHash": prepared.content_hash(),
                    });
                    println!("{summary}");
                }
                None => write_output(None, prepared.bytes())?,
            }
        }
        Commands::Verify { xml, cert } => {
            let bytes =
                std::fs::read(&xml).with_context(|| format!("reading {}", xml.display()))?;
            let certificate = match cert {
                Some(path) => Some(certificate_from_pem(
                    &std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?,
                )?),
                None => None,
            };
            verify_document(&bytes, certificate.as_ref())?;
            println!("OK");
        }
        Commands::Send {
            invoice,
            signing,
            env,
            endpoint,
            timeout_secs,
            username,
            password,
            receipt,
        } => {
            let invoice = read_invoice(&invoice)?;
            let mut config = Config::new(env).with_timeout(Duration::from_secs(timeout_secs));
            if let Some(endpoint) = endpoint {
                config = config.with_endpoint(endpoint);
            }
            let issuer = invoice.issuer.identity_number.clone();
            let credentials = match (username, password) {
                (Some(username), Some(password)) => {
                    SolCredentials::new(issuer, username, password)
                }
                _ => SolCredentials::sandbox(issuer, SANDBOX_OPERATOR),
            };
            let processor = processor(&signing, SunatClient::new(config)?)?;
            let submission = processor.submit(&invoice, &credentials).await?;
            tracing::info!(
                document_id = %submission.prepared().document_id(),
                response_code = submission.receipt().response_code().as_deref().unwrap_or("-"),
                "document accepted for processing"
            );
            write_output(receipt.as_deref(), submission.receipt().xml().as_bytes())?;
        }
        Commands::Extract { response, output } => {
            let body = std::fs::read(&response)
                .with_context(|| format!("reading {}", response.display()))?;
            let receipt = extract_receipt(&body)?;
            write_output(output.as_deref(), receipt.xml().as_bytes())?;
        }
    }

    Ok(())
}
