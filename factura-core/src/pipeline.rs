//! Build, sign, render and submit in one place.
//!
//! # Examples
//! ```rust,no_run
//! use std::sync::Arc;
//! use factura_core::config::{Config, SigningMaterialPaths, SolCredentials};
//! use factura_core::invoice::{DocumentSigner, Invoice};
//! use factura_core::pipeline::DocumentProcessor;
//! use factura_core::transport::SunatClient;
//!
//! # async fn run(invoice: Invoice) -> Result<(), factura_core::Error> {
//! let signer = Arc::new(DocumentSigner::from_files(&SigningMaterialPaths::default())?);
//! let processor = DocumentProcessor::new(signer, SunatClient::new(Config::default())?);
//! let creds = SolCredentials::sandbox(invoice.issuer.identity_number.clone(), "MODDATOS");
//! let submission = processor.submit(&invoice, &creds).await?;
//! println!("{}", submission.receipt().xml());
//! # Ok(())
//! # }
//! ```
use crate::{
    config::SolCredentials,
    invoice::{DocumentBuilder, DocumentSigner, Invoice},
    transport::{Receipt, SunatClient},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Build options applied to every document.
#[derive(Debug, Clone, Default)]
pub struct ProcessorOptions {
    stylesheet: Option<String>,
}

impl ProcessorOptions {
    pub fn with_stylesheet(mut self, href: impl Into<String>) -> Self {
        self.stylesheet = Some(href.into());
        self
    }

    pub fn stylesheet(&self) -> Option<&str> {
        self.stylesheet.as_deref()
    }
}

/// A signed, encoded document and the names it travels under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDocument {
    document_id: String,
    file_stem: String,
    bytes: Vec<u8>,
    content_hash: String,
    digest_value: String,
}

impl PreparedDocument {
    /// `<series>-<correlative>`.
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn file_stem(&self) -> &str {
        &self.file_stem
    }

    pub fn xml_file_name(&self) -> String {
        format!("{}.xml", self.file_stem)
    }

    pub fn zip_file_name(&self) -> String {
        format!("{}.zip", self.file_stem)
    }

    /// ISO-8859-1 bytes of the signed document.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }
}

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct Submission {
    prepared: PreparedDocument,
    receipt: Receipt,
}

impl Submission {
    pub fn prepared(&self) -> &PreparedDocument {
        &self.prepared
    }

    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }

    pub fn into_parts(self) -> (PreparedDocument, Receipt) {
        (self.prepared, self.receipt)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentProcessor {
    signer: Arc<DocumentSigner>,
    client: SunatClient,
    options: ProcessorOptions,
}

impl DocumentProcessor {
    pub fn new(signer: Arc<DocumentSigner>, client: SunatClient) -> Self {
        Self {
            signer,
            client,
            options: ProcessorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn client(&self) -> &SunatClient {
        &self.client
    }

    /// Build, sign and render `invoice`. Nothing is sent.
    ///
    /// # Errors
    /// The first failing stage's error; no partial document is returned.
    pub fn prepare(&self, invoice: &Invoice) -> Result<PreparedDocument, crate::Error> {
        let mut builder = DocumentBuilder::new(invoice);
        if let Some(href) = self.options.stylesheet() {
            builder = builder.with_stylesheet(href);
        }
        let unsigned = builder.build()?;
        let signed = self.signer.sign(unsigned)?;
        let encoded = signed.render()?;

        let prepared = PreparedDocument {
            document_id: invoice.document_id(),
            file_stem: invoice.file_stem(),
            digest_value: signed.digest_value().to_string(),
            content_hash: encoded.content_hash().to_string(),
            bytes: encoded.into_bytes(),
        };
        tracing::debug!(
            document_id = %prepared.document_id,
            content_hash = %prepared.content_hash,
            "document prepared"
        );
        Ok(prepared)
    }

    /// [`Self::prepare`] followed by `sendBill`.
    pub async fn submit(
        &self,
        invoice: &Invoice,
        credentials: &SolCredentials,
    ) -> Result<Submission, crate::Error> {
        let prepared = self.prepare(invoice)?;
        let receipt = self
            .client
            .send_bill(&prepared.file_stem, &prepared.bytes, credentials)
            .await?;
        Ok(Submission { prepared, receipt })
    }

    pub async fn submit_with_cancel(
        &self,
        invoice: &Invoice,
        credentials: &SolCredentials,
        cancel: CancellationToken,
    ) -> Result<Submission, crate::Error> {
        let prepared = self.prepare(invoice)?;
        let receipt = self
            .client
            .send_bill_with_cancel(&prepared.file_stem, &prepared.bytes, credentials, cancel)
            .await?;
        Ok(Submission { prepared, receipt })
    }
}
