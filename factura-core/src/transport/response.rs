//! Extraction of the receipt (CDR) from a `sendBill` response.
use super::archive::{self, ArchiveError};
use crate::invoice::encoding::Latin1;
use crate::invoice::xml::parse_strict;
use base64ct::{Base64, Encoding};
use libxml::{tree::Document, xpath};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("response is not well-formed XML: {0}")]
    MalformedXml(String),
    #[error("SOAP fault {code}: {message}")]
    Fault { code: String, message: String },
    #[error("response has no applicationResponse element")]
    MissingPayload,
    #[error("applicationResponse is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("receipt archive cannot be opened: {0}")]
    Archive(String),
    #[error("receipt archive has no .xml entry")]
    MissingReceiptEntry,
}

impl From<ArchiveError> for ExtractionError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::NoXmlEntry => ExtractionError::MissingReceiptEntry,
            other => ExtractionError::Archive(other.to_string()),
        }
    }
}

/// Receipt document returned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    entry_name: String,
    xml: String,
}

impl Receipt {
    pub fn new(entry_name: impl Into<String>, xml: impl Into<String>) -> Self {
        Self {
            entry_name: entry_name.into(),
            xml: xml.into(),
        }
    }

    /// Name of the archive entry the receipt was read from.
    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    /// `cbc:ResponseCode` of the receipt, `0` meaning accepted.
    pub fn response_code(&self) -> Option<String> {
        self.first_text("ResponseCode")
    }

    pub fn description(&self) -> Option<String> {
        self.first_text("Description")
    }

    fn first_text(&self, local_name: &str) -> Option<String> {
        let doc = parse_strict(self.xml.as_bytes()).ok()?;
        first_text_by_local_name(&doc, local_name).ok().flatten()
    }
}

fn first_text_by_local_name(
    doc: &Document,
    local_name: &str,
) -> Result<Option<String>, ExtractionError> {
    let ctx = xpath::Context::new(doc)
        .map_err(|e| ExtractionError::MalformedXml(format!("XPath context error: {e:?}")))?;
    let nodes = ctx
        .evaluate(&format!("//*[local-name()='{local_name}']"))
        .map_err(|e| ExtractionError::MalformedXml(format!("XPath error: {e:?}")))?
        .get_nodes_as_vec();
    Ok(nodes.first().map(|node| node.get_content().trim().to_string()))
}

/// Fault code and text, when the response carries a SOAP fault.
pub(crate) fn find_fault(doc: &Document) -> Result<Option<(String, String)>, ExtractionError> {
    let Some(message) = first_text_by_local_name(doc, "faultstring")? else {
        return Ok(None);
    };
    let code = first_text_by_local_name(doc, "faultcode")?.unwrap_or_default();
    Ok(Some((code, message)))
}

pub(crate) fn parse_response(body: &[u8]) -> Result<Document, ExtractionError> {
    parse_strict(body).map_err(ExtractionError::MalformedXml)
}

/// Receipt text from a raw `sendBill` response body.
///
/// # Errors
/// A fault element yields [`ExtractionError::Fault`] carrying its text; each
/// other failure (XML, missing element, base64, archive, entry) has its own
/// variant.
pub fn extract_receipt(body: &[u8]) -> Result<Receipt, ExtractionError> {
    let doc = parse_response(body)?;
    if let Some((code, message)) = find_fault(&doc)? {
        return Err(ExtractionError::Fault { code, message });
    }

    let payload =
        first_text_by_local_name(&doc, "applicationResponse")?.ok_or(ExtractionError::MissingPayload)?;
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let zipped =
        Base64::decode_vec(&compact).map_err(|e| ExtractionError::InvalidBase64(format!("{e:?}")))?;
    let entry = archive::read_first_xml(&zipped)?;

    let xml = match String::from_utf8(entry.bytes) {
        Ok(text) => text,
        Err(err) => Latin1::decode(err.as_bytes()),
    };
    Ok(Receipt::new(entry.name, xml))
}
