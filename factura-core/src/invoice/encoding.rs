//! Final rendering of signed documents in the remote service's charset.
use super::SignedDocument;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use thiserror::Error;

/// Prologue written before the canonical document.
pub const XML_PROLOGUE: &str = "<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n";

const CONTEXT_CHARS: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscodeError {
    #[error(
        "character {character:?} (U+{code:04X}) at offset {offset} has no ISO-8859-1 mapping, near \"{context}\""
    )]
    Unmappable {
        character: char,
        code: u32,
        /// Offset in characters from the start of the rendered text.
        offset: usize,
        context: String,
    },
    #[error("failed to render canonical document: {0}")]
    Render(String),
}

/// ISO-8859-1: every code point below U+0100 maps to the byte of the same value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Latin1;

impl Latin1 {
    pub const NAME: &'static str = "ISO-8859-1";

    /// Fails on the first character outside the repertoire; nothing is
    /// substituted or dropped.
    pub fn encode(text: &str) -> Result<Vec<u8>, TranscodeError> {
        let mut out = Vec::with_capacity(text.len());
        for (offset, character) in text.chars().enumerate() {
            match u8::try_from(u32::from(character)) {
                Ok(byte) => out.push(byte),
                Err(_) => {
                    return Err(TranscodeError::Unmappable {
                        character,
                        code: u32::from(character),
                        offset,
                        context: context_around(text, offset),
                    });
                }
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> String {
        bytes.iter().map(|&b| char::from(b)).collect()
    }
}

fn context_around(text: &str, offset: usize) -> String {
    let start = offset.saturating_sub(CONTEXT_CHARS);
    text.chars()
        .skip(start)
        .take(offset - start + CONTEXT_CHARS + 1)
        .collect()
}

/// Signed document bytes ready for packaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedDocument {
    bytes: Vec<u8>,
    content_hash: String,
}

impl EncodedDocument {
    fn new(bytes: Vec<u8>) -> Self {
        let content_hash = hex_sha256(&bytes);
        Self {
            bytes,
            content_hash,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Lowercase hex SHA-256 of [`Self::bytes`].
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn charset(&self) -> &'static str {
        Latin1::NAME
    }

    /// The document text, decoded back from its single-byte form.
    pub fn to_text(&self) -> String {
        Latin1::decode(&self.bytes)
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    let mut hex = String::with_capacity(hash.len() * 2);
    for byte in hash {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

impl SignedDocument {
    /// Canonical form of the signed tree behind [`XML_PROLOGUE`], transcoded
    /// to ISO-8859-1.
    pub fn render(&self) -> Result<EncodedDocument, TranscodeError> {
        let canonical = self
            .canonical_xml()
            .map_err(|e| TranscodeError::Render(e.to_string()))?;
        let mut text = String::with_capacity(XML_PROLOGUE.len() + canonical.len());
        text.push_str(XML_PROLOGUE);
        text.push_str(&canonical);

        let encoded = EncodedDocument::new(Latin1::encode(&text)?);
        tracing::debug!(
            signature_id = %self.signature_id(),
            bytes = encoded.bytes().len(),
            content_hash = %encoded.content_hash(),
            "rendered signed document"
        );
        Ok(encoded)
    }
}
