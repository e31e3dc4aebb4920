use crate::config::SigningMaterialPaths;
use crate::invoice::xml::constants::{
    C14N_1_0, C14N_1_0_WITH_COMMENTS, DS_NS, EXT_NS, RSA_SHA1, SHA1,
};
use crate::invoice::xml::{SignatureSlots, UnsignedDocument, parse_strict};
use base64ct::{Base64, Encoding};
use libxml::{
    tree::Node,
    tree::{Document, c14n},
    xpath,
};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use thiserror::Error;
use x509_cert::{
    Certificate,
    der::{Decode, DecodePem, Encode},
};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("private key parse error: {0}")]
    Key(String),
    #[error("certificate parse error: {0}")]
    Certificate(String),
    #[error("private key does not match the certificate public key")]
    KeyMismatch,
    #[error("signature placeholder: {0}")]
    Placeholder(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature placeholder is already filled")]
    AlreadySigned,
    #[error("canonicalization failed: {0}")]
    Canonicalization(String),
    #[error("XML error: {0}")]
    Xml(String),
    #[error("signature computation failed: {0}")]
    Crypto(String),
    #[error("digest mismatch: declared {declared}, computed {computed}")]
    DigestMismatch { declared: String, computed: String },
    #[error("signature value does not verify: {0}")]
    InvalidSignature(String),
}

/// RSA key and X.509 certificate used to fill the signature placeholder.
///
/// Loaded once and shared; holds no document state.
///
/// # Examples
/// ```rust,no_run
/// use std::sync::Arc;
/// use factura_core::config::SigningMaterialPaths;
/// use factura_core::invoice::DocumentSigner;
///
/// let signer = Arc::new(DocumentSigner::from_files(&SigningMaterialPaths::default())?);
/// # let _ = signer;
/// # Ok::<(), factura_core::invoice::SigningError>(())
/// ```
pub struct DocumentSigner {
    certificate: Certificate,
    certificate_b64: String,
    signing_key: SigningKey<Sha1>,
}

impl std::fmt::Debug for DocumentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSigner")
            .field(
                "subject",
                &self.certificate.tbs_certificate.subject.to_string(),
            )
            .finish_non_exhaustive()
    }
}

impl DocumentSigner {
    pub fn from_der(cert_der: &[u8], private_key_der: &[u8]) -> Result<Self, SigningError> {
        let certificate = Certificate::from_der(cert_der)
            .map_err(|e| SigningError::Certificate(format!("{e:?}")))?;
        let private_key = RsaPrivateKey::from_pkcs8_der(private_key_der)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(private_key_der))
            .map_err(|e| SigningError::Key(format!("{e:?}")))?;
        Self::from_parts(certificate, private_key)
    }

    /// Accepts a PKCS#8 (`PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`) key.
    pub fn from_pem(cert_pem: &str, private_key_pem: &str) -> Result<Self, SigningError> {
        let certificate = certificate_from_pem(cert_pem)?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| SigningError::Key(format!("{e:?}")))?;
        Self::from_parts(certificate, private_key)
    }

    pub fn from_files(paths: &SigningMaterialPaths) -> Result<Self, SigningError> {
        let read = |path: &std::path::Path| {
            std::fs::read_to_string(path).map_err(|source| SigningError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        let key_pem = read(paths.key())?;
        let cert_pem = read(paths.certificate())?;
        let signer = Self::from_pem(&cert_pem, &key_pem)?;
        tracing::debug!(certificate = %paths.certificate().display(), "loaded signing material");
        Ok(signer)
    }

    fn from_parts(certificate: Certificate, private_key: RsaPrivateKey) -> Result<Self, SigningError> {
        let cert_public_key = certificate_public_key(&certificate)?;
        if RsaPublicKey::from(&private_key) != cert_public_key {
            return Err(SigningError::KeyMismatch);
        }
        let der = certificate
            .to_der()
            .map_err(|e| SigningError::Certificate(format!("DER encoding error: {e:?}")))?;
        Ok(Self {
            certificate,
            certificate_b64: Base64::encode_string(&der),
            signing_key: SigningKey::<Sha1>::new(private_key),
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Fill the placeholder of `unsigned` and return the signed tree.
    ///
    /// Order matters: the back-reference URI is written first, then the
    /// document digest is taken with the signature element detached, then
    /// SignedInfo is canonicalized on its own and signed.
    pub fn sign(&self, unsigned: UnsignedDocument) -> Result<SignedDocument, SigningError> {
        let (doc, mut slots) = unsigned.into_parts();
        if slots.is_filled() {
            return Err(SigningError::AlreadySigned);
        }
        let mode = declared_suite(&slots)?;

        let reference = format!("#{}", slots.id);
        if let Some(uri) = slots.back_reference.as_mut() {
            uri.set_content(&reference)
                .map_err(|e| SigningError::Xml(e.to_string()))?;
        }

        let digest_value = document_digest(&doc, &slots.id, mode)?;
        slots
            .digest_value
            .set_content(&digest_value)
            .map_err(|e| SigningError::Xml(e.to_string()))?;
        slots
            .certificate
            .set_content(&self.certificate_b64)
            .map_err(|e| SigningError::Xml(e.to_string()))?;

        let signed_info = canonical_signed_info(&doc, &slots.signed_info, mode)?;
        let signature = self
            .signing_key
            .try_sign(signed_info.as_bytes())
            .map_err(|e| SigningError::Crypto(e.to_string()))?
            .to_vec();
        slots
            .signature_value
            .set_content(&Base64::encode_string(&signature))
            .map_err(|e| SigningError::Xml(e.to_string()))?;

        tracing::debug!(signature_id = %slots.id, digest = %digest_value, "document signed");

        Ok(SignedDocument {
            doc,
            signature_id: slots.id,
            mode,
            digest_value,
            signature_value: signature,
        })
    }
}

/// Canonicalization settings a declared `CanonicalizationMethod` maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CanonicalMode {
    with_comments: bool,
}

impl CanonicalMode {
    pub(crate) fn from_algorithm(uri: &str) -> Result<Self, SigningError> {
        match uri {
            C14N_1_0 => Ok(Self {
                with_comments: false,
            }),
            C14N_1_0_WITH_COMMENTS => Ok(Self {
                with_comments: true,
            }),
            other => Err(SigningError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn options(&self) -> c14n::CanonicalizationOptions {
        c14n::CanonicalizationOptions {
            mode: c14n::CanonicalizationMode::Canonical1_0,
            inclusive_ns_prefixes: vec![],
            with_comments: self.with_comments,
        }
    }

    pub(crate) fn canonicalize(&self, doc: &Document) -> Result<String, SigningError> {
        doc.canonicalize(self.options(), None)
            .map_err(|e| SigningError::Canonicalization(format!("{e:?}")))
    }
}

fn declared_suite(slots: &SignatureSlots) -> Result<CanonicalMode, SigningError> {
    let mode = CanonicalMode::from_algorithm(&slots.canonicalization)?;
    if slots.signature_method != RSA_SHA1 {
        return Err(SigningError::UnsupportedAlgorithm(slots.signature_method.clone()));
    }
    if slots.digest_method != SHA1 {
        return Err(SigningError::UnsupportedAlgorithm(slots.digest_method.clone()));
    }
    Ok(mode)
}

/// Fully signed tree; the placeholder holds digest, signature and certificate.
pub struct SignedDocument {
    pub(crate) doc: Document,
    pub(crate) signature_id: String,
    pub(crate) mode: CanonicalMode,
    digest_value: String,
    signature_value: Vec<u8>,
}

impl std::fmt::Debug for SignedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedDocument")
            .field("signature_id", &self.signature_id)
            .field("digest_value", &self.digest_value)
            .finish_non_exhaustive()
    }
}

impl SignedDocument {
    pub fn signature_id(&self) -> &str {
        &self.signature_id
    }

    /// Base64 SHA-1 digest of the canonical document without its signature.
    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    /// Raw PKCS#1 v1.5 signature bytes.
    pub fn signature_value(&self) -> &[u8] {
        &self.signature_value
    }

    pub fn signature_value_base64(&self) -> String {
        Base64::encode_string(&self.signature_value)
    }

    /// Canonical form of the whole signed document, without XML declaration.
    pub fn canonical_xml(&self) -> Result<String, SigningError> {
        self.mode.canonicalize(&self.doc)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }
}

fn xpath_context(doc: &Document) -> Result<xpath::Context, SigningError> {
    let ctx = xpath::Context::new(doc)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("ds", DS_NS)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("ext", EXT_NS)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;
    Ok(ctx)
}

/// Digest of the document with the identified signature element removed
/// (enveloped-signature transform), base64 encoded.
pub(crate) fn document_digest(
    doc: &Document,
    signature_id: &str,
    mode: CanonicalMode,
) -> Result<String, SigningError> {
    let copy = doc
        .dup()
        .map_err(|e| SigningError::Xml(format!("Failed to duplicate xml: {e:?}")))?;
    let ctx = xpath_context(&copy)?;
    let nodes = ctx
        .evaluate(&format!(
            "//ext:ExtensionContent/ds:Signature[@Id='{signature_id}']"
        ))
        .map_err(|e| SigningError::Xml(format!("XPath error: {e:?}")))?
        .get_nodes_as_vec();
    if nodes.len() != 1 {
        return Err(SigningError::Placeholder(format!(
            "expected one ds:Signature with Id '{signature_id}', found {}",
            nodes.len()
        )));
    }
    for mut node in nodes {
        node.unlink();
    }

    let canonical = mode.canonicalize(&copy)?;
    Ok(Base64::encode_string(&Sha1::digest(canonical.as_bytes())))
}

/// Canonical SignedInfo as a document subset: its own markup plus every
/// namespace declaration in scope from its ancestors.
pub(crate) fn canonical_signed_info(
    doc: &Document,
    signed_info: &Node,
    mode: CanonicalMode,
) -> Result<String, SigningError> {
    let mut fragment = doc.node_to_string(signed_info);

    let own: Vec<String> = signed_info
        .get_namespace_declarations()
        .iter()
        .map(|ns| ns.get_prefix())
        .collect();
    let mut inherited: Vec<(String, String)> = Vec::new();
    let mut current = signed_info.get_parent();
    while let Some(node) = current {
        if !node.is_element_node() {
            break;
        }
        for ns in node.get_namespace_declarations() {
            let prefix = ns.get_prefix();
            if own.contains(&prefix) || inherited.iter().any(|(p, _)| *p == prefix) {
                continue;
            }
            inherited.push((prefix, ns.get_href()));
        }
        current = node.get_parent();
    }

    let insert_at = fragment
        .char_indices()
        .skip(1)
        .find(|(_, c)| c.is_whitespace() || *c == '>' || *c == '/')
        .map(|(idx, _)| idx)
        .ok_or_else(|| SigningError::Xml("unexpected SignedInfo serialization".into()))?;
    let declarations: String = inherited
        .iter()
        .map(|(prefix, href)| {
            let href = href
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('"', "&quot;");
            if prefix.is_empty() {
                format!(" xmlns=\"{href}\"")
            } else {
                format!(" xmlns:{prefix}=\"{href}\"")
            }
        })
        .collect();
    fragment.insert_str(insert_at, &declarations);

    let standalone = parse_strict(fragment.as_bytes()).map_err(SigningError::Xml)?;
    mode.canonicalize(&standalone)
}

fn certificate_public_key(cert: &Certificate) -> Result<RsaPublicKey, SigningError> {
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| SigningError::Certificate(format!("SPKI encoding error: {e:?}")))?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| SigningError::Certificate(format!("not an RSA public key: {e:?}")))
}

fn decode_base64_text(value: &str) -> Result<Vec<u8>, base64ct::Error> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    Base64::decode_vec(&compact)
}

/// Parse a PEM `CERTIFICATE` block, e.g. to verify against a known signer.
pub fn certificate_from_pem(pem: &str) -> Result<Certificate, SigningError> {
    Certificate::from_pem(pem.as_bytes()).map_err(|e| SigningError::Certificate(format!("{e:?}")))
}

/// Check an enveloped signature produced by [`DocumentSigner::sign`].
///
/// The digest is recomputed over the document without its signature and the
/// signature value is checked against the canonical SignedInfo. The public
/// key comes from `certificate` when given, otherwise from the embedded
/// `ds:X509Certificate`.
pub fn verify_document(xml: &[u8], certificate: Option<&Certificate>) -> Result<(), SigningError> {
    let doc = parse_strict(xml).map_err(SigningError::Xml)?;
    let slots = SignatureSlots::resolve(&doc).map_err(|e| SigningError::Placeholder(e.to_string()))?;
    let mode = declared_suite(&slots)?;

    let declared = slots.digest_value.get_content().trim().to_string();
    let computed = document_digest(&doc, &slots.id, mode)?;
    if declared != computed {
        return Err(SigningError::DigestMismatch { declared, computed });
    }

    let public_key = match certificate {
        Some(cert) => certificate_public_key(cert)?,
        None => {
            let der = decode_base64_text(&slots.certificate.get_content())
                .map_err(|e| SigningError::Certificate(format!("invalid base64: {e:?}")))?;
            let cert = Certificate::from_der(&der)
                .map_err(|e| SigningError::Certificate(format!("{e:?}")))?;
            certificate_public_key(&cert)?
        }
    };

    let signature_bytes = decode_base64_text(&slots.signature_value.get_content())
        .map_err(|e| SigningError::InvalidSignature(format!("invalid base64: {e:?}")))?;
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;
    let signed_info = canonical_signed_info(&doc, &slots.signed_info, mode)?;
    VerifyingKey::<Sha1>::new(public_key)
        .verify(signed_info.as_bytes(), &signature)
        .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;

    tracing::debug!(signature_id = %slots.id, "signature verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{DocumentBuilder, fixtures};

    fn fixture(name: &str) -> String {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures/certs")
            .join(name);
        std::fs::read_to_string(path).expect("read fixture")
    }

    fn signer() -> DocumentSigner {
        DocumentSigner::from_pem(&fixture("public.pem"), &fixture("private_pkcs8.key"))
            .expect("signer")
    }

    fn signed() -> SignedDocument {
        let invoice = fixtures::invoice();
        let unsigned = DocumentBuilder::new(&invoice).build().expect("build");
        signer().sign(unsigned).expect("sign")
    }

    #[test]
    fn signed_document_verifies_with_embedded_certificate() {
        let signed = signed();
        let xml = signed.document().to_string();
        verify_document(xml.as_bytes(), None).expect("verifies");
        verify_document(xml.as_bytes(), Some(signer().certificate())).expect("verifies");
    }

    #[test]
    fn signing_is_deterministic() {
        let first = signed();
        let second = signed();
        assert_eq!(first.digest_value(), second.digest_value());
        assert_eq!(first.signature_value(), second.signature_value());
        assert_eq!(
            first.canonical_xml().expect("c14n"),
            second.canonical_xml().expect("c14n")
        );
    }

    #[test]
    fn digest_uses_declared_canonicalization_over_document_minus_signature() {
        let signed = signed();
        let canonical = signed.canonical_xml().expect("c14n");
        assert!(canonical.contains(&format!(
            r#"<ds:CanonicalizationMethod Algorithm="{C14N_1_0}"></ds:CanonicalizationMethod>"#
        )));

        let start = canonical.find("<ds:Signature ").expect("signature start");
        let end_tag = "</ds:Signature>";
        let end = canonical.find(end_tag).expect("signature end") + end_tag.len();
        let without_signature = format!("{}{}", &canonical[..start], &canonical[end..]);
        let expected = Base64::encode_string(&Sha1::digest(without_signature.as_bytes()));
        assert_eq!(signed.digest_value(), expected);
    }

    #[test]
    fn back_reference_points_at_signature_id() {
        let signed = signed();
        let canonical = signed.canonical_xml().expect("c14n");
        assert!(canonical.contains("<cbc:URI>#SignatureSP</cbc:URI>"));
        assert_eq!(signed.signature_id(), "SignatureSP");
        assert_eq!(signed.signature_value().len(), 256);
    }

    #[test]
    fn canonical_form_is_idempotent() {
        let canonical = signed().canonical_xml().expect("c14n");
        let reparsed = parse_strict(canonical.as_bytes()).expect("parse");
        let again = CanonicalMode::from_algorithm(C14N_1_0)
            .expect("mode")
            .canonicalize(&reparsed)
            .expect("c14n");
        assert_eq!(canonical, again);
    }

    #[test]
    fn tampering_breaks_verification() {
        let xml = signed().document().to_string();

        let tampered = xml.replacen(">118.00<", ">119.00<", 1);
        assert_ne!(tampered, xml);
        assert!(matches!(
            verify_document(tampered.as_bytes(), None),
            Err(SigningError::DigestMismatch { .. })
        ));

        let transform = r#"<ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature""#;
        let tampered = xml.replacen(transform, &format!(r#"{transform} Id="x""#), 1);
        assert_ne!(tampered, xml);
        assert!(matches!(
            verify_document(tampered.as_bytes(), None),
            Err(SigningError::InvalidSignature(_))
        ));
    }

    #[test]
    fn other_certificate_rejects_signature() {
        let other = Certificate::from_pem(fixture("other.pem").as_bytes()).expect("cert");
        let xml = signed().document().to_string();
        assert!(matches!(
            verify_document(xml.as_bytes(), Some(&other)),
            Err(SigningError::InvalidSignature(_))
        ));
    }

    #[test]
    fn mismatched_key_and_certificate_fail_closed() {
        let err = DocumentSigner::from_pem(&fixture("other.pem"), &fixture("private_pkcs8.key"))
            .expect_err("mismatch");
        assert!(matches!(err, SigningError::KeyMismatch));

        let err = DocumentSigner::from_pem("not a pem", &fixture("private_pkcs8.key"))
            .expect_err("bad cert");
        assert!(matches!(err, SigningError::Certificate(_)));

        let err = DocumentSigner::from_pem(&fixture("public.pem"), "garbage").expect_err("bad key");
        assert!(matches!(err, SigningError::Key(_)));
    }

    #[test]
    fn missing_files_report_path() {
        let paths = SigningMaterialPaths::new("/nonexistent/key.pem", "/nonexistent/cert.pem");
        match DocumentSigner::from_files(&paths) {
            Err(SigningError::Io { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/key.pem"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn filled_placeholder_is_not_signed_twice() {
        let xml = signed().document().to_string();
        let reparsed = UnsignedDocument::parse(xml.as_bytes()).expect("parse");
        assert!(matches!(
            signer().sign(reparsed),
            Err(SigningError::AlreadySigned)
        ));
    }

    #[test]
    fn unsupported_canonicalization_is_rejected() {
        let invoice = fixtures::invoice();
        let xml = DocumentBuilder::new(&invoice).to_xml().expect("xml");
        let xml = xml.replace(C14N_1_0, "http://www.w3.org/2001/10/xml-exc-c14n#");
        let unsigned = UnsignedDocument::parse(xml.as_bytes()).expect("parse");
        assert!(matches!(
            signer().sign(unsigned),
            Err(SigningError::UnsupportedAlgorithm(_))
        ));
    }
}
