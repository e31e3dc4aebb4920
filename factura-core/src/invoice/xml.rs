//! UBL 2.1 document assembly.
use super::{AffectedDocument, Address, BuildError, Invoice, LineItem, Party, TaxScheme};

use constants::{
    CAC_NS, CBC_NS, COUNTRY_CODE, C14N_1_0, CUSTOMIZATION_ID, DS_NS, ENVELOPED_SIGNATURE, EXT_NS,
    ROOT_NAMESPACES, RSA_SHA1, SHA1, SIGNATURE_ID, SUNAT_AGENCY, UBL_VERSION,
};
use helpers::{Amount, Precise, currency_amount, identifier, listed_code};
use libxml::{
    parser::{Parser, ParserOptions},
    tree::Document,
    tree::Node,
    xpath,
};
use quick_xml::se::Serializer as QuickXmlSerializer;
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};

pub mod constants;

mod helpers {
    use rust_decimal::{Decimal, RoundingStrategy};
    use serde::ser::{Serialize, SerializeStruct, Serializer};
    use std::fmt::{self, Display, Formatter};

    /// Monetary amount rendered with exactly two decimals, half away from zero.
    pub(crate) struct Amount(pub(crate) Decimal);

    impl Display for Amount {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            let mut value = self
                .0
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
            value.rescale(2);
            write!(f, "{value}")
        }
    }

    impl Serialize for Amount {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    /// Unit values and quantities: up to 10 decimals, never fewer than 2.
    pub(crate) struct Precise(pub(crate) Decimal);

    impl Display for Precise {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            let mut value = self
                .0
                .round_dp_with_strategy(10, RoundingStrategy::MidpointAwayFromZero)
                .normalize();
            if value.scale() < 2 {
                value.rescale(2);
            }
            write!(f, "{value}")
        }
    }

    impl Serialize for Precise {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    struct CurrencyAmountSer<'a, V> {
        tag: &'static str,
        currency: &'a str,
        value: V,
    }

    pub(super) fn currency_amount<'a, V: Serialize + 'a>(
        tag: &'static str,
        currency: &'a str,
        value: V,
    ) -> impl Serialize + 'a {
        CurrencyAmountSer {
            tag,
            currency,
            value,
        }
    }

    impl<'a, V: Serialize> Serialize for CurrencyAmountSer<'a, V> {
        fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut st = s.serialize_struct(self.tag, 2)?;
            st.serialize_field("@currencyID", self.currency)?;
            st.serialize_field("$text", &self.value)?;
            st.end()
        }
    }

    /// Element whose text is a code or identifier qualified by attributes.
    struct AttributedSer<'a> {
        tag: &'static str,
        attributes: Vec<(&'static str, &'a str)>,
        value: &'a str,
    }

    pub(super) fn identifier<'a>(
        tag: &'static str,
        attributes: Vec<(&'static str, &'a str)>,
        value: &'a str,
    ) -> impl Serialize + 'a {
        AttributedSer {
            tag,
            attributes,
            value,
        }
    }

    /// Catalogue code with the `listAgencyName`/`listName`/`listURI` triple.
    pub(super) fn listed_code<'a>(
        tag: &'static str,
        list_name: &'static str,
        list_uri: &'static str,
        value: &'a str,
    ) -> impl Serialize + 'a {
        AttributedSer {
            tag,
            attributes: vec![
                ("@listAgencyName", super::SUNAT_AGENCY),
                ("@listName", list_name),
                ("@listURI", list_uri),
            ],
            value,
        }
    }

    impl<'a> Serialize for AttributedSer<'a> {
        fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut st = s.serialize_struct(self.tag, self.attributes.len() + 1)?;
            for (name, value) in &self.attributes {
                st.serialize_field(*name, value)?;
            }
            st.serialize_field("$text", self.value)?;
            st.end()
        }
    }
}

/// Maps an [`Invoice`] to its UBL 2.1 XML tree.
///
/// The output carries one empty `ds:Signature` placeholder (Id
/// [`SIGNATURE_ID`]) under `ext:UBLExtensions/ext:UBLExtension/ext:ExtensionContent`
/// and an empty `cac:Signature` back-reference URI. Both are filled by
/// [`DocumentSigner`](super::DocumentSigner).
///
/// # Examples
/// ```rust,no_run
/// use factura_core::invoice::{DocumentBuilder, Invoice};
///
/// let invoice: Invoice = unimplemented!();
/// let unsigned = DocumentBuilder::new(&invoice)
///     .with_stylesheet("https://example.com/factura.xsl")
///     .build()?;
/// # let _ = unsigned;
/// # Ok::<(), factura_core::invoice::BuildError>(())
/// ```
#[derive(Debug, Clone)]
pub struct DocumentBuilder<'a> {
    invoice: &'a Invoice,
    stylesheet: Option<String>,
}

impl<'a> DocumentBuilder<'a> {
    pub fn new(invoice: &'a Invoice) -> Self {
        Self {
            invoice,
            stylesheet: None,
        }
    }

    /// Emit an `xml-stylesheet` processing instruction before the root element.
    pub fn with_stylesheet(mut self, href: impl Into<String>) -> Self {
        self.stylesheet = Some(href.into());
        self
    }

    /// Serialize to compact XML text without parsing it back.
    pub fn to_xml(&self) -> Result<String, BuildError> {
        self.invoice.validate()?;

        let mut buffer = String::with_capacity(8192);
        buffer.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        buffer.push('\n');
        if let Some(href) = &self.stylesheet {
            buffer.push_str(&format!(
                r#"<?xml-stylesheet type="text/xsl" href="{}"?>"#,
                escape_attribute(href)
            ));
            buffer.push('\n');
        }

        {
            let serializer = QuickXmlSerializer::new(&mut buffer);
            InvoiceXml(self.invoice).serialize(serializer)?;
        }

        Ok(buffer)
    }

    pub fn build(&self) -> Result<UnsignedDocument, BuildError> {
        let xml = self.to_xml()?;
        let document = UnsignedDocument::parse(xml.as_bytes())?;
        tracing::debug!(
            document_id = %self.invoice.document_id(),
            lines = self.invoice.line_items.len(),
            "built unsigned document"
        );
        Ok(document)
    }
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
}

/// Parsed document holding an unfilled signature placeholder.
pub struct UnsignedDocument {
    doc: Document,
    slots: SignatureSlots,
}

impl std::fmt::Debug for UnsignedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsignedDocument")
            .field("signature_id", &self.slots.id)
            .finish_non_exhaustive()
    }
}

impl UnsignedDocument {
    /// Parse an externally produced document that carries the placeholder.
    pub fn parse(xml: &[u8]) -> Result<Self, BuildError> {
        let doc = parse_strict(xml).map_err(BuildError::Parse)?;
        let slots = SignatureSlots::resolve(&doc)?;
        Ok(Self { doc, slots })
    }

    pub fn signature_id(&self) -> &str {
        &self.slots.id
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn to_xml(&self) -> String {
        self.doc.to_string()
    }

    pub(crate) fn into_parts(self) -> (Document, SignatureSlots) {
        (self.doc, self.slots)
    }
}

/// Parse without libxml's recovery mode so malformed input is an error.
pub(crate) fn parse_strict(xml: &[u8]) -> Result<Document, String> {
    let options = ParserOptions {
        recover: false,
        ..Default::default()
    };
    Parser::default()
        .parse_string_with_options(xml, options)
        .map_err(|e| format!("{e:?}"))
}

/// Direct handles to the placeholder parts, resolved once.
pub(crate) struct SignatureSlots {
    pub(crate) id: String,
    pub(crate) canonicalization: String,
    pub(crate) signature_method: String,
    pub(crate) digest_method: String,
    pub(crate) signed_info: Node,
    pub(crate) digest_value: Node,
    pub(crate) signature_value: Node,
    pub(crate) certificate: Node,
    pub(crate) back_reference: Option<Node>,
}

impl SignatureSlots {
    pub(crate) fn resolve(doc: &Document) -> Result<Self, BuildError> {
        let ctx = xpath::Context::new(doc)
            .map_err(|e| BuildError::Placeholder(format!("XPath context error: {e:?}")))?;
        for (prefix, ns) in [("ds", DS_NS), ("ext", EXT_NS), ("cac", CAC_NS), ("cbc", CBC_NS)] {
            ctx.register_namespace(prefix, ns)
                .map_err(|e| BuildError::Placeholder(format!("XPath context error: {e:?}")))?;
        }

        let mut signatures = ctx
            .evaluate("//ext:UBLExtension/ext:ExtensionContent/ds:Signature[@Id]")
            .map_err(|e| BuildError::Placeholder(format!("XPath error: {e:?}")))?
            .get_nodes_as_vec();
        if signatures.len() != 1 {
            return Err(BuildError::Placeholder(format!(
                "expected exactly one ds:Signature, found {}",
                signatures.len()
            )));
        }
        let signature = signatures.remove(0);
        let id = signature.get_attribute("Id").unwrap_or_default();
        if id.trim().is_empty() {
            return Err(BuildError::Placeholder("ds:Signature has an empty Id".into()));
        }

        let signed_info = ds_child(&signature, "SignedInfo")?;
        let canonicalization = algorithm(&ds_child(&signed_info, "CanonicalizationMethod")?)?;
        let signature_method = algorithm(&ds_child(&signed_info, "SignatureMethod")?)?;
        let reference = ds_child(&signed_info, "Reference")?;
        let digest_method = algorithm(&ds_child(&reference, "DigestMethod")?)?;
        let digest_value = ds_child(&reference, "DigestValue")?;
        let signature_value = ds_child(&signature, "SignatureValue")?;
        let key_info = ds_child(&signature, "KeyInfo")?;
        let certificate = ds_child(&ds_child(&key_info, "X509Data")?, "X509Certificate")?;

        let back_reference = ctx
            .evaluate("//cac:Signature/cac:DigitalSignatureAttachment/cac:ExternalReference/cbc:URI")
            .map_err(|e| BuildError::Placeholder(format!("XPath error: {e:?}")))?
            .get_nodes_as_vec()
            .into_iter()
            .next();

        Ok(Self {
            id,
            canonicalization,
            signature_method,
            digest_method,
            signed_info,
            digest_value,
            signature_value,
            certificate,
            back_reference,
        })
    }

    /// True once any of the three signature values carries content.
    pub(crate) fn is_filled(&self) -> bool {
        [&self.digest_value, &self.signature_value, &self.certificate]
            .iter()
            .any(|node| !node.get_content().trim().is_empty())
    }
}

fn ds_child(parent: &Node, local_name: &str) -> Result<Node, BuildError> {
    parent
        .get_child_elements()
        .into_iter()
        .find(|node| {
            node.get_name() == local_name
                && node
                    .get_namespace()
                    .is_some_and(|ns| ns.get_href() == DS_NS)
        })
        .ok_or_else(|| BuildError::Placeholder(format!("missing ds:{local_name}")))
}

fn algorithm(node: &Node) -> Result<String, BuildError> {
    node.get_attribute("Algorithm")
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BuildError::Placeholder(format!("ds:{} without Algorithm", node.get_name())))
}

struct InvoiceXml<'a>(&'a Invoice);

impl<'a> Serialize for InvoiceXml<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let invoice = self.0;
        let currency = invoice.currency.as_str();
        let document_id = invoice.document_id();

        let mut root = serializer.serialize_struct("Invoice", 0)?;

        for (attribute, ns) in ROOT_NAMESPACES {
            root.serialize_field(attribute, ns)?;
        }

        root.serialize_field("ext:UBLExtensions", &UblExtensionsXml)?;

        root.serialize_field("cbc:UBLVersionID", UBL_VERSION)?;
        root.serialize_field("cbc:CustomizationID", CUSTOMIZATION_ID)?;
        root.serialize_field("cbc:ID", &document_id)?;
        root.serialize_field("cbc:IssueDate", &invoice.issue_date.format("%Y-%m-%d").to_string())?;
        root.serialize_field(
            "cbc:InvoiceTypeCode",
            &identifier(
                "cbc:InvoiceTypeCode",
                vec![
                    ("@listID", "0101"),
                    ("@listAgencyName", SUNAT_AGENCY),
                    ("@listName", "Tipo de Documento"),
                    ("@listURI", "urn:pe:gob:sunat:cpe:see:gem:catalogos:catalogo01"),
                ],
                &invoice.document_type,
            ),
        )?;

        for legend in &invoice.legends {
            root.serialize_field(
                "cbc:Note",
                &identifier(
                    "cbc:Note",
                    vec![("@languageLocaleID", legend.code.as_str())],
                    &legend.value,
                ),
            )?;
        }

        root.serialize_field(
            "cbc:DocumentCurrencyCode",
            &identifier(
                "cbc:DocumentCurrencyCode",
                vec![
                    ("@listID", "ISO 4217 Alpha"),
                    ("@listName", "Currency"),
                    ("@listAgencyName", "United Nations Economic Commission for Europe"),
                ],
                currency,
            ),
        )?;

        if let Some(affected) = &invoice.affected_document {
            root.serialize_field("cac:DiscrepancyResponse", &DiscrepancyResponseXml(affected))?;
            root.serialize_field("cac:BillingReference", &BillingReferenceXml(affected))?;
        }

        root.serialize_field("cac:Signature", &SignatureReferenceXml(invoice))?;

        root.serialize_field(
            "cac:AccountingSupplierParty",
            &PartyRoleXml("cac:AccountingSupplierParty", &invoice.issuer),
        )?;
        root.serialize_field(
            "cac:AccountingCustomerParty",
            &PartyRoleXml("cac:AccountingCustomerParty", &invoice.recipient),
        )?;

        root.serialize_field(
            "cac:TaxTotal",
            &TaxTotalXml {
                currency,
                tax_amount: invoice.tax_amount,
                subtotals: tax_subtotals(&invoice.line_items),
            },
        )?;

        root.serialize_field("cac:LegalMonetaryTotal", &LegalMonetaryTotalXml(invoice))?;

        for (idx, line) in invoice.line_items.iter().enumerate() {
            root.serialize_field("cac:InvoiceLine", &InvoiceLineXml(idx + 1, line, currency))?;
        }

        root.end()
    }
}

/// `ext:UBLExtensions`: an empty `sac:AdditionalInformation` extension
/// followed by the one holding the signature placeholder.
struct UblExtensionsXml;

impl Serialize for UblExtensionsXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Clone, Copy)]
        enum Extension {
            AdditionalInformation,
            Signature,
        }

        impl Serialize for Extension {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("ext:UBLExtension", 0)?;
                st.serialize_field("ext:ExtensionContent", &ExtensionContent(*self))?;
                st.end()
            }
        }

        struct ExtensionContent(Extension);
        impl Serialize for ExtensionContent {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("ext:ExtensionContent", 0)?;
                match self.0 {
                    Extension::AdditionalInformation => {
                        st.serialize_field("sac:AdditionalInformation", &EmptyXml)?;
                    }
                    Extension::Signature => {
                        st.serialize_field("ds:Signature", &SignaturePlaceholderXml)?;
                    }
                }
                st.end()
            }
        }

        struct EmptyXml;
        impl Serialize for EmptyXml {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                s.serialize_struct("sac:AdditionalInformation", 0)?.end()
            }
        }

        let mut st = s.serialize_struct("ext:UBLExtensions", 0)?;
        st.serialize_field("ext:UBLExtension", &Extension::AdditionalInformation)?;
        st.serialize_field("ext:UBLExtension", &Extension::Signature)?;
        st.end()
    }
}

/// Element carrying only an `Algorithm` attribute.
struct AlgorithmXml(&'static str, &'static str);

impl Serialize for AlgorithmXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct(self.0, 1)?;
        st.serialize_field("@Algorithm", self.1)?;
        st.end()
    }
}

struct SignaturePlaceholderXml;

impl Serialize for SignaturePlaceholderXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct Reference;
        impl Serialize for Reference {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                struct Transforms;
                impl Serialize for Transforms {
                    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
                    where
                        S: Serializer,
                    {
                        let mut st = s.serialize_struct("ds:Transforms", 0)?;
                        st.serialize_field(
                            "ds:Transform",
                            &AlgorithmXml("ds:Transform", ENVELOPED_SIGNATURE),
                        )?;
                        st.end()
                    }
                }

                let mut st = s.serialize_struct("ds:Reference", 0)?;
                st.serialize_field("@URI", "")?;
                st.serialize_field("ds:Transforms", &Transforms)?;
                st.serialize_field("ds:DigestMethod", &AlgorithmXml("ds:DigestMethod", SHA1))?;
                st.serialize_field("ds:DigestValue", "")?;
                st.end()
            }
        }

        struct SignedInfo;
        impl Serialize for SignedInfo {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("ds:SignedInfo", 0)?;
                st.serialize_field(
                    "ds:CanonicalizationMethod",
                    &AlgorithmXml("ds:CanonicalizationMethod", C14N_1_0),
                )?;
                st.serialize_field(
                    "ds:SignatureMethod",
                    &AlgorithmXml("ds:SignatureMethod", RSA_SHA1),
                )?;
                st.serialize_field("ds:Reference", &Reference)?;
                st.end()
            }
        }

        struct KeyInfo;
        impl Serialize for KeyInfo {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                struct X509Data;
                impl Serialize for X509Data {
                    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
                    where
                        S: Serializer,
                    {
                        let mut st = s.serialize_struct("ds:X509Data", 0)?;
                        st.serialize_field("ds:X509Certificate", "")?;
                        st.end()
                    }
                }

                let mut st = s.serialize_struct("ds:KeyInfo", 0)?;
                st.serialize_field("ds:X509Data", &X509Data)?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("ds:Signature", 0)?;
        st.serialize_field("@Id", SIGNATURE_ID)?;
        st.serialize_field("ds:SignedInfo", &SignedInfo)?;
        st.serialize_field("ds:SignatureValue", "")?;
        st.serialize_field("ds:KeyInfo", &KeyInfo)?;
        st.end()
    }
}

struct SignatureReferenceXml<'a>(&'a Invoice);

impl<'a> Serialize for SignatureReferenceXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct SignatoryParty<'a>(&'a Party);
        impl<'a> Serialize for SignatoryParty<'a> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("cac:SignatoryParty", 0)?;
                st.serialize_field(
                    "cac:PartyIdentification",
                    &Wrapped("cac:PartyIdentification", "cbc:ID", &self.0.identity_number),
                )?;
                st.serialize_field(
                    "cac:PartyName",
                    &Wrapped("cac:PartyName", "cbc:Name", &self.0.legal_name),
                )?;
                st.end()
            }
        }

        struct Attachment;
        impl Serialize for Attachment {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("cac:DigitalSignatureAttachment", 0)?;
                st.serialize_field(
                    "cac:ExternalReference",
                    &Wrapped("cac:ExternalReference", "cbc:URI", ""),
                )?;
                st.end()
            }
        }

        let invoice = self.0;
        let id = format!("{}-{}", invoice.issuer.identity_number, invoice.document_id());
        let mut st = s.serialize_struct("cac:Signature", 0)?;
        st.serialize_field("cbc:ID", &id)?;
        st.serialize_field("cac:SignatoryParty", &SignatoryParty(&invoice.issuer))?;
        st.serialize_field("cac:DigitalSignatureAttachment", &Attachment)?;
        st.end()
    }
}

/// Aggregate holding a single text child.
struct Wrapped<'a>(&'static str, &'static str, &'a str);

impl<'a> Serialize for Wrapped<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct(self.0, 0)?;
        st.serialize_field(self.1, self.2)?;
        st.end()
    }
}

struct DiscrepancyResponseXml<'a>(&'a AffectedDocument);

impl<'a> Serialize for DiscrepancyResponseXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let affected = self.0;
        let mut st = s.serialize_struct("cac:DiscrepancyResponse", 0)?;
        st.serialize_field("cbc:ReferenceID", &affected.document_id())?;
        st.serialize_field("cbc:ResponseCode", &affected.reason_code)?;
        st.serialize_field("cbc:Description", &affected.description)?;
        st.end()
    }
}

struct BillingReferenceXml<'a>(&'a AffectedDocument);

impl<'a> Serialize for BillingReferenceXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct InvoiceDocumentReference<'a>(&'a AffectedDocument);
        impl<'a> Serialize for InvoiceDocumentReference<'a> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("cac:InvoiceDocumentReference", 0)?;
                st.serialize_field("cbc:ID", &self.0.document_id())?;
                st.serialize_field("cbc:DocumentTypeCode", &self.0.document_type)?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("cac:BillingReference", 0)?;
        st.serialize_field(
            "cac:InvoiceDocumentReference",
            &InvoiceDocumentReference(self.0),
        )?;
        st.end()
    }
}

struct PartyRoleXml<'a>(&'static str, &'a Party);

impl<'a> Serialize for PartyRoleXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct(self.0, 0)?;
        st.serialize_field("cac:Party", &PartyXml(self.1))?;
        st.end()
    }
}

struct PartyXml<'a>(&'a Party);

impl<'a> Serialize for PartyXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct PartyIdentification<'a>(&'a Party);
        impl<'a> Serialize for PartyIdentification<'a> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let party = self.0;
                let mut st = s.serialize_struct("cac:PartyIdentification", 0)?;
                st.serialize_field(
                    "cbc:ID",
                    &identifier(
                        "cbc:ID",
                        vec![
                            ("@schemeID", party.identity_document_type.as_str()),
                            ("@schemeName", "Documento de Identidad"),
                            ("@schemeAgencyName", SUNAT_AGENCY),
                            ("@schemeURI", "urn:pe:gob:sunat:cpe:see:gem:catalogos:catalogo06"),
                        ],
                        &party.identity_number,
                    ),
                )?;
                st.end()
            }
        }

        struct PartyLegalEntity<'a>(&'a Party);
        impl<'a> Serialize for PartyLegalEntity<'a> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("cac:PartyLegalEntity", 0)?;
                st.serialize_field("cbc:RegistrationName", &self.0.legal_name)?;
                if let Some(address) = &self.0.address {
                    st.serialize_field("cac:RegistrationAddress", &AddressXml(address))?;
                }
                st.end()
            }
        }

        let party = self.0;
        let mut st = s.serialize_struct("cac:Party", 0)?;
        st.serialize_field("cac:PartyIdentification", &PartyIdentification(party))?;
        if let Some(name) = party.commercial_name.as_deref().filter(|n| !n.trim().is_empty()) {
            st.serialize_field("cac:PartyName", &Wrapped("cac:PartyName", "cbc:Name", name))?;
        }
        st.serialize_field("cac:PartyLegalEntity", &PartyLegalEntity(party))?;
        st.end()
    }
}

struct AddressXml<'a>(&'a Address);

impl<'a> Serialize for AddressXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let a = self.0;
        let mut st = s.serialize_struct("cac:RegistrationAddress", 0)?;
        // A line-only address carries no locality components.
        if !a.locality_code.is_empty() {
            st.serialize_field(
                "cbc:ID",
                &identifier(
                    "cbc:ID",
                    vec![("@schemeName", "Ubigeos"), ("@schemeAgencyName", "PE:INEI")],
                    &a.locality_code,
                ),
            )?;
        }
        for (tag, value) in [
            ("cbc:CityName", &a.province),
            ("cbc:CountrySubentity", &a.region),
            ("cbc:District", &a.district),
        ] {
            if !value.is_empty() {
                st.serialize_field(tag, value)?;
            }
        }
        st.serialize_field("cac:AddressLine", &Wrapped("cac:AddressLine", "cbc:Line", &a.line))?;
        st.serialize_field(
            "cac:Country",
            &Wrapped("cac:Country", "cbc:IdentificationCode", COUNTRY_CODE),
        )?;
        st.end()
    }
}

/// Per-scheme sums used for the document level tax breakdown.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SchemeSubtotal {
    pub(crate) scheme: TaxScheme,
    pub(crate) taxable_amount: Decimal,
    pub(crate) tax_amount: Decimal,
}

/// One subtotal per scheme, in order of first appearance.
pub(crate) fn tax_subtotals(lines: &[LineItem]) -> Vec<SchemeSubtotal> {
    let mut subtotals: Vec<SchemeSubtotal> = Vec::new();
    for line in lines {
        let Some(scheme) = line.tax_scheme() else {
            continue;
        };
        match subtotals.iter_mut().find(|s| s.scheme == scheme) {
            Some(existing) => {
                existing.taxable_amount += line.line_total;
                existing.tax_amount += line.tax_amount;
            }
            None => subtotals.push(SchemeSubtotal {
                scheme,
                taxable_amount: line.line_total,
                tax_amount: line.tax_amount,
            }),
        }
    }
    subtotals
}

struct TaxSchemeXml(TaxScheme);

impl Serialize for TaxSchemeXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let scheme = self.0;
        let mut st = s.serialize_struct("cac:TaxScheme", 0)?;
        st.serialize_field(
            "cbc:ID",
            &identifier(
                "cbc:ID",
                vec![("@schemeID", "UN/ECE 5153"), ("@schemeAgencyName", SUNAT_AGENCY)],
                scheme.id(),
            ),
        )?;
        st.serialize_field("cbc:Name", scheme.name())?;
        st.serialize_field("cbc:TaxTypeCode", scheme.type_code())?;
        st.end()
    }
}

/// `cac:TaxCategory`; the line variant adds percent and exemption reason.
struct TaxCategoryXml<'a> {
    scheme: TaxScheme,
    affectation_code: Option<&'a str>,
}

impl<'a> Serialize for TaxCategoryXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:TaxCategory", 0)?;
        st.serialize_field(
            "cbc:ID",
            &identifier(
                "cbc:ID",
                vec![
                    ("@schemeID", "UN/ECE 5305"),
                    ("@schemeName", "Tax Category Identifier"),
                    ("@schemeAgencyName", "United Nations Economic Commission for Europe"),
                ],
                self.scheme.category(),
            ),
        )?;
        if let Some(code) = self.affectation_code {
            st.serialize_field("cbc:Percent", &Amount(self.scheme.percent()))?;
            st.serialize_field(
                "cbc:TaxExemptionReasonCode",
                &listed_code(
                    "cbc:TaxExemptionReasonCode",
                    "Afectacion del IGV",
                    "urn:pe:gob:sunat:cpe:see:gem:catalogos:catalogo07",
                    code,
                ),
            )?;
        }
        st.serialize_field("cac:TaxScheme", &TaxSchemeXml(self.scheme))?;
        st.end()
    }
}

struct TaxSubtotalXml<'a> {
    currency: &'a str,
    taxable_amount: Decimal,
    tax_amount: Decimal,
    category: TaxCategoryXml<'a>,
}

impl<'a> Serialize for TaxSubtotalXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:TaxSubtotal", 0)?;
        st.serialize_field(
            "cbc:TaxableAmount",
            &currency_amount("cbc:TaxableAmount", self.currency, Amount(self.taxable_amount)),
        )?;
        st.serialize_field(
            "cbc:TaxAmount",
            &currency_amount("cbc:TaxAmount", self.currency, Amount(self.tax_amount)),
        )?;
        st.serialize_field("cac:TaxCategory", &self.category)?;
        st.end()
    }
}

struct TaxTotalXml<'a> {
    currency: &'a str,
    tax_amount: Decimal,
    subtotals: Vec<SchemeSubtotal>,
}

impl<'a> Serialize for TaxTotalXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:TaxTotal", 0)?;
        st.serialize_field(
            "cbc:TaxAmount",
            &currency_amount("cbc:TaxAmount", self.currency, Amount(self.tax_amount)),
        )?;
        for subtotal in &self.subtotals {
            st.serialize_field(
                "cac:TaxSubtotal",
                &TaxSubtotalXml {
                    currency: self.currency,
                    taxable_amount: subtotal.taxable_amount,
                    tax_amount: subtotal.tax_amount,
                    category: TaxCategoryXml {
                        scheme: subtotal.scheme,
                        affectation_code: None,
                    },
                },
            )?;
        }
        st.end()
    }
}

struct LegalMonetaryTotalXml<'a>(&'a Invoice);

impl<'a> Serialize for LegalMonetaryTotalXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let invoice = self.0;
        let currency = invoice.currency.as_str();
        let line_extension: Decimal = invoice.line_items.iter().map(|l| l.line_total).sum();

        let mut st = s.serialize_struct("cac:LegalMonetaryTotal", 0)?;
        st.serialize_field(
            "cbc:LineExtensionAmount",
            &currency_amount("cbc:LineExtensionAmount", currency, Amount(line_extension)),
        )?;
        st.serialize_field(
            "cbc:TaxInclusiveAmount",
            &currency_amount(
                "cbc:TaxInclusiveAmount",
                currency,
                Amount(invoice.total_amount),
            ),
        )?;
        st.serialize_field(
            "cbc:PayableAmount",
            &currency_amount("cbc:PayableAmount", currency, Amount(invoice.total_amount)),
        )?;
        st.end()
    }
}

struct InvoiceLineXml<'a>(usize, &'a LineItem, &'a str);

impl<'a> Serialize for InvoiceLineXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let (idx, li, currency) = (self.0, self.1, self.2);
        let Some(scheme) = li.tax_scheme() else {
            return Err(<S::Error as serde::ser::Error>::custom(format!(
                "line {idx}: unknown tax affectation code '{}'",
                li.affectation_code
            )));
        };
        let position = li.position.map(|p| p as usize).unwrap_or(idx);

        let mut st = s.serialize_struct("cac:InvoiceLine", 0)?;

        st.serialize_field("cbc:ID", &position.to_string())?;
        st.serialize_field(
            "cbc:InvoicedQuantity",
            &QuantityXml {
                unit_code: &li.unit_code,
                value: li.quantity,
            },
        )?;
        st.serialize_field(
            "cbc:LineExtensionAmount",
            &currency_amount("cbc:LineExtensionAmount", currency, Amount(li.line_total)),
        )?;
        st.serialize_field(
            "cac:PricingReference",
            &PricingReferenceXml {
                currency,
                unit_price: li.unit_price,
            },
        )?;
        st.serialize_field(
            "cac:TaxTotal",
            &LineTaxTotalXml {
                currency,
                line: li,
                scheme,
            },
        )?;
        st.serialize_field("cac:Item", &ItemXml(li))?;
        st.serialize_field(
            "cac:Price",
            &PriceXml {
                currency,
                unit_value: li.unit_value,
            },
        )?;

        st.end()
    }
}

struct QuantityXml<'a> {
    unit_code: &'a str,
    value: Decimal,
}

impl<'a> Serialize for QuantityXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cbc:InvoicedQuantity", 4)?;
        st.serialize_field("@unitCode", self.unit_code)?;
        st.serialize_field("@unitCodeListID", "UN/ECE rec 20")?;
        st.serialize_field(
            "@unitCodeListAgencyName",
            "United Nations Economic Commission for Europe",
        )?;
        st.serialize_field("$text", &Precise(self.value))?;
        st.end()
    }
}

struct PricingReferenceXml<'a> {
    currency: &'a str,
    unit_price: Decimal,
}

impl<'a> Serialize for PricingReferenceXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct AlternativeConditionPrice<'a>(&'a PricingReferenceXml<'a>);
        impl<'a> Serialize for AlternativeConditionPrice<'a> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("cac:AlternativeConditionPrice", 0)?;
                st.serialize_field(
                    "cbc:PriceAmount",
                    &currency_amount("cbc:PriceAmount", self.0.currency, Amount(self.0.unit_price)),
                )?;
                st.serialize_field(
                    "cbc:PriceTypeCode",
                    &listed_code(
                        "cbc:PriceTypeCode",
                        "Tipo de Precio",
                        "urn:pe:gob:sunat:cpe:see:gem:catalogos:catalogo16",
                        "01",
                    ),
                )?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("cac:PricingReference", 0)?;
        st.serialize_field("cac:AlternativeConditionPrice", &AlternativeConditionPrice(self))?;
        st.end()
    }
}

struct LineTaxTotalXml<'a> {
    currency: &'a str,
    line: &'a LineItem,
    scheme: TaxScheme,
}

impl<'a> Serialize for LineTaxTotalXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:TaxTotal", 0)?;
        st.serialize_field(
            "cbc:TaxAmount",
            &currency_amount("cbc:TaxAmount", self.currency, Amount(self.line.tax_amount)),
        )?;
        st.serialize_field(
            "cac:TaxSubtotal",
            &TaxSubtotalXml {
                currency: self.currency,
                taxable_amount: self.line.line_total,
                tax_amount: self.line.tax_amount,
                category: TaxCategoryXml {
                    scheme: self.scheme,
                    affectation_code: Some(&self.line.affectation_code),
                },
            },
        )?;
        st.end()
    }
}

struct ItemXml<'a>(&'a LineItem);

impl<'a> Serialize for ItemXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:Item", 0)?;
        st.serialize_field("cbc:Description", &self.0.description)?;
        if !self.0.product_code.trim().is_empty() {
            st.serialize_field(
                "cac:SellersItemIdentification",
                &Wrapped("cac:SellersItemIdentification", "cbc:ID", &self.0.product_code),
            )?;
        }
        st.end()
    }
}

struct PriceXml<'a> {
    currency: &'a str,
    unit_value: Decimal,
}

impl<'a> Serialize for PriceXml<'a> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("cac:Price", 0)?;
        st.serialize_field(
            "cbc:PriceAmount",
            &currency_amount("cbc:PriceAmount", self.currency, Precise(self.unit_value)),
        )?;
        st.end()
    }
}
