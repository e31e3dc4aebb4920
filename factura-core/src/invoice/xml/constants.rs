pub(crate) const INVOICE_NS: &str = "urn:oasis:names:specification:ubl:schema:xsd:Invoice-2";
pub(crate) const CAC_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonAggregateComponents-2";
pub(crate) const CBC_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonBasicComponents-2";
pub(crate) const CCTS_NS: &str = "urn:un:unece:uncefact:documentation:2";
pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const EXT_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonExtensionComponents-2";
pub(crate) const QDT_NS: &str = "urn:oasis:names:specification:ubl:schema:xsd:QualifiedDataTypes-2";
pub(crate) const SAC_NS: &str =
    "urn:sunat:names:specification:ubl:peru:schema:xsd:SunatAggregateComponents-1";
pub(crate) const UDT_NS: &str =
    "urn:un:unece:uncefact:data:specification:UnqualifiedDataTypesSchemaModule:2";

/// Root namespace declarations, in emission order.
pub(crate) const ROOT_NAMESPACES: [(&str, &str); 9] = [
    ("@xmlns", INVOICE_NS),
    ("@xmlns:cac", CAC_NS),
    ("@xmlns:cbc", CBC_NS),
    ("@xmlns:ccts", CCTS_NS),
    ("@xmlns:ds", DS_NS),
    ("@xmlns:ext", EXT_NS),
    ("@xmlns:qdt", QDT_NS),
    ("@xmlns:sac", SAC_NS),
    ("@xmlns:udt", UDT_NS),
];

/// Stable `Id` of the placeholder `ds:Signature`.
pub const SIGNATURE_ID: &str = "SignatureSP";

pub(crate) const C14N_1_0: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub(crate) const C14N_1_0_WITH_COMMENTS: &str =
    "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
pub(crate) const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub(crate) const SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub(crate) const ENVELOPED_SIGNATURE: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

pub(crate) const UBL_VERSION: &str = "2.1";
pub(crate) const CUSTOMIZATION_ID: &str = "2.0";
pub(crate) const SUNAT_AGENCY: &str = "PE:SUNAT";
pub(crate) const COUNTRY_CODE: &str = "PE";
