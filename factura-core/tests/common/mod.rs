use factura_core::config::Config;
use factura_core::invoice::{DocumentSigner, Invoice};
use factura_core::pipeline::DocumentProcessor;
use factura_core::transport::SunatClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CBC_NS: &str = "urn:oasis:names:specification:ubl:schema:xsd:CommonBasicComponents-2";
pub const CAC_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonAggregateComponents-2";
pub const UBL_NS: &str = "urn:oasis:names:specification:ubl:schema:xsd:Invoice-2";
pub const EXT_NS: &str =
    "urn:oasis:names:specification:ubl:schema:xsd:CommonExtensionComponents-2";
pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

pub fn fixture_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(relative)
}

#[allow(dead_code)]
pub fn read_fixture(relative: &str) -> Vec<u8> {
    std::fs::read(fixture_path(relative)).expect("read fixture")
}

#[allow(dead_code)]
pub fn invoice(name: &str) -> Invoice {
    let json = std::fs::read_to_string(fixture_path(&format!("invoices/{name}.json")))
        .expect("read invoice fixture");
    serde_json::from_str(&json).expect("parse invoice fixture")
}

pub fn signer() -> DocumentSigner {
    let cert = std::fs::read_to_string(fixture_path("certs/public.pem")).expect("cert");
    let key = std::fs::read_to_string(fixture_path("certs/private_pkcs8.key")).expect("key");
    DocumentSigner::from_pem(&cert, &key).expect("signer")
}

#[allow(dead_code)]
pub fn processor(endpoint: &str) -> DocumentProcessor {
    let client = SunatClient::new(Config::default().with_endpoint(endpoint)).expect("client");
    DocumentProcessor::new(Arc::new(signer()), client)
}

#[allow(dead_code)]
pub fn xpath_context(doc: &libxml::tree::Document) -> libxml::xpath::Context {
    let ctx = libxml::xpath::Context::new(doc).expect("xpath context");
    for (prefix, ns) in [
        ("cbc", CBC_NS),
        ("cac", CAC_NS),
        ("ubl", UBL_NS),
        ("ext", EXT_NS),
        ("ds", DS_NS),
    ] {
        ctx.register_namespace(prefix, ns).expect("register ns");
    }
    ctx
}

#[allow(dead_code)]
pub fn xpath_texts(ctx: &libxml::xpath::Context, expr: &str) -> Vec<String> {
    ctx.evaluate(expr)
        .expect("xpath")
        .get_nodes_as_vec()
        .iter()
        .map(|node| node.get_content())
        .collect()
}
