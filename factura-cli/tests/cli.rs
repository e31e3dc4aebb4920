use httpmock::prelude::*;
use std::path::PathBuf;
use std::process::Command;

fn cli_exe() -> &'static str {
    env!("CARGO_BIN_EXE_factura")
}

fn fixture(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("factura-core")
        .join("tests")
        .join("fixtures")
        .join(relative)
}

fn signing_args() -> Vec<String> {
    vec![
        "--key".into(),
        fixture("certs/private_pkcs8.key").display().to_string(),
        "--cert".into(),
        fixture("certs/public.pem").display().to_string(),
    ]
}

#[test]
fn sign_command_writes_document_and_summary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output_path = dir.path().join("20601546913-01-F001-1.xml");
    let output = Command::new(cli_exe())
        .arg("sign")
        .arg("--invoice")
        .arg(fixture("invoices/F001-1.json"))
        .args(signing_args())
        .arg("--output")
        .arg(&output_path)
        .output()
        .expect("run sign command");

    assert!(
        output.status.success(),
        "sign command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let summary = serde_json::from_slice::<serde_json::Value>(&output.stdout)
        .expect("parse json output");
    assert_eq!(
        summary.get("documentId").and_then(|v| v.as_str()),
        Some("F001-1")
    );
    assert_eq!(
        summary.get("fileName").and_then(|v| v.as_str()),
        Some("20601546913-01-F001-1.xml")
    );

    let signed = std::fs::read(&output_path).expect("read signed document");
    assert!(signed.starts_with(br#"<?xml version="1.0" encoding="ISO-8859-1"?>"#));
    assert!(signed.windows(13).any(|w| w == b"<ds:Signature"));
}

#[test]
fn verify_command_accepts_golden_document() {
    let output = Command::new(cli_exe())
        .args(["verify", "--xml"])
        .arg(fixture("golden/F001-1-signed.xml"))
        .arg("--cert")
        .arg(fixture("certs/public.pem"))
        .output()
        .expect("run verify command");

    assert!(
        output.status.success(),
        "verify command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "OK");
}

#[test]
fn verify_command_fails_for_unsigned_document() {
    let output = Command::new(cli_exe())
        .args(["verify", "--xml"])
        .arg(fixture("golden/F001-1-unsigned.xml"))
        .output()
        .expect("run verify command");
    assert!(!output.status.success());
}

#[test]
fn extract_command_prints_receipt() {
    let expected = std::fs::read_to_string(fixture("responses/R-20601546913-01-F001-1.xml"))
        .expect("read receipt fixture");
    let output = Command::new(cli_exe())
        .args(["extract", "--response"])
        .arg(fixture("responses/send-bill-accepted.xml"))
        .output()
        .expect("run extract command");

    assert!(
        output.status.success(),
        "extract command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), expected);
}

#[test]
fn extract_command_reports_fault() {
    let output = Command::new(cli_exe())
        .args(["extract", "--response"])
        .arg(fixture("responses/send-bill-fault.xml"))
        .output()
        .expect("run extract command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("El comprobante fue registrado previamente con otros datos"));
}

#[test]
fn send_command_writes_receipt() {
    let server = match std::panic::catch_unwind(MockServer::start).ok() {
        Some(server) => server,
        None => return,
    };
    let response =
        std::fs::read(fixture("responses/send-bill-accepted.xml")).expect("read response");
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/billService")
            .body_contains("<fileName>20601546913-01-F001-1.zip</fileName>");
        then.status(200).body(response);
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let receipt_path = dir.path().join("R-20601546913-01-F001-1.xml");
    let output = Command::new(cli_exe())
        .arg("send")
        .arg("--invoice")
        .arg(fixture("invoices/F001-1.json"))
        .args(signing_args())
        .arg("--endpoint")
        .arg(server.url("/billService"))
        .arg("--receipt")
        .arg(&receipt_path)
        .output()
        .expect("run send command");

    assert!(
        output.status.success(),
        "send command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    mock.assert();
    let receipt = std::fs::read_to_string(&receipt_path).expect("read receipt");
    assert!(receipt.contains("<cbc:ResponseCode>0</cbc:ResponseCode>"));
}
