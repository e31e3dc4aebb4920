//! billService client: packaging, SOAP exchange and receipt extraction.
//!
//! # Examples
//! ```rust,no_run
//! use factura_core::config::{Config, EnvironmentType, SolCredentials};
//! use factura_core::transport::SunatClient;
//!
//! # async fn run(signed: Vec<u8>) -> Result<(), factura_core::Error> {
//! let client = SunatClient::new(Config::new(EnvironmentType::Beta))?;
//! let creds = SolCredentials::sandbox("20601546913", "MODDATOS");
//! let receipt = client
//!     .send_bill("20601546913-01-F001-1", &signed, &creds)
//!     .await?;
//! println!("{}", receipt.xml());
//! # Ok(())
//! # }
//! ```
pub mod archive;
pub mod envelope;
pub mod response;

use crate::config::{Config, SolCredentials};
use archive::ArchiveError;
use base64ct::{Base64, Encoding};
use reqwest::Client;
pub use response::{ExtractionError, Receipt};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const CONTENT_TYPE: &str = "text/xml;charset=UTF-8";
const SOAP_ACTION: &str = "urn:sendBill";

/// Failures of the outbound exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to package document: {0}")]
    Archive(#[from] ArchiveError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP client error: {0}")]
    Http(reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("remote fault {code}: {message}")]
    Fault { code: String, message: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("HTTP client cannot be built: {0}")]
    Client(String),
}

/// SOAP client for the `sendBill` operation.
#[derive(Debug, Clone)]
pub struct SunatClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl SunatClient {
    /// The endpoint is resolved from `config` once, here.
    ///
    /// # Errors
    /// Returns [`TransportError::Client`] if the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self, TransportError> {
        let timeout = config.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Zip `signed_bytes` as `<file_stem>.xml`, send it as `<file_stem>.zip`
    /// and return the receipt.
    ///
    /// # Errors
    /// Transport failures and remote faults come back as
    /// [`crate::Error::Transport`]; a 2xx response whose receipt cannot be read
    /// is [`crate::Error::Extraction`].
    pub async fn send_bill(
        &self,
        file_stem: &str,
        signed_bytes: &[u8],
        credentials: &SolCredentials,
    ) -> Result<Receipt, crate::Error> {
        let zipped = archive::zip_single(&format!("{file_stem}.xml"), signed_bytes)
            .map_err(TransportError::from)?;
        let zip_name = format!("{file_stem}.zip");
        let body = envelope::send_bill_envelope(
            &zip_name,
            &Base64::encode_string(&zipped),
            credentials,
        );

        tracing::info!(
            endpoint = %self.endpoint,
            file_name = %zip_name,
            archive_bytes = zipped.len(),
            "sending bill"
        );

        let (status, body) = self.post(body).await?;
        if !(200..300).contains(&status) {
            return Err(classify_failure(status, body).into());
        }

        let receipt = response::extract_receipt(body.as_bytes()).inspect_err(|err| {
            if let ExtractionError::Fault { code, message } = err {
                tracing::warn!(%code, %message, "billService returned a fault");
            }
        })?;
        tracing::info!(
            entry = %receipt.entry_name(),
            response_code = receipt.response_code().as_deref().unwrap_or("-"),
            "receipt received"
        );
        Ok(receipt)
    }

    /// [`Self::send_bill`] that stops with [`TransportError::Cancelled`] once
    /// `cancel` fires.
    pub async fn send_bill_with_cancel(
        &self,
        file_stem: &str,
        signed_bytes: &[u8],
        credentials: &SolCredentials,
        cancel: CancellationToken,
    ) -> Result<Receipt, crate::Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(file_stem, "send cancelled");
                Err(TransportError::Cancelled.into())
            }
            result = self.send_bill(file_stem, signed_bytes, credentials) => result,
        }
    }

    async fn post(&self, body: String) -> Result<(u16, String), TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", CONTENT_TYPE)
            .header("SOAPAction", SOAP_ACTION)
            .body(body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.request_error(e))?;
        Ok((status, body))
    }

    fn request_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            tracing::warn!(timeout = ?self.timeout, "billService timed out");
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Http(err)
        }
    }
}

fn classify_failure(status: u16, body: String) -> TransportError {
    let fault = response::parse_response(body.as_bytes())
        .ok()
        .and_then(|doc| response::find_fault(&doc).ok().flatten());
    match fault {
        Some((code, message)) => {
            tracing::warn!(status, %code, %message, "billService returned a fault");
            TransportError::Fault { code, message }
        }
        None => {
            tracing::warn!(status, "billService returned an unexpected status");
            TransportError::Status { status, body }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const STEM: &str = "20601546913-01-F001-1";

    fn try_start_server() -> Option<MockServer> {
        std::panic::catch_unwind(MockServer::start).ok()
    }

    fn client_for(server: &MockServer) -> SunatClient {
        SunatClient::new(Config::default().with_endpoint(server.url("/billService")))
            .expect("client")
    }

    fn creds() -> SolCredentials {
        SolCredentials::sandbox("20601546913", "MODDATOS")
    }

    fn receipt_response(entry: &str, cdr: &str) -> String {
        let zipped = archive::zip_single(entry, cdr.as_bytes()).expect("zip");
        format!(
            concat!(
                r#"<soap-env:Envelope xmlns:soap-env="http://schemas.xmlsoap.org/soap/envelope/">"#,
                r#"<soap-env:Body><br:sendBillResponse xmlns:br="http://service.sunat.gob.pe">"#,
                "<applicationResponse>{}</applicationResponse>",
                "</br:sendBillResponse></soap-env:Body></soap-env:Envelope>"
            ),
            Base64::encode_string(&zipped)
        )
    }

    fn fault_response(message: &str) -> String {
        format!(
            concat!(
                r#"<soap-env:Envelope xmlns:soap-env="http://schemas.xmlsoap.org/soap/envelope/">"#,
                "<soap-env:Body><soap-env:Fault><faultcode>soap-env:Client.0102</faultcode>",
                "<faultstring>{}</faultstring></soap-env:Fault></soap-env:Body></soap-env:Envelope>"
            ),
            message
        )
    }

    #[test]
    fn posts_envelope_and_returns_receipt() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/billService")
                .header("content-type", "text/xml;charset=UTF-8")
                .header("soapaction", "urn:sendBill")
                .body_contains("<fileName>20601546913-01-F001-1.zip</fileName>")
                .body_contains("<wsse:Username>20601546913MODDATOS</wsse:Username>")
                .body_contains("<wsse:Password>20601546913</wsse:Password>");
            then.status(200)
                .body(receipt_response("R-20601546913-01-F001-1.xml", "<ok/>"));
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let receipt = rt
            .block_on(client_for(&server).send_bill(STEM, b"<Invoice/>", &creds()))
            .expect("receipt");
        mock.assert();
        assert_eq!(receipt.xml(), "<ok/>");
        assert_eq!(receipt.entry_name(), "R-20601546913-01-F001-1.xml");
    }

    #[test]
    fn fault_in_success_body_is_transport_fault() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        server.mock(|when, then| {
            when.method(POST).path("/billService");
            then.status(200).body(fault_response("El comprobante fue registrado previamente"));
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt
            .block_on(client_for(&server).send_bill(STEM, b"<Invoice/>", &creds()))
            .expect_err("fault");
        match err {
            crate::Error::Transport(TransportError::Fault { code, message }) => {
                assert_eq!(code, "soap-env:Client.0102");
                assert_eq!(message, "El comprobante fue registrado previamente");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_error_with_fault_is_transport_fault() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        server.mock(|when, then| {
            when.method(POST).path("/billService");
            then.status(500).body(fault_response("Usuario no autorizado"));
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt
            .block_on(client_for(&server).send_bill(STEM, b"<Invoice/>", &creds()))
            .expect_err("fault");
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::Fault { ref message, .. })
                if message == "Usuario no autorizado"
        ));
        assert!(err.is_remote_failure());
    }

    #[test]
    fn non_success_without_fault_is_status_error() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        server.mock(|when, then| {
            when.method(POST).path("/billService");
            then.status(503).body("maintenance");
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt
            .block_on(client_for(&server).send_bill(STEM, b"<Invoice/>", &creds()))
            .expect_err("status");
        match err {
            crate::Error::Transport(TransportError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn success_without_payload_is_extraction_error() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        server.mock(|when, then| {
            when.method(POST).path("/billService");
            then.status(200).body("<Envelope><Body/></Envelope>");
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt
            .block_on(client_for(&server).send_bill(STEM, b"<Invoice/>", &creds()))
            .expect_err("missing payload");
        assert!(matches!(
            err,
            crate::Error::Extraction(ExtractionError::MissingPayload)
        ));
    }

    #[test]
    fn slow_server_times_out() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        server.mock(|when, then| {
            when.method(POST).path("/billService");
            then.status(200)
                .delay(Duration::from_secs(3))
                .body(receipt_response("R-x.xml", "<ok/>"));
        });

        let client = SunatClient::new(
            Config::default()
                .with_endpoint(server.url("/billService"))
                .with_timeout(Duration::from_millis(200)),
        )
        .expect("client");
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt
            .block_on(client.send_bill(STEM, b"<Invoice/>", &creds()))
            .expect_err("timeout");
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::Timeout(d)) if d == Duration::from_millis(200)
        ));
    }

    #[test]
    fn unreachable_endpoint_is_http_error() {
        let client = SunatClient::new(
            Config::default()
                .with_endpoint("http://127.0.0.1:9/billService")
                .with_timeout(Duration::from_secs(5)),
        )
        .expect("client");
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt
            .block_on(client.send_bill(STEM, b"<Invoice/>", &creds()))
            .expect_err("connection refused");
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::Http(_) | TransportError::Timeout(_))
        ));
    }

    #[test]
    fn cancelled_token_stops_send() {
        let client = SunatClient::new(Config::default().with_endpoint("http://127.0.0.1:9/"))
            .expect("client");
        let token = CancellationToken::new();
        token.cancel();
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let err = rt
            .block_on(client.send_bill_with_cancel(STEM, b"<Invoice/>", &creds(), token))
            .expect_err("cancelled");
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::Cancelled)
        ));
    }

    #[test]
    fn cancelling_in_flight_request_returns_promptly() {
        let server = match try_start_server() {
            Some(server) => server,
            None => return,
        };
        server.mock(|when, then| {
            when.method(POST).path("/billService");
            then.status(200)
                .delay(Duration::from_secs(5))
                .body(receipt_response("R-x.xml", "<ok/>"));
        });

        let client = SunatClient::new(
            Config::default()
                .with_endpoint(server.url("/billService"))
                .with_timeout(Duration::from_secs(30)),
        )
        .expect("client");
        let token = CancellationToken::new();
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let started = std::time::Instant::now();
        let err = rt
            .block_on(async {
                let canceller = token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    canceller.cancel();
                });
                client
                    .send_bill_with_cancel(STEM, b"<Invoice/>", &creds(), token)
                    .await
            })
            .expect_err("cancelled");

        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::Cancelled)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn explicit_endpoint_wins() {
        let client = SunatClient::new(Config::default().with_endpoint("http://localhost/bs"))
            .expect("client");
        assert_eq!(client.endpoint(), "http://localhost/bs");
        assert_eq!(client.timeout(), crate::config::DEFAULT_TIMEOUT);
    }
}
