//! SOAP request envelope for `sendBill`.
use crate::config::SolCredentials;
use quick_xml::escape::escape;

/// `sendBill` request with a WS-Security UsernameToken header.
///
/// Field names and element order are fixed by the remote service.
pub fn send_bill_envelope(
    file_name: &str,
    content_base64: &str,
    credentials: &SolCredentials,
) -> String {
    format!(
        concat!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:ser="http://service.sunat.gob.pe" "#,
            r#"xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">"#,
            "<soapenv:Header><wsse:Security><wsse:UsernameToken>",
            "<wsse:Username>{username}</wsse:Username>",
            "<wsse:Password>{password}</wsse:Password>",
            "</wsse:UsernameToken></wsse:Security></soapenv:Header>",
            "<soapenv:Body><ser:sendBill>",
            "<fileName>{file_name}</fileName>",
            "<contentFile>{content}</contentFile>",
            "</ser:sendBill></soapenv:Body></soapenv:Envelope>"
        ),
        username = escape(credentials.username()),
        password = escape(credentials.password()),
        file_name = escape(file_name),
        content = content_base64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SANDBOX_OPERATOR, SolCredentials};

    #[test]
    fn envelope_matches_remote_template() {
        let creds = SolCredentials::sandbox("20601546913", SANDBOX_OPERATOR);
        let envelope = send_bill_envelope("20601546913-01-F001-1.zip", "UEsDBA==", &creds);
        assert_eq!(
            envelope,
            concat!(
                r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ser="http://service.sunat.gob.pe" xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">"#,
                "<soapenv:Header><wsse:Security><wsse:UsernameToken>",
                "<wsse:Username>20601546913MODDATOS</wsse:Username>",
                "<wsse:Password>20601546913</wsse:Password>",
                "</wsse:UsernameToken></wsse:Security></soapenv:Header>",
                "<soapenv:Body><ser:sendBill><fileName>20601546913-01-F001-1.zip</fileName>",
                "<contentFile>UEsDBA==</contentFile></ser:sendBill></soapenv:Body></soapenv:Envelope>"
            )
        );
    }

    #[test]
    fn credentials_are_escaped() {
        let creds = SolCredentials::new("20601546913", "USER<1>", "p&ss");
        let envelope = send_bill_envelope("a.zip", "", &creds);
        assert!(envelope.contains("<wsse:Username>USER&lt;1&gt;</wsse:Username>"));
        assert!(envelope.contains("<wsse:Password>p&amp;ss</wsse:Password>"));
    }
}
