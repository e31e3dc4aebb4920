//! Invoice domain types and the signing pipeline stages built on them.
pub mod encoding;
pub mod sign;
pub mod xml;

pub use sign::{DocumentSigner, SignedDocument, SigningError};
pub use xml::{DocumentBuilder, UnsignedDocument};

use chrono::NaiveDate;
use quick_xml::se::SeError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while turning an [`Invoice`] into an unsigned document.
///
/// These indicate input the upstream layer should have rejected, or a
/// builder bug; they are never retried.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invoice has no line items")]
    NoLineItems,
    #[error("line {line}: unknown tax affectation code '{code}'")]
    UnknownAffectationCode { line: usize, code: String },
    #[error("{field} is {declared} but the lines add up to {computed}")]
    TotalsMismatch {
        field: &'static str,
        declared: Decimal,
        computed: Decimal,
    },
    #[error("failed to serialize invoice to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
    #[error("XML parse error: {0}")]
    Parse(String),
    #[error("signature placeholder: {0}")]
    Placeholder(String),
}

/// Electronic document received from the request layer.
///
/// Field names on the wire follow the inbound JSON contract. The flat
/// `docAfectadoSerie`, `docAfectadoCorrelativo`, `docAfectadoTipo` and
/// `motivoNotaCredito` fields are accepted in place of `docAfectado`.
///
/// # Examples
/// ```rust
/// use factura_core::invoice::Invoice;
///
/// let json = r#"{
///   "tipoDocumento": "01", "serie": "F001", "correlativo": "1",
///   "fechaEmision": "2024-05-10", "moneda": "PEN",
///   "emisor": {"tipoDocIdentidad": "6", "ruc": "20601546913", "razonSocial": "ACME SAC"},
///   "receptor": {"tipoDocIdentidad": "6", "ruc": "20100066603", "razonSocial": "CLIENTE SAC"},
///   "totalGravado": "100.00", "totalIGV": "18.00", "totalGeneral": "118.00",
///   "detalles": [{
///     "codigoProducto": "P001", "descripcion": "Servicio", "unidadMedida": "ZZ",
///     "cantidad": "1", "valorUnitario": "100", "precioUnitario": "118",
///     "valorTotal": "100.00", "afectacionIGV": "10", "igv": "18.00"
///   }]
/// }"#;
/// let invoice: Invoice = serde_json::from_str(json)?;
/// assert_eq!(invoice.document_id(), "F001-1");
/// assert_eq!(invoice.file_stem(), "20601546913-01-F001-1");
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "InvoiceRecord")]
pub struct Invoice {
    /// Catalogue 01 code: `01` invoice, `03` receipt, `07` credit note, `08` debit note.
    #[serde(rename = "tipoDocumento")]
    pub document_type: String,
    #[serde(rename = "serie")]
    pub series: String,
    #[serde(rename = "correlativo")]
    pub correlative: String,
    #[serde(rename = "fechaEmision")]
    pub issue_date: NaiveDate,
    #[serde(rename = "moneda")]
    pub currency: String,
    #[serde(rename = "emisor")]
    pub issuer: Party,
    #[serde(rename = "receptor")]
    pub recipient: Party,
    #[serde(rename = "totalGravado")]
    pub taxable_amount: Decimal,
    #[serde(rename = "totalIGV")]
    pub tax_amount: Decimal,
    #[serde(rename = "totalGeneral")]
    pub total_amount: Decimal,
    #[serde(rename = "detalles")]
    pub line_items: Vec<LineItem>,
    #[serde(rename = "leyendas", default)]
    pub legends: Vec<Legend>,
    #[serde(
        rename = "docAfectado",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub affected_document: Option<AffectedDocument>,
}

impl Invoice {
    /// `<series>-<correlative>`, the value of the header `cbc:ID`.
    pub fn document_id(&self) -> String {
        format!("{}-{}", self.series, self.correlative)
    }

    /// `<issuer-id>-<doc-type>-<series>-<correlative>`, shared by the XML
    /// entry and the archive sent to the remote service.
    pub fn file_stem(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.issuer.identity_number, self.document_type, self.series, self.correlative
        )
    }

    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        let required = [
            (self.document_type.as_str(), "tipoDocumento"),
            (self.series.as_str(), "serie"),
            (self.correlative.as_str(), "correlativo"),
            (self.currency.as_str(), "moneda"),
            (self.issuer.identity_number.as_str(), "emisor.ruc"),
            (self.issuer.legal_name.as_str(), "emisor.razonSocial"),
            (self.recipient.identity_number.as_str(), "receptor.ruc"),
        ];
        for (value, field) in required {
            if value.trim().is_empty() {
                return Err(BuildError::MissingField(field));
            }
        }
        if self.line_items.is_empty() {
            return Err(BuildError::NoLineItems);
        }
        for (idx, item) in self.line_items.iter().enumerate() {
            if TaxScheme::from_affectation(&item.affectation_code).is_none() {
                return Err(BuildError::UnknownAffectationCode {
                    line: idx + 1,
                    code: item.affectation_code.clone(),
                });
            }
        }

        let taxed: Decimal = self
            .line_items
            .iter()
            .filter(|item| item.tax_scheme() == Some(TaxScheme::Igv))
            .map(|item| item.line_total)
            .sum();
        let tax: Decimal = self.line_items.iter().map(|item| item.tax_amount).sum();
        for (field, declared, computed) in [
            ("totalGravado", self.taxable_amount, taxed),
            ("totalIGV", self.tax_amount, tax),
        ] {
            if round_amount(declared) != round_amount(computed) {
                return Err(BuildError::TotalsMismatch {
                    field,
                    declared,
                    computed,
                });
            }
        }
        Ok(())
    }
}

/// Inbound shape of [`Invoice`], folding the flat affected document fields
/// into [`AffectedDocument`].
#[derive(Deserialize)]
struct InvoiceRecord {
    #[serde(rename = "tipoDocumento")]
    document_type: String,
    #[serde(rename = "serie")]
    series: String,
    #[serde(rename = "correlativo")]
    correlative: String,
    #[serde(rename = "fechaEmision")]
    issue_date: NaiveDate,
    #[serde(rename = "moneda")]
    currency: String,
    #[serde(rename = "emisor")]
    issuer: Party,
    #[serde(rename = "receptor")]
    recipient: Party,
    #[serde(rename = "totalGravado")]
    taxable_amount: Decimal,
    #[serde(rename = "totalIGV")]
    tax_amount: Decimal,
    #[serde(rename = "totalGeneral")]
    total_amount: Decimal,
    #[serde(rename = "detalles")]
    line_items: Vec<LineItem>,
    #[serde(rename = "leyendas", default)]
    legends: Vec<Legend>,
    #[serde(rename = "docAfectado", default)]
    affected_document: Option<AffectedDocument>,
    #[serde(rename = "docAfectadoSerie", default)]
    affected_series: String,
    #[serde(rename = "docAfectadoCorrelativo", default)]
    affected_correlative: String,
    #[serde(rename = "docAfectadoTipo", default)]
    affected_type: String,
    #[serde(rename = "motivoNotaCredito", default)]
    affected_reason: String,
}

/// Reason code assumed when only the flat fields are given: catalogue 09
/// `01`, cancellation of the operation.
const DEFAULT_REASON_CODE: &str = "01";

impl From<InvoiceRecord> for Invoice {
    fn from(record: InvoiceRecord) -> Self {
        let affected_document = record.affected_document.or_else(|| {
            (!record.affected_series.trim().is_empty()).then(|| AffectedDocument {
                document_type: record.affected_type,
                series: record.affected_series,
                correlative: record.affected_correlative,
                reason_code: DEFAULT_REASON_CODE.to_owned(),
                description: record.affected_reason,
            })
        });
        Invoice {
            document_type: record.document_type,
            series: record.series,
            correlative: record.correlative,
            issue_date: record.issue_date,
            currency: record.currency,
            issuer: record.issuer,
            recipient: record.recipient,
            taxable_amount: record.taxable_amount,
            tax_amount: record.tax_amount,
            total_amount: record.total_amount,
            line_items: record.line_items,
            legends: record.legends,
            affected_document,
        }
    }
}

fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Issuer or recipient of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Catalogue 06 code: `6` RUC, `1` DNI, `4` foreign ID card...
    #[serde(rename = "tipoDocIdentidad")]
    pub identity_document_type: String,
    #[serde(rename = "ruc")]
    pub identity_number: String,
    #[serde(rename = "razonSocial")]
    pub legal_name: String,
    #[serde(
        rename = "nombreComercial",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub commercial_name: Option<String>,
    /// Also accepted as a plain `direccion` string, which fills only
    /// [`Address::line`].
    #[serde(
        rename = "domicilio",
        alias = "direccion",
        default,
        deserialize_with = "address_or_line",
        skip_serializing_if = "Option::is_none"
    )]
    pub address: Option<Address>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressRecord {
    Structured(Address),
    Line(String),
}

fn address_or_line<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let address = match Option::<AddressRecord>::deserialize(deserializer)? {
        Some(AddressRecord::Structured(address)) => Some(address),
        Some(AddressRecord::Line(line)) if !line.trim().is_empty() => Some(Address {
            region: String::new(),
            province: String::new(),
            district: String::new(),
            locality_code: String::new(),
            line,
        }),
        _ => None,
    };
    Ok(address)
}

/// Structured fiscal address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(rename = "departamento")]
    pub region: String,
    #[serde(rename = "provincia")]
    pub province: String,
    #[serde(rename = "distrito")]
    pub district: String,
    /// Six digit UBIGEO locality code.
    #[serde(rename = "ubigeo")]
    pub locality_code: String,
    #[serde(rename = "direccion")]
    pub line: String,
}

/// One invoiced line.
///
/// `unit_value` is net of tax, `unit_price` includes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// 1-based position; the input order is used when absent.
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(rename = "codigoProducto")]
    pub product_code: String,
    #[serde(rename = "descripcion")]
    pub description: String,
    /// UN/ECE rec 20 unit code.
    #[serde(rename = "unidadMedida")]
    pub unit_code: String,
    #[serde(rename = "cantidad")]
    pub quantity: Decimal,
    #[serde(rename = "valorUnitario")]
    pub unit_value: Decimal,
    #[serde(rename = "precioUnitario")]
    pub unit_price: Decimal,
    #[serde(rename = "valorTotal")]
    pub line_total: Decimal,
    /// Catalogue 07 code.
    #[serde(rename = "afectacionIGV")]
    pub affectation_code: String,
    #[serde(rename = "igv")]
    pub tax_amount: Decimal,
}

impl LineItem {
    pub fn tax_scheme(&self) -> Option<TaxScheme> {
        TaxScheme::from_affectation(&self.affectation_code)
    }
}

/// Catalogue 52 legend, rendered as a `cbc:Note`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Legend {
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "valor")]
    pub value: String,
}

impl Legend {
    pub fn new(code: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value: value.into(),
        }
    }
}

/// Prior document a credit or debit note modifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedDocument {
    #[serde(rename = "tipo")]
    pub document_type: String,
    #[serde(rename = "serie")]
    pub series: String,
    #[serde(rename = "correlativo")]
    pub correlative: String,
    /// Catalogue 09/10 reason code.
    #[serde(rename = "codigoMotivo")]
    pub reason_code: String,
    #[serde(rename = "motivo")]
    pub description: String,
}

impl AffectedDocument {
    pub fn document_id(&self) -> String {
        format!("{}-{}", self.series, self.correlative)
    }
}

/// Tax scheme a line falls under, derived from its affectation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaxScheme {
    Igv,
    Exonerated,
    Unaffected,
    Export,
}

/// General sales tax rate applied to taxed lines.
pub const IGV_RATE: Decimal = Decimal::from_parts(1800, 0, 0, false, 2);

impl TaxScheme {
    pub fn from_affectation(code: &str) -> Option<Self> {
        let code: u8 = code.trim().parse().ok()?;
        match code {
            10..=17 => Some(TaxScheme::Igv),
            20 | 21 => Some(TaxScheme::Exonerated),
            30..=37 => Some(TaxScheme::Unaffected),
            40 => Some(TaxScheme::Export),
            _ => None,
        }
    }

    /// Catalogue 05 tributo code.
    pub fn id(&self) -> &'static str {
        match self {
            TaxScheme::Igv => "1000",
            TaxScheme::Exonerated => "9997",
            TaxScheme::Unaffected => "9998",
            TaxScheme::Export => "9995",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaxScheme::Igv => "IGV",
            TaxScheme::Exonerated => "EXO",
            TaxScheme::Unaffected => "INA",
            TaxScheme::Export => "EXP",
        }
    }

    pub fn type_code(&self) -> &'static str {
        match self {
            TaxScheme::Igv | TaxScheme::Exonerated => "VAT",
            TaxScheme::Unaffected | TaxScheme::Export => "FRE",
        }
    }

    /// UN/ECE 5305 tax category.
    pub fn category(&self) -> &'static str {
        match self {
            TaxScheme::Igv => "S",
            TaxScheme::Exonerated => "E",
            TaxScheme::Unaffected => "O",
            TaxScheme::Export => "G",
        }
    }

    pub fn percent(&self) -> Decimal {
        match self {
            TaxScheme::Igv => IGV_RATE,
            _ => Decimal::ZERO,
        }
    }
}
