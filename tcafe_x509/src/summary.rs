use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use snafu::Snafu;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::algorithms::{public_key_algorithm, signature_algorithm_name};

const OID_OCSP: &str = "1.3.6.1.5.5.7.48.1";
const OID_CT_POISON: &str = "1.3.6.1.4.1.11129.2.4.3";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CertificateError {
    #[snafu(display("failed to parse certificate: {message}"))]
    ParseCertificate { message: String },
}

pub type Result<T, E = CertificateError> = std::result::Result<T, E>;

/// Distinguished name broken into the components the store indexes.
#[derive(Debug, Clone, Default)]
pub struct NameSummary {
    pub distinguished_name: String,
    pub common_name: String,
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,
    pub country: Vec<String>,
    pub locality: Vec<String>,
    pub province: Vec<String>,
}

/// One raw extension, preserved for the OID-keyed extension map.
#[derive(Debug, Clone)]
pub struct ExtensionEntry {
    pub oid: String,
    pub critical: bool,
    pub value_base64: String,
}

/// Everything the ingesters extract from one DER certificate.
#[derive(Debug, Clone)]
pub struct CertificateSummary {
    pub der_sha256: String,
    pub tbs_sha256: String,
    pub subject: NameSummary,
    pub issuer: NameSummary,
    /// Hex of the serial magnitude bytes, no leading zeros.
    pub serial_hex: String,
    /// Decimal rendering of the serial.
    pub serial_decimal: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names, IP addresses (rendered), email addresses and URIs.
    pub subject_alternative_names: Vec<String>,
    pub signature_algorithm: String,
    pub public_key_algorithm: String,
    pub public_key_bits: u32,
    pub is_ca: bool,
    pub path_len_constraint: Option<u32>,
    pub key_usage: Vec<String>,
    pub extended_key_usage: Vec<String>,
    pub subject_key_identifier: Option<String>,
    pub authority_key_identifier: Option<String>,
    pub crl_distribution_points: Vec<String>,
    pub ocsp_urls: Vec<String>,
    pub extensions: Vec<ExtensionEntry>,
}

/// Parse a DER certificate and extract the full field set.
pub fn summarize_certificate(der: &[u8]) -> Result<CertificateSummary> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|err| {
        ParseCertificateSnafu {
            message: err.to_string(),
        }
        .build()
    })?;

    let tbs_raw = cert.tbs_certificate.as_ref();

    let mut summary = CertificateSummary {
        der_sha256: hex::encode(Sha256::digest(der)),
        tbs_sha256: hex::encode(Sha256::digest(tbs_raw)),
        subject: summarize_name(cert.subject()),
        issuer: summarize_name(cert.issuer()),
        serial_hex: serial_hex(cert.raw_serial()),
        serial_decimal: cert.tbs_certificate.serial.to_str_radix(10),
        not_before: datetime_from_asn1(&cert.validity().not_before),
        not_after: datetime_from_asn1(&cert.validity().not_after),
        subject_alternative_names: Vec::new(),
        signature_algorithm: signature_algorithm_name(
            &cert.signature_algorithm.algorithm.to_id_string(),
        ),
        public_key_algorithm: String::new(),
        public_key_bits: 0,
        is_ca: false,
        path_len_constraint: None,
        key_usage: Vec::new(),
        extended_key_usage: Vec::new(),
        subject_key_identifier: None,
        authority_key_identifier: None,
        crl_distribution_points: Vec::new(),
        ocsp_urls: Vec::new(),
        extensions: Vec::new(),
    };

    summarize_public_key(&cert, &mut summary);

    for extension in cert.extensions() {
        summary.extensions.push(ExtensionEntry {
            oid: extension.oid.to_id_string(),
            critical: extension.critical,
            value_base64: BASE64.encode(extension.value),
        });

        match extension.parsed_extension() {
            ParsedExtension::BasicConstraints(bc) => {
                summary.is_ca = bc.ca;
                summary.path_len_constraint = bc.path_len_constraint;
            }
            ParsedExtension::KeyUsage(ku) => {
                summary.key_usage = key_usage_names(ku);
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                summary.extended_key_usage = extended_key_usage_names(eku);
            }
            ParsedExtension::SubjectAlternativeName(san) => {
                summary.subject_alternative_names = san
                    .general_names
                    .iter()
                    .filter_map(general_name_string)
                    .collect();
            }
            ParsedExtension::SubjectKeyIdentifier(ski) => {
                summary.subject_key_identifier = Some(hex::encode(ski.0));
            }
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                summary.authority_key_identifier =
                    aki.key_identifier.as_ref().map(|ki| hex::encode(ki.0));
            }
            ParsedExtension::CRLDistributionPoints(crl) => {
                for point in crl.points.iter() {
                    let Some(DistributionPointName::FullName(names)) = &point.distribution_point
                    else {
                        continue;
                    };
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            summary.crl_distribution_points.push(uri.to_string());
                        }
                    }
                }
            }
            ParsedExtension::AuthorityInfoAccess(aia) => {
                for desc in aia.accessdescs.iter() {
                    if desc.access_method.to_id_string() != OID_OCSP {
                        continue;
                    }
                    if let GeneralName::URI(uri) = &desc.access_location {
                        summary.ocsp_urls.push(uri.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    Ok(summary)
}

/// Whether a bare TBS certificate carries the CT poison extension. Parse
/// failures count as absent.
pub fn tbs_contains_poison(tbs: &[u8]) -> bool {
    let Ok((_, tbs)) = TbsCertificate::from_der(tbs) else {
        return false;
    };
    tbs.extensions()
        .iter()
        .any(|ext| ext.oid.to_id_string() == OID_CT_POISON)
}

/// Hex of the serial magnitude, matching the store's existing rows: leading
/// zero octets stripped, empty for a zero serial.
pub fn serial_hex(raw: &[u8]) -> String {
    let stripped: Vec<u8> = raw.iter().copied().skip_while(|b| *b == 0).collect();
    hex::encode(stripped)
}

fn datetime_from_asn1(time: &ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_default()
}

fn summarize_name(name: &X509Name<'_>) -> NameSummary {
    fn collect<'a>(
        iter: impl Iterator<Item = &'a AttributeTypeAndValue<'a>>,
    ) -> Vec<String> {
        iter.filter_map(|attr| attr.as_str().ok())
            .map(|value| value.to_string())
            .collect()
    }

    NameSummary {
        distinguished_name: name.to_string(),
        common_name: collect(name.iter_common_name())
            .into_iter()
            .next()
            .unwrap_or_default(),
        organization: collect(name.iter_organization()),
        organizational_unit: collect(name.iter_organizational_unit()),
        country: collect(name.iter_country()),
        locality: collect(name.iter_locality()),
        province: collect(name.iter_state_or_province()),
    }
}

fn summarize_public_key(cert: &X509Certificate<'_>, summary: &mut CertificateSummary) {
    let spki = cert.public_key();
    let algorithm_oid = spki.algorithm.algorithm.to_id_string();

    let curve_oid = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|params| params.as_oid().ok())
        .map(|oid| oid.to_id_string());

    let parsed = spki.parsed().ok();
    let rsa_modulus = match &parsed {
        Some(PublicKey::RSA(rsa)) => Some(rsa.modulus),
        _ => None,
    };

    let (algorithm, bits) =
        public_key_algorithm(&algorithm_oid, curve_oid.as_deref(), rsa_modulus);
    summary.public_key_algorithm = algorithm;
    summary.public_key_bits = bits;
}

fn general_name_string(name: &GeneralName<'_>) -> Option<String> {
    match name {
        GeneralName::DNSName(dns) => Some(dns.to_string()),
        GeneralName::RFC822Name(email) => Some(email.to_string()),
        GeneralName::URI(uri) => Some(uri.to_string()),
        GeneralName::IPAddress(bytes) => ip_string(bytes),
        _ => None,
    }
}

fn ip_string(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

fn key_usage_names(ku: &KeyUsage) -> Vec<String> {
    let mut names = Vec::new();
    if ku.digital_signature() {
        names.push("DigitalSignature");
    }
    if ku.non_repudiation() {
        names.push("ContentCommitment");
    }
    if ku.key_encipherment() {
        names.push("KeyEncipherment");
    }
    if ku.data_encipherment() {
        names.push("DataEncipherment");
    }
    if ku.key_agreement() {
        names.push("KeyAgreement");
    }
    if ku.key_cert_sign() {
        names.push("CertSign");
    }
    if ku.crl_sign() {
        names.push("CRLSign");
    }
    if ku.encipher_only() {
        names.push("EncipherOnly");
    }
    if ku.decipher_only() {
        names.push("DecipherOnly");
    }
    names.into_iter().map(String::from).collect()
}

fn extended_key_usage_names(eku: &ExtendedKeyUsage) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    if eku.server_auth {
        names.push("ServerAuth".to_string());
    }
    if eku.client_auth {
        names.push("ClientAuth".to_string());
    }
    if eku.code_signing {
        names.push("CodeSigning".to_string());
    }
    if eku.email_protection {
        names.push("EmailProtection".to_string());
    }
    if eku.time_stamping {
        names.push("TimeStamping".to_string());
    }
    if eku.ocsp_signing {
        names.push("OCSPSigning".to_string());
    }
    for _ in eku.other.iter() {
        names.push("Unknown".to_string());
    }
    names
}
