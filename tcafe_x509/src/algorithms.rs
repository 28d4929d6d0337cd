//! OID to display-name mapping for signature and key algorithms.

/// Signature algorithm name for an OID, in the naming convention the store
/// already holds ("SHA256-RSA", "ECDSA-SHA384", ...). Unknown OIDs fall back
/// to the dotted form.
pub fn signature_algorithm_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.2" => "MD2-RSA",
        "1.2.840.113549.1.1.4" => "MD5-RSA",
        "1.2.840.113549.1.1.5" => "SHA1-RSA",
        "1.2.840.113549.1.1.11" => "SHA256-RSA",
        "1.2.840.113549.1.1.12" => "SHA384-RSA",
        "1.2.840.113549.1.1.13" => "SHA512-RSA",
        "1.2.840.113549.1.1.10" => "RSA-PSS",
        "1.2.840.10040.4.3" => "DSA-SHA1",
        "2.16.840.1.101.3.4.3.2" => "DSA-SHA256",
        "1.2.840.10045.4.1" => "ECDSA-SHA1",
        "1.2.840.10045.4.3.2" => "ECDSA-SHA256",
        "1.2.840.10045.4.3.3" => "ECDSA-SHA384",
        "1.2.840.10045.4.3.4" => "ECDSA-SHA512",
        "1.3.101.112" => "Ed25519",
        other => return other.to_string(),
    }
    .to_string()
}

/// Public key algorithm and size in bits from the SPKI algorithm OID, the
/// optional named-curve parameter OID, and the RSA modulus when present.
pub fn public_key_algorithm(
    algorithm_oid: &str,
    curve_oid: Option<&str>,
    rsa_modulus: Option<&[u8]>,
) -> (String, u32) {
    match algorithm_oid {
        "1.2.840.113549.1.1.1" | "1.2.840.113549.1.1.10" => {
            let bits = rsa_modulus.map(modulus_bits).unwrap_or(0);
            ("RSA".to_string(), bits)
        }
        "1.2.840.10045.2.1" => {
            let bits = curve_oid.map(curve_bits).unwrap_or(0);
            ("ECDSA".to_string(), bits)
        }
        "1.3.101.112" => ("Ed25519".to_string(), 256),
        "1.2.840.10040.4.1" => ("DSA".to_string(), 0),
        _ => ("Unknown".to_string(), 0),
    }
}

fn curve_bits(oid: &str) -> u32 {
    match oid {
        "1.3.132.0.33" => 224,
        "1.2.840.10045.3.1.7" => 256,
        "1.3.132.0.10" => 256,
        "1.3.132.0.34" => 384,
        "1.3.132.0.35" => 521,
        _ => 0,
    }
}

fn modulus_bits(modulus: &[u8]) -> u32 {
    // DER integers carry a leading zero octet when the high bit is set.
    let stripped = modulus.iter().skip_while(|b| **b == 0).count();
    (stripped * 8) as u32
}
