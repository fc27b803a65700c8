//! Certificates, private keys and issuance

use crate::error::{PkiError, Result};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509, X509NameBuilder, X509Ref};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

const RSA_KEY_BITS: u32 = 2048;
const CA_VALIDITY_DAYS: u32 = 3650;
const LEAF_VALIDITY_DAYS: u32 = 455;

/// PEM-encoded X.509 certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Certificate {
    pem: String,
}

impl Certificate {
    pub fn from_pem(pem: impl Into<String>) -> Result<Self> {
        let pem = pem.into();
        X509::from_pem(pem.as_bytes())
            .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
        Ok(Self { pem })
    }

    pub(crate) fn from_x509(cert: &X509Ref) -> Result<Self> {
        let pem = String::from_utf8(cert.to_pem()?)
            .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
        Ok(Self { pem })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn x509(&self) -> Result<X509> {
        Ok(X509::from_pem(self.pem.as_bytes())?)
    }

    /// Serial number as a decimal string; used as the keyset item id
    pub fn serial(&self) -> Result<String> {
        let x509 = self.x509()?;
        let bn = x509.serial_number().to_bn()?;
        Ok(bn.to_dec_str()?.to_string())
    }

    /// Subject rendered as `CN=...,O=...`
    pub fn subject(&self) -> Result<String> {
        let x509 = self.x509()?;
        let mut parts = Vec::new();
        for entry in x509.subject_name().entries() {
            let key = match entry.object().nid() {
                Nid::COMMONNAME => "CN",
                Nid::ORGANIZATIONNAME => "O",
                _ => continue,
            };
            let value = entry.data().as_utf8()?;
            parts.push(format!("{}={}", key, value));
        }
        Ok(parts.join(","))
    }

    pub fn common_name(&self) -> Result<Option<String>> {
        let x509 = self.x509()?;
        let cn = x509
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .map(|e| e.data().as_utf8().map(|s| s.to_string()))
            .transpose()?;
        Ok(cn)
    }

    /// DNS names and IP addresses from the subjectAltName extension
    pub fn alternate_names(&self) -> Result<Vec<String>> {
        let x509 = self.x509()?;
        let mut names = Vec::new();
        if let Some(sans) = x509.subject_alt_names() {
            for san in sans.iter() {
                if let Some(dns) = san.dnsname() {
                    names.push(dns.to_string());
                } else if let Some(ip) = san.ipaddress() {
                    let addr = match ip.len() {
                        4 => {
                            let b: [u8; 4] = ip.try_into().unwrap_or([0; 4]);
                            Some(IpAddr::from(b))
                        }
                        16 => {
                            let b: [u8; 16] = ip.try_into().unwrap_or([0; 16]);
                            Some(IpAddr::from(b))
                        }
                        _ => None,
                    };
                    if let Some(addr) = addr {
                        names.push(addr.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Whether `key` is the private half of this certificate's public key
    pub fn matches_key(&self, key: &PrivateKey) -> Result<bool> {
        let x509 = self.x509()?;
        let pkey = key.pkey()?;
        Ok(x509.public_key()?.public_eq(&pkey))
    }
}

/// PEM-encoded (PKCS#8) private key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey {
    pem: String,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl PrivateKey {
    pub fn generate() -> Result<Self> {
        let rsa = Rsa::generate(RSA_KEY_BITS)?;
        let pkey = PKey::from_rsa(rsa)?;
        Self::from_pkey(&pkey)
    }

    pub fn from_pem(pem: impl Into<String>) -> Result<Self> {
        let pem = pem.into();
        PKey::private_key_from_pem(pem.as_bytes())
            .map_err(|e| PkiError::InvalidCertificate(format!("private key: {}", e)))?;
        Ok(Self { pem })
    }

    fn from_pkey(pkey: &PKey<Private>) -> Result<Self> {
        let pem = String::from_utf8(pkey.private_key_to_pem_pkcs8()?)
            .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
        Ok(Self { pem })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn pkey(&self) -> Result<PKey<Private>> {
        Ok(PKey::private_key_from_pem(self.pem.as_bytes())?)
    }
}

/// What a certificate is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertType {
    Ca,
    Client,
    Server,
}

/// Subject of an issued certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<String>,
}

impl Subject {
    pub fn cn(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organizations: Vec::new(),
        }
    }
}

/// The signing material taken from a keyset's primary item
#[derive(Debug, Clone)]
pub struct Signer {
    pub certificate: Certificate,
    pub private_key: PrivateKey,
}

/// Parameters for [`issue_certificate`]
#[derive(Debug, Clone)]
pub struct IssueCertRequest {
    pub cert_type: CertType,
    pub subject: Subject,
    pub alternate_names: Vec<String>,
    /// Decimal serial number
    pub serial: String,
    /// Reuse an existing key instead of generating one
    pub private_key: Option<PrivateKey>,
    pub validity_days: Option<u32>,
}

/// Sign a new certificate.
///
/// With `signer = None` the request must be a CA and the certificate is
/// self-signed.
pub fn issue_certificate(
    request: &IssueCertRequest,
    signer: Option<&Signer>,
) -> Result<(Certificate, PrivateKey)> {
    if signer.is_none() && request.cert_type != CertType::Ca {
        return Err(PkiError::InvalidCertificate(format!(
            "{} certificate {} needs a signer",
            match request.cert_type {
                CertType::Ca => "ca",
                CertType::Client => "client",
                CertType::Server => "server",
            },
            request.subject.common_name
        )));
    }

    let private_key = match &request.private_key {
        Some(k) => k.clone(),
        None => PrivateKey::generate()?,
    };
    let pkey = private_key.pkey()?;

    let mut name = X509NameBuilder::new()?;
    for org in &request.subject.organizations {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, org)?;
    }
    name.append_entry_by_nid(Nid::COMMONNAME, &request.subject.common_name)?;
    let name = name.build();

    let serial = BigNum::from_dec_str(&request.serial)?;
    let serial: Asn1Integer = serial.to_asn1_integer()?;

    let validity_days = request.validity_days.unwrap_or(match request.cert_type {
        CertType::Ca => CA_VALIDITY_DAYS,
        _ => LEAF_VALIDITY_DAYS,
    });

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(&pkey)?;
    // Backdate to tolerate clock skew between operator and nodes
    let now = chrono::Utc::now().timestamp() - 3600;
    let not_before = Asn1Time::from_unix(now)?;
    let not_after = Asn1Time::days_from_now(validity_days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    let signer_cert = signer.map(|s| s.certificate.x509()).transpose()?;
    match &signer_cert {
        Some(cert) => builder.set_issuer_name(cert.subject_name())?,
        None => builder.set_issuer_name(&name)?,
    }

    match request.cert_type {
        CertType::Ca => {
            builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .digital_signature()
                    .build()?,
            )?;
        }
        CertType::Client => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
            )?;
            builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
        }
        CertType::Server => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
            )?;
            builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
        }
    }

    if !request.alternate_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for alt in &request.alternate_names {
            if alt.parse::<IpAddr>().is_ok() {
                san.ip(alt);
            } else {
                san.dns(alt);
            }
        }
        let extension = {
            let ctx = builder.x509v3_context(signer_cert.as_deref(), None);
            san.build(&ctx)?
        };
        builder.append_extension(extension)?;
    }

    let signing_key = match signer {
        Some(s) => s.private_key.pkey()?,
        None => pkey.clone(),
    };
    builder.sign(&signing_key, MessageDigest::sha256())?;
    let cert = builder.build();

    Ok((Certificate::from_x509(&cert)?, private_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca(serial: &str) -> (Certificate, PrivateKey) {
        issue_certificate(
            &IssueCertRequest {
                cert_type: CertType::Ca,
                subject: Subject::cn("kubernetes-ca"),
                alternate_names: vec![],
                serial: serial.to_string(),
                private_key: None,
                validity_days: None,
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_self_signed_ca() {
        let (cert, key) = ca("1234567890123456789012345");
        assert_eq!(cert.serial().unwrap(), "1234567890123456789012345");
        assert_eq!(cert.subject().unwrap(), "CN=kubernetes-ca");
        assert!(cert.matches_key(&key).unwrap());
    }

    #[test]
    fn test_validity_window_is_backdated() {
        let (cert, _) = issue_certificate(
            &IssueCertRequest {
                cert_type: CertType::Ca,
                subject: Subject::cn("kubernetes-ca"),
                alternate_names: vec![],
                serial: "7".to_string(),
                private_key: None,
                validity_days: Some(10),
            },
            None,
        )
        .unwrap();
        let x509 = cert.x509().unwrap();
        let now = Asn1Time::days_from_now(0).unwrap();

        let skew = x509.not_before().diff(&now).unwrap();
        assert_eq!(skew.days, 0);
        assert!(skew.secs >= 3600, "{}", skew.secs);
        let window = x509.not_before().diff(x509.not_after()).unwrap();
        assert_eq!(window.days, 10);
    }

    #[test]
    fn test_leaf_signed_by_ca() {
        let (ca_cert, ca_key) = ca("100");
        let signer = Signer {
            certificate: ca_cert.clone(),
            private_key: ca_key,
        };
        let (leaf, _) = issue_certificate(
            &IssueCertRequest {
                cert_type: CertType::Server,
                subject: Subject {
                    common_name: "kubernetes-master".to_string(),
                    organizations: vec!["system:masters".to_string()],
                },
                alternate_names: vec!["api.example.com".to_string(), "100.64.0.1".to_string()],
                serial: "101".to_string(),
                private_key: None,
                validity_days: None,
            },
            Some(&signer),
        )
        .unwrap();

        let leaf_x509 = leaf.x509().unwrap();
        let ca_pub = ca_cert.x509().unwrap().public_key().unwrap();
        assert!(leaf_x509.verify(&ca_pub).unwrap());
        assert_eq!(
            leaf.alternate_names().unwrap(),
            vec!["100.64.0.1", "api.example.com"]
        );
        assert_eq!(
            leaf.subject().unwrap(),
            "O=system:masters,CN=kubernetes-master"
        );
    }

    #[test]
    fn test_leaf_requires_signer() {
        let err = issue_certificate(
            &IssueCertRequest {
                cert_type: CertType::Client,
                subject: Subject::cn("kubelet"),
                alternate_names: vec![],
                serial: "5".to_string(),
                private_key: None,
                validity_days: None,
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PkiError::InvalidCertificate(_)));
    }
}
