//! Signing capabilities and certificate chains.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::pkcs8::DecodePrivateKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use tracing::debug;
use x509_cert::{
    Certificate,
    der::{Decode, Encode},
    spki::ObjectIdentifier,
};

use super::{DataToSign, DigestAlgorithm, KeyAlgorithm, SignatureValue, SigningError};

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// Something that can produce signature values for one certificate chain.
///
/// Implementations may be local keys, hardware tokens or remote services;
/// calls are blocking and the signer never retries them.
pub trait SigningCapability {
    fn certificate_chain(&self) -> Result<CertificateChain, SigningError>;

    /// Algorithm of the key behind [`SigningCapability::sign`]; selects the
    /// `SignatureMethod` of the signature.
    fn key_algorithm(&self) -> KeyAlgorithm;

    fn sign(&self, data: &DataToSign) -> Result<SignatureValue, SigningError>;
}

/// Source of signing capabilities owned outside the signer.
pub trait KeyMaterialProvider {
    fn signing_capability(&self) -> Result<&dyn SigningCapability, SigningError>;
}

/// Certificates leaf first. Never empty.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    pub fn new(certificates: Vec<Certificate>) -> Result<Self, SigningError> {
        if certificates.is_empty() {
            return Err(SigningError::KeyMaterial("empty certificate chain".into()));
        }
        Ok(Self { certificates })
    }

    /// One or more concatenated PEM certificates, leaf first.
    pub fn from_pem(pem: &str) -> Result<Self, SigningError> {
        let certificates = Certificate::load_pem_chain(pem.as_bytes())
            .map_err(|e| SigningError::KeyMaterial(format!("Certificate parse error: {e:?}")))?;
        Self::new(certificates)
    }

    pub fn from_der(der: &[u8]) -> Result<Self, SigningError> {
        let certificate = Certificate::from_der(der)
            .map_err(|e| SigningError::KeyMaterial(format!("Certificate parse error: {e:?}")))?;
        Self::new(vec![certificate])
    }

    /// Appends intermediate or root certificates after the current ones.
    pub fn extend_from_pem(mut self, pem: &str) -> Result<Self, SigningError> {
        let extra = Certificate::load_pem_chain(pem.as_bytes())
            .map_err(|e| SigningError::KeyMaterial(format!("Certificate parse error: {e:?}")))?;
        self.certificates.extend(extra);
        Ok(self)
    }

    pub fn signing_certificate(&self) -> &Certificate {
        &self.certificates[0]
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Key algorithm of the leaf certificate.
    pub fn key_algorithm(&self) -> Result<KeyAlgorithm, SigningError> {
        key_algorithm(self.signing_certificate())
    }

    /// True when both chains start with the same leaf certificate.
    pub fn same_signer(&self, other: &CertificateChain) -> Result<bool, SigningError> {
        Ok(certificate_der(self.signing_certificate())?
            == certificate_der(other.signing_certificate())?)
    }

    pub(crate) fn der_encoded(&self) -> Result<Vec<Vec<u8>>, SigningError> {
        self.certificates.iter().map(certificate_der).collect()
    }
}

pub(crate) fn certificate_der(cert: &Certificate) -> Result<Vec<u8>, SigningError> {
    cert.to_der()
        .map_err(|e| SigningError::KeyMaterial(format!("Certificate DER encoding error: {e:?}")))
}

/// RFC 4514 issuer name and decimal serial number for `IssuerSerial`.
pub(crate) fn issuer_and_serial(cert: &Certificate) -> (String, String) {
    let serial = serial_bytes_to_decimal_string(cert.tbs_certificate.serial_number.as_bytes());
    let issuer = cert.tbs_certificate.issuer.to_string();
    (issuer, serial)
}

pub(crate) fn key_algorithm(cert: &Certificate) -> Result<KeyAlgorithm, SigningError> {
    let oid = cert.tbs_certificate.subject_public_key_info.algorithm.oid;
    if oid == RSA_ENCRYPTION {
        Ok(KeyAlgorithm::Rsa)
    } else if oid == EC_PUBLIC_KEY {
        Ok(KeyAlgorithm::Ecdsa)
    } else {
        Err(SigningError::UnsupportedAlgorithm(format!(
            "certificate key algorithm {oid}"
        )))
    }
}

fn public_key_bytes(cert: &Certificate) -> Result<&[u8], SigningError> {
    cert.tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| SigningError::KeyMaterial("certificate public key has unused bits".into()))
}

fn verifying_key(cert: &Certificate) -> Result<VerifyingKey, SigningError> {
    VerifyingKey::from_sec1_bytes(public_key_bytes(cert)?).map_err(|e| {
        SigningError::KeyMaterial(format!("certificate key is not a secp256k1 key: {e:?}"))
    })
}

fn rsa_public_key(cert: &Certificate) -> Result<RsaPublicKey, SigningError> {
    RsaPublicKey::from_pkcs1_der(public_key_bytes(cert)?)
        .map_err(|e| SigningError::KeyMaterial(format!("certificate RSA key error: {e:?}")))
}

fn pkcs1v15(digest: DigestAlgorithm) -> Pkcs1v15Sign {
    match digest {
        DigestAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
        DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
        DigestAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
        DigestAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
    }
}

/// Checks `signature` over the pre-hashed `digest` with the key of `cert`.
pub(crate) fn verify_prehash(
    cert: &Certificate,
    key_algorithm: KeyAlgorithm,
    digest_algorithm: DigestAlgorithm,
    digest: &[u8],
    signature: &[u8],
) -> Result<(), SigningError> {
    let certified = self::key_algorithm(cert)?;
    if certified != key_algorithm {
        return Err(SigningError::Verification(format!(
            "{key_algorithm} signature method with a {certified} certificate"
        )));
    }
    let verified = match key_algorithm {
        KeyAlgorithm::Ecdsa => {
            let signature = Signature::from_slice(signature).map_err(|e| {
                SigningError::Verification(format!("malformed SignatureValue: {e:?}"))
            })?;
            verifying_key(cert)?
                .verify_prehash(digest, &signature)
                .is_ok()
        }
        KeyAlgorithm::Rsa => rsa_public_key(cert)?
            .verify(pkcs1v15(digest_algorithm), digest, signature)
            .is_ok(),
    };
    if !verified {
        return Err(SigningError::Verification(
            "SignatureValue does not match SignedInfo".into(),
        ));
    }
    Ok(())
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}

/// Private key of a [`LocalSigner`].
pub enum PrivateKey {
    /// secp256k1 ECDSA.
    Ecdsa(SigningKey),
    /// RSA with PKCS#1 v1.5 padding.
    Rsa(RsaPrivateKey),
}

impl PrivateKey {
    /// PKCS#8 DER of either key type.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, SigningError> {
        if let Ok(key) = SigningKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::Ecdsa(key));
        }
        RsaPrivateKey::from_pkcs8_der(der)
            .map(PrivateKey::Rsa)
            .map_err(|e| SigningError::KeyMaterial(format!("Private key parse error: {e:?}")))
    }

    /// PKCS#8 PEM (`BEGIN PRIVATE KEY`) of either key type.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, SigningError> {
        if let Ok(key) = SigningKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::Ecdsa(key));
        }
        RsaPrivateKey::from_pkcs8_pem(pem)
            .map(PrivateKey::Rsa)
            .map_err(|e| SigningError::KeyMaterial(format!("Private key parse error: {e:?}")))
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PrivateKey::Ecdsa(_) => KeyAlgorithm::Ecdsa,
            PrivateKey::Rsa(_) => KeyAlgorithm::Rsa,
        }
    }

    fn matches(&self, cert: &Certificate) -> Result<bool, SigningError> {
        if key_algorithm(cert)? != self.algorithm() {
            return Ok(false);
        }
        Ok(match self {
            PrivateKey::Ecdsa(key) => &verifying_key(cert)? == key.verifying_key(),
            PrivateKey::Rsa(key) => rsa_public_key(cert)? == key.to_public_key(),
        })
    }
}

impl From<SigningKey> for PrivateKey {
    fn from(key: SigningKey) -> Self {
        PrivateKey::Ecdsa(key)
    }
}

impl From<RsaPrivateKey> for PrivateKey {
    fn from(key: RsaPrivateKey) -> Self {
        PrivateKey::Rsa(key)
    }
}

/// In-process private key with its certificate chain.
pub struct LocalSigner {
    chain: CertificateChain,
    private_key: PrivateKey,
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("chain", &self.chain)
            .field("key_algorithm", &self.private_key.algorithm())
            .finish_non_exhaustive()
    }
}

impl LocalSigner {
    /// Fails when the key does not match the leaf certificate.
    pub fn new(
        chain: CertificateChain,
        private_key: impl Into<PrivateKey>,
    ) -> Result<Self, SigningError> {
        let private_key = private_key.into();
        if !private_key.matches(chain.signing_certificate())? {
            return Err(SigningError::KeyMaterial(
                "private key does not match the signing certificate".into(),
            ));
        }
        Ok(Self { chain, private_key })
    }

    pub fn from_der(cert_der: &[u8], private_key_der: &[u8]) -> Result<Self, SigningError> {
        let chain = CertificateChain::from_der(cert_der)?;
        Self::new(chain, PrivateKey::from_pkcs8_der(private_key_der)?)
    }

    /// `chain_pem` holds the leaf certificate first, then any intermediates.
    pub fn from_pem(chain_pem: &str, private_key_pem: &str) -> Result<Self, SigningError> {
        let chain = CertificateChain::from_pem(chain_pem)?;
        Self::new(chain, PrivateKey::from_pkcs8_pem(private_key_pem)?)
    }

    pub fn certificate(&self) -> &Certificate {
        self.chain.signing_certificate()
    }
}

impl SigningCapability for LocalSigner {
    fn certificate_chain(&self) -> Result<CertificateChain, SigningError> {
        Ok(self.chain.clone())
    }

    fn key_algorithm(&self) -> KeyAlgorithm {
        self.private_key.algorithm()
    }

    fn sign(&self, data: &DataToSign) -> Result<SignatureValue, SigningError> {
        let digest = data.digest();
        let bytes = match &self.private_key {
            PrivateKey::Ecdsa(key) => {
                let signature: Signature = key
                    .sign_prehash(&digest)
                    .map_err(|e| SigningError::Signing(format!("Failed to sign digest: {e:?}")))?;
                signature.to_bytes().to_vec()
            }
            PrivateKey::Rsa(key) => key
                .sign(pkcs1v15(data.digest_algorithm()), &digest)
                .map_err(|e| SigningError::Signing(format!("Failed to sign digest: {e:?}")))?,
        };
        debug!(
            key = %self.private_key.algorithm(),
            digest = %data.digest_algorithm(),
            "signed with local key"
        );
        Ok(SignatureValue::new(bytes))
    }
}

/// Local keys in priority order; the first one signs.
#[derive(Debug, Default)]
pub struct KeyRing {
    signers: Vec<LocalSigner>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signer(mut self, signer: LocalSigner) -> Self {
        self.signers.push(signer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }
}

impl KeyMaterialProvider for KeyRing {
    fn signing_capability(&self) -> Result<&dyn SigningCapability, SigningError> {
        self.signers
            .first()
            .map(|signer| signer as &dyn SigningCapability)
            .ok_or(SigningError::NoSigningKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNER_CERT: &str = include_str!("../../tests/fixtures/keys/signer-cert.pem");
    const SIGNER_CHAIN: &str = include_str!("../../tests/fixtures/keys/signer-chain.pem");
    const SIGNER_KEY: &str = include_str!("../../tests/fixtures/keys/signer-key.pem");
    const RSA_CERT: &str = include_str!("../../tests/fixtures/keys/rsa-cert.pem");
    const RSA_KEY: &str = include_str!("../../tests/fixtures/keys/rsa-key.pem");

    #[test]
    fn serial_bytes_to_decimal_handles_large_values() {
        assert_eq!(serial_bytes_to_decimal_string(&[0x01]), "1");
        assert_eq!(serial_bytes_to_decimal_string(&[0x01, 0x00]), "256");
        assert_eq!(serial_bytes_to_decimal_string(&[0x00, 0x01]), "1");
        assert_eq!(serial_bytes_to_decimal_string(&[0xFF, 0xFF]), "65535");
    }

    #[test]
    fn issuer_and_serial_come_from_certificate() {
        let chain = CertificateChain::from_pem(SIGNER_CERT).expect("chain");
        let (issuer, serial) = issuer_and_serial(chain.signing_certificate());
        assert_eq!(serial, "4660");
        assert!(issuer.contains("CN=Verifactu Test CA"), "{issuer}");
    }

    #[test]
    fn chain_pem_keeps_leaf_first() {
        let chain = CertificateChain::from_pem(SIGNER_CHAIN).expect("chain");
        assert_eq!(chain.len(), 2);
        let (_, serial) = issuer_and_serial(chain.signing_certificate());
        assert_eq!(serial, "4660");
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert!(matches!(
            CertificateChain::new(vec![]),
            Err(SigningError::KeyMaterial(_))
        ));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let chain = CertificateChain::from_pem(SIGNER_CERT).expect("chain");
        let other = SigningKey::from_slice(&[7u8; 32]).expect("key");
        assert!(matches!(
            LocalSigner::new(chain, other),
            Err(SigningError::KeyMaterial(_))
        ));
    }

    #[test]
    fn empty_key_ring_has_no_signing_key() {
        let ring = KeyRing::new();
        assert!(matches!(
            ring.signing_capability(),
            Err(SigningError::NoSigningKey)
        ));
    }

    #[test]
    fn local_signer_produces_raw_signature() {
        let signer = LocalSigner::from_pem(SIGNER_CHAIN, SIGNER_KEY).expect("signer");
        let data = DataToSign {
            bytes: b"<ds:SignedInfo/>".to_vec(),
            digest_algorithm: DigestAlgorithm::Sha256,
        };
        let value = signer.sign(&data).expect("sign");
        assert_eq!(value.as_bytes().len(), 64);
    }

    #[test]
    fn key_algorithm_follows_certificate() {
        let ecdsa = CertificateChain::from_pem(SIGNER_CERT).expect("chain");
        let rsa = CertificateChain::from_pem(RSA_CERT).expect("chain");
        assert_eq!(ecdsa.key_algorithm().unwrap(), KeyAlgorithm::Ecdsa);
        assert_eq!(rsa.key_algorithm().unwrap(), KeyAlgorithm::Rsa);
        assert!(!ecdsa.same_signer(&rsa).unwrap());
    }

    #[test]
    fn rsa_signature_verifies_against_certificate() {
        let signer = LocalSigner::from_pem(RSA_CERT, RSA_KEY).expect("signer");
        assert_eq!(signer.key_algorithm(), KeyAlgorithm::Rsa);
        let data = DataToSign {
            bytes: b"<ds:SignedInfo/>".to_vec(),
            digest_algorithm: DigestAlgorithm::Sha256,
        };
        let value = signer.sign(&data).expect("sign");
        assert_eq!(value.as_bytes().len(), 256);
        verify_prehash(
            signer.certificate(),
            KeyAlgorithm::Rsa,
            DigestAlgorithm::Sha256,
            &data.digest(),
            value.as_bytes(),
        )
        .expect("verify");
        assert!(matches!(
            verify_prehash(
                signer.certificate(),
                KeyAlgorithm::Ecdsa,
                DigestAlgorithm::Sha256,
                &data.digest(),
                value.as_bytes(),
            ),
            Err(SigningError::Verification(_))
        ));
    }

    #[test]
    fn rsa_key_does_not_match_ecdsa_certificate() {
        let chain = CertificateChain::from_pem(SIGNER_CERT).expect("chain");
        let key = PrivateKey::from_pkcs8_pem(RSA_KEY).expect("key");
        assert_eq!(key.algorithm(), KeyAlgorithm::Rsa);
        assert!(matches!(
            LocalSigner::new(chain, key),
            Err(SigningError::KeyMaterial(_))
        ));
    }
}
