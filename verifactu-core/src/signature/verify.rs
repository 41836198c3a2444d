//! Verification of signatures produced by [`super::CanonicalSigner`].
//!
//! Every reference digest is recomputed, every canonicalization transform
//! must match `CanonicalizationMethod`, and the `SignatureValue` is checked
//! against the first certificate in `KeyInfo`.

use base64ct::{Base64, Encoding};
use libxml::xpath;
use tracing::debug;
use x509_cert::{Certificate, der::Decode};

use super::constants::{ENVELOPED_SIGNATURE_TRANSFORM, SIGNED_PROPERTIES_TYPE};
use super::key::verify_prehash;
use super::xml::{
    canonicalize_document, canonicalize_node, enveloped_content, find_node, find_nodes,
    parse_xml, xpath_context,
};
use super::{
    CanonicalizationAlgorithm, DigestAlgorithm, DocumentToSign, KeyAlgorithm, SigningError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedReference {
    uri: String,
    digest_algorithm: DigestAlgorithm,
    signed_properties: bool,
}

impl VerifiedReference {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    /// True for the reference covering the XAdES `SignedProperties`.
    pub fn is_signed_properties(&self) -> bool {
        self.signed_properties
    }
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    canonicalization: CanonicalizationAlgorithm,
    key_algorithm: KeyAlgorithm,
    digest_algorithm: DigestAlgorithm,
    references: Vec<VerifiedReference>,
    signer: Certificate,
    signing_time: Option<String>,
    policy_id: Option<String>,
}

impl VerificationReport {
    pub fn canonicalization(&self) -> CanonicalizationAlgorithm {
        self.canonicalization
    }

    /// Key algorithm of the `SignatureMethod`.
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    /// Digest of the `SignatureMethod`.
    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    pub fn references(&self) -> &[VerifiedReference] {
        &self.references
    }

    pub fn signer(&self) -> &Certificate {
        &self.signer
    }

    pub fn signer_subject(&self) -> String {
        self.signer.tbs_certificate.subject.to_string()
    }

    pub fn signing_time(&self) -> Option<&str> {
        self.signing_time.as_deref()
    }

    /// Identifier of the explicit policy, `None` when implicit.
    pub fn policy_id(&self) -> Option<&str> {
        self.policy_id.as_deref()
    }
}

/// Verifies the first `ds:Signature` in `signed`.
///
/// `detached` supplies the content of a reference whose URI is neither
/// empty nor a same-document `#id`; its name must equal the URI.
pub fn verify(
    signed: &[u8],
    detached: Option<&DocumentToSign>,
) -> Result<VerificationReport, SigningError> {
    let doc = parse_xml("signed document", signed)?;
    let ctx = xpath_context(&doc)?;

    let signature = find_node(&ctx, "//ds:Signature")
        .map_err(|_| SigningError::Verification("no ds:Signature element".into()))?;
    let signature_path = match signature.get_attribute("Id") {
        Some(id) => format!("//ds:Signature[@Id='{}']", xpath_literal(&id)?),
        None => "(//ds:Signature)[1]".to_string(),
    };
    let signed_info_path = format!("{signature_path}/ds:SignedInfo");

    let canonicalization: CanonicalizationAlgorithm = algorithm_attribute(
        &ctx,
        &format!("{signed_info_path}/ds:CanonicalizationMethod"),
    )?
    .parse()?;
    let signature_method = algorithm_attribute(
        &ctx,
        &format!("{signed_info_path}/ds:SignatureMethod"),
    )?;
    let (key_algorithm, digest_algorithm) =
        KeyAlgorithm::from_signature_method_uri(&signature_method)?;

    let reference_count = find_nodes(&ctx, &format!("{signed_info_path}/ds:Reference"))?.len();
    if reference_count == 0 {
        return Err(SigningError::Verification("SignedInfo has no references".into()));
    }

    let mut references = Vec::with_capacity(reference_count);
    for index in 1..=reference_count {
        let reference_path = format!("{signed_info_path}/ds:Reference[{index}]");
        let verified = verify_reference(
            &doc,
            &ctx,
            &reference_path,
            &signature_path,
            canonicalization,
            detached,
        )?;
        debug!(uri = verified.uri(), "reference digest verified");
        references.push(verified);
    }
    if !references.iter().any(VerifiedReference::is_signed_properties) {
        return Err(SigningError::Verification(
            "SignedProperties are not covered by a reference".into(),
        ));
    }

    let certificate_text = node_text(
        &ctx,
        &format!("{signature_path}/ds:KeyInfo/ds:X509Data/ds:X509Certificate"),
    )?;
    let signer = Certificate::from_der(&decode_base64(&certificate_text)?)
        .map_err(|e| SigningError::Verification(format!("invalid KeyInfo certificate: {e:?}")))?;

    let properties_path = format!(
        "{signature_path}/ds:Object/xades:QualifyingProperties/xades:SignedProperties/xades:SignedSignatureProperties"
    );
    verify_certificate_digest(&ctx, &properties_path, &signer)?;

    let mut signed_info = find_node(&ctx, &signed_info_path)?;
    let signed_info_bytes = canonicalize_node(&mut signed_info, canonicalization)?;
    let signature_value = decode_base64(&node_text(
        &ctx,
        &format!("{signature_path}/ds:SignatureValue"),
    )?)?;
    verify_prehash(
        &signer,
        key_algorithm,
        digest_algorithm,
        &digest_algorithm.digest(&signed_info_bytes),
        &signature_value,
    )?;

    let signing_time = optional_text(&ctx, &format!("{properties_path}/xades:SigningTime"))?;
    let policy_id = optional_text(
        &ctx,
        &format!(
            "{properties_path}/xades:SignaturePolicyIdentifier/xades:SignaturePolicyId/xades:SigPolicyId/xades:Identifier"
        ),
    )?;

    Ok(VerificationReport {
        canonicalization,
        key_algorithm,
        digest_algorithm,
        references,
        signer,
        signing_time,
        policy_id,
    })
}

fn verify_reference(
    doc: &libxml::tree::Document,
    ctx: &xpath::Context,
    reference_path: &str,
    signature_path: &str,
    canonicalization: CanonicalizationAlgorithm,
    detached: Option<&DocumentToSign>,
) -> Result<VerifiedReference, SigningError> {
    let reference = find_node(ctx, reference_path)?;
    let uri = reference.get_attribute("URI").unwrap_or_default();
    let signed_properties =
        reference.get_attribute("Type").as_deref() == Some(SIGNED_PROPERTIES_TYPE);

    let mut enveloped = false;
    let mut canonicalized = false;
    for transform in find_nodes(ctx, &format!("{reference_path}/ds:Transforms/ds:Transform"))? {
        let algorithm = transform.get_attribute("Algorithm").unwrap_or_default();
        if algorithm == ENVELOPED_SIGNATURE_TRANSFORM {
            enveloped = true;
        } else if algorithm == canonicalization.uri() {
            canonicalized = true;
        } else {
            return Err(SigningError::CanonicalizationMismatch {
                method: canonicalization.uri().to_string(),
                transform: algorithm,
            });
        }
    }
    if !canonicalized {
        return Err(SigningError::CanonicalizationMismatch {
            method: canonicalization.uri().to_string(),
            transform: "(none)".to_string(),
        });
    }

    let digest_algorithm: DigestAlgorithm =
        algorithm_attribute(ctx, &format!("{reference_path}/ds:DigestMethod"))?.parse()?;
    let expected = decode_base64(&node_text(ctx, &format!("{reference_path}/ds:DigestValue"))?)?;

    let content = if uri.is_empty() {
        if !enveloped {
            return Err(SigningError::Verification(
                "whole-document reference without enveloped-signature transform".into(),
            ));
        }
        enveloped_content(doc, signature_path, canonicalization)?
    } else if let Some(id) = uri.strip_prefix('#') {
        let mut targets = find_nodes(ctx, &format!("//*[@Id='{}']", xpath_literal(id)?))?;
        if targets.len() != 1 {
            return Err(SigningError::Verification(format!(
                "reference '{uri}' must match exactly one element, found {}",
                targets.len()
            )));
        }
        canonicalize_node(&mut targets[0], canonicalization)?
    } else {
        let document = detached.filter(|d| d.name() == uri).ok_or_else(|| {
            SigningError::Verification(format!("detached content for '{uri}' not supplied"))
        })?;
        let detached_doc = parse_xml(document.name(), document.content())?;
        canonicalize_document(&detached_doc, canonicalization)?
    };

    if digest_algorithm.digest(&content) != expected {
        return Err(SigningError::DigestMismatch { uri });
    }
    Ok(VerifiedReference {
        uri,
        digest_algorithm,
        signed_properties,
    })
}

fn verify_certificate_digest(
    ctx: &xpath::Context,
    properties_path: &str,
    signer: &Certificate,
) -> Result<(), SigningError> {
    let cert_digest_path =
        format!("{properties_path}/xades:SigningCertificate/xades:Cert/xades:CertDigest");
    let digest_algorithm: DigestAlgorithm =
        algorithm_attribute(ctx, &format!("{cert_digest_path}/ds:DigestMethod"))?.parse()?;
    let expected = decode_base64(&node_text(ctx, &format!("{cert_digest_path}/ds:DigestValue"))?)?;
    let der = super::key::certificate_der(signer)?;
    if digest_algorithm.digest(&der) != expected {
        return Err(SigningError::Verification(
            "SigningCertificate digest does not match KeyInfo certificate".into(),
        ));
    }
    Ok(())
}

fn algorithm_attribute(ctx: &xpath::Context, path: &str) -> Result<String, SigningError> {
    find_node(ctx, path)
        .map_err(|_| SigningError::Verification(format!("missing {path}")))?
        .get_attribute("Algorithm")
        .ok_or_else(|| SigningError::Verification(format!("missing Algorithm on {path}")))
}

fn node_text(ctx: &xpath::Context, path: &str) -> Result<String, SigningError> {
    optional_text(ctx, path)?
        .ok_or_else(|| SigningError::Verification(format!("missing or empty {path}")))
}

fn optional_text(ctx: &xpath::Context, path: &str) -> Result<Option<String>, SigningError> {
    Ok(find_nodes(ctx, path)?
        .first()
        .map(|node| node.get_content().trim().to_string())
        .filter(|value| !value.is_empty()))
}

fn decode_base64(text: &str) -> Result<Vec<u8>, SigningError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Base64::decode_vec(&compact)
        .map_err(|e| SigningError::Verification(format!("invalid base64 value: {e:?}")))
}

/// Identifiers are spliced into XPath string literals.
fn xpath_literal(id: &str) -> Result<&str, SigningError> {
    if id.contains(['\'', '"']) {
        return Err(SigningError::Verification(format!(
            "unsupported identifier '{id}'"
        )));
    }
    Ok(id)
}
