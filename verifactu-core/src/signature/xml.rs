use base64ct::{Base64, Encoding};
use libxml::{
    parser::{Parser, ParserOptions},
    tree::{Document, Node},
    xpath,
};
use sha2::{Digest, Sha256};

use super::constants::{
    DS_NS, ENVELOPED_SIGNATURE_TRANSFORM, SIGNATURE_TEMPLATE, SIGNED_PROPERTIES_TYPE, XADES_NS,
};
use super::key::{CertificateChain, certificate_der, issuer_and_serial};
use super::{
    CanonicalizationAlgorithm, DocumentToSign, KeyAlgorithm, Packaging, SignatureValue,
    SigningError, SigningParameters,
};

/// Strict parse: no recovery from malformed input and no network access.
pub(crate) fn parse_xml(name: &str, bytes: &[u8]) -> Result<Document, SigningError> {
    crate::init();
    let options = ParserOptions {
        recover: false,
        no_net: true,
        ..ParserOptions::default()
    };
    let doc = Parser::default()
        .parse_string_with_options(bytes, options)
        .map_err(|e| SigningError::DocumentParse {
            name: name.to_string(),
            message: format!("{e:?}"),
        })?;
    if doc.get_root_element().is_none() {
        return Err(SigningError::DocumentParse {
            name: name.to_string(),
            message: "missing root element".into(),
        });
    }
    Ok(doc)
}

pub(crate) fn xpath_context(doc: &Document) -> Result<xpath::Context, SigningError> {
    let ctx = xpath::Context::new(doc)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("ds", DS_NS)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("xades", XADES_NS)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;
    Ok(ctx)
}

pub(crate) fn find_nodes(ctx: &xpath::Context, path: &str) -> Result<Vec<Node>, SigningError> {
    Ok(ctx
        .evaluate(path)
        .map_err(|e| SigningError::Xml(format!("XPath error for {path}: {e:?}")))?
        .get_nodes_as_vec())
}

pub(crate) fn find_node(ctx: &xpath::Context, path: &str) -> Result<Node, SigningError> {
    find_nodes(ctx, path)?
        .into_iter()
        .next()
        .ok_or_else(|| SigningError::Xml(format!("XPath target not found: {path}")))
}

fn set_xpath_text(ctx: &xpath::Context, path: &str, value: &str) -> Result<(), SigningError> {
    let nodes = find_nodes(ctx, path)?;
    if nodes.is_empty() {
        return Err(SigningError::Xml(format!("XPath target not found: {path}")));
    }
    for mut node in nodes {
        node.set_content(value)
            .map_err(|e| SigningError::Xml(e.to_string()))?;
    }
    Ok(())
}

/// Appends `value` as a text node, so markup characters are escaped on
/// output. For free-form values such as names and URLs.
fn append_xpath_text(ctx: &xpath::Context, path: &str, value: &str) -> Result<(), SigningError> {
    find_node(ctx, path)?
        .append_text(value)
        .map_err(|e| SigningError::Xml(e.to_string()))
}

fn set_xpath_attribute(
    ctx: &xpath::Context,
    path: &str,
    name: &str,
    value: &str,
) -> Result<(), SigningError> {
    let nodes = find_nodes(ctx, path)?;
    if nodes.is_empty() {
        return Err(SigningError::Xml(format!("XPath target not found: {path}")));
    }
    for mut node in nodes {
        node.set_attribute(name, value)
            .map_err(|e| SigningError::Xml(e.to_string()))?;
    }
    Ok(())
}

fn remove_xpath_node(ctx: &xpath::Context, path: &str) -> Result<(), SigningError> {
    find_node(ctx, path)?.unlink();
    Ok(())
}

pub(crate) fn canonicalize_document(
    doc: &Document,
    algorithm: CanonicalizationAlgorithm,
) -> Result<Vec<u8>, SigningError> {
    doc.canonicalize(algorithm.options(), None)
        .map(String::into_bytes)
        .map_err(|e| SigningError::Xml(format!("Failed to canonicalize xml: {e:?}")))
}

/// Canonical form of a subtree, keeping the namespace context of its
/// ancestors.
pub(crate) fn canonicalize_node(
    node: &mut Node,
    algorithm: CanonicalizationAlgorithm,
) -> Result<Vec<u8>, SigningError> {
    node.canonicalize(algorithm.options())
        .map(String::into_bytes)
        .map_err(|e| SigningError::Xml(format!("Failed to canonicalize node: {e:?}")))
}

/// The enveloped-signature transform: the document without the signature
/// selected by `signature_path`, canonicalized.
pub(crate) fn enveloped_content(
    doc: &Document,
    signature_path: &str,
    algorithm: CanonicalizationAlgorithm,
) -> Result<Vec<u8>, SigningError> {
    let copy = doc
        .dup()
        .map_err(|e| SigningError::Xml(format!("Failed to duplicate xml: {e:?}")))?;
    let ctx = xpath_context(&copy)?;
    let mut signature = find_node(&ctx, signature_path)?;
    signature.unlink();
    canonicalize_document(&copy, algorithm)
}

fn import_fragment(doc: &mut Document, xml: &str) -> Result<Node, SigningError> {
    let fragment = parse_xml("signature fragment", xml.as_bytes())?;
    let mut node = fragment
        .get_root_element()
        .ok_or_else(|| SigningError::Xml("missing fragment root".into()))?;
    node.unlink();
    doc.import_node(&mut node)
        .map_err(|_| SigningError::Xml("failed to import fragment".into()))
}

/// Element identifiers of one signature, derived from its inputs so that
/// signing the same document twice yields the same markup.
struct SignatureIds {
    signature: String,
    reference: String,
    signed_properties: String,
    object: String,
}

impl SignatureIds {
    fn derive(canonical_input: &[u8], signing_time: &str, certificate_der: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_input);
        hasher.update(signing_time.as_bytes());
        hasher.update(certificate_der);
        let token = hex::encode(&hasher.finalize()[..16]);
        Self {
            signature: format!("id-{token}"),
            reference: format!("r-id-{token}-1"),
            signed_properties: format!("xades-id-{token}"),
            object: format!("o-id-{token}"),
        }
    }
}

/// URI of the payload reference; detached names are used verbatim.
fn payload_uri(
    document: &DocumentToSign,
    packaging: Packaging,
    ids: &SignatureIds,
) -> Result<String, SigningError> {
    match packaging {
        Packaging::Enveloped => Ok(String::new()),
        Packaging::Enveloping => Ok(format!("#{}", ids.object)),
        Packaging::Detached => {
            let name = document.name();
            if name.is_empty() || name.trim() != name || name.starts_with('#') {
                return Err(SigningError::Xml(format!(
                    "detached signatures need a document name usable as URI, got '{name}'"
                )));
            }
            Ok(name.to_string())
        }
    }
}

/// Writes every value of the signature under `signature_path` except the
/// two reference digests and the signature value.
fn apply_signature_values(
    doc: &Document,
    signature_path: &str,
    params: &SigningParameters,
    chain: &CertificateChain,
    key_algorithm: KeyAlgorithm,
    ids: &SignatureIds,
    payload_uri: &str,
) -> Result<(), SigningError> {
    let ctx = xpath_context(doc)?;
    let canonicalization = params.canonicalization().uri();
    let digest = params.digest_algorithm();
    let leaf = chain.signing_certificate();

    let signed_info = format!("{signature_path}/ds:SignedInfo");
    let payload_reference = format!("{signed_info}/ds:Reference[not(@Type)]");
    let properties_reference =
        format!("{signed_info}/ds:Reference[@Type='{SIGNED_PROPERTIES_TYPE}']");
    set_xpath_attribute(
        &ctx,
        &format!("{signed_info}/ds:CanonicalizationMethod"),
        "Algorithm",
        canonicalization,
    )?;
    set_xpath_attribute(
        &ctx,
        &format!("{signed_info}/ds:SignatureMethod"),
        "Algorithm",
        key_algorithm.signature_method_uri(digest),
    )?;
    set_xpath_attribute(&ctx, &payload_reference, "Id", &ids.reference)?;
    set_xpath_attribute(&ctx, &payload_reference, "URI", payload_uri)?;
    let mut transforms = find_node(&ctx, &format!("{payload_reference}/ds:Transforms"))?;
    if params.packaging() == Packaging::Enveloped {
        add_transform(&mut transforms, ENVELOPED_SIGNATURE_TRANSFORM)?;
    }
    add_transform(&mut transforms, canonicalization)?;
    set_xpath_attribute(
        &ctx,
        &format!("{signed_info}/ds:Reference/ds:DigestMethod"),
        "Algorithm",
        digest.uri(),
    )?;
    set_xpath_attribute(
        &ctx,
        &properties_reference,
        "URI",
        &format!("#{}", ids.signed_properties),
    )?;
    set_xpath_attribute(
        &ctx,
        &format!("{properties_reference}/ds:Transforms/ds:Transform"),
        "Algorithm",
        canonicalization,
    )?;

    set_xpath_attribute(
        &ctx,
        &format!("{signature_path}/ds:SignatureValue"),
        "Id",
        &format!("{}-value", ids.signature),
    )?;
    let mut x509_data = find_node(&ctx, &format!("{signature_path}/ds:KeyInfo/ds:X509Data"))?;
    let ds = x509_data.get_namespace();
    for der in chain.der_encoded()? {
        x509_data
            .add_text_child(ds.clone(), "X509Certificate", &Base64::encode_string(&der))
            .map_err(|e| SigningError::Xml(e.to_string()))?;
    }

    let qualifying = format!("{signature_path}/ds:Object/xades:QualifyingProperties");
    let signed_properties = format!("{qualifying}/xades:SignedProperties");
    let properties = format!("{signed_properties}/xades:SignedSignatureProperties");
    let cert = format!("{properties}/xades:SigningCertificate/xades:Cert");
    set_xpath_attribute(&ctx, &qualifying, "Target", &format!("#{}", ids.signature))?;
    set_xpath_attribute(&ctx, &signed_properties, "Id", &ids.signed_properties)?;
    set_xpath_text(
        &ctx,
        &format!("{properties}/xades:SigningTime"),
        &params.signing_time_text(),
    )?;
    set_xpath_attribute(
        &ctx,
        &format!("{cert}/xades:CertDigest/ds:DigestMethod"),
        "Algorithm",
        digest.uri(),
    )?;
    set_xpath_text(
        &ctx,
        &format!("{cert}/xades:CertDigest/ds:DigestValue"),
        &Base64::encode_string(&digest.digest(&certificate_der(leaf)?)),
    )?;
    let (issuer, serial) = issuer_and_serial(leaf);
    append_xpath_text(
        &ctx,
        &format!("{cert}/xades:IssuerSerial/ds:X509IssuerName"),
        &issuer,
    )?;
    set_xpath_text(
        &ctx,
        &format!("{cert}/xades:IssuerSerial/ds:X509SerialNumber"),
        &serial,
    )?;

    let policy_path = format!("{properties}/xades:SignaturePolicyIdentifier");
    match params.policy() {
        Some(policy) => {
            let policy_id = format!("{policy_path}/xades:SignaturePolicyId");
            append_xpath_text(
                &ctx,
                &format!("{policy_id}/xades:SigPolicyId/xades:Identifier"),
                policy.id(),
            )?;
            set_xpath_attribute(
                &ctx,
                &format!("{policy_id}/xades:SigPolicyHash/ds:DigestMethod"),
                "Algorithm",
                policy.digest_algorithm().uri(),
            )?;
            set_xpath_text(
                &ctx,
                &format!("{policy_id}/xades:SigPolicyHash/ds:DigestValue"),
                &policy.hash_base64(),
            )?;
            append_xpath_text(
                &ctx,
                &format!(
                    "{policy_id}/xades:SigPolicyQualifiers/xades:SigPolicyQualifier/xades:SPURI"
                ),
                policy.url(),
            )?;
        }
        None => remove_xpath_node(&ctx, &policy_path)?,
    }
    set_xpath_attribute(
        &ctx,
        &format!("{signed_properties}/xades:SignedDataObjectProperties/xades:DataObjectFormat"),
        "ObjectReference",
        &format!("#{}", ids.reference),
    )?;

    let payload_object = format!("{signature_path}/ds:Object[@MimeType]");
    match params.packaging() {
        Packaging::Enveloping => set_xpath_attribute(&ctx, &payload_object, "Id", &ids.object),
        Packaging::Enveloped | Packaging::Detached => remove_xpath_node(&ctx, &payload_object),
    }
}

fn add_transform(transforms: &mut Node, algorithm: &str) -> Result<(), SigningError> {
    let ds = transforms.get_namespace();
    transforms
        .new_child(ds, "Transform")
        .and_then(|mut transform| transform.set_attribute("Algorithm", algorithm))
        .map_err(|e| SigningError::Xml(e.to_string()))
}

fn set_signature_id(signature: &mut Node, id: &str) -> Result<(), SigningError> {
    signature
        .set_attribute("Id", id)
        .map_err(|e| SigningError::Xml(e.to_string()))
}

/// The template as a standalone document, for enveloping and detached
/// signatures.
fn signature_document(ids: &SignatureIds) -> Result<Document, SigningError> {
    let doc = parse_xml("signature template", SIGNATURE_TEMPLATE.as_bytes())?;
    let mut signature = doc
        .get_root_element()
        .ok_or_else(|| SigningError::Xml("missing template root".into()))?;
    set_signature_id(&mut signature, &ids.signature)?;
    Ok(doc)
}

/// A signature skeleton placed according to its packaging, with both
/// reference digests filled in.
pub(crate) struct SignatureAssembly {
    doc: Document,
    signature_path: String,
    canonicalization: CanonicalizationAlgorithm,
}

impl SignatureAssembly {
    pub(crate) fn build(
        document: &DocumentToSign,
        params: &SigningParameters,
        key_algorithm: KeyAlgorithm,
    ) -> Result<Self, SigningError> {
        let chain = params.certificate_chain().ok_or_else(|| {
            SigningError::KeyMaterial("no certificate chain bound to the signing parameters".into())
        })?;
        if let Some(policy) = params.policy() {
            policy.ensure_digest(params.digest_algorithm())?;
        }

        let canonicalization = params.canonicalization();
        let digest = params.digest_algorithm();
        let mut input = parse_xml(document.name(), document.content())?;
        let canonical_input = canonicalize_document(&input, canonicalization)?;
        let ids = SignatureIds::derive(
            &canonical_input,
            &params.signing_time_text(),
            &certificate_der(chain.signing_certificate())?,
        );
        let payload_uri = payload_uri(document, params.packaging(), &ids)?;
        let signature_path = format!("//ds:Signature[@Id='{}']", ids.signature);
        let apply = |doc: &Document| {
            apply_signature_values(
                doc,
                &signature_path,
                params,
                chain,
                key_algorithm,
                &ids,
                &payload_uri,
            )
        };

        let (doc, payload_digest) = match params.packaging() {
            Packaging::Enveloped => {
                let mut root = input
                    .get_root_element()
                    .ok_or_else(|| SigningError::Xml("missing document root".into()))?;
                let mut signature = import_fragment(&mut input, SIGNATURE_TEMPLATE)?;
                root.add_child(&mut signature)
                    .map_err(|e| SigningError::Xml(e.to_string()))?;
                set_signature_id(&mut signature, &ids.signature)?;
                apply(&input)?;
                let content = enveloped_content(&input, &signature_path, canonicalization)?;
                (input, digest.digest(&content))
            }
            Packaging::Enveloping => {
                let mut doc = signature_document(&ids)?;
                apply(&doc)?;
                let mut payload = input
                    .get_root_element()
                    .ok_or_else(|| SigningError::Xml("missing document root".into()))?;
                payload.unlink();
                let mut payload = doc
                    .import_node(&mut payload)
                    .map_err(|_| SigningError::Xml("failed to import payload".into()))?;
                let ctx = xpath_context(&doc)?;
                let mut object = find_node(
                    &ctx,
                    &format!("{signature_path}/ds:Object[@Id='{}']", ids.object),
                )?;
                object
                    .add_child(&mut payload)
                    .map_err(|e| SigningError::Xml(e.to_string()))?;
                let content = canonicalize_node(&mut object, canonicalization)?;
                (doc, digest.digest(&content))
            }
            Packaging::Detached => {
                let doc = signature_document(&ids)?;
                apply(&doc)?;
                (doc, digest.digest(&canonical_input))
            }
        };

        {
            let ctx = xpath_context(&doc)?;
            set_xpath_text(
                &ctx,
                &format!(
                    "{signature_path}/ds:SignedInfo/ds:Reference[@Id='{}']/ds:DigestValue",
                    ids.reference
                ),
                &Base64::encode_string(&payload_digest),
            )?;
            let mut signed_properties = find_node(
                &ctx,
                &format!(
                    "{signature_path}/ds:Object/xades:QualifyingProperties/xades:SignedProperties"
                ),
            )?;
            let properties = canonicalize_node(&mut signed_properties, canonicalization)?;
            set_xpath_text(
                &ctx,
                &format!(
                    "{signature_path}/ds:SignedInfo/ds:Reference[@URI='#{}']/ds:DigestValue",
                    ids.signed_properties
                ),
                &Base64::encode_string(&digest.digest(&properties)),
            )?;
        }

        Ok(Self {
            doc,
            signature_path,
            canonicalization,
        })
    }

    /// Canonical `SignedInfo`, the input of the signature value.
    pub(crate) fn signed_info(&self) -> Result<Vec<u8>, SigningError> {
        let ctx = xpath_context(&self.doc)?;
        let mut signed_info = find_node(&ctx, &format!("{}/ds:SignedInfo", self.signature_path))?;
        canonicalize_node(&mut signed_info, self.canonicalization)
    }

    pub(crate) fn set_signature_value(&mut self, value: &SignatureValue) -> Result<(), SigningError> {
        let ctx = xpath_context(&self.doc)?;
        set_xpath_text(
            &ctx,
            &format!("{}/ds:SignatureValue", self.signature_path),
            &value.to_base64(),
        )
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.doc.to_string().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_document_is_rejected() {
        let err = parse_xml("broken.xml", b"<invoice><total>1</invoice>").err().unwrap();
        assert!(matches!(err, SigningError::DocumentParse { .. }));
    }

    #[test]
    fn enveloped_content_drops_only_the_signature() {
        let doc = parse_xml(
            "doc.xml",
            br#"<root><a>1</a><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Id="s1"/></root>"#,
        )
        .unwrap();
        let content = enveloped_content(
            &doc,
            "//ds:Signature[@Id='s1']",
            CanonicalizationAlgorithm::Exclusive,
        )
        .unwrap();
        assert_eq!(String::from_utf8(content).unwrap(), "<root><a>1</a></root>");
    }

    #[test]
    fn ids_are_stable_for_identical_inputs() {
        let a = SignatureIds::derive(b"<a></a>", "2024-01-01T00:00:00Z", b"cert");
        let b = SignatureIds::derive(b"<a></a>", "2024-01-01T00:00:00Z", b"cert");
        let c = SignatureIds::derive(b"<a></a>", "2024-01-01T00:00:01Z", b"cert");
        assert_eq!(a.signature, b.signature);
        assert_ne!(a.signature, c.signature);
        assert!(a.reference.starts_with("r-id-"));
    }
}
