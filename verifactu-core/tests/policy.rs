mod common;

use common::fixed_params;
use verifactu_core::signature::{PolicyDescriptor, PolicyError, SigningError, bind};

fn descriptor(mask: u8) -> PolicyDescriptor {
    let mut descriptor = PolicyDescriptor::new();
    if mask & 0b0001 != 0 {
        descriptor = descriptor.with_id("urn:oid:2.16.724.1.3.1.1.2.1.9");
    }
    if mask & 0b0010 != 0 {
        descriptor = descriptor.with_url("https://sede.example.es/politica.pdf");
    }
    if mask & 0b0100 != 0 {
        descriptor = descriptor.with_digest_algorithm("SHA-256");
    }
    if mask & 0b1000 != 0 {
        descriptor = descriptor.with_hash(vec![0x11; 32]);
    }
    descriptor
}

#[test]
fn policy_is_all_or_nothing() {
    for mask in 0u8..16 {
        let result = bind(fixed_params(), Some(&descriptor(mask)));
        match mask {
            0 => assert!(result.expect("implicit").policy().is_none()),
            0b1111 => assert!(result.expect("explicit").policy().is_some()),
            _ => match result {
                Err(SigningError::Policy(PolicyError::Incomplete { missing })) => {
                    assert_eq!(missing.len(), 4 - mask.count_ones() as usize, "mask {mask:04b}");
                }
                other => panic!("mask {mask:04b}: unexpected {other:?}"),
            },
        }
    }
}

#[test]
fn hash_length_follows_policy_digest() {
    let descriptor = descriptor(0b1111)
        .with_digest_algorithm("SHA-1")
        .with_hash(vec![0x11; 32]);
    match bind(fixed_params(), Some(&descriptor)) {
        Err(SigningError::Policy(err)) => {
            assert!(err.is_incomplete());
            assert_eq!(
                err,
                PolicyError::HashLength {
                    algorithm: verifactu_core::signature::DigestAlgorithm::Sha1,
                    expected: 20,
                    actual: 32,
                }
            );
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn policy_digest_accepts_uri_form() {
    let descriptor = descriptor(0b1111).with_digest_algorithm("http://www.w3.org/2001/04/xmlenc#sha256");
    let params = bind(fixed_params(), Some(&descriptor)).expect("bind");
    assert_eq!(
        params.policy().map(|p| p.hash_base64()),
        Some("ERERERERERERERERERERERERERERERERERERERERERE=".to_string())
    );
}
