use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use base64ct::{Base64, Encoding};

fn cli_exe() -> &'static str {
    env!("CARGO_BIN_EXE_verifactu")
}

fn core_fixture(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("verifactu-core")
        .join("tests")
        .join("fixtures")
        .join(relative)
}

fn run(args: &[&str]) -> Output {
    Command::new(cli_exe())
        .args(args)
        .output()
        .expect("run verifactu")
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

fn sign(input: &Path, output: &Path, extra: &[&str]) -> Output {
    let key = core_fixture("keys/signer-key.pem");
    let cert = core_fixture("keys/signer-cert.pem");
    let chain = core_fixture("keys/ca-cert.pem");
    let mut args = vec![
        "sign",
        "--input",
        path_str(input),
        "--key",
        path_str(&key),
        "--cert",
        path_str(&cert),
        "--chain",
        path_str(&chain),
        "--output",
        path_str(output),
    ];
    args.extend_from_slice(extra);
    run(&args)
}

#[test]
fn sign_then_verify_enveloped() {
    let dir = tempfile::tempdir().unwrap();
    let signed = dir.path().join("signed.xml");
    let output = sign(&core_fixture("documents/facturae-invoice.xml"), &signed, &[]);
    assert_success(&output, "sign");

    let text = std::fs::read_to_string(&signed).unwrap();
    assert_eq!(text.matches("<ds:X509Certificate>").count(), 2);

    let output = run(&["verify", "--input", path_str(&signed)]);
    assert_success(&output, "verify");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("signature OK"));
    assert!(stdout.contains("CN=Acme Facturacion"));
}

#[test]
fn detached_signature_needs_content_to_verify() {
    let dir = tempfile::tempdir().unwrap();
    let signed = dir.path().join("receipt.sig.xml");
    let receipt = core_fixture("documents/plain-receipt.xml");
    let output = sign(&receipt, &signed, &["--packaging", "detached"]);
    assert_success(&output, "sign");

    let output = run(&["verify", "--input", path_str(&signed)]);
    assert!(!output.status.success());

    let output = run(&[
        "verify",
        "--input",
        path_str(&signed),
        "--detached",
        path_str(&receipt),
    ]);
    assert_success(&output, "verify detached");
}

#[test]
fn explicit_policy_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let signed = dir.path().join("signed.xml");
    let hash = Base64::encode_string(&[0x5A; 32]);
    let output = sign(
        &core_fixture("documents/facturae-invoice.xml"),
        &signed,
        &[
            "--policy-id",
            "urn:oid:2.16.724.1.3.1.1.2.1.9",
            "--policy-url",
            "https://sede.example.es/politica.pdf",
            "--policy-digest",
            "SHA-256",
            "--policy-hash",
            &hash,
        ],
    );
    assert_success(&output, "sign");

    let output = run(&["verify", "--input", path_str(&signed)]);
    assert_success(&output, "verify");
    assert!(
        String::from_utf8_lossy(&output.stdout)
            .contains("policy: urn:oid:2.16.724.1.3.1.1.2.1.9")
    );
}

#[test]
fn incomplete_policy_fails() {
    let dir = tempfile::tempdir().unwrap();
    let signed = dir.path().join("signed.xml");
    let output = sign(
        &core_fixture("documents/facturae-invoice.xml"),
        &signed,
        &["--policy-id", "urn:oid:2.16.724.1.3.1.1.2.1.9"],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("incomplete signature policy"));
    assert!(!signed.exists());
}

#[test]
fn digest_prints_canonical_signed_info() {
    let output = run(&[
        "digest",
        "--input",
        path_str(&core_fixture("documents/plain-receipt.xml")),
        "--cert",
        path_str(&core_fixture("keys/signer-cert.pem")),
        "--digest",
        "SHA-512",
    ]);
    assert_success(&output, "digest");
    let stdout = String::from_utf8(output.stdout).unwrap();
    let signed_info = Base64::decode_vec(stdout.trim()).expect("base64 output");
    let signed_info = String::from_utf8(signed_info).unwrap();
    assert!(signed_info.starts_with("<ds:SignedInfo"));
    assert!(signed_info.contains("http://www.w3.org/2001/04/xmlenc#sha512"));
}

#[test]
fn register_continues_the_persisted_chain() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = dir.path().join("ledger.json");
    let first_invoice = dir.path().join("first.json");
    let second_invoice = dir.path().join("second.json");
    std::fs::write(
        &first_invoice,
        r#"{"series":"A","fiscalYear":2024,"issuerTaxId":"B12345678","recipientTaxId":"12345678Z","issueDate":"2024-03-01","totalAmount":"121.00"}"#,
    )
    .unwrap();
    std::fs::write(
        &second_invoice,
        r#"{"serie":"A","ejercicio":2024,"emisorNif":"B12345678","receptorNif":"12345678Z","fecha":"2024-03-02","total":"60.50"}"#,
    )
    .unwrap();

    let register = |invoice: &Path| {
        let output = run(&[
            "register",
            "--invoice",
            path_str(invoice),
            "--ledger",
            path_str(&ledger),
            "--qr",
        ]);
        assert_success(&output, "register");
        let stdout = String::from_utf8(output.stdout).unwrap();
        let mut lines = stdout.lines();
        let record: serde_json::Value =
            serde_json::from_str(lines.next().expect("record line")).unwrap();
        let payload = lines.next().expect("payload line").to_string();
        (record, payload)
    };

    let (first, first_payload) = register(&first_invoice);
    assert_eq!(first["sequence"], 1);
    assert_eq!(first["previousFingerprint"], "INIT");
    assert_eq!(
        first_payload,
        format!(
            "VERIFACTU;B12345678;A;1;2024;2024-03-01;121.00;{}",
            first["fingerprint"].as_str().unwrap()
        )
    );
    assert!(ledger.exists());

    let (second, _) = register(&second_invoice);
    assert_eq!(second["sequence"], 2);
    assert_eq!(second["previousFingerprint"], first["fingerprint"]);
}

#[test]
fn register_minimal_invoice_twice() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = dir.path().join("ledger.json");
    let invoice = dir.path().join("invoice.json");
    std::fs::write(
        &invoice,
        r#"{"series":"A","fiscalYear":2024,"issuerTaxId":"B12345678","totalAmount":"121.00"}"#,
    )
    .unwrap();

    let register = || {
        let output = run(&[
            "register",
            "--invoice",
            path_str(&invoice),
            "--ledger",
            path_str(&ledger),
        ]);
        assert_success(&output, "register");
        serde_json::from_slice::<serde_json::Value>(&output.stdout).unwrap()
    };

    let first = register();
    assert_eq!(first["key"], "A:2024");
    assert_eq!(first["sequence"], 1);
    assert_eq!(first["previousFingerprint"], "INIT");
    assert_eq!(
        first["fingerprint"],
        "D-OEBw5wlWcSonBYE6T4i3uSsgTkQqDPJg7pTyTuND8"
    );

    let second = register();
    assert_eq!(second["sequence"], 2);
    assert_eq!(second["previousFingerprint"], first["fingerprint"]);
}

#[test]
fn rsa_key_signs_and_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let signed = dir.path().join("signed.xml");
    let output = run(&[
        "sign",
        "--input",
        path_str(&core_fixture("documents/facturae-invoice.xml")),
        "--key",
        path_str(&core_fixture("keys/rsa-key.pem")),
        "--cert",
        path_str(&core_fixture("keys/rsa-cert.pem")),
        "--output",
        path_str(&signed),
    ]);
    assert_success(&output, "sign");
    let text = std::fs::read_to_string(&signed).unwrap();
    assert!(text.contains("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"));

    let output = run(&["verify", "--input", path_str(&signed)]);
    assert_success(&output, "verify");
    assert!(String::from_utf8_lossy(&output.stdout).contains("key: RSA"));
}

#[test]
fn register_uses_configured_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("verifactu.properties");
    let invoice = dir.path().join("invoice.json");
    std::fs::write(
        &config,
        "ledger.default.series=B\nledger.default.fiscal_year=2023\n",
    )
    .unwrap();
    std::fs::write(
        &invoice,
        r#"{"issuerTaxId":"B12345678","recipientTaxId":"12345678Z","issueDate":"2023-12-31","totalAmount":"5.00"}"#,
    )
    .unwrap();

    let output = run(&[
        "register",
        "--invoice",
        path_str(&invoice),
        "--config",
        path_str(&config),
    ]);
    assert_success(&output, "register");
    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["key"], "B:2023");

    let output = run(&["register", "--invoice", path_str(&invoice)]);
    assert!(!output.status.success(), "series has no default");
}
