use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64ct::{Base64, Encoding};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use verifactu_core::config::Config;
use verifactu_core::ledger::{InvoiceChainLedger, InvoiceFields, LedgerSnapshot, payload};
use verifactu_core::signature::{
    CanonicalSigner, CanonicalizationAlgorithm, CertificateChain, DigestAlgorithm, DocumentToSign,
    LocalSigner, Packaging, PolicyDescriptor, SigningParameters, verify,
};

#[derive(Parser)]
#[command(name = "verifactu")]
#[command(about = "XAdES invoice signing and hash-chained invoice registration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign an XML document with a local key.
    Sign {
        #[arg(long)]
        input: PathBuf,
        /// PKCS#8 private key in PEM form.
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        signing: SigningArgs,
    },
    /// Print the canonical SignedInfo an external signer has to sign.
    Digest {
        #[arg(long)]
        input: PathBuf,
        #[command(flatten)]
        signing: SigningArgs,
    },
    Verify {
        #[arg(long)]
        input: PathBuf,
        /// Content of a detached signature's reference.
        #[arg(long)]
        detached: Option<PathBuf>,
    },
    /// Register an invoice in the hash chain.
    Register {
        /// Invoice fields as JSON.
        #[arg(long)]
        invoice: PathBuf,
        /// Ledger snapshot, read if present and written back afterwards.
        #[arg(long)]
        ledger: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Also print the verification payload.
        #[arg(long)]
        qr: bool,
    },
}

#[derive(Args)]
struct SigningArgs {
    /// Signing certificate in PEM form.
    #[arg(long)]
    cert: PathBuf,
    /// Intermediate and root certificates in PEM form.
    #[arg(long)]
    chain: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    packaging: Option<Packaging>,
    #[arg(long)]
    digest: Option<DigestAlgorithm>,
    #[arg(long)]
    canonicalization: Option<CanonicalizationAlgorithm>,
    #[arg(long)]
    policy_id: Option<String>,
    #[arg(long)]
    policy_url: Option<String>,
    #[arg(long)]
    policy_digest: Option<String>,
    /// Policy document hash, standard base64.
    #[arg(long)]
    policy_hash: Option<String>,
}

impl SigningArgs {
    fn config(&self) -> Result<Config> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(packaging) = self.packaging {
            config = config.with_packaging(packaging);
        }
        if let Some(digest) = self.digest {
            config = config.with_digest_algorithm(digest);
        }
        if let Some(canonicalization) = self.canonicalization {
            config = config.with_canonicalization(canonicalization);
        }

        // Command line policy fields override the configured ones one by one.
        let mut policy = config.policy().cloned().unwrap_or_default();
        if let Some(id) = &self.policy_id {
            policy = policy.with_id(id);
        }
        if let Some(url) = &self.policy_url {
            policy = policy.with_url(url);
        }
        if let Some(digest) = &self.policy_digest {
            policy = policy.with_digest_algorithm(digest);
        }
        if let Some(hash) = &self.policy_hash {
            policy = policy
                .with_hash_base64(hash)
                .map_err(|e| anyhow::anyhow!("--policy-hash is not base64: {e}"))?;
        }
        if policy != PolicyDescriptor::default() {
            config = config.with_policy(policy);
        }
        Ok(config)
    }

    fn chain_pem(&self) -> Result<String> {
        let mut pem = read_text(&self.cert)?;
        if let Some(chain) = &self.chain {
            if !pem.ends_with('\n') {
                pem.push('\n');
            }
            pem.push_str(&read_text(chain)?);
        }
        Ok(pem)
    }

    fn parameters(&self) -> Result<SigningParameters> {
        let chain = CertificateChain::from_pem(&self.chain_pem()?)?;
        let params = SigningParameters::from_config(&self.config()?)?.with_certificate_chain(chain);
        debug!(
            packaging = %params.packaging(),
            digest = %params.digest_algorithm(),
            canonicalization = %params.canonicalization(),
            explicit_policy = params.policy().is_some(),
            "signing parameters"
        );
        Ok(params)
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sign {
            input,
            key,
            output,
            signing,
        } => {
            let document = read_document(&input)?;
            let params = signing.parameters()?;
            let signer = LocalSigner::from_pem(&signing.chain_pem()?, &read_text(&key)?)?;
            let signed = CanonicalSigner::new().sign(&document, &params, Some(&signer))?;
            match output {
                Some(path) => {
                    fs::write(&path, signed.as_bytes())
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), "signed document written");
                }
                None => std::io::stdout().write_all(signed.as_bytes())?,
            }
        }
        Commands::Digest { input, signing } => {
            let document = read_document(&input)?;
            let data = CanonicalSigner::new().compute_digest(&document, &signing.parameters()?)?;
            println!("{}", Base64::encode_string(data.bytes()));
        }
        Commands::Verify { input, detached } => {
            let signed = fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let detached = detached.as_deref().map(read_document).transpose()?;
            let report = verify(&signed, detached.as_ref())?;
            println!("signature OK");
            println!("signer: {}", report.signer_subject());
            println!("canonicalization: {}", report.canonicalization());
            println!("key: {}", report.key_algorithm());
            println!("digest: {}", report.digest_algorithm());
            if let Some(time) = report.signing_time() {
                println!("signing time: {time}");
            }
            if let Some(policy) = report.policy_id() {
                println!("policy: {policy}");
            }
        }
        Commands::Register {
            invoice,
            ledger,
            config,
            qr,
        } => {
            let config = load_config(config.as_deref())?;
            let chains = InvoiceChainLedger::with_defaults(config.ledger_defaults().clone());
            if let Some(path) = ledger.as_deref().filter(|path| path.exists()) {
                let snapshot: LedgerSnapshot = serde_json::from_str(&read_text(path)?)
                    .with_context(|| format!("invalid ledger snapshot {}", path.display()))?;
                chains.restore(snapshot)?;
            }

            let fields: InvoiceFields = serde_json::from_str(&read_text(&invoice)?)
                .with_context(|| format!("invalid invoice {}", invoice.display()))?;
            let record = chains.register_invoice(&fields)?;
            println!("{}", serde_json::to_string(&record)?);
            if qr {
                println!("{}", payload::build(&fields, &record));
            }

            if let Some(path) = ledger {
                let snapshot = serde_json::to_string_pretty(&chains.snapshot()?)?;
                fs::write(&path, snapshot)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so command output stays machine readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Ok(match path {
        Some(path) => Config::from_properties_file(path)?,
        None => Config::new(),
    })
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// The file name doubles as the reference URI of detached signatures.
fn read_document(path: &Path) -> Result<DocumentToSign> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let content = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(DocumentToSign::new(name, content))
}
