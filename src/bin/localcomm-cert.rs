use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use clap::{ArgAction, Parser};
use localcomm::security::certs::LocalCertificate;

/// Generate the self-signed certificate a service or object presents on local connections.
///
/// The subject CN is the certificate id exchanged during certificate sharing,
/// so use the full service id (`srvId/usrId/instId`) or full object id when known.
#[derive(Parser, Debug)]
#[command(
    name = "localcomm-cert",
    version,
    about = "Generate self-signed certs for LocalComm"
)]
struct Cli {
    /// Common Name (CN). Defaults to localcomm-<unix_ts>
    #[arg(long)]
    cn: Option<String>,

    /// Output certificate path
    #[arg(long, default_value = "local_cert.pem")]
    out_cert: PathBuf,

    /// Output private key path
    #[arg(long, default_value = "local_key.pem")]
    out_key: PathBuf,

    /// Also copy the cert into this trusted directory (useful for allowlist mode)
    #[arg(long)]
    trusted_dir: Option<PathBuf>,

    /// Overwrite output files if they exist
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    for path in [&cli.out_cert, &cli.out_key] {
        if path.exists() && !cli.force {
            anyhow::bail!("{} exists; use --force to overwrite", path.display());
        }
    }

    let cn = match cli.cn {
        Some(cn) => cn,
        None => {
            let ts = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)?.as_secs();
            format!("localcomm-{}", ts)
        }
    };

    let cert = LocalCertificate::generate(&cn)?;
    cert.write_pem(&cli.out_cert, &cli.out_key)?;

    if let Some(dir) = &cli.trusted_dir {
        fs::create_dir_all(dir)?;
        let target = dir.join(format!("{}.pem", cert.fingerprint()));
        fs::write(&target, cert.cert_pem().unwrap_or_default())?;
        println!("  trusted copy: {}", target.display());
    }

    println!("✅ Generated cert and key");
    println!("  cn:   {}", cert.id());
    println!("  cert: {}", cli.out_cert.display());
    println!("  key:  {}", cli.out_key.display());
    println!("  spki_sha256: {}", cert.fingerprint());
    println!(
        "\nAdd to config.toml (example):\n[keystore]\ncert_path = \"{}\"\nkey_path = \"{}\"\n\n[trust]\nmode = \"allowlist\"\npin_fingerprints = [\"{}\"]\n",
        cli.out_cert.display(),
        cli.out_key.display(),
        cert.fingerprint()
    );
    Ok(())
}
