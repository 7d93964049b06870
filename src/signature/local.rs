use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

use super::{PcrSigner, PeSigner};
use crate::tpm::PcrAlgorithm;

/// PCR policy signer backed by an RSA private key file.
pub struct LocalPcrSigner {
    key: RsaPrivateKey,
    public: RsaPublicKey,
}

impl LocalPcrSigner {
    /// Load an RSA private key from a PKCS#8 or PKCS#1 PEM file. Non-RSA
    /// keys fail here, not at signing time.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = fs::read_to_string(path)
            .with_context(|| format!("Failed to read PCR private key {path:?}"))?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .with_context(|| format!("Failed to parse RSA private key {path:?}"))?;
        let public = key.to_public_key();

        Ok(Self { key, public })
    }
}

impl PcrSigner for LocalPcrSigner {
    fn public_rsa_key(&self) -> &RsaPublicKey {
        &self.public
    }

    fn sign(&self, message: &[u8], alg: PcrAlgorithm) -> Result<Vec<u8>> {
        let signature = match alg {
            PcrAlgorithm::Sha1 => SigningKey::<Sha1>::new(self.key.clone())
                .try_sign(message)?
                .to_vec(),
            PcrAlgorithm::Sha256 => SigningKey::<Sha256>::new(self.key.clone())
                .try_sign(message)?
                .to_vec(),
            PcrAlgorithm::Sha384 => SigningKey::<Sha384>::new(self.key.clone())
                .try_sign(message)?
                .to_vec(),
            PcrAlgorithm::Sha512 => SigningKey::<Sha512>::new(self.key.clone())
                .try_sign(message)?
                .to_vec(),
        };

        Ok(signature)
    }
}

/// Authenticode signer shelling out to sbsign.
pub struct SecureBootSigner {
    certificate: PathBuf,
    private_key: PathBuf,
}

impl SecureBootSigner {
    pub fn new(certificate: &Path, private_key: &Path) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
        }
    }

    /// Whether `path` already carries a signature that verifies against our
    /// certificate.
    fn verify(&self, path: &Path) -> Result<bool> {
        let args: Vec<OsString> = vec![
            OsString::from("--cert"),
            self.certificate.clone().into(),
            path.as_os_str().to_owned(),
        ];

        let output = Command::new("sbverify")
            .args(&args)
            .output()
            .context("Failed to run sbverify. Most likely, the binary is not on PATH.")?;

        Ok(output.status.success())
    }
}

impl PeSigner for SecureBootSigner {
    fn sign(&self, input: &Path, output: &Path) -> Result<()> {
        log::debug!("Signing {input:?} to {output:?}");

        if self.verify(input).unwrap_or(false) {
            log::info!("{input:?} is already signed, copying verbatim");
            fs::copy(input, output)
                .with_context(|| format!("Failed to copy signed binary to {output:?}"))?;
            return Ok(());
        }

        let args: Vec<OsString> = vec![
            OsString::from("--key"),
            self.private_key.clone().into(),
            OsString::from("--cert"),
            self.certificate.clone().into(),
            input.as_os_str().to_owned(),
            OsString::from("--output"),
            output.as_os_str().to_owned(),
        ];

        let out = Command::new("sbsign")
            .args(&args)
            .output()
            .context("Failed to run sbsign. Most likely, the binary is not on PATH.")?;

        if !out.status.success() {
            std::io::stderr()
                .write_all(&out.stderr)
                .context("Failed to write output of sbsign to stderr.")?;
            log::debug!("sbsign failed with args: `{args:?}`.");
            return Err(anyhow::anyhow!("Failed to sign {output:?}."));
        }

        Ok(())
    }
}
