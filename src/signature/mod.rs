use std::path::Path;

use anyhow::Result;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};

use crate::tpm::PcrAlgorithm;

/// RSA signer for the PCR policy records.
///
/// Implementations only need to expose the RSA public key and produce
/// PKCS#1 v1.5 signatures; fingerprint and PEM encodings derive from the
/// public key. The key must be RSA, which implementations enforce at
/// construction.
pub trait PcrSigner {
    /// The public half of the signing key.
    fn public_rsa_key(&self) -> &RsaPublicKey;

    /// PKCS#1 v1.5 signature over `message`, hashed under the bank
    /// algorithm. Banks other than SHA-256 still sign the 32-byte policy
    /// digest, re-hashed under their own algorithm, which is what
    /// systemd-stub verifies against at boot.
    fn sign(&self, message: &[u8], alg: PcrAlgorithm) -> Result<Vec<u8>>;

    /// SHA-256 fingerprint of the PKCS#1 DER encoding of the public key,
    /// the `pkfp` field of a policy record.
    fn public_key_fingerprint(&self) -> Result<[u8; 32]> {
        let der = self.public_rsa_key().to_pkcs1_der()?;
        Ok(Sha256::digest(der.as_bytes()).into())
    }

    /// SubjectPublicKeyInfo PEM of the public key, the contents of the
    /// `.pcrpkey` section.
    fn public_key_pem(&self) -> Result<String> {
        Ok(self.public_rsa_key().to_public_key_pem(LineEnding::LF)?)
    }
}

/// Authenticode signer for PE binaries.
pub trait PeSigner {
    /// Sign `input` and write the signed binary to `output`. An input that
    /// already carries a valid signature is copied verbatim.
    fn sign(&self, input: &Path, output: &Path) -> Result<()>;
}

pub mod local;
