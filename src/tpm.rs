use std::fmt;

use anyhow::{bail, Result};
use digest::DynDigest;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Command code of `TPM2_PolicyPCR`, from the TPM 2.0 command registry.
const TPM_CC_POLICY_PCR: u32 = 0x0000_017f;

/// Octets in a PCR select bitmap. A conformant TPM allocates at least
/// 24 PCRs (0-23) in every bank, which fit in three octets.
const SIZE_OF_PCR_SELECT: usize = 3;

/// Hash algorithms a PCR bank can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PcrAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl PcrAlgorithm {
    /// All banks, in the order they are emitted into `.pcrsig`.
    pub const ALL: [PcrAlgorithm; 4] = [
        PcrAlgorithm::Sha1,
        PcrAlgorithm::Sha256,
        PcrAlgorithm::Sha384,
        PcrAlgorithm::Sha512,
    ];

    /// TPM_ALG_ID assigned by the TCG algorithm registry.
    pub fn tpm_alg_id(self) -> u16 {
        match self {
            PcrAlgorithm::Sha1 => 0x0004,
            PcrAlgorithm::Sha256 => 0x000b,
            PcrAlgorithm::Sha384 => 0x000c,
            PcrAlgorithm::Sha512 => 0x000d,
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            PcrAlgorithm::Sha1 => 20,
            PcrAlgorithm::Sha256 => 32,
            PcrAlgorithm::Sha384 => 48,
            PcrAlgorithm::Sha512 => 64,
        }
    }

    /// Bank name as it appears in the `.pcrsig` JSON.
    pub fn bank_name(self) -> &'static str {
        match self {
            PcrAlgorithm::Sha1 => "sha1",
            PcrAlgorithm::Sha256 => "sha256",
            PcrAlgorithm::Sha384 => "sha384",
            PcrAlgorithm::Sha512 => "sha512",
        }
    }

    fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            PcrAlgorithm::Sha1 => Box::new(Sha1::new()),
            PcrAlgorithm::Sha256 => Box::new(Sha256::new()),
            PcrAlgorithm::Sha384 => Box::new(Sha384::new()),
            PcrAlgorithm::Sha512 => Box::new(Sha512::new()),
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize().into_vec()
    }
}

impl fmt::Display for PcrAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.bank_name())
    }
}

/// Emulation of a single TPM PCR: a register that starts at all zeros and
/// can only be extended.
#[derive(Debug, Clone)]
pub struct PcrRegister {
    alg: PcrAlgorithm,
    value: Vec<u8>,
}

impl PcrRegister {
    pub fn new(alg: PcrAlgorithm) -> Self {
        Self {
            alg,
            value: vec![0; alg.digest_len()],
        }
    }

    /// TPM extend: the event data is hashed first, then folded into the
    /// register as `H(value || H(event))`.
    pub fn extend(&mut self, event: &[u8]) {
        let event_digest = self.alg.digest(event);
        let mut hasher = self.alg.hasher();
        hasher.update(&self.value);
        hasher.update(&event_digest);
        self.value = hasher.finalize().into_vec();
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn algorithm(&self) -> PcrAlgorithm {
        self.alg
    }
}

/// Convert PCR indices into the TPM 2.0 three-octet select bitmap.
pub fn create_selector(pcrs: &[u32]) -> Result<[u8; SIZE_OF_PCR_SELECT]> {
    let mut mask = [0u8; SIZE_OF_PCR_SELECT];

    for &n in pcrs {
        if n >= (8 * SIZE_OF_PCR_SELECT) as u32 {
            bail!(
                "PCR index {n} is out of range (exceeds maximum value {})",
                8 * SIZE_OF_PCR_SELECT - 1
            );
        }

        mask[(n >> 3) as usize] |= 1 << (n & 0x7);
    }

    Ok(mask)
}

/// A `TPML_PCR_SELECTION` holding a single bank selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcrSelection {
    alg: PcrAlgorithm,
    select: [u8; SIZE_OF_PCR_SELECT],
}

impl PcrSelection {
    pub fn new(alg: PcrAlgorithm, pcrs: &[u32]) -> Result<Self> {
        Ok(Self {
            alg,
            select: create_selector(pcrs)?,
        })
    }

    /// TPM 2.0 wire form: a count-prefixed list of `TPMS_PCR_SELECTION`
    /// entries, each `{hash, sizeofSelect, pcrSelect}`.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&self.alg.tpm_alg_id().to_be_bytes());
        out.push(SIZE_OF_PCR_SELECT as u8);
        out.extend_from_slice(&self.select);
        out
    }
}

/// Compute the `TPM2_PolicyPCR` digest authorizing key use only while the
/// selected PCR holds `pcr_value`.
///
/// The policy session hash is always SHA-256, independent of the bank the
/// PCR value came from.
pub fn calculate_policy(pcr_value: &[u8], selection: &PcrSelection) -> [u8; 32] {
    let pcr_digest = Sha256::digest(pcr_value);

    let mut hasher = Sha256::new();
    Digest::update(&mut hasher, [0u8; 32]);
    Digest::update(&mut hasher, TPM_CC_POLICY_PCR.to_be_bytes());
    Digest::update(&mut hasher, selection.marshal());
    Digest::update(&mut hasher, pcr_digest);
    hasher.finalize().into()
}
