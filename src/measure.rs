use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::section::{SectionName, SectionsData};
use crate::signature::PcrSigner;
use crate::tpm::{calculate_policy, PcrAlgorithm, PcrRegister, PcrSelection};

/// PCR where systemd-stub measures the UKI sections (everything except
/// `.pcrsig`).
pub const UKI_PCR: u32 = 11;

/// One signed policy record of a PCR bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankData {
    /// PCR indices the policy binds to.
    pub pcrs: Vec<u32>,
    /// Fingerprint of the signing public key, lowercase hex.
    pub pkfp: String,
    /// PolicyPCR digest, lowercase hex.
    pub pol: String,
    /// PKCS#1 v1.5 signature over the policy digest, base64.
    pub sig: String,
}

/// The serialized `.pcrsig` payload. Empty banks are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sha1: Vec<BankData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sha256: Vec<BankData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sha384: Vec<BankData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sha512: Vec<BankData>,
}

impl PcrData {
    fn bank_mut(&mut self, alg: PcrAlgorithm) -> &mut Vec<BankData> {
        match alg {
            PcrAlgorithm::Sha1 => &mut self.sha1,
            PcrAlgorithm::Sha256 => &mut self.sha256,
            PcrAlgorithm::Sha384 => &mut self.sha384,
            PcrAlgorithm::Sha512 => &mut self.sha512,
        }
    }
}

/// A boot phase extended into the PCR after all sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseInfo {
    pub phase: String,
    /// Phases can be marked measure-only; the default is to sign every
    /// phase.
    pub calculate_signature: bool,
}

/// Parse a colon-separated phase path, e.g. `enter-initrd:leave-initrd`.
pub fn parse_phases(phase_path: &str) -> Result<Vec<PhaseInfo>> {
    let mut phases = Vec::new();

    for part in phase_path.split(':') {
        if part.is_empty() {
            bail!("Empty phase in {phase_path:?}");
        }
        phases.push(PhaseInfo {
            phase: part.to_string(),
            calculate_signature: true,
        });
    }

    Ok(phases)
}

/// Extend a fresh PCR register with the measured sections.
///
/// Sections are visited in the fixed measurement order regardless of how
/// the map was populated; absent sections are skipped entirely. Section
/// names are measured null-terminated, contents as-is, mimicking what
/// systemd-stub does when the UKI boots.
pub fn measure_sections(alg: PcrAlgorithm, sections: &SectionsData) -> Result<PcrRegister> {
    let mut register = PcrRegister::new(alg);

    for name in SectionName::MEASUREMENT_ORDER {
        let Some(path) = sections.get(&name) else {
            continue;
        };
        log::debug!("Measuring section {name} ({alg})");

        let contents = fs::read(path)
            .with_context(|| format!("Failed to read section {name} from {path:?}"))?;

        let mut tag = name.as_str().as_bytes().to_vec();
        tag.push(0);
        register.extend(&tag);
        register.extend(&contents);
    }

    Ok(register)
}

/// Extend the register with a phase string (no terminator) and return the
/// intermediate PCR value for that phase.
pub fn measure_phase(register: &mut PcrRegister, phase: &str) -> Vec<u8> {
    register.extend(phase.as_bytes());
    register.value().to_vec()
}

/// Build one signed `BankData` record from an intermediate PCR value.
pub fn sign_policy(
    pcr: u32,
    alg: PcrAlgorithm,
    signer: &dyn PcrSigner,
    pcr_value: &[u8],
) -> Result<BankData> {
    let selection = PcrSelection::new(alg, &[pcr])?;
    let policy = calculate_policy(pcr_value, &selection);
    let signature = signer
        .sign(&policy, alg)
        .context("PCR signer refused to sign the policy digest")?;
    let fingerprint = signer.public_key_fingerprint()?;

    log::debug!("Signed policy pol={} ({alg})", hex::encode(policy));

    Ok(BankData {
        pcrs: vec![pcr],
        pkfp: hex::encode(fingerprint),
        pol: hex::encode(policy),
        sig: BASE64.encode(signature),
    })
}

/// Emulate the boot-time measurement of `sections` across all banks and
/// sign one policy per phase.
pub fn generate_signed_pcr(
    sections: &SectionsData,
    phases: &[PhaseInfo],
    signer: &dyn PcrSigner,
    pcr: u32,
) -> Result<PcrData> {
    let mut data = PcrData::default();

    for alg in PcrAlgorithm::ALL {
        let mut register = measure_sections(alg, sections)?;
        let mut banks = Vec::new();

        for phase in phases {
            let value = measure_phase(&mut register, &phase.phase);
            log::debug!(
                "PCR after phase {} ({alg}): {}",
                phase.phase,
                hex::encode(&value)
            );

            if !phase.calculate_signature {
                continue;
            }

            banks.push(sign_policy(pcr, alg, signer, &value)?);
        }

        *data.bank_mut(alg) = banks;
    }

    Ok(data)
}

/// Measure without signing, logging the per-phase PCR values.
pub fn generate_measurements(
    sections: &SectionsData,
    phases: &[PhaseInfo],
    pcr: u32,
) -> Result<()> {
    for alg in PcrAlgorithm::ALL {
        let mut register = measure_sections(alg, sections)?;

        for phase in phases {
            let value = measure_phase(&mut register, &phase.phase);
            log::info!("{}:{}:{}={}", phase.phase, pcr, alg, hex::encode(&value));
        }
    }

    Ok(())
}

/// Measure a single file as one synthetic section and sign the result,
/// producing one record per bank.
pub fn generate_signed_pcr_for_file(
    file: &Path,
    signer: &dyn PcrSigner,
    pcr: u32,
) -> Result<PcrData> {
    let contents = fs::read(file).with_context(|| format!("Failed to read {file:?}"))?;
    let mut data = PcrData::default();

    for alg in PcrAlgorithm::ALL {
        let mut register = PcrRegister::new(alg);
        register.extend(&contents);
        *data.bank_mut(alg) = vec![sign_policy(pcr, alg, signer, register.value())?];
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::SectionsData;
    use crate::utils::SecureTempDirExt;

    #[test]
    fn parse_phases_splits_in_order() {
        let phases = parse_phases("enter-initrd:leave-initrd:sysinit:ready").unwrap();
        assert_eq!(phases.len(), 4);
        assert_eq!(phases[0].phase, "enter-initrd");
        assert_eq!(phases[3].phase, "ready");
        assert!(phases.iter().all(|p| p.calculate_signature));
    }

    #[test]
    fn parse_phases_rejects_empty_components() {
        assert!(parse_phases("").is_err());
        assert!(parse_phases("enter-initrd::ready").is_err());
        assert!(parse_phases("enter-initrd:").is_err());
    }

    #[test]
    fn empty_sections_leave_register_untouched() {
        let register = measure_sections(PcrAlgorithm::Sha256, &SectionsData::new()).unwrap();
        assert_eq!(register.value(), vec![0u8; 32]);
    }

    #[test]
    fn measurement_order_is_independent_of_insertion_order() {
        let tmpdir = tempfile::tempdir().unwrap();
        let cmdline = tmpdir.write_secure_file("cmdline", "root=LABEL=BOOT").unwrap();
        let uname = tmpdir.write_secure_file("uname", "6.5.0").unwrap();

        let mut first = SectionsData::new();
        first.insert(SectionName::Cmdline, cmdline.clone());
        first.insert(SectionName::Uname, uname.clone());

        let mut second = SectionsData::new();
        second.insert(SectionName::Uname, uname);
        second.insert(SectionName::Cmdline, cmdline);

        let a = measure_sections(PcrAlgorithm::Sha256, &first).unwrap();
        let b = measure_sections(PcrAlgorithm::Sha256, &second).unwrap();
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn adding_a_section_changes_the_measurement() {
        let tmpdir = tempfile::tempdir().unwrap();
        let cmdline = tmpdir.write_secure_file("cmdline", "root=LABEL=BOOT").unwrap();

        let mut sections = SectionsData::new();
        sections.insert(SectionName::Cmdline, cmdline);

        let with = measure_sections(PcrAlgorithm::Sha256, &sections).unwrap();
        let without = measure_sections(PcrAlgorithm::Sha256, &SectionsData::new()).unwrap();
        assert_ne!(with.value(), without.value());
    }

    #[test]
    fn phase_values_chain() {
        let mut stepped = PcrRegister::new(PcrAlgorithm::Sha256);
        measure_phase(&mut stepped, "enter-initrd");
        let after_second = measure_phase(&mut stepped, "leave-initrd");

        let mut direct = PcrRegister::new(PcrAlgorithm::Sha256);
        direct.extend(b"enter-initrd");
        direct.extend(b"leave-initrd");

        assert_eq!(after_second, direct.value());
    }
}
