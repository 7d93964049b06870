use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::measure::{self, PhaseInfo, UKI_PCR};
use crate::os_release::{OsRelease, DEFAULT_OS_NAME};
use crate::pe;
use crate::section::{sections_data, SectionName, UkiSection};
use crate::signature::{PcrSigner, PeSigner};
use crate::uname;
use crate::utils::SecureTempDirExt;

/// Fallback `.splash` contents: a 1x1-pixel black BMP.
const DEFAULT_SPLASH: &[u8] = &[
    0x42, 0x4d, 0x3a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x36, 0x00, 0x00, 0x00, 0x28,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x18, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x13, 0x0b, 0x00, 0x00, 0x13, 0x0b, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// UKI builder.
///
/// The build process is as follows:
///   - sign the sd-boot binary, if one was supplied together with Secure
///     Boot key material
///   - generate the section plan: ephemeral files (os-release, cmdline,
///     uname, sbat, PCR public key) plus the caller-supplied inputs
///   - measure the planned sections, sign one policy per phase and bank,
///     and append the result as the `.pcrsig` section
///   - assemble the final PE starting from the stub and sign it.
pub struct Builder {
    /// Architecture of the UKI file.
    pub arch: Option<String>,
    /// OS version recorded in the generated os-release.
    pub version: Option<String>,
    /// Path to the sd-stub the UKI is built from.
    pub sd_stub_path: PathBuf,
    /// Path to the sd-boot to sign alongside the UKI.
    pub sd_boot_path: Option<PathBuf>,
    /// Path to the kernel image.
    pub kernel_path: PathBuf,
    /// Path to the initrd image.
    pub initrd_path: PathBuf,
    /// Kernel command line.
    pub cmdline: String,
    /// Existing os-release file to embed instead of generating one.
    pub os_release: Option<PathBuf>,
    /// Splash image to embed instead of the bundled one.
    pub splash: Option<PathBuf>,
    /// Boot phases to precompute policies for, in boot order.
    pub phases: Vec<PhaseInfo>,
    /// Policy signer; without one the build measures and logs only.
    pub pcr_signer: Option<Box<dyn PcrSigner>>,
    /// Secure Boot signer; without one the UKI is left unsigned.
    pub pe_signer: Option<Box<dyn PeSigner>>,

    /// Path the signed sd-boot is written to.
    pub out_sd_boot_path: PathBuf,
    /// Path the final UKI is written to.
    pub out_uki_path: PathBuf,
}

type Generator = fn(&Builder, &TempDir, &mut Vec<UkiSection>) -> Result<()>;

impl Builder {
    /// Build the UKI file.
    pub fn build(&self) -> Result<()> {
        let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;

        if let Some(pe_signer) = &self.pe_signer {
            if let Some(sd_boot) = &self.sd_boot_path {
                log::info!("Signing sd-boot {sd_boot:?}");
                pe_signer
                    .sign(sd_boot, &self.out_sd_boot_path)
                    .context("Failed to sign sd-boot")?;
                log::info!("Signed sd-boot to {:?}", self.out_sd_boot_path);
            }
        } else if self.sd_boot_path.is_some() {
            log::info!("Not signing sd-boot: no Secure Boot key material");
        }

        log::info!("Generating UKI sections");

        // Kernel goes second to last so its decompression headroom cannot
        // perturb the VMAs of the preceding sections; pcrsig goes last so it
        // measures everything before it.
        let generators: [Generator; 9] = [
            Builder::plan_os_release,
            Builder::plan_cmdline,
            Builder::plan_initrd,
            Builder::plan_splash,
            Builder::plan_uname,
            Builder::plan_sbat,
            Builder::plan_pcr_public_key,
            Builder::plan_kernel,
            Builder::plan_pcr_signature,
        ];

        let mut sections = Vec::new();
        for generate in generators {
            generate(self, &scratch, &mut sections).context("Failed to generate sections")?;
        }

        log::info!("Assembling UKI");
        let unsigned = scratch.path().join("uki.unsigned.efi");
        pe::append_sections(&self.sd_stub_path, &mut sections, &unsigned)
            .context("Failed to assemble the UKI")?;

        match &self.pe_signer {
            Some(pe_signer) => {
                log::info!("Signing UKI to {:?}", self.out_uki_path);
                pe_signer
                    .sign(&unsigned, &self.out_uki_path)
                    .context("Failed to sign the UKI")?;
            }
            None => {
                let out = unsigned_output_path(&self.out_uki_path);
                log::info!("Secure Boot disabled, copying unsigned UKI to {out:?}");
                fs::copy(&unsigned, &out)
                    .with_context(|| format!("Failed to write unsigned UKI to {out:?}"))?;
            }
        }

        Ok(())
    }

    fn plan_os_release(
        &self,
        scratch: &TempDir,
        sections: &mut Vec<UkiSection>,
    ) -> Result<()> {
        let path = match &self.os_release {
            Some(path) => {
                log::debug!("Using existing os-release {path:?}");
                path.clone()
            }
            None => {
                log::debug!("Generating os-release");
                let os_release = OsRelease::for_distribution(
                    DEFAULT_OS_NAME,
                    self.version.as_deref().unwrap_or_default(),
                );
                scratch.write_secure_file("os-release", os_release.to_string())?
            }
        };

        sections.push(UkiSection::new(SectionName::OsRel, path));
        Ok(())
    }

    fn plan_cmdline(&self, scratch: &TempDir, sections: &mut Vec<UkiSection>) -> Result<()> {
        log::debug!("Using cmdline {:?}", self.cmdline);
        let path = scratch.write_secure_file("cmdline", &self.cmdline)?;
        sections.push(UkiSection::new(SectionName::Cmdline, path));
        Ok(())
    }

    fn plan_initrd(&self, _scratch: &TempDir, sections: &mut Vec<UkiSection>) -> Result<()> {
        log::debug!("Using initrd {:?}", self.initrd_path);
        sections.push(UkiSection::new(SectionName::Initrd, self.initrd_path.clone()));
        Ok(())
    }

    fn plan_splash(&self, scratch: &TempDir, sections: &mut Vec<UkiSection>) -> Result<()> {
        let data = match &self.splash {
            Some(path) => {
                log::debug!("Using splash {path:?}");
                fs::read(path).with_context(|| format!("Failed to read splash {path:?}"))?
            }
            None => {
                log::debug!("Using bundled splash");
                DEFAULT_SPLASH.to_vec()
            }
        };

        let path = scratch.write_secure_file("splash.bmp", data)?;
        sections.push(UkiSection::new(SectionName::Splash, path));
        Ok(())
    }

    fn plan_uname(&self, scratch: &TempDir, sections: &mut Vec<UkiSection>) -> Result<()> {
        // Not every kernel image carries a readable version; skipping the
        // section is the only non-fatal failure in the plan.
        let version = match uname::discover_kernel_version(&self.kernel_path) {
            Ok(Some(version)) => version,
            Ok(None) => {
                log::info!(
                    "Could not infer a kernel version from {:?}, omitting .uname",
                    self.kernel_path
                );
                return Ok(());
            }
            Err(err) => {
                log::info!("Kernel version discovery failed ({err:#}), omitting .uname");
                return Ok(());
            }
        };

        log::debug!("Discovered kernel version {version}");
        let path = scratch.write_secure_file("uname", version)?;
        sections.push(UkiSection::new(SectionName::Uname, path));
        Ok(())
    }

    fn plan_sbat(&self, scratch: &TempDir, sections: &mut Vec<UkiSection>) -> Result<()> {
        log::debug!("Extracting SBAT from {:?}", self.sd_stub_path);
        let sbat = pe::get_sbat(&self.sd_stub_path)?;
        let path = scratch.write_secure_file("sbat", sbat)?;

        // The stub already carries .sbat, so the section must be measured
        // without appending a second copy.
        sections.push(UkiSection::new(SectionName::Sbat, path).measure_only());
        Ok(())
    }

    fn plan_pcr_public_key(
        &self,
        scratch: &TempDir,
        sections: &mut Vec<UkiSection>,
    ) -> Result<()> {
        let Some(signer) = &self.pcr_signer else {
            return Ok(());
        };

        log::debug!("Embedding PCR public key");
        let pem = signer.public_key_pem()?;
        let path = scratch.write_secure_file("pcr-public.pem", pem)?;
        sections.push(UkiSection::new(SectionName::PcrPKey, path));
        Ok(())
    }

    fn plan_kernel(&self, _scratch: &TempDir, sections: &mut Vec<UkiSection>) -> Result<()> {
        log::debug!("Using kernel {:?}", self.kernel_path);
        sections.push(UkiSection::new(SectionName::Linux, self.kernel_path.clone()));
        Ok(())
    }

    fn plan_pcr_signature(
        &self,
        scratch: &TempDir,
        sections: &mut Vec<UkiSection>,
    ) -> Result<()> {
        let measured = sections_data(sections);

        match &self.pcr_signer {
            Some(signer) => {
                log::info!("Generating signed PCR policies (PCR {UKI_PCR})");
                let data =
                    measure::generate_signed_pcr(&measured, &self.phases, signer.as_ref(), UKI_PCR)?;
                let json =
                    serde_json::to_vec(&data).context("Failed to serialize PCR signature data")?;
                let path = scratch.write_secure_file("pcrpsig", json)?;
                sections.push(UkiSection::new(SectionName::PcrSig, path).append_only());
            }
            None => {
                log::info!("No PCR key supplied, logging measurements only");
                measure::generate_measurements(&measured, &self.phases, UKI_PCR)?;
            }
        }

        Ok(())
    }
}

/// Output path used when Secure Boot signing is disabled.
fn unsigned_output_path(out: &Path) -> PathBuf {
    match out.to_str() {
        Some(s) if s.contains("signed") => PathBuf::from(s.replace("signed", "unsigned")),
        _ => out.to_path_buf(),
    }
}
