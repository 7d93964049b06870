use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Well-known section names of a unified kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionName {
    Linux,
    OsRel,
    Cmdline,
    Initrd,
    Splash,
    Dtb,
    Uname,
    Sbat,
    PcrPKey,
    PcrSig,
}

impl SectionName {
    /// The order in which systemd-stub measures sections into the PCR.
    /// DO NOT REARRANGE.
    pub const MEASUREMENT_ORDER: [SectionName; 9] = [
        SectionName::Linux,
        SectionName::OsRel,
        SectionName::Cmdline,
        SectionName::Initrd,
        SectionName::Splash,
        SectionName::Dtb,
        SectionName::Uname,
        SectionName::Sbat,
        SectionName::PcrPKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SectionName::Linux => ".linux",
            SectionName::OsRel => ".osrel",
            SectionName::Cmdline => ".cmdline",
            SectionName::Initrd => ".initrd",
            SectionName::Splash => ".splash",
            SectionName::Dtb => ".dtb",
            SectionName::Uname => ".uname",
            SectionName::Sbat => ".sbat",
            SectionName::PcrPKey => ".pcrpkey",
            SectionName::PcrSig => ".pcrsig",
        }
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planned section of the output UKI.
#[derive(Debug, Clone)]
pub struct UkiSection {
    pub name: SectionName,
    /// Path to the contents of the section.
    pub path: PathBuf,
    /// Should the section be measured into the TPM?
    pub measure: bool,
    /// Should the section be appended, or is it already in the PE file?
    pub append: bool,
    /// Size and VMA, filled in by the assembler.
    pub size: u64,
    pub vma: u64,
}

impl UkiSection {
    pub fn new(name: SectionName, path: impl Into<PathBuf>) -> Self {
        Self {
            name,
            path: path.into(),
            measure: true,
            append: true,
            size: 0,
            vma: 0,
        }
    }

    /// The section is already present in the stub and only participates in
    /// measurement.
    pub fn measure_only(mut self) -> Self {
        self.append = false;
        self
    }

    /// The section is appended to the output without being measured.
    pub fn append_only(mut self) -> Self {
        self.measure = false;
        self
    }
}

/// Map of measured sections to their backing files.
pub type SectionsData = BTreeMap<SectionName, PathBuf>;

/// Collect the measured sections of a plan.
pub fn sections_data(sections: &[UkiSection]) -> SectionsData {
    sections
        .iter()
        .filter(|s| s.measure)
        .map(|s| (s.name, s.path.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_data_keeps_only_measured_sections() {
        let sections = vec![
            UkiSection::new(SectionName::Cmdline, "/tmp/cmdline"),
            UkiSection::new(SectionName::Sbat, "/tmp/sbat").measure_only(),
            UkiSection::new(SectionName::PcrSig, "/tmp/pcrpsig").append_only(),
        ];

        let data = sections_data(&sections);
        assert_eq!(data.len(), 2);
        assert!(data.contains_key(&SectionName::Cmdline));
        assert!(data.contains_key(&SectionName::Sbat));
        assert!(!data.contains_key(&SectionName::PcrSig));
    }
}
