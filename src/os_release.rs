use std::collections::BTreeMap;
use std::fmt;

/// Distribution name used when no os-release file is supplied.
pub const DEFAULT_OS_NAME: &str = "Linux";

/// An os-release file represented by a BTreeMap.
///
/// The BTreeMap is used over a HashMap, so that the keys are ordered. This
/// is irrelevant for the stub (which does not care about order when reading
/// the `.osrel` section) but keeps the generated bytes deterministic, which
/// the measurements depend on.
pub struct OsRelease(pub BTreeMap<String, String>);

impl OsRelease {
    /// Build the minimal os-release embedded when the caller does not
    /// provide one: NAME, ID (lowercased NAME), VERSION_ID and PRETTY_NAME.
    pub fn for_distribution(name: &str, version: &str) -> Self {
        let mut map = BTreeMap::new();

        map.insert("NAME".into(), name.to_string());
        map.insert("ID".into(), name.to_lowercase());
        map.insert("VERSION_ID".into(), version.to_string());
        map.insert("PRETTY_NAME".into(), format!("{name} ({version})"));

        Self(map)
    }
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && !"._-".contains(c))
}

/// Display OsRelease in the format of an os-release file.
impl fmt::Display for OsRelease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (key, value) in &self.0 {
            if needs_quoting(value) {
                writeln!(f, "{key}=\"{value}\"")?
            } else {
                writeln!(f, "{key}={value}")?
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_expected_fields() {
        let os_release = OsRelease::for_distribution("Mauve", "1.2.3");

        assert_eq!(os_release.0["NAME"], "Mauve");
        assert_eq!(os_release.0["ID"], "mauve");
        assert_eq!(os_release.0["VERSION_ID"], "1.2.3");
        assert_eq!(os_release.0["PRETTY_NAME"], "Mauve (1.2.3)");
    }

    #[test]
    fn quotes_values_that_need_it() {
        let rendered = OsRelease::for_distribution("Mauve", "1.2.3").to_string();

        assert!(rendered.contains("ID=mauve\n"));
        assert!(rendered.contains("VERSION_ID=1.2.3\n"));
        assert!(rendered.contains("PRETTY_NAME=\"Mauve (1.2.3)\"\n"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = OsRelease::for_distribution("Mauve", "1.2.3").to_string();
        let b = OsRelease::for_distribution("Mauve", "1.2.3").to_string();
        assert_eq!(a, b);
    }
}
