use std::fs;

use ukify::measure::{generate_signed_pcr, generate_signed_pcr_for_file, parse_phases, PcrData};
use ukify::section::{SectionName, SectionsData};
use ukify::signature::local::LocalPcrSigner;
use ukify::signature::PcrSigner;

// Policy digests for PCR 11, SHA-256 bank, empty sections, the default
// phase path. Cross-checked against systemd-measure.
const KNOWN_PCR11_POLICIES: [&str; 4] = [
    "7c8486f61cc1d88a28d6ab87850bee07c467ce6311340219e43a7a6e6521e543",
    "7474e6080ddc5355c6087db4272c7d8a6871a7c83a54694369561253f08fd3f1",
    "8fac790c125cc6c82b372714c8ecf83784523c05c5b78b37b1aae05521b7ec3e",
    "53f5e6ee03093e2fb1ea9d1351952a33ce381ae93bef210abb764941be8d8ec6",
];

fn test_signer() -> LocalPcrSigner {
    LocalPcrSigner::from_pem_file("tests/fixtures/pcr-key.pem")
        .expect("Failed to load test signing key")
}

fn default_phases() -> Vec<ukify::measure::PhaseInfo> {
    parse_phases("enter-initrd:leave-initrd:sysinit:ready").unwrap()
}

#[test]
fn signs_known_policies_for_empty_sections() {
    let signer = test_signer();
    let data =
        generate_signed_pcr(&SectionsData::new(), &default_phases(), &signer, 11).unwrap();

    for bank in [&data.sha1, &data.sha256, &data.sha384, &data.sha512] {
        assert_eq!(bank.len(), 4);
    }

    for (bank_data, expected) in data.sha256.iter().zip(KNOWN_PCR11_POLICIES) {
        assert_eq!(bank_data.pol, expected);
        assert_eq!(bank_data.pcrs, vec![11]);
        assert!(!bank_data.sig.is_empty());
    }
}

#[test]
fn different_pcr_produces_different_policies() {
    let signer = test_signer();
    let data =
        generate_signed_pcr(&SectionsData::new(), &default_phases(), &signer, 13).unwrap();

    for (bank_data, known) in data.sha256.iter().zip(KNOWN_PCR11_POLICIES) {
        assert_ne!(bank_data.pol, known);
    }
}

#[test]
fn sections_change_every_policy() {
    let signer = test_signer();
    let tmpdir = tempfile::tempdir().unwrap();
    let cmdline = tmpdir.path().join("cmdline");
    fs::write(&cmdline, "root=LABEL=BOOT").unwrap();

    let mut sections = SectionsData::new();
    sections.insert(SectionName::Cmdline, cmdline);

    let data = generate_signed_pcr(&sections, &default_phases(), &signer, 11).unwrap();

    for (bank_data, known) in data.sha256.iter().zip(KNOWN_PCR11_POLICIES) {
        assert_ne!(bank_data.pol, known);
    }
}

#[test]
fn fingerprint_depends_only_on_the_key() {
    let signer = test_signer();
    let data =
        generate_signed_pcr(&SectionsData::new(), &default_phases(), &signer, 11).unwrap();

    let expected = hex::encode(signer.public_key_fingerprint().unwrap());
    for bank in [&data.sha1, &data.sha256, &data.sha384, &data.sha512] {
        for bank_data in bank.iter() {
            assert_eq!(bank_data.pkfp, expected);
        }
    }
}

#[test]
fn rebuilds_are_byte_identical() {
    let signer = test_signer();
    let phases = default_phases();

    let first = generate_signed_pcr(&SectionsData::new(), &phases, &signer, 11).unwrap();
    let second = generate_signed_pcr(&SectionsData::new(), &phases, &signer, 11).unwrap();

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[test]
fn measure_only_phases_are_extended_but_not_signed() {
    let signer = test_signer();
    let mut phases = default_phases();
    phases[0].calculate_signature = false;

    let data = generate_signed_pcr(&SectionsData::new(), &phases, &signer, 11).unwrap();

    // One record fewer, but the remaining phases still see the skipped
    // extension: their policies match the full run from the second entry on.
    assert_eq!(data.sha256.len(), 3);
    assert_eq!(data.sha256[0].pol, KNOWN_PCR11_POLICIES[1]);
    assert_eq!(data.sha256[2].pol, KNOWN_PCR11_POLICIES[3]);
}

#[test]
fn single_file_measurement_emits_one_record_per_bank() {
    let signer = test_signer();
    let tmpdir = tempfile::tempdir().unwrap();
    let file = tmpdir.path().join("rootfs.img");
    fs::write(&file, b"not actually a rootfs").unwrap();

    let data = generate_signed_pcr_for_file(&file, &signer, 13).unwrap();

    for bank in [&data.sha1, &data.sha256, &data.sha384, &data.sha512] {
        assert_eq!(bank.len(), 1);
        assert_eq!(bank[0].pcrs, vec![13]);
    }
    // Bank values differ, so the policies do too.
    assert_ne!(data.sha256[0].pol, data.sha384[0].pol);
}

#[test]
fn out_of_range_pcr_is_rejected() {
    let signer = test_signer();
    assert!(generate_signed_pcr(&SectionsData::new(), &default_phases(), &signer, 24).is_err());
}

#[test]
fn empty_banks_are_omitted_from_json() {
    let mut data = PcrData::default();
    data.sha256 = vec![ukify::measure::BankData {
        pcrs: vec![11],
        pkfp: "00".into(),
        pol: "11".into(),
        sig: "c2ln".into(),
    }];

    let json = serde_json::to_string(&data).unwrap();
    assert!(json.contains("\"sha256\""));
    assert!(!json.contains("\"sha1\""));
    assert!(!json.contains("\"sha384\""));
    assert!(!json.contains("\"sha512\""));

    let round_tripped: PcrData = serde_json::from_str(&json).unwrap();
    assert_eq!(round_tripped, data);
}
