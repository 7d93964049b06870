//! Build, measure and Secure Boot-sign Unified Kernel Images.
//!
//! The crate emulates the TPM PCR extensions systemd-stub performs at boot,
//! signs a `TPM2_PolicyPCR` digest for every boot phase and bank, and
//! appends the resulting sections onto an sd-stub PE binary.

pub mod builder;
pub mod cli;
pub mod measure;
pub mod os_release;
pub mod pe;
pub mod section;
pub mod signature;
pub mod tpm;
pub mod uname;
pub mod utils;
