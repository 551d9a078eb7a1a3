//! Cluster name generation and validation
//!
//! Cluster names look like `kl-abc1234`: a short lowercase prefix, a dash,
//! and seven hex characters. The hex id doubles as the machine-name
//! domain, so the format is load-bearing rather than cosmetic.

use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

use crate::error::{Error, Result};

/// Prefix for generated cluster names
pub const NAME_PREFIX: &str = "kl";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9]*-[0-9a-f]{7}$").expect("valid cluster name pattern")
    })
}

/// Generate a fresh cluster name, `kl-` plus seven random hex characters
pub fn new_name() -> String {
    let id: u32 = rand::thread_rng().gen_range(0..0x1000_0000);
    format!("{NAME_PREFIX}-{id:07x}")
}

/// Validate a cluster name against the `<prefix>-<7 hex>` format
pub fn validate_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid cluster name {name:?}, expected <prefix>-<7 hex chars>"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_validate() {
        for _ in 0..64 {
            let name = new_name();
            validate_name(&name).unwrap();
            assert!(name.starts_with("kl-"));
        }
    }

    #[test]
    fn test_foreign_prefixes_are_accepted() {
        validate_name("sk8-abc1234").unwrap();
    }

    #[test]
    fn test_malformed_names_are_rejected() {
        for bad in ["", "kl-xyz", "kl-ABC1234", "kl_abc1234", "-abc1234", "kl-abc12345"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
