//! The named allow-list of tolerated deviations from the published format.
//!
//! Validation everywhere else is strict equality against the managed PE
//! layout. Real-world producers (most notably Silverlight-era emitters)
//! deviate in a handful of known places; those places are enumerated here,
//! once, and every validation site that tolerates a deviation consults
//! this table through [`check`]. Removing an entry makes the
//! corresponding field strict again; there is no other source of
//! leniency in the crate.

use crate::Result;

/// One tolerated deviation: the field path it applies to and why it is
/// accepted.
#[derive(Debug, Clone, Copy)]
pub struct SpecVariation {
    /// Field path as used in validation error messages.
    pub field: &'static str,
    /// Why the deviation is tolerated.
    pub rationale: &'static str,
}

/// Every deviation this crate tolerates.
pub const SPEC_VARIATIONS: &[SpecVariation] = &[
    SpecVariation {
        field: "DosHeader.Final",
        rationale: "trailing reserved dword should be zero, but Silverlight assemblies put data there",
    },
    SpecVariation {
        field: "CoffHeader.Flags",
        rationale: "spec also requires the line-number/local-symbol stripped bits to be set",
    },
    SpecVariation {
        field: "NtFields.ImageBase",
        rationale: "image base varies under Silverlight",
    },
    SpecVariation {
        field: "NtFields.FileChecksum",
        rationale: "file checksum is not always zero",
    },
    SpecVariation {
        field: "NtFields.DllFlags",
        rationale: "DLL characteristics are not always zero",
    },
    SpecVariation {
        field: "NtFields.StackCommitSize",
        rationale: "differs from the nominal 0x1000 under Silverlight",
    },
    SpecVariation {
        field: "NtFields.HeapReserveSize",
        rationale: "differs from the nominal 0x100000 under Silverlight",
    },
    SpecVariation {
        field: "NtFields.HeapCommitSize",
        rationale: "differs from the nominal 0x1000 under Silverlight",
    },
    SpecVariation {
        field: "DataDirectories.ResourceTable",
        rationale: "should be zero for managed images, but producers emit native resources",
    },
    SpecVariation {
        field: "DataDirectories.CertificateTable",
        rationale: "should be zero; when present it is never dereferenced, since known \
                    producers emit addresses outside every section",
    },
    SpecVariation {
        field: "DataDirectories.Debug",
        rationale: "should be zero, but producers emit debug directories",
    },
];

/// Returns `true` if `field` has a tolerated deviation.
#[must_use]
pub fn tolerated(field: &str) -> bool {
    SPEC_VARIATIONS.iter().any(|v| v.field == field)
}

/// Uniform validation entry point for variation-covered fields.
///
/// Accepts when the value matches the strict specification, or when the
/// field is on the allow-list; everything else is a format violation
/// naming the field.
pub(crate) fn check(field: &'static str, matches_spec: bool) -> Result<()> {
    if matches_spec || tolerated(field) {
        Ok(())
    } else {
        Err(malformed_error!("invalid {}", field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_fields_are_tolerated() {
        assert!(tolerated("DosHeader.Final"));
        assert!(tolerated("NtFields.FileChecksum"));
        assert!(tolerated("DataDirectories.CertificateTable"));
        assert!(!tolerated("CoffHeader.Machine"));
    }

    #[test]
    fn check_accepts_spec_matches() {
        assert!(check("CoffHeader.Machine", true).is_ok());
        assert!(check("NtFields.ImageBase", false).is_ok());
    }

    #[test]
    fn check_rejects_unlisted_deviations() {
        let err = check("CoffHeader.Machine", false).unwrap_err();
        assert!(err.to_string().contains("CoffHeader.Machine"));
    }
}
