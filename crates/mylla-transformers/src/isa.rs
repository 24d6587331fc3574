//! CPU instruction-set probing.
//!
//! The tier is detected once per process and stored in a read-only record;
//! kernel dispatch selects the best implementation at or below this tier.

use once_cell::sync::Lazy;

/// Instruction-set tiers, totally ordered from the portable baseline up.
///
/// Every kernel has a `NoSimd` reference implementation; higher tiers are
/// optional accelerations that must agree with the reference within each
/// operation's documented tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsaTier {
    NoSimd,
    Avx2,
    Avx512f,
    Avx512Vnni,
    Amx,
}

impl IsaTier {
    /// All tiers in ascending order. Tests iterate this to cross-check
    /// dispatch-table entries against the reference.
    pub const ALL: [IsaTier; 5] = [
        IsaTier::NoSimd,
        IsaTier::Avx2,
        IsaTier::Avx512f,
        IsaTier::Avx512Vnni,
        IsaTier::Amx,
    ];
}

impl std::fmt::Display for IsaTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IsaTier::NoSimd => "nosimd",
            IsaTier::Avx2 => "avx2",
            IsaTier::Avx512f => "avx512f",
            IsaTier::Avx512Vnni => "avx512-vnni",
            IsaTier::Amx => "amx",
        };
        f.write_str(name)
    }
}

static DETECTED: Lazy<IsaTier> = Lazy::new(|| {
    // MYLLA_ISA lets tests and benchmarks pin a lower tier.
    if let Ok(forced) = std::env::var("MYLLA_ISA") {
        match forced.as_str() {
            "nosimd" => return IsaTier::NoSimd,
            "avx2" => return probe().min(IsaTier::Avx2),
            other => log::warn!("ignoring unknown MYLLA_ISA value '{}'", other),
        }
    }
    let tier = probe();
    log::info!("cpu isa tier: {}", tier);
    tier
});

fn probe() -> IsaTier {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx512vnni") && is_x86_feature_detected!("avx512f") {
            return IsaTier::Avx512Vnni;
        }
        if is_x86_feature_detected!("avx512f") {
            return IsaTier::Avx512f;
        }
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return IsaTier::Avx2;
        }
    }
    IsaTier::NoSimd
}

/// The highest tier available on this host, probed once.
pub fn detected_tier() -> IsaTier {
    *DETECTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_total_order() {
        assert!(IsaTier::NoSimd < IsaTier::Avx2);
        assert!(IsaTier::Avx2 < IsaTier::Avx512f);
        assert!(IsaTier::Avx512f < IsaTier::Avx512Vnni);
        assert!(IsaTier::Avx512Vnni < IsaTier::Amx);
    }

    #[test]
    fn test_detection_is_stable() {
        let a = detected_tier();
        let b = detected_tier();
        assert_eq!(a, b);
    }
}
