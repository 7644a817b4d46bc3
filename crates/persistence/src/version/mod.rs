//! FHIR version detection, conversion and storage negotiation.
//!
//! Resources arrive in either R4 (4.0.x / R4B 4.3.0) or R5 shape. This module
//! decides which release a body is expressed in ([`detector`]), translates
//! bodies between releases ([`converter`], [`converters`]), picks how a body is
//! persisted ([`negotiator`]) and certifies conversions by round trip
//! ([`roundtrip`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VersionError;

pub mod choice;
pub mod converter;
pub mod converters;
pub mod detector;
pub mod extension;
pub mod negotiator;
pub mod roundtrip;

pub use converter::{ConverterFactory, MappingRule, ResourceConverter, RuleConverter};
pub use detector::{DetectionResult, VersionDetector, VersionIndicator};
pub use extension::{ExtensionSchema, ExtensionSlot, ORIGINAL_PAYLOAD, OriginalPayload, ValueKind};
pub use negotiator::{
    PreparedResource, StorageStrategy, VersionCopy, VersionMetadata, VersionNegotiator,
};
pub use roundtrip::{RoundTripDifference, RoundTripReport, RoundTripValidator};

/// A FHIR release.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum FhirVersion {
    /// FHIR R4 (4.0.1).
    #[default]
    R4,
    /// FHIR R4B (4.3.0). Shares the R4 resource structure.
    R4B,
    /// FHIR R5 (5.0.0).
    R5,
}

impl FhirVersion {
    /// Returns the short release name (`R4`, `R4B`, `R5`).
    pub fn as_str(&self) -> &'static str {
        match self {
            FhirVersion::R4 => "R4",
            FhirVersion::R4B => "R4B",
            FhirVersion::R5 => "R5",
        }
    }

    /// Returns the full semantic version string.
    pub fn full_version(&self) -> &'static str {
        match self {
            FhirVersion::R4 => "4.0.1",
            FhirVersion::R4B => "4.3.0",
            FhirVersion::R5 => "5.0.0",
        }
    }

    /// Returns the release whose resource structure this version uses.
    ///
    /// R4B resources are structurally R4 for every converter in this crate.
    pub fn family(&self) -> FhirVersion {
        match self {
            FhirVersion::R4 | FhirVersion::R4B => FhirVersion::R4,
            FhirVersion::R5 => FhirVersion::R5,
        }
    }

    /// Returns true if both versions share a resource structure.
    pub fn same_family(&self, other: FhirVersion) -> bool {
        self.family() == other.family()
    }
}

impl fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FhirVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "R4" | "r4" | "4.0" | "4.0.0" | "4.0.1" => Ok(FhirVersion::R4),
            "R4B" | "r4b" | "4.3" | "4.3.0" => Ok(FhirVersion::R4B),
            "R5" | "r5" | "5.0" | "5.0.0" => Ok(FhirVersion::R5),
            other => Err(VersionError::UnknownVersion {
                version: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!("4.0.1".parse::<FhirVersion>().unwrap(), FhirVersion::R4);
        assert_eq!("R4B".parse::<FhirVersion>().unwrap(), FhirVersion::R4B);
        assert_eq!("5.0.0".parse::<FhirVersion>().unwrap(), FhirVersion::R5);
        assert!("STU3".parse::<FhirVersion>().is_err());
    }

    #[test]
    fn test_family() {
        assert_eq!(FhirVersion::R4B.family(), FhirVersion::R4);
        assert!(FhirVersion::R4.same_family(FhirVersion::R4B));
        assert!(!FhirVersion::R4.same_family(FhirVersion::R5));
    }
}
