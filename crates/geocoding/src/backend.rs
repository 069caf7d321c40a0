//! Backend selection.

use serde::{Deserialize, Serialize};

use geojobs_core::{DomainError, DomainResult};

use crate::job::{GeocodingKind, GeometryType};

/// Which geocoding engine runs a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum BackendChoice {
    /// Paid third-party provider, used for high-resolution street geocoding.
    External,
    /// In-house boundary/named-place matcher. Needs to know which geometry
    /// to produce.
    Internal { geometry_type: GeometryType },
}

impl BackendChoice {
    pub fn for_kind(kind: GeocodingKind, geometry_type: Option<GeometryType>) -> DomainResult<Self> {
        match kind {
            GeocodingKind::HighResolution => Ok(BackendChoice::External),
            _ => geometry_type
                .map(|geometry_type| BackendChoice::Internal { geometry_type })
                .ok_or_else(|| {
                    DomainError::validation(
                        "geometry_type",
                        format!("is required for {kind} geocodings"),
                    )
                }),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, BackendChoice::External)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_resolution_goes_external() {
        assert_eq!(
            BackendChoice::for_kind(GeocodingKind::HighResolution, None).unwrap(),
            BackendChoice::External
        );
        // Geometry type is irrelevant for the external provider.
        assert!(
            BackendChoice::for_kind(GeocodingKind::HighResolution, Some(GeometryType::Polygon))
                .unwrap()
                .is_external()
        );
    }

    #[test]
    fn every_other_kind_goes_internal() {
        for kind in GeocodingKind::ALL
            .into_iter()
            .filter(|k| *k != GeocodingKind::HighResolution)
        {
            let choice = BackendChoice::for_kind(kind, Some(GeometryType::Point)).unwrap();
            assert_eq!(
                choice,
                BackendChoice::Internal {
                    geometry_type: GeometryType::Point
                }
            );
            assert!(BackendChoice::for_kind(kind, None).is_err());
        }
    }
}
