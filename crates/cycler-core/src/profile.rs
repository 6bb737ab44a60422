//! Battery electrical parameters and the built-in catalog.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryProfile {
    pub name: String,
    /// End-of-charge voltage (V).
    pub eocv: f64,
    /// End-of-discharge voltage (V).
    pub eodv: f64,
    pub capacity_mah: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("unknown battery profile {0:?}")]
    Unknown(String),
    #[error("end-of-discharge voltage {eodv} V must be below end-of-charge voltage {eocv} V")]
    VoltageOrder { eocv: f64, eodv: f64 },
    #[error("capacity must be positive, got {0} mAh")]
    Capacity(f64),
    #[error("profile values must be finite")]
    NonFinite,
}

impl BatteryProfile {
    pub fn new(
        name: impl Into<String>,
        eocv: f64,
        eodv: f64,
        capacity_mah: f64,
    ) -> Result<Self, ProfileError> {
        if !eocv.is_finite() || !eodv.is_finite() || !capacity_mah.is_finite() {
            return Err(ProfileError::NonFinite);
        }
        if eodv >= eocv {
            return Err(ProfileError::VoltageOrder { eocv, eodv });
        }
        if capacity_mah <= 0.0 {
            return Err(ProfileError::Capacity(capacity_mah));
        }
        Ok(Self {
            name: name.into(),
            eocv,
            eodv,
            capacity_mah,
        })
    }

    /// Current for a C-rate divisor, e.g. `c_rate(10.0)` is C/10 in mA.
    pub fn c_rate(&self, divisor: f64) -> f64 {
        self.capacity_mah / divisor
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub eocv: f64,
    pub eodv: f64,
    pub capacity_mah: f64,
}

impl CatalogEntry {
    fn profile(&self) -> BatteryProfile {
        BatteryProfile {
            name: self.name.to_string(),
            eocv: self.eocv,
            eodv: self.eodv,
            capacity_mah: self.capacity_mah,
        }
    }
}

pub const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "panasonic-18650",
        description: "Panasonic 18650 Li-ion, 4.2 V / C/5 charge",
        eocv: 4.18,
        eodv: 3.0,
        capacity_mah: 5000.0,
    },
    CatalogEntry {
        name: "a123-26650-2s",
        description: "A123 26650 LiFePO4, two cells in series",
        eocv: 2.0 * 3.58,
        eodv: 2.0 * 2.0,
        capacity_mah: 2500.0,
    },
    CatalogEntry {
        name: "galaxy-s3-mini",
        description: "Samsung Galaxy S3 mini phone battery",
        eocv: 4.18,
        eodv: 3.1,
        capacity_mah: 1600.0,
    },
];

pub fn lookup(name: &str) -> Result<BatteryProfile, ProfileError> {
    CATALOG
        .iter()
        .find(|entry| entry.name.eq_ignore_ascii_case(name))
        .map(CatalogEntry::profile)
        .ok_or_else(|| ProfileError::Unknown(name.to_string()))
}
