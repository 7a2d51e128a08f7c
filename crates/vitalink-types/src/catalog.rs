//! Static catalog of supported devices.
//!
//! Every supported device is described once, as constant data. Brands form a
//! closed tagged union, so resolving a brand's service, GATT profile or
//! decoder is an exhaustive `match` and an unmapped brand cannot exist at
//! runtime. Only parsing names coming from outside (configuration, user
//! input) can fail, with [`ParseError::UnsupportedDevice`].

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crc16::Crc16Options;
use crate::error::ParseError;
use crate::uuid::{
    BLOOD_PRESSURE_MEASUREMENT, BLOOD_PRESSURE_SERVICE, GLUCOSE_MEASUREMENT, GLUCOSE_SERVICE,
    RECORD_ACCESS_CONTROL_POINT,
};

/// What a device measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceKind {
    /// Blood-pressure cuff.
    BloodPressure,
    /// Blood-glucose meter.
    GlucoseMeter,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::BloodPressure => write!(f, "blood pressure monitor"),
            DeviceKind::GlucoseMeter => write!(f, "glucose meter"),
        }
    }
}

/// Supported blood-pressure brands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BloodPressureBrand {
    /// Omron Healthcare.
    Omron,
    /// A&D Medical.
    AndMedical,
    /// Beurer.
    Beurer,
}

/// Supported glucose-meter brands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GlucoseBrand {
    /// Ascensia Contour.
    Contour,
    /// Roche Accu-Chek.
    AccuChek,
}

impl GlucoseBrand {
    /// Segmented transfer parameters.
    #[must_use]
    pub const fn framing(self) -> GlucoseFraming {
        match self {
            GlucoseBrand::Contour => GlucoseFraming {
                header: 0xC5,
                checksum: Crc16Options {
                    initial: 0xFFFF,
                    skip_leading: 1,
                    skip_trailing: 0,
                },
                // Concentration is reported in kg/L.
                scale_to_mg_dl: 100_000.0,
            },
            GlucoseBrand::AccuChek => GlucoseFraming {
                header: 0xA7,
                checksum: Crc16Options {
                    initial: 0x1D0F,
                    skip_leading: 1,
                    skip_trailing: 0,
                },
                // Concentration is reported in mol/L.
                scale_to_mg_dl: 18_015.6,
            },
        }
    }
}

/// A device brand, tagged by what it measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Brand {
    /// A blood-pressure brand.
    BloodPressure(BloodPressureBrand),
    /// A glucose-meter brand.
    Glucose(GlucoseBrand),
}

impl Brand {
    /// Every supported brand.
    pub const ALL: [Brand; 5] = [
        Brand::BloodPressure(BloodPressureBrand::Omron),
        Brand::BloodPressure(BloodPressureBrand::AndMedical),
        Brand::BloodPressure(BloodPressureBrand::Beurer),
        Brand::Glucose(GlucoseBrand::Contour),
        Brand::Glucose(GlucoseBrand::AccuChek),
    ];

    /// What this brand's devices measure.
    #[must_use]
    pub const fn kind(self) -> DeviceKind {
        match self {
            Brand::BloodPressure(_) => DeviceKind::BloodPressure,
            Brand::Glucose(_) => DeviceKind::GlucoseMeter,
        }
    }

    /// Stable lowercase name used in configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Brand::BloodPressure(BloodPressureBrand::Omron) => "omron",
            Brand::BloodPressure(BloodPressureBrand::AndMedical) => "and",
            Brand::BloodPressure(BloodPressureBrand::Beurer) => "beurer",
            Brand::Glucose(GlucoseBrand::Contour) => "contour",
            Brand::Glucose(GlucoseBrand::AccuChek) => "accu-chek",
        }
    }

    /// GATT layout this brand's devices use.
    #[must_use]
    pub const fn profile(self) -> GattProfile {
        match self {
            Brand::BloodPressure(_) => GattProfile {
                service: BLOOD_PRESSURE_SERVICE,
                measurement: BLOOD_PRESSURE_MEASUREMENT,
                control: None,
            },
            // Both glucose brands use the SIG characteristics; only framing differs.
            Brand::Glucose(_) => GattProfile {
                service: GLUCOSE_SERVICE,
                measurement: GLUCOSE_MEASUREMENT,
                control: Some(ControlRequest {
                    characteristic: RECORD_ACCESS_CONTROL_POINT,
                    // Report stored records: all records.
                    command: &[0x01, 0x01],
                }),
            },
        }
    }

    /// Segmented transfer parameters, for glucose brands.
    #[must_use]
    pub const fn glucose_framing(self) -> Option<GlucoseFraming> {
        match self {
            Brand::BloodPressure(_) => None,
            Brand::Glucose(brand) => Some(brand.framing()),
        }
    }

    /// Checksum that guards every packet from this brand, if any.
    #[must_use]
    pub const fn checksum(self) -> Option<Crc16Options> {
        match self.glucose_framing() {
            Some(framing) => Some(framing.checksum),
            None => None,
        }
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Brand {
    type Err = ParseError;

    /// Parse a brand name, case-insensitively.
    ///
    /// ```
    /// use vitalink_types::catalog::{Brand, BloodPressureBrand};
    ///
    /// assert_eq!("Omron".parse::<Brand>(), Ok(Brand::BloodPressure(BloodPressureBrand::Omron)));
    /// assert!("acme".parse::<Brand>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Brand::ALL
            .into_iter()
            .find(|brand| brand.as_str() == wanted)
            .ok_or_else(|| ParseError::UnsupportedDevice(s.to_string()))
    }
}

/// A characteristic write that asks the device to start a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// Characteristic to write.
    pub characteristic: Uuid,
    /// Bytes to write.
    pub command: &'static [u8],
}

/// Service and characteristics a session needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    /// Primary service.
    pub service: Uuid,
    /// Characteristic carrying measurements (notify or indicate).
    pub measurement: Uuid,
    /// Optional transfer request written after subscribing.
    pub control: Option<ControlRequest>,
}

/// Per-brand parameters of the segmented glucose transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlucoseFraming {
    /// First byte of every frame.
    pub header: u8,
    /// Checksum guarding each frame.
    pub checksum: Crc16Options,
    /// Multiplier from the reported unit to mg/dL.
    pub scale_to_mg_dl: f64,
}

/// Catalog identifier of a supported model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum DeviceModel {
    /// Omron Evolv (BP7000).
    OmronEvolv,
    /// Omron M7 Intelli IT.
    OmronM7,
    /// A&D UA-651BLE.
    AndUa651,
    /// Beurer BM 54.
    BeurerBm54,
    /// Contour Next One.
    ContourNextOne,
    /// Accu-Chek Guide.
    AccuChekGuide,
}

impl DeviceModel {
    /// Stable identifier used in configuration files and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceModel::OmronEvolv => "omron-evolv",
            DeviceModel::OmronM7 => "omron-m7",
            DeviceModel::AndUa651 => "and-ua651",
            DeviceModel::BeurerBm54 => "beurer-bm54",
            DeviceModel::ContourNextOne => "contour-next-one",
            DeviceModel::AccuChekGuide => "accu-chek-guide",
        }
    }

    /// The catalog entry for this model.
    #[must_use]
    pub fn descriptor(self) -> &'static DeviceDescriptor {
        descriptor(self)
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceModel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        CATALOG
            .iter()
            .map(|d| d.id)
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| ParseError::UnsupportedDevice(s.to_string()))
    }
}

/// Immutable description of a supported device model.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Unique catalog identifier.
    pub id: DeviceModel,
    /// Human-readable model name.
    pub display_name: &'static str,
    /// Brand, which selects profile and decoder.
    pub brand: Brand,
    /// Substrings matched case-insensitively against the advertised name.
    pub identification_codes: &'static [&'static str],
}

impl DeviceDescriptor {
    /// What this device measures.
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        self.brand.kind()
    }

    /// Service identifier the device advertises.
    #[must_use]
    pub const fn service(&self) -> Uuid {
        self.brand.profile().service
    }

    /// GATT layout of the device.
    #[must_use]
    pub const fn profile(&self) -> GattProfile {
        self.brand.profile()
    }

    /// Whether an advertised name carries one of the identification codes.
    #[must_use]
    pub fn matches_name(&self, advertised: &str) -> bool {
        let advertised = advertised.to_lowercase();
        self.identification_codes
            .iter()
            .any(|code| advertised.contains(&code.to_lowercase()))
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Every supported device, in catalog order.
pub static CATALOG: [DeviceDescriptor; 6] = [
    DeviceDescriptor {
        id: DeviceModel::OmronEvolv,
        display_name: "Omron Evolv",
        brand: Brand::BloodPressure(BloodPressureBrand::Omron),
        identification_codes: &["BLEsmart_", "Evolv"],
    },
    DeviceDescriptor {
        id: DeviceModel::OmronM7,
        display_name: "Omron M7 Intelli IT",
        brand: Brand::BloodPressure(BloodPressureBrand::Omron),
        identification_codes: &["M7 Intelli", "BLEsmart_0000"],
    },
    DeviceDescriptor {
        id: DeviceModel::AndUa651,
        display_name: "A&D UA-651BLE",
        brand: Brand::BloodPressure(BloodPressureBrand::AndMedical),
        identification_codes: &["A&D_UA-651", "UA-651"],
    },
    DeviceDescriptor {
        id: DeviceModel::BeurerBm54,
        display_name: "Beurer BM 54",
        brand: Brand::BloodPressure(BloodPressureBrand::Beurer),
        identification_codes: &["BM54", "BC57"],
    },
    DeviceDescriptor {
        id: DeviceModel::ContourNextOne,
        display_name: "Contour Next One",
        brand: Brand::Glucose(GlucoseBrand::Contour),
        identification_codes: &["Contour"],
    },
    DeviceDescriptor {
        id: DeviceModel::AccuChekGuide,
        display_name: "Accu-Chek Guide",
        brand: Brand::Glucose(GlucoseBrand::AccuChek),
        identification_codes: &["meter+", "Accu-Chek"],
    },
];

/// All catalog entries.
pub fn all() -> &'static [DeviceDescriptor] {
    &CATALOG
}

/// Catalog entries of one brand.
pub fn list(brand: Brand) -> impl Iterator<Item = &'static DeviceDescriptor> {
    CATALOG.iter().filter(move |d| d.brand == brand)
}

/// Service identifier advertised by a brand's devices.
#[must_use]
pub const fn service_id(brand: Brand) -> Uuid {
    brand.profile().service
}

/// Catalog entry for a model.
#[must_use]
pub fn descriptor(model: DeviceModel) -> &'static DeviceDescriptor {
    match model {
        DeviceModel::OmronEvolv => &CATALOG[0],
        DeviceModel::OmronM7 => &CATALOG[1],
        DeviceModel::AndUa651 => &CATALOG[2],
        DeviceModel::BeurerBm54 => &CATALOG[3],
        DeviceModel::ContourNextOne => &CATALOG[4],
        DeviceModel::AccuChekGuide => &CATALOG[5],
    }
}
