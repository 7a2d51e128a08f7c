//! Bluetooth UUIDs for supported health devices.
//!
//! All identifiers here are 16-bit Bluetooth SIG assigned numbers expanded to
//! 128-bit form with the Bluetooth base UUID
//! (`0000xxxx-0000-1000-8000-00805f9b34fb`).

use uuid::Uuid;

/// Bluetooth base UUID with the 16-bit slot zeroed.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG assigned number into a full 128-bit UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Return the 16-bit assigned number if `uuid` lies on the Bluetooth base UUID.
pub fn to_short(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = (value >> 96) as u32;
    if value & !(0xFFFF_FFFFu128 << 96) == BLUETOOTH_BASE_UUID && short <= u32::from(u16::MAX) {
        Some(short as u16)
    } else {
        None
    }
}

// --- Services ---

/// Glucose service.
pub const GLUCOSE_SERVICE: Uuid = from_short(0x1808);

/// Blood Pressure service.
pub const BLOOD_PRESSURE_SERVICE: Uuid = from_short(0x1810);

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = from_short(0x180A);

/// Battery service.
pub const BATTERY_SERVICE: Uuid = from_short(0x180F);

// --- Characteristics ---

/// Blood Pressure Measurement characteristic (indicate).
pub const BLOOD_PRESSURE_MEASUREMENT: Uuid = from_short(0x2A35);

/// Glucose Measurement characteristic (notify).
pub const GLUCOSE_MEASUREMENT: Uuid = from_short(0x2A18);

/// Record Access Control Point characteristic (write, indicate).
pub const RECORD_ACCESS_CONTROL_POINT: Uuid = from_short(0x2A52);

/// Battery level characteristic.
pub const BATTERY_LEVEL: Uuid = from_short(0x2A19);

/// Manufacturer name string characteristic.
pub const MANUFACTURER_NAME: Uuid = from_short(0x2A29);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blood_pressure_service_uuid() {
        let expected = "00001810-0000-1000-8000-00805f9b34fb";
        assert_eq!(BLOOD_PRESSURE_SERVICE.to_string(), expected);
    }

    #[test]
    fn test_glucose_service_uuid() {
        let expected = "00001808-0000-1000-8000-00805f9b34fb";
        assert_eq!(GLUCOSE_SERVICE.to_string(), expected);
    }

    #[test]
    fn test_measurement_characteristic_uuids() {
        assert_eq!(
            BLOOD_PRESSURE_MEASUREMENT.to_string(),
            "00002a35-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            GLUCOSE_MEASUREMENT.to_string(),
            "00002a18-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            RECORD_ACCESS_CONTROL_POINT.to_string(),
            "00002a52-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_short_round_trip() {
        assert_eq!(to_short(&GLUCOSE_SERVICE), Some(0x1808));
        assert_eq!(to_short(&BATTERY_LEVEL), Some(0x2A19));
    }

    #[test]
    fn test_to_short_rejects_vendor_uuid() {
        let vendor = Uuid::from_u128(0xf0cd_1400_95da_4f4b_9ac8_aa55_d312_af0c);
        assert_eq!(to_short(&vendor), None);
    }

    #[test]
    fn test_service_uuids_are_distinct() {
        assert_ne!(GLUCOSE_SERVICE, BLOOD_PRESSURE_SERVICE);
        assert_ne!(DEVICE_INFO_SERVICE, BATTERY_SERVICE);
    }
}
