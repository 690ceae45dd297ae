//! Register map model.
//!
//! The map is a fixed, hand-curated table. It is validated once at startup;
//! after that every descriptor is known to have a unique name and a width the
//! decoder supports.

use std::collections::HashSet;

use metersight_common::is_valid_chunk;
use metersight_common::keyexpr::SNAPSHOT_CHUNK;
use serde::{Deserialize, Serialize};

use crate::decode::is_supported_width;
use crate::error::{BridgeError, ReadError, Result};

/// One register group on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Device-relative start address (before the configured offset).
    pub address: u16,

    /// Unique register name, also used as the topic chunk and gauge name.
    pub name: String,

    /// Unit tag as documented by the device, possibly empty.
    #[serde(default, alias = "unit")]
    pub raw_unit: String,

    /// Width in bytes: 2, 4 or 8.
    pub size_bytes: u16,

    /// Interpret the value as two's complement.
    #[serde(default)]
    pub signed: bool,
}

impl RegisterDescriptor {
    /// Create a descriptor.
    pub fn new(
        address: u16,
        name: impl Into<String>,
        raw_unit: impl Into<String>,
        size_bytes: u16,
        signed: bool,
    ) -> Self {
        Self {
            address,
            name: name.into(),
            raw_unit: raw_unit.into(),
            size_bytes,
            signed,
        }
    }

    /// Number of 16-bit words to request.
    pub fn word_count(&self) -> u16 {
        self.size_bytes / 2
    }

    /// Apply the address offset, failing if the result leaves the 16-bit space.
    pub fn resolve_address(&self, offset: i32) -> std::result::Result<u16, ReadError> {
        let start = i64::from(self.address) + i64::from(offset);
        let end = start + i64::from(self.word_count()) - 1;

        if start < 0 || end > i64::from(u16::MAX) {
            return Err(ReadError::AddressOutOfRange {
                address: self.address,
                offset,
            });
        }

        Ok(start as u16)
    }

    /// Hex rendering used in published records.
    pub fn address_hex(&self) -> String {
        format!("{:#x}", self.address)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BridgeError::validation(format!(
                "register at {} has an empty name",
                self.address_hex()
            )));
        }

        if !is_valid_chunk(&self.name) {
            return Err(BridgeError::validation(format!(
                "register name '{}' cannot be used in a key expression",
                self.name
            )));
        }

        if self.name == SNAPSHOT_CHUNK {
            return Err(BridgeError::validation(format!(
                "register name '{}' is reserved for the aggregate topic",
                self.name
            )));
        }

        if self.size_bytes == 0 || self.size_bytes % 2 != 0 {
            return Err(BridgeError::validation(format!(
                "register '{}': size_bytes must be a positive even number, got {}",
                self.name, self.size_bytes
            )));
        }

        if !is_supported_width(usize::from(self.word_count())) {
            return Err(BridgeError::validation(format!(
                "register '{}': unsupported width of {} words",
                self.name,
                self.word_count()
            )));
        }

        Ok(())
    }
}

/// Ordered, validated list of register descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    descriptors: Vec<RegisterDescriptor>,
}

impl RegisterMap {
    /// Build a map, enforcing descriptor invariants and name uniqueness.
    pub fn new(descriptors: Vec<RegisterDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(BridgeError::validation("register map is empty"));
        }

        let mut seen = HashSet::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.name.as_str()) {
                return Err(BridgeError::validation(format!(
                    "duplicate register name '{}'",
                    descriptor.name
                )));
            }
        }

        Ok(Self { descriptors })
    }

    /// Check that every descriptor stays addressable once `offset` is applied.
    pub fn validate_offset(&self, offset: i32) -> Result<()> {
        for descriptor in &self.descriptors {
            descriptor.resolve_address(offset).map_err(|e| {
                BridgeError::validation(format!("register '{}': {}", descriptor.name, e))
            })?;
        }
        Ok(())
    }

    /// Descriptors in map order.
    pub fn iter(&self) -> std::slice::Iter<'_, RegisterDescriptor> {
        self.descriptors.iter()
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Always false for a validated map.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Register names in map order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&RegisterDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// Built-in map for the Telstar 80A three-phase meter.
    pub fn telstar_80a() -> Self {
        Self {
            descriptors: telstar_80a_descriptors(),
        }
    }
}

impl<'a> IntoIterator for &'a RegisterMap {
    type Item = &'a RegisterDescriptor;
    type IntoIter = std::slice::Iter<'a, RegisterDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

/// Raw Telstar 80A table: address, name, unit, size in bytes, signed.
const TELSTAR_80A: &[(u16, &str, &str, u16, bool)] = &[
    (0x2000, "serial_number", "", 4, false),
    (0x2002, "date_time_utc", "unix", 4, false),
    (0x2004, "active_power_total_mW", "mW", 4, true),
    (0x2006, "active_power_l1_mW", "mW", 4, true),
    (0x2008, "active_power_l2_mW", "mW", 4, true),
    (0x200A, "active_power_l3_mW", "mW", 4, true),
    (0x200C, "reactive_power_total_mVar", "mVar", 4, false),
    (0x200E, "reactive_power_l1_mVar", "mVar", 4, false),
    (0x2010, "reactive_power_l2_mVar", "mVar", 4, false),
    (0x2012, "reactive_power_l3_mVar", "mVar", 4, false),
    (0x2014, "voltage_l1_mV", "mV", 4, false),
    (0x2016, "voltage_l2_mV", "mV", 4, false),
    (0x2018, "voltage_l3_mV", "mV", 4, false),
    (0x201A, "current_l1_mA", "mA", 4, true),
    (0x201C, "current_l2_mA", "mA", 4, true),
    (0x201E, "current_l3_mA", "mA", 4, true),
    (0x2020, "power_factor_l1_raw", "1/1000", 2, false),
    (0x2021, "power_factor_l2_raw", "1/1000", 2, false),
    (0x2022, "power_factor_l3_raw", "1/1000", 2, false),
    (0x2023, "active_tariff", "", 2, false),
    (0x2024, "active_energy_import_total_mWh", "mWh", 8, false),
    (0x2028, "active_energy_export_total_mWh", "mWh", 8, false),
    (0x202C, "active_energy_import_t1_mWh", "mWh", 8, false),
    (0x2030, "active_energy_import_t2_mWh", "mWh", 8, false),
    (0x2034, "active_energy_export_t1_mWh", "mWh", 8, false),
    (0x2038, "active_energy_export_t2_mWh", "mWh", 8, false),
    (0x203C, "reactive_energy_q1_mVarh", "mVarh", 8, false),
    (0x2040, "reactive_energy_q2_mVarh", "mVarh", 8, false),
    (0x2044, "reactive_energy_q3_mVarh", "mVarh", 8, false),
    (0x2048, "reactive_energy_q4_mVarh", "mVarh", 8, false),
    (0x204C, "active_energy_import_total_Wh", "Wh", 4, false),
    (0x204E, "active_energy_export_total_Wh", "Wh", 4, false),
    (0x2050, "active_energy_import_t1_Wh", "Wh", 4, false),
    (0x2052, "active_energy_import_t2_Wh", "Wh", 4, false),
    (0x2054, "active_energy_export_t1_Wh", "Wh", 4, false),
    (0x2056, "active_energy_export_t2_Wh", "Wh", 4, false),
    (0x2058, "reactive_energy_q1_Varh", "Varh", 4, false),
    (0x205A, "reactive_energy_q2_Varh", "Varh", 4, false),
    (0x205C, "reactive_energy_q3_Varh", "Varh", 4, false),
    (0x205E, "reactive_energy_q4_Varh", "Varh", 4, false),
];

fn telstar_80a_descriptors() -> Vec<RegisterDescriptor> {
    TELSTAR_80A
        .iter()
        .map(|&(address, name, unit, size_bytes, signed)| {
            RegisterDescriptor::new(address, name, unit, size_bytes, signed)
        })
        .collect()
}
