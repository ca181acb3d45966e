//! Interpretation of the scraped fields.

use crate::coordinator::Snapshot;
use crate::device::DHW_TEMPERATURE_RANGE;
use crate::extract::{FieldMap, FieldValue};
use crate::fields::Field;
use std::ops::RangeInclusive;

/// Temperatures the heating circuit target can be set to, in °C.
pub const HEATING_TEMPERATURE_RANGE: RangeInclusive<f64> = 20.0..=60.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RegulationMode {
    /// The heating circuit follows a fixed return water temperature.
    Manually,
    /// The return water temperature follows the outdoor temperature.
    Equitherm,
}

impl RegulationMode {
    fn from_raw(raw: &FieldValue) -> Option<Self> {
        let raw = match raw {
            FieldValue::Text(v) => v.trim(),
            FieldValue::Float(v) if *v == 0.0 => "0",
            FieldValue::Float(v) if *v == 1.0 => "1",
            FieldValue::Bool(false) => "0",
            FieldValue::Bool(true) => "1",
            FieldValue::Float(_) => return None,
        };
        if raw == "0" || raw.eq_ignore_ascii_case("manually") {
            Some(RegulationMode::Manually)
        } else if raw == "1" || raw.eq_ignore_ascii_case("equitherm") {
            Some(RegulationMode::Equitherm)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    Off,
    HeatPump,
}

/// State of one of the two water circuits heated by the device.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct WaterHeater {
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub operation: Operation,
    pub target_settable: bool,
    pub min_temperature: f64,
    pub max_temperature: f64,
}

/// Typed access to the fields of a poll.
///
/// Fields missing from the poll read as `None`, or `false` for the `is_*` flags.
pub trait Readings {
    fn value(&self, field: Field) -> Option<&FieldValue>;

    fn number(&self, field: Field) -> Option<f64> {
        self.value(field)?.as_f64()
    }

    fn flag(&self, field: Field) -> Option<bool> {
        self.value(field)?.as_bool()
    }

    fn regulation_mode(&self) -> Option<RegulationMode> {
        RegulationMode::from_raw(self.value(Field::RegulationMode)?)
    }

    fn is_compressor_active(&self) -> bool {
        self.flag(Field::CompressorActive).unwrap_or(false)
    }

    fn is_dhw_active(&self) -> bool {
        self.flag(Field::DhwActive).unwrap_or(false)
    }

    fn heating_circuit(&self) -> WaterHeater {
        let manual = self.regulation_mode() == Some(RegulationMode::Manually);
        let target = if manual {
            Field::ManualTargetReturnWaterTemperature
        } else {
            Field::EquithermTargetReturnWaterTemperature
        };
        let heating = self.is_compressor_active() && !self.is_dhw_active();
        WaterHeater {
            current_temperature: self.number(Field::InletTemperature),
            target_temperature: self.number(target),
            operation: if heating { Operation::HeatPump } else { Operation::Off },
            target_settable: manual,
            min_temperature: *HEATING_TEMPERATURE_RANGE.start(),
            max_temperature: *HEATING_TEMPERATURE_RANGE.end(),
        }
    }

    fn domestic_hot_water(&self) -> WaterHeater {
        WaterHeater {
            current_temperature: self.number(Field::DhwTemperature),
            target_temperature: self.number(Field::DhwTemperatureRequired),
            operation: if self.is_dhw_active() { Operation::HeatPump } else { Operation::Off },
            target_settable: true,
            min_temperature: *DHW_TEMPERATURE_RANGE.start(),
            max_temperature: *DHW_TEMPERATURE_RANGE.end(),
        }
    }
}

impl Readings for FieldMap {
    fn value(&self, field: Field) -> Option<&FieldValue> {
        self.get(field.device_key())
    }
}

impl Readings for Snapshot {
    fn value(&self, field: Field) -> Option<&FieldValue> {
        self.fields.value(field)
    }
}
