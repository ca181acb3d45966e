use crate::device::Page;

/// How the device encodes a field, as implied by the suffix of its device key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Kind {
    /// `…f` keys, coerced into a float.
    Float,
    /// `…BOOL_i` keys, coerced into a boolean.
    Bool,
    /// Anything else is kept as the raw string and interpreted by the readers.
    Enum,
}

impl Kind {
    const fn matches_key(self, key: &str) -> bool {
        let key = key.as_bytes();
        let is_bool = ends_with(key, b"BOOL_i");
        let is_float = !is_bool && ends_with(key, b"f");
        match self {
            Kind::Float => is_float,
            Kind::Bool => is_bool,
            Kind::Enum => !is_float && !is_bool,
        }
    }
}

const fn ends_with(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    let offset = haystack.len() - needle.len();
    let mut idx = 0;
    while idx < needle.len() {
        if haystack[offset + idx] != needle[idx] {
            return false;
        }
        idx += 1;
    }
    true
}

// The device keys are generated by the PLC's web page builder and differ between firmware
// builds. The keys below are unverified placeholders in that naming scheme, not keys read off a
// device. Until they are replaced with what `read --raw` reports, known fields read as missing
// and the domestic hot water setpoint write is accepted by the device without effect.
macro_rules! for_each_field {
    ($m:ident) => {
        $m! {
            RegulationMode: "REGULATION_MODE", "__T9A1D5C0E_USINT_u", Enum, Controls,
                "Regulation mode";
            EnergyConsumption: "ENERGY_CONSUMPTION", "__T4F2B7A11_REAL_.0f", Float, Measurements,
                unit = "kWh", "Energy consumption";
            EnergyConsumptionToday: "ENERGY_CONSUMPTION_TODAY", "__T0C83E5F2_REAL_.2f", Float,
                Measurements, unit = "kWh", "Energy consumption today";
            PowerConsumption: "POWER_CONSUMPTION", "__T71B0D4A9_REAL_.2f", Float, Measurements,
                unit = "kW", "Power consumption";
            HeatQuantity: "HEAT_QUANTITY", "__TE25A9C37_REAL_.0f", Float, Measurements,
                unit = "kWh", "Heat quantity";
            HeatQuantityToday: "HEAT_QUANTITY_TODAY", "__T3B6F1E84_REAL_.2f", Float, Measurements,
                unit = "kWh", "Heat quantity today";
            HeatProduction: "HEAT_PRODUCTION", "__TA8C47D20_REAL_.2f", Float, Measurements,
                unit = "kW", "Heat production";
            Cop: "COP", "__T5D93B2F6_REAL_.2f", Float, Measurements,
                "Coefficient of performance";
            Scop: "SCOP", "__TC17E08AB_REAL_.2f", Float, Measurements,
                "Seasonal coefficient of performance";
            OutletTemperature: "OUTLET_TEMPERATURE", "__T82F5C61D_REAL_.1f", Float, Measurements,
                unit = "°C", "Outlet temperature";
            ElectricHeaterOutletTemperature: "ELECTRIC_HEATER_OUTLET_TEMPERATURE",
                "__T1E4A93C7_REAL_.1f", Float, Measurements,
                unit = "°C", "Electric heater outlet temperature";
            InletTemperature: "INLET_TEMPERATURE", "__TB6D2874E_REAL_.1f", Float, Measurements,
                unit = "°C", "Inlet temperature";
            OutdoorTemperature: "OUTDOOR_TEMPERATURE", "__T2A7C5F93_REAL_.1f", Float, Measurements,
                unit = "°C", "Outdoor temperature";
            OutdoorTemperatureAverage: "OUTDOOR_TEMPERATURE_AVERAGE", "__TD41B6E08_REAL_.1f", Float,
                Measurements, unit = "°C", "Outdoor temperature average";
            EquithermTargetReturnWaterTemperature: "EQUITHERM_TARGET_RETURN_WATER_TEMPERATURE",
                "__T6C0F3A95_REAL_.1f", Float, Equitherm,
                unit = "°C", "Equitherm target return water temperature";
            ManualTargetReturnWaterTemperature: "MANUAL_TARGET_RETURN_WATER_TEMPERATURE",
                "__T97E2B14C_REAL_.1f", Float, Controls,
                unit = "°C", "Manual target return water temperature";
            DhwTemperature: "DHW_TEMPERATURE", "__T3F8D6A27_REAL_.1f", Float, Measurements,
                unit = "°C", "Domestic hot water temperature";
            DhwTemperatureRequired: "DHW_TEMPERATURE_REQUIRED", "__TF05C29B3_REAL_.1f", Float,
                Controls, unit = "°C", "Required domestic hot water temperature";
            FanActive: "FAN_ACTIVE", "__T8B1E7D45_BOOL_i", Bool, Measurements,
                "Fan running";
            CompressorActive: "COMPRESSOR_ACTIVE", "__T4D6A0F18_BOOL_i", Bool, Measurements,
                "Compressor running";
            PrimaryCircuitPumpActive: "PRIMARY_CIRCUIT_PUMP_ACTIVE", "__TA3C5E962_BOOL_i", Bool,
                Measurements, "Primary circuit pump running";
            SecondaryCircuitPumpActive: "SECONDARY_CIRCUIT_PUMP_ACTIVE", "__T5E9B2C7A_BOOL_i", Bool,
                Measurements, "Secondary circuit pump running";
            DefrostActive: "DEFROST_ACTIVE", "__TC8F14B3D_BOOL_i", Bool, Measurements,
                "Defrost running";
            BivalenceActive: "BIVALENCE_ACTIVE", "__T17A6D8E4_BOOL_i", Bool, Measurements,
                "Bivalent heat source running";
            DhwActive: "DHW_ACTIVE", "__T0B2E5F91_BOOL_i", Bool, Measurements,
                "Domestic hot water heating";
        }
    };
}

macro_rules! optional {
    () => {
        None
    };
    ($($lit: tt)+) => {
        Some($($lit)*)
    };
}

macro_rules! make_fields {
    ($($variant: ident: $name: literal, $key: literal, $kind: ident, $page: ident,
       $(unit = $unit: literal,)? $description: literal;)+) => {
        /// A field the readers know the meaning of.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::VariantArray)]
        pub enum Field {
            $($variant),+
        }
        const NAMES: &[&str] = &[$($name),*];
        const DEVICE_KEYS: &[&str] = &[$($key),*];
        const KINDS: &[Kind] = &[$(Kind::$kind),*];
        const PAGES: &[Page] = &[$(Page::$page),*];
        const UNITS: &[Option<&str>] = &[$(optional!($($unit)?)),*];
        const DESCRIPTIONS: &[&str] = &[$($description),*];
    };
}

for_each_field!(make_fields);

const _ASSERT_KEYS_AGREE_WITH_KINDS: () = const {
    let mut idx = 0;
    while idx < DEVICE_KEYS.len() {
        assert!(
            KINDS[idx].matches_key(DEVICE_KEYS[idx]),
            "device key suffix does not agree with the declared field kind"
        );
        idx += 1;
    }
};

impl Field {
    pub fn all() -> &'static [Field] {
        <Self as strum::VariantArray>::VARIANTS
    }

    pub fn from_name(name: &str) -> Option<Field> {
        let index = NAMES.iter().position(|v| v.eq_ignore_ascii_case(name))?;
        Self::all().get(index).copied()
    }

    pub fn from_device_key(key: &str) -> Option<Field> {
        let index = DEVICE_KEYS.iter().position(|v| *v == key)?;
        Self::all().get(index).copied()
    }

    /// The symbolic name, e.g. `COMPRESSOR_ACTIVE`.
    pub fn name(self) -> &'static str {
        NAMES[self as usize]
    }

    /// The `NAME` attribute of the `INPUT` element carrying this field on the device.
    pub fn device_key(self) -> &'static str {
        DEVICE_KEYS[self as usize]
    }

    pub fn kind(self) -> Kind {
        KINDS[self as usize]
    }

    /// The page this field is read from, and written to if it is writable.
    pub fn page(self) -> Page {
        PAGES[self as usize]
    }

    pub fn unit(self) -> Option<&'static str> {
        UNITS[self as usize]
    }

    pub fn description(self) -> &'static str {
        DESCRIPTIONS[self as usize]
    }

    pub fn is_match(self, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        self.name().contains(&pattern)
            || self.device_key().to_uppercase().contains(&pattern)
            || self.description().to_uppercase().contains(&pattern)
    }
}
