//! Sensor kinds and their wire units.
//!
//! Temperature and humidity travel as integers in milli-units, voltage as a
//! raw ADC reading on channel 0, magnetic flux density as an `{x, y, z}`
//! triple. Ranges mirror the emulator's 32-bit peripheral registers.

use serde_json::{json, Value};

use super::backend::Emulation;

pub const MAX_UINT: i64 = (1 << 32) - 1;
pub const MAX_INT: i64 = (1 << 31) - 1;
pub const MIN_INT: i64 = -(1 << 31);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Voltage,
    Humidity,
    MagneticFluxDensity,
}

/// Every kind the protocol knows, in wire order.
pub const SENSOR_KINDS: &[SensorKind] = &[
    SensorKind::Temperature,
    SensorKind::Voltage,
    SensorKind::Humidity,
    SensorKind::MagneticFluxDensity,
];

impl SensorKind {
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "temperature" => Some(Self::Temperature),
            "voltage" => Some(Self::Voltage),
            "humidity" => Some(Self::Humidity),
            "magnetic-flux-density" => Some(Self::MagneticFluxDensity),
            _ => None,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Voltage => "voltage",
            Self::Humidity => "humidity",
            Self::MagneticFluxDensity => "magnetic-flux-density",
        }
    }

    /// Write a sensor reading. The value must already be wire-shaped.
    pub async fn set(
        &self,
        backend: &mut dyn Emulation,
        machine: &str,
        peripheral: &str,
        value: &Value,
    ) -> Result<(), String> {
        match self {
            Self::Temperature => {
                let milli = int_in_range(value, MIN_INT, MAX_INT)?;
                backend
                    .invoke(machine, peripheral, &format!("Temperature {}", format_milli(milli)))
                    .await
            }
            Self::Humidity => {
                let milli = int_in_range(value, 0, MAX_UINT)?;
                backend
                    .invoke(machine, peripheral, &format!("Humidity {}", format_milli(milli)))
                    .await
            }
            Self::Voltage => {
                let raw = int_in_range(value, 0, MAX_UINT)?;
                backend
                    .invoke(machine, peripheral, &format!("SetADCValue 0 {raw}"))
                    .await
            }
            Self::MagneticFluxDensity => {
                let triple = value
                    .as_object()
                    .ok_or_else(|| "value must be an {x, y, z} object".to_string())?;
                for axis in ["x", "y", "z"] {
                    let component = triple
                        .get(axis)
                        .ok_or_else(|| format!("missing required argument '{axis}'"))?;
                    let raw = int_in_range(component, MIN_INT, MAX_INT)?;
                    let property = format!("MagneticFluxDensity{} {raw}", axis.to_uppercase());
                    backend.invoke(machine, peripheral, &property).await?;
                }
                Ok(())
            }
        }
    }

    /// Read a sensor back in the same units `set` accepts.
    pub async fn get(
        &self,
        backend: &mut dyn Emulation,
        machine: &str,
        peripheral: &str,
    ) -> Result<Value, String> {
        match self {
            Self::Temperature => {
                let text = backend.get_property(machine, peripheral, "Temperature").await?;
                Ok(json!(parse_milli(&text)?))
            }
            Self::Humidity => {
                let text = backend.get_property(machine, peripheral, "Humidity").await?;
                Ok(json!(parse_milli(&text)?))
            }
            Self::Voltage => {
                let text = backend.get_property(machine, peripheral, "GetADCValue 0").await?;
                let raw: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| format!("unexpected ADC reading: '{text}'"))?;
                Ok(json!(raw))
            }
            Self::MagneticFluxDensity => {
                let mut triple = serde_json::Map::new();
                for axis in ["x", "y", "z"] {
                    let property = format!("MagneticFluxDensity{}", axis.to_uppercase());
                    let text = backend.get_property(machine, peripheral, &property).await?;
                    let raw: i64 = text
                        .trim()
                        .parse()
                        .map_err(|_| format!("unexpected flux reading: '{text}'"))?;
                    triple.insert(axis.to_string(), json!(raw));
                }
                Ok(Value::Object(triple))
            }
        }
    }

    /// Whether a peripheral answers this kind's getter.
    pub async fn probes(
        &self,
        backend: &mut dyn Emulation,
        machine: &str,
        peripheral: &str,
    ) -> bool {
        self.get(backend, machine, peripheral).await.is_ok()
    }
}

fn int_in_range(value: &Value, min: i64, max: i64) -> Result<i64, String> {
    let raw = value
        .as_i64()
        .ok_or_else(|| format!("value must be an integer in [{min}, {max}]"))?;
    if raw < min || raw > max {
        return Err(format!("value {raw} out of range [{min}, {max}]"));
    }
    Ok(raw)
}

/// Milli-units to the decimal notation the emulator's properties take:
/// 23500 becomes `23.500`.
fn format_milli(value: i64) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    format!("{sign}{}.{:03}", abs / 1000, abs % 1000)
}

fn parse_milli(text: &str) -> Result<i64, String> {
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| format!("unexpected sensor reading: '{text}'"))?;
    Ok((value * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milli_formatting() {
        assert_eq!(format_milli(23500), "23.500");
        assert_eq!(format_milli(-1500), "-1.500");
        assert_eq!(format_milli(7), "0.007");
        assert_eq!(format_milli(0), "0.000");
    }

    #[test]
    fn milli_roundtrip() {
        for value in [23500i64, -1500, 0, 7, 999, -999] {
            assert_eq!(parse_milli(&format_milli(value)).unwrap(), value);
        }
    }

    #[test]
    fn range_checks() {
        assert!(int_in_range(&json!(MAX_INT), MIN_INT, MAX_INT).is_ok());
        assert!(int_in_range(&json!(MAX_INT + 1), MIN_INT, MAX_INT).is_err());
        assert!(int_in_range(&json!(-1), 0, MAX_UINT).is_err());
        assert!(int_in_range(&json!("23"), MIN_INT, MAX_INT).is_err());
    }

    #[test]
    fn wire_names_roundtrip() {
        for kind in SENSOR_KINDS {
            assert_eq!(SensorKind::from_wire(kind.wire_name()), Some(*kind));
        }
        assert_eq!(SensorKind::from_wire("pressure"), None);
    }
}
