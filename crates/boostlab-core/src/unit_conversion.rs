//! Unit Conversion Functions
//!
//! Conversions used by the parameter table, the dyno model, and display
//! layers: pressure, temperature, lambda/AFR, and speed.

/// Convert Celsius to Fahrenheit
pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

/// Convert Fahrenheit to Celsius
pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

/// Convert kPa to PSI
pub fn kpa_to_psi(kpa: f64) -> f64 {
    kpa * 0.14503773773020923
}

/// Convert PSI to kPa
pub fn psi_to_kpa(psi: f64) -> f64 {
    psi / 0.14503773773020923
}

/// Gauge boost (PSI) from absolute manifold pressure (kPa) at sea level
pub fn boost_psi_from_map_kpa(map_kpa: f64) -> f64 {
    kpa_to_psi(map_kpa - 101.325)
}

/// Convert Lambda to AFR for a given fuel
///
/// Fuel types: "gasoline" (default), "e85", "ethanol", "methanol".
pub fn lambda_to_afr(lambda: f64, fuel_type: &str) -> f64 {
    lambda * stoich_afr(fuel_type)
}

/// Convert AFR to Lambda for a given fuel
pub fn afr_to_lambda(afr: f64, fuel_type: &str) -> f64 {
    afr / stoich_afr(fuel_type)
}

fn stoich_afr(fuel_type: &str) -> f64 {
    match fuel_type.to_lowercase().as_str() {
        "gasoline" | "petrol" => 14.7,
        "e85" => 9.8,
        "ethanol" => 9.0,
        "methanol" => 6.4,
        _ => 14.7,
    }
}

/// Convert km/h to mph
pub fn kmh_to_mph(kmh: f64) -> f64 {
    kmh * 0.62137119223733
}

/// Convert mph to km/h
pub fn mph_to_kmh(mph: f64) -> f64 {
    mph / 0.62137119223733
}

/// Convert m/s to km/h
pub fn mps_to_kmh(mps: f64) -> f64 {
    mps * 3.6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_roundtrip() {
        let kpa = 170.0;
        let back = psi_to_kpa(kpa_to_psi(kpa));
        assert!((back - kpa).abs() < 1e-9);
    }

    #[test]
    fn test_boost_gauge_conversion() {
        // ~170 kPa absolute is about 10 PSI of boost
        let boost = boost_psi_from_map_kpa(170.0);
        assert!((boost - 9.96).abs() < 0.05, "got {boost}");
    }

    #[test]
    fn test_lambda_afr() {
        assert!((lambda_to_afr(1.0, "gasoline") - 14.7).abs() < 1e-12);
        assert!((afr_to_lambda(11.76, "gasoline") - 0.8).abs() < 1e-12);
        assert!((lambda_to_afr(1.0, "e85") - 9.8).abs() < 1e-12);
    }

    #[test]
    fn test_temperature() {
        assert_eq!(celsius_to_fahrenheit(0.0), 32.0);
        assert_eq!(fahrenheit_to_celsius(212.0), 100.0);
    }
}
