//! Length units accepted by distance queries
//!
//! The conversion tables are fixed by the file-format contract: factors are
//! meters-to-unit, with the reciprocals used for the opposite direction.

/// Units a caller may express distances in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Meters,
    Kilometers,
    Feet,
    Yards,
    Miles,
}

/// Meters-to-unit factors, indexed by `Unit as usize`.
pub const METERS_TO_UNITS: [f64; 5] = [1.0, 0.001, 3.28084, 1.093613, 6.213711922373339e-4];

impl Unit {
    /// Parse a unit string. Accepts the short and long spellings only;
    /// anything else is `None`.
    pub fn parse(s: &str) -> Option<Unit> {
        match s {
            "m" | "meters" => Some(Unit::Meters),
            "km" | "kilometers" => Some(Unit::Kilometers),
            "ft" | "feet" => Some(Unit::Feet),
            "yd" | "yards" => Some(Unit::Yards),
            "mi" | "miles" => Some(Unit::Miles),
            _ => None,
        }
    }

    pub fn from_meters(self, meters: f64) -> f64 {
        meters * METERS_TO_UNITS[self as usize]
    }

    pub fn to_meters(self, value: f64) -> f64 {
        value / METERS_TO_UNITS[self as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_spellings() {
        assert_eq!(Unit::parse("m"), Some(Unit::Meters));
        assert_eq!(Unit::parse("meters"), Some(Unit::Meters));
        assert_eq!(Unit::parse("km"), Some(Unit::Kilometers));
        assert_eq!(Unit::parse("kilometers"), Some(Unit::Kilometers));
        assert_eq!(Unit::parse("ft"), Some(Unit::Feet));
        assert_eq!(Unit::parse("feet"), Some(Unit::Feet));
        assert_eq!(Unit::parse("yd"), Some(Unit::Yards));
        assert_eq!(Unit::parse("yards"), Some(Unit::Yards));
        assert_eq!(Unit::parse("mi"), Some(Unit::Miles));
        assert_eq!(Unit::parse("miles"), Some(Unit::Miles));
        assert_eq!(Unit::parse("furlongs"), None);
        assert_eq!(Unit::parse("M"), None);
    }

    #[test]
    fn test_round_trip_within_tolerance() {
        for unit in [Unit::Meters, Unit::Kilometers, Unit::Feet, Unit::Yards, Unit::Miles] {
            let factor = METERS_TO_UNITS[unit as usize];
            let product = factor * (1.0 / factor);
            assert!((product - 1.0).abs() < 1e-9, "{:?}: {}", unit, product);
        }
    }

    #[test]
    fn test_mile_conversion() {
        let meters = Unit::Miles.to_meters(1.0);
        assert!((meters - 1609.344).abs() < 0.01);
    }
}
