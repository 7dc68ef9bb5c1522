//! Weight units, precision and the "is this a weight input" heuristic

use crate::surface::InputDescriptor;

/// Decimal places used when an input carries no usable `step`
pub const DEFAULT_PRECISION: u32 = 2;

pub const MAX_PRECISION: u32 = 10;

/// Target unit of an input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    pub symbol: &'static str,
    /// Grams per one of this unit
    pub grams: f64,
}

pub const GRAM: Unit = Unit {
    symbol: "g",
    grams: 1.0,
};

/// Canonical units. Volumes assume a density of 1 g/ml.
const UNITS: &[Unit] = &[
    GRAM,
    Unit {
        symbol: "kg",
        grams: 1000.0,
    },
    Unit {
        symbol: "mg",
        grams: 0.001,
    },
    Unit {
        symbol: "lb",
        grams: 453.592_37,
    },
    Unit {
        symbol: "oz",
        grams: 28.349_523_125,
    },
    Unit {
        symbol: "ml",
        grams: 1.0,
    },
    Unit {
        symbol: "cl",
        grams: 10.0,
    },
    Unit {
        symbol: "dl",
        grams: 100.0,
    },
    Unit {
        symbol: "l",
        grams: 1000.0,
    },
];

const ALIASES: &[(&str, &str)] = &[
    ("g", "g"),
    ("gr", "g"),
    ("gram", "g"),
    ("grams", "g"),
    ("gramm", "g"),
    ("gramme", "g"),
    ("grammes", "g"),
    ("kg", "kg"),
    ("kgs", "kg"),
    ("kilo", "kg"),
    ("kilos", "kg"),
    ("kilogram", "kg"),
    ("kilograms", "kg"),
    ("kilogramm", "kg"),
    ("mg", "mg"),
    ("milligram", "mg"),
    ("milligrams", "mg"),
    ("lb", "lb"),
    ("lbs", "lb"),
    ("pound", "lb"),
    ("pounds", "lb"),
    ("oz", "oz"),
    ("ounce", "oz"),
    ("ounces", "oz"),
    ("ml", "ml"),
    ("milliliter", "ml"),
    ("milliliters", "ml"),
    ("millilitre", "ml"),
    ("millilitres", "ml"),
    ("cl", "cl"),
    ("dl", "dl"),
    ("l", "l"),
    ("liter", "l"),
    ("liters", "l"),
    ("litre", "l"),
    ("litres", "l"),
];

/// Terms that mark an input as weight-related
const WEIGHT_TERMS: &[&str] = &[
    "weight", "gewicht", "poids", "peso", "mass", "scale", "gram", "kilogram", "amount",
    "quantity", "tare",
];

pub fn unit_for_symbol(symbol: &str) -> Option<Unit> {
    let symbol = symbol.trim().to_lowercase();
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == symbol)
        .map(|(_, canonical)| *canonical)?;
    UNITS.iter().find(|u| u.symbol == canonical).copied()
}

/// First unit word found in free text
fn unit_in_text(text: &str) -> Option<Unit> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .find_map(unit_for_symbol)
}

/// Resolve the unit an input expects.
///
/// Looks at the `unit` data attribute, then nearby hint text (nearest
/// first), then the label. Returns the unit and whether it was actually
/// found; the fallback is grams.
pub fn resolve_unit(input: &InputDescriptor) -> (Unit, bool) {
    let candidates = input
        .data
        .get("unit")
        .into_iter()
        .chain(input.hints.iter())
        .chain(input.label.iter());
    for text in candidates {
        if let Some(unit) = unit_in_text(text) {
            return (unit, true);
        }
    }
    (GRAM, false)
}

/// Decimal places implied by a `step` attribute ("0.01" → 2, "1" → 0)
pub fn precision_from_step(step: &str) -> Option<u32> {
    let step = step.trim();
    let value: f64 = step.parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    if step.contains(['e', 'E']) {
        // Scientific notation: count via the rendered value
        let rendered = format!("{}", value);
        return Some(decimals_of(&rendered));
    }
    Some(decimals_of(step))
}

fn decimals_of(s: &str) -> u32 {
    match s.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

/// Precision for `input`: its `step`, else `default`, clamped to [0, 10]
pub fn resolve_precision(input: &InputDescriptor, default: u32) -> u32 {
    input
        .step
        .as_deref()
        .and_then(precision_from_step)
        .unwrap_or(default)
        .min(MAX_PRECISION)
}

/// Round half away from zero to `precision` decimals
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(MAX_PRECISION) as i32);
    (value * factor).round() / factor
}

/// Convert grams into `unit`, rounded and formatted with `precision` decimals
pub fn format_weight(grams: f64, unit: Unit, precision: u32) -> String {
    let precision = precision.min(MAX_PRECISION);
    let value = round_to(grams / unit.grams, precision);
    // Avoid "-0.00"
    let value = if value == 0.0 { 0.0 } else { value };
    format!("{:.*}", precision as usize, value)
}

/// Convert a sensor reading in `symbol` to grams; unknown symbols read as grams
pub fn to_grams(value: f64, symbol: Option<&str>) -> f64 {
    match symbol.and_then(unit_for_symbol) {
        Some(unit) => value * unit.grams,
        None => {
            if let Some(symbol) = symbol {
                tracing::debug!("Unknown sensor unit {:?}, assuming grams", symbol);
            }
            value
        }
    }
}

fn mentions_weight(text: &str) -> bool {
    let text = text.to_lowercase();
    WEIGHT_TERMS.iter().any(|term| text.contains(term))
}

/// Whether `input` looks like it takes a weight
pub fn is_weight_input(input: &InputDescriptor) -> bool {
    if input.data.contains_key("scale-input") || input.data.contains_key("weight") {
        return true;
    }
    mentions_weight(input.id.as_str())
        || input.name.as_deref().is_some_and(mentions_weight)
        || input.classes.iter().any(|c| mentions_weight(c))
        || input.data.keys().any(|k| mentions_weight(k))
        || input.label.as_deref().is_some_and(mentions_weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve() {
        assert_eq!(unit_for_symbol("KG").unwrap().symbol, "kg");
        assert_eq!(unit_for_symbol("pounds").unwrap().symbol, "lb");
        assert_eq!(unit_for_symbol("Litre").unwrap().symbol, "l");
        assert!(unit_for_symbol("furlong").is_none());
    }

    #[test]
    fn test_resolution_order() {
        let input = InputDescriptor::new("amount")
            .with_label("Amount (lb)")
            .with_hint("kg");
        assert_eq!(resolve_unit(&input), (unit_for_symbol("kg").unwrap(), true));

        let input = input.with_data("unit", "oz");
        assert_eq!(resolve_unit(&input).0.symbol, "oz");

        let input = InputDescriptor::new("amount").with_label("Amount");
        assert_eq!(resolve_unit(&input), (GRAM, false));
    }

    #[test]
    fn test_precision_from_step() {
        assert_eq!(precision_from_step("0.01"), Some(2));
        assert_eq!(precision_from_step("0.50"), Some(1));
        assert_eq!(precision_from_step("1"), Some(0));
        assert_eq!(precision_from_step("1e-3"), Some(3));
        assert_eq!(precision_from_step("any"), None);
        assert_eq!(precision_from_step("0"), None);

        let input = InputDescriptor::new("a").with_step("0.000000000001");
        assert_eq!(resolve_precision(&input, 2), MAX_PRECISION);
        assert_eq!(resolve_precision(&InputDescriptor::new("b"), 3), 3);
        assert_eq!(resolve_precision(&InputDescriptor::new("c"), 99), MAX_PRECISION);
    }

    #[test]
    fn test_written_value_is_rounded_conversion() {
        let cases = [
            (1234.0, "kg", 2, "1.23"),
            (1235.0, "kg", 3, "1.235"),
            (500.0, "g", 0, "500"),
            (453.59237, "lb", 2, "1.00"),
            (100.0, "oz", 1, "3.5"),
            (250.0, "ml", 0, "250"),
            (750.0, "l", 2, "0.75"),
        ];
        for (grams, symbol, precision, expected) in cases {
            let unit = unit_for_symbol(symbol).unwrap();
            assert_eq!(format_weight(grams, unit, precision), expected, "{grams} g in {symbol}");
        }
    }

    #[test]
    fn test_readings_a_step_apart_format_differently() {
        let kg = unit_for_symbol("kg").unwrap();
        let precision = 2;
        // One rounding step in grams
        let threshold = kg.grams * 10f64.powi(-(precision as i32));
        for base in [0.0, 1234.0, 5000.0, 12_345.6] {
            let a = format_weight(base, kg, precision);
            let b = format_weight(base + threshold, kg, precision);
            assert_ne!(a, b, "{base} vs {}", base + threshold);
        }
    }

    #[test]
    fn test_sensor_units_normalise_to_grams() {
        assert_eq!(to_grams(1.5, Some("kg")), 1500.0);
        assert_eq!(to_grams(2.0, Some("lb")), 907.18474);
        assert_eq!(to_grams(12.0, None), 12.0);
        assert_eq!(to_grams(12.0, Some("stone")), 12.0);
    }

    #[test]
    fn test_weight_input_heuristic() {
        assert!(is_weight_input(&InputDescriptor::new("product_weight")));
        assert!(is_weight_input(&InputDescriptor::new("x").with_name("amount")));
        assert!(is_weight_input(&InputDescriptor::new("x").with_class("scale-target")));
        assert!(is_weight_input(&InputDescriptor::new("x").with_data("scale-input", "")));
        assert!(is_weight_input(&InputDescriptor::new("x").with_label("Gewicht")));
        assert!(!is_weight_input(&InputDescriptor::new("barcode").with_label("Barcode")));
    }
}
