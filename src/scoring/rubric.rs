//! Scoring rubric: parameters, ranges, and range selection.
//!
//! Rubric rows live in the `scoring_ranges` reference table; the seed below
//! covers the real line for every `(parameter, delivery_method)` pair, with
//! out-of-range values mapping to an exclusion bucket.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::DeliveryMethod;

/// The four scored physicochemical parameters, with fixed weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    Dose,
    MolecularWeight,
    MeltingPoint,
    LogP,
}

impl Parameter {
    pub const ALL: [Parameter; 4] = [
        Parameter::Dose,
        Parameter::MolecularWeight,
        Parameter::MeltingPoint,
        Parameter::LogP,
    ];

    pub fn weight(&self) -> f64 {
        match self {
            Self::Dose => 0.40,
            Self::MolecularWeight => 0.30,
            Self::MeltingPoint => 0.20,
            Self::LogP => 0.10,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Dose => "mg/kg/day",
            Self::MolecularWeight => "Da",
            Self::MeltingPoint => "°C",
            Self::LogP => "",
        }
    }

    /// Human-readable name used in prompts and reports.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Dose => "Dose",
            Self::MolecularWeight => "Molecular Weight",
            Self::MeltingPoint => "Melting Point",
            Self::LogP => "Log P",
        }
    }

    /// Stable snake_case key used in JSON payloads and persistence.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Dose => "dose",
            Self::MolecularWeight => "molecular_weight",
            Self::MeltingPoint => "melting_point",
            Self::LogP => "log_p",
        }
    }

    pub fn from_key(key: &str) -> Result<Self> {
        match key {
            "dose" => Ok(Self::Dose),
            "molecular_weight" => Ok(Self::MolecularWeight),
            "melting_point" => Ok(Self::MeltingPoint),
            "log_p" => Ok(Self::LogP),
            other => Err(Error::Internal(format!("unknown parameter key: {}", other))),
        }
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// One rubric row mapping a value interval to a score.
///
/// `None` bounds are open; both bounds are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricRange {
    pub parameter: Parameter,
    pub delivery_method: DeliveryMethod,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub score: u8,
    pub is_exclusion: bool,
    pub range_text: String,
}

impl RubricRange {
    pub fn matches(&self, value: f64) -> bool {
        self.min_value.map_or(true, |min| value >= min)
            && self.max_value.map_or(true, |max| value <= max)
    }

    /// Interval width used as the final tie-breaker; open ranges are widest.
    fn width(&self) -> f64 {
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => max - min,
            _ => f64::INFINITY,
        }
    }
}

/// Outcome of a rubric lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeMatch {
    pub score: u8,
    pub is_exclusion: bool,
    pub range_text: String,
}

/// Select the rubric row for a value.
///
/// Tie-breaking on boundary overlap: prefer the non-exclusion row, then the
/// higher score, then the narrower range. Values outside every range map to
/// the exclusion bucket.
pub fn select_range(
    ranges: &[RubricRange],
    parameter: Parameter,
    delivery_method: DeliveryMethod,
    value: f64,
) -> RangeMatch {
    let mut candidates: Vec<&RubricRange> = ranges
        .iter()
        .filter(|r| {
            r.parameter == parameter && r.delivery_method == delivery_method && r.matches(value)
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.is_exclusion
            .cmp(&b.is_exclusion)
            .then(b.score.cmp(&a.score))
            .then(a.width().total_cmp(&b.width()))
    });

    match candidates.first() {
        Some(range) => RangeMatch {
            score: range.score,
            is_exclusion: range.is_exclusion,
            range_text: range.range_text.clone(),
        },
        None => RangeMatch {
            score: 0,
            is_exclusion: true,
            range_text: "Out of Range".to_string(),
        },
    }
}

fn range(
    parameter: Parameter,
    delivery_method: DeliveryMethod,
    min_value: Option<f64>,
    max_value: Option<f64>,
    score: u8,
    is_exclusion: bool,
    range_text: &str,
) -> RubricRange {
    RubricRange {
        parameter,
        delivery_method,
        min_value,
        max_value,
        score,
        is_exclusion,
        range_text: range_text.to_string(),
    }
}

/// Seeded rubric covering the real line per `(parameter, delivery_method)`.
pub fn default_rubric() -> Vec<RubricRange> {
    use DeliveryMethod::{Transdermal as Td, Transmucosal as Tm};
    use Parameter::*;

    vec![
        // Dose, transdermal (mg/kg/day)
        range(Dose, Td, None, Some(0.07), 9, false, "≤ 0.07 mg/kg/day"),
        range(Dose, Td, Some(0.07), Some(0.15), 7, false, "0.07–0.15 mg/kg/day"),
        range(Dose, Td, Some(0.15), Some(0.3), 5, false, "0.15–0.3 mg/kg/day"),
        range(Dose, Td, Some(0.3), Some(0.7), 3, false, "0.3–0.7 mg/kg/day"),
        range(Dose, Td, Some(0.7), Some(1.5), 1, false, "0.7–1.5 mg/kg/day"),
        range(Dose, Td, Some(1.5), None, 0, true, "> 1.5 mg/kg/day"),
        // Dose, transmucosal
        range(Dose, Tm, None, Some(0.15), 9, false, "≤ 0.15 mg/kg/day"),
        range(Dose, Tm, Some(0.15), Some(0.3), 7, false, "0.15–0.3 mg/kg/day"),
        range(Dose, Tm, Some(0.3), Some(0.7), 5, false, "0.3–0.7 mg/kg/day"),
        range(Dose, Tm, Some(0.7), Some(1.5), 3, false, "0.7–1.5 mg/kg/day"),
        range(Dose, Tm, Some(1.5), Some(3.0), 1, false, "1.5–3 mg/kg/day"),
        range(Dose, Tm, Some(3.0), None, 0, true, "> 3 mg/kg/day"),
        // Molecular weight, transdermal (Da)
        range(MolecularWeight, Td, None, Some(350.0), 9, false, "≤ 350 Da"),
        range(MolecularWeight, Td, Some(350.0), Some(500.0), 7, false, "350–500 Da"),
        range(MolecularWeight, Td, Some(500.0), Some(650.0), 4, false, "500–650 Da"),
        range(MolecularWeight, Td, Some(650.0), Some(800.0), 2, false, "650–800 Da"),
        range(MolecularWeight, Td, Some(800.0), None, 0, true, "> 800 Da"),
        // Molecular weight, transmucosal
        range(MolecularWeight, Tm, None, Some(500.0), 9, false, "≤ 500 Da"),
        range(MolecularWeight, Tm, Some(500.0), Some(800.0), 6, false, "500–800 Da"),
        range(MolecularWeight, Tm, Some(800.0), Some(1000.0), 3, false, "800–1000 Da"),
        range(MolecularWeight, Tm, Some(1000.0), None, 0, true, "> 1000 Da"),
        // Melting point, transdermal (°C)
        range(MeltingPoint, Td, None, Some(100.0), 9, false, "≤ 100 °C"),
        range(MeltingPoint, Td, Some(100.0), Some(150.0), 7, false, "100–150 °C"),
        range(MeltingPoint, Td, Some(150.0), Some(200.0), 5, false, "150–200 °C"),
        range(MeltingPoint, Td, Some(200.0), Some(250.0), 3, false, "200–250 °C"),
        range(MeltingPoint, Td, Some(250.0), Some(300.0), 1, false, "250–300 °C"),
        range(MeltingPoint, Td, Some(300.0), None, 0, true, "> 300 °C"),
        // Melting point, transmucosal
        range(MeltingPoint, Tm, None, Some(150.0), 8, false, "≤ 150 °C"),
        range(MeltingPoint, Tm, Some(150.0), Some(250.0), 5, false, "150–250 °C"),
        range(MeltingPoint, Tm, Some(250.0), None, 2, false, "> 250 °C"),
        // Log P, transdermal
        range(LogP, Td, None, Some(-1.0), 0, true, "< -1"),
        range(LogP, Td, Some(-1.0), Some(0.0), 3, false, "-1–0"),
        range(LogP, Td, Some(0.0), Some(1.0), 6, false, "0–1"),
        range(LogP, Td, Some(1.0), Some(3.0), 9, false, "1–3"),
        range(LogP, Td, Some(3.0), Some(4.0), 6, false, "3–4"),
        range(LogP, Td, Some(4.0), Some(5.0), 3, false, "4–5"),
        range(LogP, Td, Some(5.0), None, 0, true, "> 5"),
        // Log P, transmucosal
        range(LogP, Tm, None, Some(0.0), 5, false, "< 0"),
        range(LogP, Tm, Some(0.0), Some(4.0), 8, false, "0–4"),
        range(LogP, Tm, Some(4.0), Some(6.0), 3, false, "4–6"),
        range(LogP, Tm, Some(6.0), None, 0, true, "> 6"),
    ]
}
