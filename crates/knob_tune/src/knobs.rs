//! Knob catalog and typed configurations.
//!
//! A [`KnobCatalog`] is loaded once from the JSON knob description file and
//! passed by reference to every component that needs it. Iteration over the
//! catalog is always in lexicographic name order; that order is the canonical
//! feature order shared by the surrogate trainer and the predictor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::TuneError;

/// Declared value kind of a knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnobKind {
    Integer,
    #[serde(alias = "float")]
    Real,
}

/// One tunable server parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct KnobSpec {
    pub name: String,
    pub kind: KnobKind,
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

/// On-disk form of one catalog entry. Extra fields in the file are ignored.
#[derive(Debug, Deserialize)]
struct RawKnobSpec {
    #[serde(rename = "type")]
    kind: KnobKind,
    min: f64,
    max: f64,
    default: f64,
}

impl KnobSpec {
    pub fn new(
        name: impl Into<String>,
        kind: KnobKind,
        min: f64,
        max: f64,
        default: f64,
    ) -> Result<Self, TuneError> {
        let name = name.into();
        if !is_valid_identifier(&name) {
            return Err(TuneError::InvalidKnob {
                name,
                reason: "not a valid parameter identifier".to_string(),
            });
        }
        if !(min.is_finite() && max.is_finite() && default.is_finite()) {
            return Err(TuneError::InvalidKnob {
                name,
                reason: "bounds and default must be finite".to_string(),
            });
        }
        if kind == KnobKind::Integer && (min.fract() != 0.0 || max.fract() != 0.0) {
            return Err(TuneError::InvalidKnob {
                name,
                reason: format!("integer knob has fractional bounds [{min}, {max}]"),
            });
        }
        if min > max {
            return Err(TuneError::InvalidKnob {
                name,
                reason: format!("min {min} exceeds max {max}"),
            });
        }
        if default < min || default > max {
            return Err(TuneError::InvalidKnob {
                name,
                reason: format!("default {default} outside [{min}, {max}]"),
            });
        }
        Ok(Self {
            name,
            kind,
            min,
            max,
            default,
        })
    }

    /// Clamps `raw` into range and converts it to the declared kind.
    ///
    /// Integer knobs are truncated after clamping; their bounds are integral,
    /// so the result stays inside `[min, max]`.
    pub fn coerce(&self, raw: f64) -> KnobValue {
        let raw = if raw.is_nan() { self.default } else { raw };
        let clamped = raw.clamp(self.min, self.max);
        match self.kind {
            KnobKind::Integer => KnobValue::Integer(clamped.trunc() as i64),
            KnobKind::Real => KnobValue::Real(clamped),
        }
    }

    /// Returns `(value - min) / (max - min)`, or `None` for a fixed knob.
    pub fn normalize(&self, value: f64) -> Option<f64> {
        let span = self.max - self.min;
        if span == 0.0 {
            return None;
        }
        Some((value - self.min) / span)
    }
}

/// A knob value tagged with its kind.
///
/// Serialized as a bare JSON number: integers without a fractional part,
/// reals always with one, so a value written to the evaluation log parses
/// back to the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KnobValue {
    Integer(i64),
    Real(f64),
}

impl KnobValue {
    pub fn as_f64(self) -> f64 {
        match self {
            KnobValue::Integer(v) => v as f64,
            KnobValue::Real(v) => v,
        }
    }
}

impl fmt::Display for KnobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnobValue::Integer(v) => write!(f, "{v}"),
            KnobValue::Real(v) => write!(f, "{v}"),
        }
    }
}

/// Immutable set of knob specs, keyed and iterated by name.
#[derive(Debug, Clone, Default)]
pub struct KnobCatalog {
    specs: BTreeMap<String, KnobSpec>,
}

impl KnobCatalog {
    pub fn from_specs(specs: impl IntoIterator<Item = KnobSpec>) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        }
    }

    /// Parses the JSON knob catalog `{ "<name>": { "type", "min", "max", "default" } }`.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let parsed: BTreeMap<String, RawKnobSpec> =
            serde_json::from_str(raw).context("parse knob catalog")?;
        let mut specs = Vec::with_capacity(parsed.len());
        for (name, raw) in parsed {
            specs.push(KnobSpec::new(name, raw.kind, raw.min, raw.max, raw.default)?);
        }
        Ok(Self::from_specs(specs))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read knob catalog {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("load knob catalog {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Option<&KnobSpec> {
        self.specs.get(name)
    }

    /// Specs in canonical (lexicographic) order.
    pub fn iter(&self) -> impl Iterator<Item = &KnobSpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Validates knob names and coerces every value of `config`.
    ///
    /// Returned pairs are in canonical order.
    pub fn resolve<'a>(
        &'a self,
        config: &Configuration,
    ) -> Result<Vec<(&'a KnobSpec, KnobValue)>, TuneError> {
        let mut resolved = Vec::with_capacity(config.len());
        for (name, value) in config.iter() {
            let spec = self.get(name).ok_or_else(|| TuneError::InvalidKnob {
                name: name.to_string(),
                reason: "not present in knob catalog".to_string(),
            })?;
            resolved.push((spec, spec.coerce(value.as_f64())));
        }
        Ok(resolved)
    }
}

/// One full assignment of knob values under evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    values: BTreeMap<String, KnobValue>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: KnobValue) {
        self.values.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: KnobValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<KnobValue> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, KnobValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, KnobValue)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (String, KnobValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Accepts lower-case parameter names such as `shared_buffers` or
/// `auto_explain.log_min_duration`.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> KnobCatalog {
        KnobCatalog::from_json(
            r#"{
                "work_mem": {"type": "integer", "min": 64, "max": 1048576, "default": 4096},
                "random_page_cost": {"type": "float", "min": 1.0, "max": 8.0, "default": 4.0},
                "max_connections": {"type": "integer", "min": 100, "max": 100, "default": 100, "unit": "conn"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn catalog_iterates_in_name_order() {
        let names: Vec<_> = catalog().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, ["max_connections", "random_page_cost", "work_mem"]);
    }

    #[test]
    fn float_is_an_alias_for_real() {
        let catalog = catalog();
        assert_eq!(catalog.get("random_page_cost").unwrap().kind, KnobKind::Real);
    }

    #[test]
    fn coerce_clamps_then_truncates_integers() {
        let catalog = catalog();
        let work_mem = catalog.get("work_mem").unwrap();
        assert_eq!(work_mem.coerce(10.0), KnobValue::Integer(64));
        assert_eq!(work_mem.coerce(9e9), KnobValue::Integer(1_048_576));
        assert_eq!(work_mem.coerce(4096.9), KnobValue::Integer(4096));

        let cost = catalog.get("random_page_cost").unwrap();
        assert_eq!(cost.coerce(0.5), KnobValue::Real(1.0));
        assert_eq!(cost.coerce(2.25), KnobValue::Real(2.25));
    }

    #[test]
    fn resolve_rejects_unknown_knobs() {
        let config = Configuration::new().with("not_a_knob", KnobValue::Integer(1));
        let err = catalog().resolve(&config).unwrap_err();
        assert!(matches!(err, TuneError::InvalidKnob { .. }));
    }

    #[test]
    fn invalid_specs_are_rejected_at_load() {
        assert!(KnobCatalog::from_json(
            r#"{"work_mem": {"type": "integer", "min": 10, "max": 1, "default": 5}}"#
        )
        .is_err());
        assert!(KnobCatalog::from_json(
            r#"{"work_mem; DROP TABLE x": {"type": "integer", "min": 1, "max": 10, "default": 5}}"#
        )
        .is_err());
        assert!(KnobCatalog::from_json(
            r#"{"work_mem": {"type": "enum", "min": 1, "max": 10, "default": 5}}"#
        )
        .is_err());
    }

    #[test]
    fn integer_knobs_require_integral_bounds() {
        let err = KnobSpec::new("work_mem", KnobKind::Integer, 0.5, 10.0, 1.0).unwrap_err();
        assert!(matches!(err, TuneError::InvalidKnob { .. }));
        assert!(KnobSpec::new("work_mem", KnobKind::Integer, 1.0, 10.5, 1.0).is_err());
        assert!(KnobSpec::new("random_page_cost", KnobKind::Real, 0.5, 10.0, 1.0).is_ok());

        let spec = KnobSpec::new("work_mem", KnobKind::Integer, 1.0, 10.0, 1.0).unwrap();
        for raw in [0.7, 1.2, 9.99, 10.0, -4.0, 1e12] {
            let value = spec.coerce(raw).as_f64();
            assert!((spec.min..=spec.max).contains(&value), "{raw} coerced to {value}");
        }
    }

    #[test]
    fn fixed_knobs_do_not_normalize() {
        let catalog = catalog();
        assert!(catalog.get("max_connections").unwrap().normalize(100.0).is_none());
        let cost = catalog.get("random_page_cost").unwrap();
        assert_eq!(cost.normalize(8.0), Some(1.0));
    }

    #[test]
    fn configuration_json_keeps_value_kinds() {
        let config = Configuration::new()
            .with("work_mem", KnobValue::Integer(2048))
            .with("random_page_cost", KnobValue::Real(3.0));
        let text = serde_json::to_string(&config).unwrap();
        let parsed: Configuration = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
