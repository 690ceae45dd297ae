//! Unit scaling rules.
//!
//! Scaling is a priority-ordered rule table evaluated first match wins. The
//! standard table has two tiers: rules that match on a name suffix *or* on
//! the bare raw unit, followed by rules keyed on the raw unit alone. A value
//! that matches nothing is passed through unchanged with its raw unit.

use crate::decode::RawValue;

/// Arithmetic applied to the raw integer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Identity,
    Divide(f64),
}

impl Transform {
    /// Apply the transform.
    pub fn apply(&self, raw: f64) -> f64 {
        match *self {
            Transform::Identity => raw,
            Transform::Divide(divisor) => raw / divisor,
        }
    }
}

/// Predicate selecting the registers a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Field name ends with the token, or the raw unit equals the token with
    /// underscores removed (`"_mWh"` also matches raw unit `"mWh"`).
    SuffixOrUnit(&'static str),
    /// Raw unit equals the tag exactly.
    RawUnit(&'static str),
}

impl Matcher {
    fn matches(&self, name: &str, raw_unit: &str) -> bool {
        match self {
            Matcher::SuffixOrUnit(token) => {
                name.ends_with(token) || raw_unit == token.replace('_', "")
            }
            Matcher::RawUnit(unit) => raw_unit == *unit,
        }
    }
}

/// One entry of the rule table.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingRule {
    pub matcher: Matcher,
    pub transform: Transform,
    /// Output unit. For suffix rules an empty unit keeps the raw unit; for
    /// raw-unit rules it is used verbatim.
    pub unit: &'static str,
}

impl ScalingRule {
    /// Rule matching a name suffix or the equivalent bare unit.
    pub const fn suffix(token: &'static str, transform: Transform, unit: &'static str) -> Self {
        Self {
            matcher: Matcher::SuffixOrUnit(token),
            transform,
            unit,
        }
    }

    /// Rule matching only the raw unit tag.
    pub const fn raw_unit(tag: &'static str, transform: Transform, unit: &'static str) -> Self {
        Self {
            matcher: Matcher::RawUnit(tag),
            transform,
            unit,
        }
    }

    fn output_unit(&self, raw_unit: &str) -> String {
        match self.matcher {
            Matcher::SuffixOrUnit(_) if self.unit.is_empty() => raw_unit.to_string(),
            _ => self.unit.to_string(),
        }
    }
}

/// Suffix tier of the standard table, in evaluation order.
///
/// `mWh` goes to kWh while plain `Wh` only divides by 1000. Reactive energy
/// in `mVarh` is divided down to `Varh`, and plain `Varh` stays as-is.
const SUFFIX_RULES: [ScalingRule; 10] = [
    ScalingRule::suffix("_mW", Transform::Divide(1_000.0), "W"),
    ScalingRule::suffix("_mV", Transform::Divide(1_000.0), "V"),
    ScalingRule::suffix("_mA", Transform::Divide(1_000.0), "A"),
    ScalingRule::suffix("_mWh", Transform::Divide(1_000_000.0), "kWh"),
    ScalingRule::suffix("_mVar", Transform::Divide(1_000.0), "Var"),
    ScalingRule::suffix("_mVarh", Transform::Divide(1_000.0), "Varh"),
    ScalingRule::suffix("_1/1000", Transform::Divide(1_000.0), ""),
    ScalingRule::suffix("_rawpf", Transform::Divide(1_000.0), ""),
    ScalingRule::suffix("Wh", Transform::Divide(1_000.0), "kWh"),
    ScalingRule::suffix("Varh", Transform::Identity, "Varh"),
];

/// Raw units looked up in the second tier, each against the suffix rule `_<unit>`.
const RAW_UNIT_KEYS: [&str; 8] = ["mW", "mV", "mA", "mWh", "mVar", "mVarh", "1/1000", "Wh"];

/// Result of scaling one register.
#[derive(Debug, Clone, PartialEq)]
pub struct Scaled {
    pub value: f64,
    pub unit: String,
}

/// Ordered scaling rule table.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingEngine {
    rules: Vec<ScalingRule>,
}

impl ScalingEngine {
    /// Engine with a custom rule table.
    pub fn new(rules: Vec<ScalingRule>) -> Self {
        Self { rules }
    }

    /// The standard meter table.
    pub fn standard() -> Self {
        let mut rules = SUFFIX_RULES.to_vec();

        for key in RAW_UNIT_KEYS {
            let twin = rules
                .iter()
                .find(|rule| match rule.matcher {
                    Matcher::SuffixOrUnit(token) => token.strip_prefix('_') == Some(key),
                    Matcher::RawUnit(_) => false,
                })
                .map(|rule| (rule.transform, rule.unit));

            if let Some((transform, unit)) = twin {
                rules.push(ScalingRule::raw_unit(key, transform, unit));
            }
        }

        Self { rules }
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[ScalingRule] {
        &self.rules
    }

    /// Scale a decoded value.
    pub fn scale(&self, name: &str, raw: RawValue, raw_unit: &str) -> Scaled {
        let value = raw.as_f64();

        match self.rules.iter().find(|rule| rule.matcher.matches(name, raw_unit)) {
            Some(rule) => Scaled {
                value: rule.transform.apply(value),
                unit: rule.output_unit(raw_unit),
            },
            None => Scaled {
                value,
                unit: raw_unit.to_string(),
            },
        }
    }
}

impl Default for ScalingEngine {
    fn default() -> Self {
        Self::standard()
    }
}
