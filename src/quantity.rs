use std::{collections::BTreeMap, num::ParseIntError, sync::OnceLock};

use k8s_openapi::{
    api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity,
};
use regex::Regex;

use crate::resources::workspacekinds::PodConfigSpec;

#[allow(non_camel_case_types)]
enum QuantitySuffix {
    Ki,
    Mi,
    Gi,
    Ti,
    Pi,
    Ei,
    k,
    M,
    G,
    T,
    P,
    E,
    m,
    None,
    Exponent(i32),
}

impl QuantitySuffix {
    fn parse(suffix: &str) -> Result<Self, ParseError> {
        Ok(match suffix {
            "Ki" => Self::Ki,
            "Mi" => Self::Mi,
            "Gi" => Self::Gi,
            "Ti" => Self::Ti,
            "Pi" => Self::Pi,
            "Ei" => Self::Ei,
            "k" => Self::k,
            "M" => Self::M,
            "G" => Self::G,
            "T" => Self::T,
            "P" => Self::P,
            "E" => Self::E,
            "m" => Self::m,
            "" => Self::None,
            s if s.starts_with(['e', 'E']) => Self::Exponent(s[1..].parse()?),
            _ => return Err(ParseError::InvalidUnit(suffix.to_string())),
        })
    }

    /// Scale of one unit of this suffix as a fraction `numerator / denominator` of a milli-unit
    fn milli_scale(&self) -> Option<(i128, i128)> {
        const KI: i128 = 1024;
        const K: i128 = 1000;
        Some(match self {
            Self::Ki => (KI * K, 1),
            Self::Mi => (KI.pow(2) * K, 1),
            Self::Gi => (KI.pow(3) * K, 1),
            Self::Ti => (KI.pow(4) * K, 1),
            Self::Pi => (KI.pow(5) * K, 1),
            Self::Ei => (KI.pow(6) * K, 1),
            Self::k => (K.pow(2), 1),
            Self::M => (K.pow(3), 1),
            Self::G => (K.pow(4), 1),
            Self::T => (K.pow(5), 1),
            Self::P => (K.pow(6), 1),
            Self::E => (K.pow(7), 1),
            Self::m => (1, 1),
            Self::None => (K, 1),
            Self::Exponent(e) => {
                let e = e.checked_add(3)?;
                let scale = 10i128.checked_pow(e.unsigned_abs())?;
                if e >= 0 {
                    (scale, 1)
                } else {
                    (1, scale)
                }
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    ParseIntError(#[from] ParseIntError),
    #[error("quantity {0:?} does not match the expected format")]
    InvalidFormat(String),
    #[error("invalid unit {0:?}")]
    InvalidUnit(String),
    #[error("quantity {0:?} is too large")]
    Overflow(String),
}

/// Parse a Kubernetes quantity into milli-units, rounding fractions of a milli-unit up
pub fn to_milli(quantity: &Quantity) -> Result<i128, ParseError> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let raw = quantity.0.trim();
    let re = REGEX.get_or_init(|| {
        Regex::new(r"^([+-]?)([0-9]*)(?:\.([0-9]*))?([eE][+-]?[0-9]+|[a-zA-Z]{0,2})$")
            .expect("quantity regex is valid")
    });
    let caps = re
        .captures(raw)
        .ok_or_else(|| ParseError::InvalidFormat(raw.to_string()))?;

    let whole = caps.get(2).map_or("", |m| m.as_str());
    let fraction = caps.get(3).map_or("", |m| m.as_str());
    if whole.is_empty() && fraction.is_empty() {
        return Err(ParseError::InvalidFormat(raw.to_string()));
    }
    let overflow = || ParseError::Overflow(raw.to_string());

    let digits = format!("{whole}{fraction}");
    let mantissa: i128 = digits.parse()?;
    let fraction_scale = 10i128
        .checked_pow(fraction.len() as u32)
        .ok_or_else(overflow)?;

    let (num, den) = QuantitySuffix::parse(caps.get(4).map_or("", |m| m.as_str()))?
        .milli_scale()
        .ok_or_else(overflow)?;
    let numerator = mantissa.checked_mul(num).ok_or_else(overflow)?;
    let denominator = fraction_scale.checked_mul(den).ok_or_else(overflow)?;
    let milli = numerator
        .checked_add(denominator - 1)
        .ok_or_else(overflow)?
        / denominator;

    Ok(if &caps[1] == "-" { -milli } else { milli })
}

/// Rewrite a quantity into a canonical form so equal amounts compare equal
pub fn canonicalize(quantity: &Quantity) -> Result<Quantity, ParseError> {
    Ok(Quantity(format!("{}m", to_milli(quantity)?)))
}

fn canonicalize_map(
    map: Option<BTreeMap<String, Quantity>>,
) -> Result<Option<BTreeMap<String, Quantity>>, ParseError> {
    match map {
        Some(map) if !map.is_empty() => Ok(Some(
            map.into_iter()
                .map(|(k, v)| Ok((k, canonicalize(&v)?)))
                .collect::<Result<_, ParseError>>()?,
        )),
        _ => Ok(None),
    }
}

/// Bring a podConfig spec into a form where structurally equivalent specs compare equal.
///
/// Quantities are canonicalized and empty collections are treated as unset.
pub fn normalize_pod_config_spec(spec: &PodConfigSpec) -> Result<PodConfigSpec, ParseError> {
    let mut spec = spec.clone();
    spec.node_selector = spec.node_selector.filter(|m| !m.is_empty());
    spec.tolerations = spec.tolerations.filter(|t| !t.is_empty());
    spec.resources = match spec.resources {
        Some(resources) => {
            let resources = ResourceRequirements {
                claims: resources.claims.filter(|c| !c.is_empty()),
                limits: canonicalize_map(resources.limits)?,
                requests: canonicalize_map(resources.requests)?,
            };
            (resources != ResourceRequirements::default()).then_some(resources)
        }
        None => None,
    };
    Ok(spec)
}
