//! Resource quantity arithmetic
//!
//! The scheduler cache adds, subtracts and compares Kubernetes resource
//! quantities. Quantities are carried as their wire form ([`Quantity`]) and
//! parsed into integer milli-units for arithmetic, so `500m` cpu and
//! `0.5` cpu compare equal and memory suffixes never lose precision.
//!
//! Supported forms: plain integers, decimals, the `m` milli suffix, decimal
//! suffixes `k M G T P E` and binary suffixes `Ki Mi Gi Ti Pi Ei`.
//! Scientific notation is not used by the objects this cache tracks.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

/// A named set of resource quantities, e.g. `{cpu: 500m, memory: 1Gi}`.
pub type ResourceList = BTreeMap<String, Quantity>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid quantity {0:?}")]
pub struct InvalidQuantity(pub String);

const DEC_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

const BIN_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

/// Parse a quantity into integer milli-units (`1` == `1000`, `500m` == `500`).
pub fn parse_milli(quantity: &Quantity) -> Result<i128, InvalidQuantity> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return Err(InvalidQuantity(quantity.0.clone()));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(InvalidQuantity(quantity.0.clone()));
    }

    // Multiplier expressed in milli-units.
    let multiplier: i128 = if suffix.is_empty() {
        1000
    } else if suffix == "m" {
        1
    } else if let Some((_, exp)) = DEC_SUFFIXES.iter().find(|(tag, _)| *tag == suffix) {
        1000 * 1000i128.pow(*exp)
    } else if let Some((_, exp)) = BIN_SUFFIXES.iter().find(|(tag, _)| *tag == suffix) {
        1000 * (1i128 << exp)
    } else {
        return Err(InvalidQuantity(quantity.0.clone()));
    };

    let (integral, fraction) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if fraction.contains('.') {
        return Err(InvalidQuantity(quantity.0.clone()));
    }

    let integral: i128 = if integral.is_empty() {
        0
    } else {
        integral
            .parse()
            .map_err(|_| InvalidQuantity(quantity.0.clone()))?
    };
    let mut value = integral
        .checked_mul(multiplier)
        .ok_or_else(|| InvalidQuantity(quantity.0.clone()))?;

    if !fraction.is_empty() {
        let digits: i128 = fraction
            .parse()
            .map_err(|_| InvalidQuantity(quantity.0.clone()))?;
        let denom = 10i128.pow(fraction.len() as u32);
        value += digits * multiplier / denom;
    }

    Ok(value)
}

/// Format milli-units back into a quantity: whole values are plain, the
/// rest keep the `m` suffix.
pub fn format_milli(value: i128) -> Quantity {
    if value % 1000 == 0 {
        Quantity(format!("{}", value / 1000))
    } else {
        Quantity(format!("{}m", value))
    }
}

/// Componentwise value equality: same resource names, equal quantities.
pub fn equals(a: &ResourceList, b: &ResourceList) -> bool {
    if a.len() != b.len() {
        return false;
    }
    for (name, quantity) in a {
        let Some(other) = b.get(name) else {
            return false;
        };
        match (parse_milli(quantity), parse_milli(other)) {
            (Ok(lhs), Ok(rhs)) if lhs == rhs => {}
            _ => return false,
        }
    }
    true
}

/// Parse a full resource list into milli-units.
pub fn parse_list(list: &ResourceList) -> Result<BTreeMap<String, i128>, InvalidQuantity> {
    list.iter()
        .map(|(name, quantity)| Ok((name.clone(), parse_milli(quantity)?)))
        .collect()
}

/// Render a milli-unit map back into a resource list.
pub fn format_list(list: &BTreeMap<String, i128>) -> ResourceList {
    list.iter()
        .map(|(name, value)| (name.clone(), format_milli(*value)))
        .collect()
}
