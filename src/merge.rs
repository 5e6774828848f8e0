//! Recursive merge algebra over configuration mappings.
//!
//! All operations are pure: inputs are borrowed and every value placed in
//! a result is a deep copy. The algebra is total, a mapping on one side
//! and a scalar or sequence on the other never errors:
//!
//! - [`union`]: right wins, nested mappings are merged.
//! - [`difference`]: what `left` has that `right` does not (or has differently).
//! - [`intersection`]: what both sides agree on.

use crate::value::{ConfigValue, Mapping};

/// Returns `left` when both values are deeply equal.
pub fn equal<'a>(left: &'a ConfigValue, right: &ConfigValue) -> Option<&'a ConfigValue> {
    if left == right {
        Some(left)
    } else {
        None
    }
}

/// Union of two mappings, with `right` taking precedence.
pub fn union(left: &Mapping, right: &Mapping) -> Mapping {
    let mut result = left.clone();

    for (key, r) in right {
        let merged = match (left.get(key), r) {
            (Some(ConfigValue::Mapping(l)), ConfigValue::Mapping(r)) => {
                ConfigValue::Mapping(union(l, r))
            }
            _ => r.clone(),
        };
        result.insert(key.clone(), merged);
    }

    result
}

/// Entries of `left` that are missing from or different in `right`.
pub fn difference(left: &Mapping, right: &Mapping) -> Mapping {
    let mut result = Mapping::new();

    for (key, l) in left {
        let Some(r) = right.get(key) else {
            result.insert(key.clone(), l.clone());
            continue;
        };

        match (l, r) {
            (ConfigValue::Mapping(lm), ConfigValue::Mapping(rm)) => {
                if lm.is_empty() && rm.is_empty() {
                    continue;
                } else if lm.is_empty() {
                    result.insert(key.clone(), l.clone());
                } else {
                    let nested = difference(lm, rm);
                    if !nested.is_empty() {
                        result.insert(key.clone(), ConfigValue::Mapping(nested));
                    }
                }
            }
            _ => {
                if equal(l, r).is_none() {
                    result.insert(key.clone(), l.clone());
                }
            }
        }
    }

    result
}

/// Entries present in both mappings on which both sides agree.
pub fn intersection(left: &Mapping, right: &Mapping) -> Mapping {
    let mut result = Mapping::new();

    for (key, l) in left {
        let Some(r) = right.get(key) else {
            continue;
        };

        match (l, r) {
            (ConfigValue::Mapping(lm), ConfigValue::Mapping(rm)) => {
                result.insert(key.clone(), ConfigValue::Mapping(intersection(lm, rm)));
            }
            _ => {
                if let Some(v) = equal(l, r) {
                    result.insert(key.clone(), v.clone());
                }
            }
        }
    }

    result
}
