//! Kubernetes label selectors, as accepted by `kubectl -l` and the
//! `labelSelector` list parameter, evaluated locally against cached objects.

use crate::k8s::cache::CacheError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as K8sLabelSelector;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::NotEquals(key, value) => labels.get(key) != Some(value),
            Self::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn(key, values) => labels.get(key).is_none_or(|v| !values.contains(v)),
            Self::Exists(key) => labels.contains_key(key),
            Self::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Self::Equals(key, value) => write!(f, "{key}={value}"),
            Self::NotEquals(key, value) => write!(f, "{key}!={value}"),
            Self::In(key, values) => write!(f, "{key} in ({})", join(values)),
            Self::NotIn(key, values) => write!(f, "{key} notin ({})", join(values)),
            Self::Exists(key) => f.write_str(key),
            Self::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// Conjunction of requirements; the empty selector matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Equality-only selector, every pair must be present in the object's labels
    #[must_use]
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            requirements: labels
                .iter()
                .map(|(key, value)| Requirement::Equals(key.clone(), value.clone()))
                .collect(),
        }
    }

    /// Convert an API `LabelSelector` (`matchLabels` + `matchExpressions`)
    ///
    /// # Errors
    ///
    /// Returns `InvalidSelector` for an unknown operator or an `In`/`NotIn` without values
    pub fn from_api(selector: &K8sLabelSelector) -> Result<Self, CacheError> {
        let mut requirements: Vec<Requirement> = selector
            .match_labels
            .iter()
            .flatten()
            .map(|(key, value)| Requirement::Equals(key.clone(), value.clone()))
            .collect();

        for expr in selector.match_expressions.iter().flatten() {
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            let invalid = |reason: &str| CacheError::InvalidSelector {
                selector: format!("{} {}", expr.key, expr.operator),
                reason: reason.to_string(),
            };
            let requirement = match expr.operator.as_str() {
                "In" if values.is_empty() => return Err(invalid("In requires values")),
                "NotIn" if values.is_empty() => return Err(invalid("NotIn requires values")),
                "In" => Requirement::In(expr.key.clone(), values),
                "NotIn" => Requirement::NotIn(expr.key.clone(), values),
                "Exists" => Requirement::Exists(expr.key.clone()),
                "DoesNotExist" => Requirement::DoesNotExist(expr.key.clone()),
                _ => return Err(invalid("unknown operator")),
            };
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    #[must_use]
    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Objects without labels only match selectors that require no label
    #[must_use]
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let empty = BTreeMap::new();
        let labels = labels.unwrap_or(&empty);
        self.requirements.iter().all(|req| req.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join(","))
    }
}

// split on commas that are not inside a value set
fn split_terms(input: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&input[start..]);
    terms
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn parse_term(term: &str) -> Result<Requirement, String> {
    if let Some(open) = term.find('(') {
        let close = term
            .rfind(')')
            .filter(|close| *close > open)
            .ok_or("unbalanced parentheses")?;
        let mut head = term[..open].split_whitespace();
        let (Some(key), Some(op), None) = (head.next(), head.next(), head.next()) else {
            return Err(format!("malformed set requirement '{term}'"));
        };
        let values: BTreeSet<String> = term[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .collect();
        if !valid_key(key) {
            return Err(format!("invalid key '{key}'"));
        }
        if values.is_empty() {
            return Err(format!("empty value set for '{key}'"));
        }
        return match op {
            "in" => Ok(Requirement::In(key.to_string(), values)),
            "notin" => Ok(Requirement::NotIn(key.to_string(), values)),
            other => Err(format!("unknown set operator '{other}'")),
        };
    }

    let (key, value, negated) = if let Some((key, value)) = term.split_once("!=") {
        (key, Some(value), true)
    } else if let Some((key, value)) = term.split_once("==") {
        (key, Some(value), false)
    } else if let Some((key, value)) = term.split_once('=') {
        (key, Some(value), false)
    } else if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        if !valid_key(key) {
            return Err(format!("invalid key '{key}'"));
        }
        return Ok(Requirement::DoesNotExist(key.to_string()));
    } else {
        (term, None, false)
    };

    let key = key.trim();
    if !valid_key(key) {
        return Err(format!("invalid key '{key}'"));
    }
    Ok(match (value.map(str::trim), negated) {
        (Some(value), true) => Requirement::NotEquals(key.to_string(), value.to_string()),
        (Some(value), false) => Requirement::Equals(key.to_string(), value.to_string()),
        (None, _) => Requirement::Exists(key.to_string()),
    })
}

impl FromStr for LabelSelector {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::everything());
        }
        let requirements = split_terms(s)
            .into_iter()
            .map(str::trim)
            .map(parse_term)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| CacheError::InvalidSelector {
                selector: s.to_string(),
                reason,
            })?;
        Ok(Self { requirements })
    }
}
