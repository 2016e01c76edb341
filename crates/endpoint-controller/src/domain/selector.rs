//! Equality-based label selectors as used by `Service.spec.selector`.

use std::collections::BTreeMap;

use error_stack::Report;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum SelectorError {
    #[display("invalid label key `{key}`: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[display("invalid value `{value}` for label `{key}`: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },
}

impl std::error::Error for SelectorError {}

/// A validated conjunction of `key=value` requirements. An empty selector
/// matches every object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, Report<SelectorError>> {
        for (key, value) in map {
            validate_key(key)?;
            validate_value(key, value)?;
        }
        Ok(Self(map.clone()))
    }

    /// Builds a selector from trusted requirements without validation.
    pub(crate) fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn validate_key(key: &str) -> Result<(), Report<SelectorError>> {
    let invalid = |reason| {
        Report::new(SelectorError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 {
            return Err(invalid("prefix must be 1-253 characters"));
        }
        let valid_prefix = prefix.split('.').all(|label| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
        if !valid_prefix {
            return Err(invalid("prefix must be a DNS subdomain"));
        }
    }
    if name.is_empty() {
        return Err(invalid("name part must not be empty"));
    }
    check_name_chars(name).map_err(invalid)
}

fn validate_value(key: &str, value: &str) -> Result<(), Report<SelectorError>> {
    if value.is_empty() {
        return Ok(());
    }
    check_name_chars(value).map_err(|reason| {
        Report::new(SelectorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason,
        })
    })
}

fn check_name_chars(s: &str) -> Result<(), &'static str> {
    if s.len() > 63 {
        return Err("must be no more than 63 characters");
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("must consist of alphanumerics, '-', '_' or '.'");
    }
    let first = s.chars().next().unwrap_or('-');
    let last = s.chars().last().unwrap_or('-');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err("must start and end with an alphanumeric character");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn matches_requires_every_pair() {
        let selector = Selector::from_map(&labels(&[("app", "a"), ("tier", "web")])).unwrap();
        assert!(selector.matches(&labels(&[("app", "a"), ("tier", "web"), ("x", "y")])));
        assert!(!selector.matches(&labels(&[("app", "a")])));
        assert!(!selector.matches(&labels(&[("app", "b"), ("tier", "web")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = Selector::from_map(&BTreeMap::new()).unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[("anything", "goes")])));
    }

    #[test]
    fn accepts_prefixed_keys() {
        let selector =
            Selector::from_map(&labels(&[("app.kubernetes.io/name", "web_1.0")])).unwrap();
        assert!(selector.matches(&labels(&[("app.kubernetes.io/name", "web_1.0")])));
    }

    #[test]
    fn rejects_malformed_requirements() {
        let bad_key = Selector::from_map(&labels(&[("-app", "a")])).unwrap_err();
        assert!(matches!(
            bad_key.current_context(),
            SelectorError::InvalidKey { .. }
        ));

        let bad_prefix = Selector::from_map(&labels(&[("Example.com/app", "a")])).unwrap_err();
        assert!(matches!(
            bad_prefix.current_context(),
            SelectorError::InvalidKey { .. }
        ));

        let bad_value = Selector::from_map(&labels(&[("app", "a b")])).unwrap_err();
        assert!(matches!(
            bad_value.current_context(),
            SelectorError::InvalidValue { .. }
        ));
    }
}
