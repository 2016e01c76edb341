use std::fmt;
use std::str::FromStr;

use kube::ResourceExt;

/// Identity of a Service, `namespace/name`. Every queue in the controller is
/// keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of any namespaced object; cluster-scoped objects get an empty namespace.
    pub fn from_object<K: kube::Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, PartialEq, Eq, derive_more::Display)]
#[display("invalid service key `{_0}`, expected `namespace/name`")]
pub struct InvalidKey(pub String);

impl std::error::Error for InvalidKey {}

impl FromStr for ServiceKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(InvalidKey(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_round_trip() {
        let key: ServiceKey = "default/svc-a".parse().unwrap();
        assert_eq!(key, ServiceKey::new("default", "svc-a"));
        assert_eq!(key.to_string(), "default/svc-a");
    }

    #[test]
    fn rejects_malformed_keys() {
        for raw in ["svc-a", "/svc-a", "default/", "a/b/c"] {
            assert!(raw.parse::<ServiceKey>().is_err(), "{raw} should not parse");
        }
    }
}
