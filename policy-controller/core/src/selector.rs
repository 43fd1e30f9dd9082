//! Dot-separated paths into the authorization JSON, e.g. `auth.identity.email` or
//! `request.headers.x-forwarded-for`. Numeric segments index into arrays.

use serde_json::Value;
use std::{fmt, str::FromStr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    segments: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid selector {0:?}: segments must not be empty")]
pub struct InvalidSelector(String);

// === impl Selector ===

impl Selector {
    pub fn resolve<'v>(&self, value: &'v Value) -> Option<&'v Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

impl FromStr for Selector {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = s.split('.').map(str::to_string).collect::<Vec<_>>();
        if segments.iter().any(String::is_empty) {
            return Err(InvalidSelector(s.to_string()));
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}
