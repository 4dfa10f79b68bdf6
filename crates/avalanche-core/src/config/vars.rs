//! Environment variable interpolation for config files.
//!
//! Recognised forms:
//! - `${VAR}` - value of VAR, error if unset
//! - `${VAR:-fallback}` - fallback when VAR is unset or empty
//! - `$$` - a literal `$`
//!
//! Warehouse credentials and bucket names are typically injected this way.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?::-(?P<fallback>[^}]*))?\}")
        .expect("placeholder pattern is valid")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// One message per unresolved placeholder.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if every placeholder resolved.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in `input`.
///
/// Every unresolved variable is reported, not just the first.
pub fn interpolate(input: &str) -> InterpolationResult {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate using an arbitrary variable lookup.
pub(crate) fn interpolate_with<F>(input: &str, lookup: F) -> InterpolationResult
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = PLACEHOLDER
        .replace_all(input, |caps: &Captures| {
            let Some(name) = caps.name("name") else {
                return "$".to_string();
            };
            let name = name.as_str();
            let fallback = caps.name("fallback").map(|m| m.as_str());

            match (lookup(name), fallback) {
                (Some(value), _) if value.contains(['\n', '\r']) => {
                    errors.push(format!("environment variable '{name}' contains a newline"));
                    String::new()
                }
                (Some(value), Some(fallback)) if value.is_empty() => fallback.to_string(),
                (Some(value), _) => value,
                (None, Some(fallback)) => fallback.to_string(),
                (None, None) => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    String::new()
                }
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}
