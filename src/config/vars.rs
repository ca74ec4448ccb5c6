//! Environment variable interpolation for the config file.
//!
//! Supports `$VAR`, `${VAR}`, `${VAR:-default}` and `$$` as an escape for a
//! literal `$`. Missing variables without a default are collected so the
//! user sees every problem at once.

use regex::Regex;
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                             # literal $ escape
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)     # braced variable name
            (?: :- ([^}]*) )?            # optional default value
        \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)       # unbraced variable name
        ",
    )
    .expect("invalid interpolation pattern")
});

/// Interpolate environment variables into `input`.
///
/// Returns the substituted text or the accumulated list of errors.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN.replace_all(input, |caps: &regex::Captures| {
        if &caps[0] == "$$" {
            return "$".to_string();
        }

        let name = caps
            .get(1)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let default = caps.get(2).map(|m| m.as_str());

        match env::var(name) {
            Ok(value) if value.is_empty() && default.is_some() => {
                default.unwrap_or_default().to_string()
            }
            Ok(value) => value,
            Err(_) => match default {
                Some(fallback) => fallback.to_string(),
                None => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    caps[0].to_string()
                }
            },
        }
    });

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let saved: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();
        // SAFETY: tests in this module run serially and restore state below
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }
        let result = f();
        for (key, original) in saved {
            match original {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }
        result
    }

    #[test]
    fn test_substitutes_set_variables() {
        with_env(&[("MQPUMP_TEST_HOST", Some("rabbit.local"))], || {
            assert_eq!(
                interpolate("host: $MQPUMP_TEST_HOST").unwrap(),
                "host: rabbit.local"
            );
            assert_eq!(
                interpolate("host: ${MQPUMP_TEST_HOST}").unwrap(),
                "host: rabbit.local"
            );
        });
    }

    #[test]
    fn test_default_applies_when_unset_or_empty() {
        with_env(
            &[
                ("MQPUMP_TEST_UNSET", None),
                ("MQPUMP_TEST_EMPTY", Some("")),
            ],
            || {
                assert_eq!(
                    interpolate("a: ${MQPUMP_TEST_UNSET:-5672}, b: ${MQPUMP_TEST_EMPTY:-guest}")
                        .unwrap(),
                    "a: 5672, b: guest"
                );
            },
        );
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        with_env(
            &[("MQPUMP_TEST_MISS1", None), ("MQPUMP_TEST_MISS2", None)],
            || {
                let errors =
                    interpolate("a: $MQPUMP_TEST_MISS1, b: $MQPUMP_TEST_MISS2").unwrap_err();
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("MQPUMP_TEST_MISS1"));
            },
        );
    }

    #[test]
    fn test_dollar_escape() {
        assert_eq!(interpolate("cost: $$10").unwrap(), "cost: $10");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(interpolate("no variables here").unwrap(), "no variables here");
    }
}
