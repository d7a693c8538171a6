use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Reads and parses an environment variable, falling back to `default` when the
/// variable is unset or cannot be parsed.
pub fn get_env_var_or<T>(var: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring invalid value '{}' for {}: {} (using {})", raw, var, e, default);
                default
            }
        },
        _ => default,
    }
}

/// Reads an optional, non-empty string variable.
pub fn get_env_var_opt(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Reads a duration expressed in milliseconds.
pub fn get_env_var_millis(var: &str, default: Duration) -> Duration {
    Duration::from_millis(get_env_var_or(var, default.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_var_uses_default() {
        assert_eq!(get_env_var_or("ANNALIST_TEST_SURELY_UNSET", 0.65_f64), 0.65);
        assert_eq!(get_env_var_opt("ANNALIST_TEST_SURELY_UNSET"), None);
    }

    #[test]
    fn test_invalid_value_uses_default() {
        env::set_var("ANNALIST_TEST_BAD_NUMBER", "not-a-number");
        assert_eq!(get_env_var_or("ANNALIST_TEST_BAD_NUMBER", 4_u32), 4);
        env::remove_var("ANNALIST_TEST_BAD_NUMBER");
    }
}
