//! Common helper functions for Duet.

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Non-empty, trimmed value of an environment variable.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_true_values() {
        std::env::set_var("DUET_TEST_ENV_TRUE", "true");
        assert!(env_bool("DUET_TEST_ENV_TRUE", false));

        std::env::set_var("DUET_TEST_ENV_ON", " ON ");
        assert!(env_bool("DUET_TEST_ENV_ON", false));
    }

    #[test]
    fn test_env_bool_false_and_missing() {
        std::env::set_var("DUET_TEST_ENV_FALSE", "nope");
        assert!(!env_bool("DUET_TEST_ENV_FALSE", true));
        assert!(env_bool("DUET_TEST_ENV_MISSING", true));
    }

    #[test]
    fn test_env_string_ignores_blank() {
        std::env::set_var("DUET_TEST_ENV_BLANK", "   ");
        assert_eq!(env_string("DUET_TEST_ENV_BLANK"), None);

        std::env::set_var("DUET_TEST_ENV_URL", " ws://relay:8080 ");
        assert_eq!(
            env_string("DUET_TEST_ENV_URL").as_deref(),
            Some("ws://relay:8080")
        );
    }
}
