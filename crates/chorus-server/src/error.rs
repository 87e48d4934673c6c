use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Environment variable that sets a dotted settings path, e.g.
/// `backends.openai.api_key` -> `CHORUS_BACKENDS__OPENAI__API_KEY`
pub fn to_env_var(field_path: &str) -> String {
    format!("CHORUS_{}", field_path.replace('.', "__").to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("backends.openai.api_key"), "CHORUS_BACKENDS__OPENAI__API_KEY");
        assert_eq!(to_env_var("system_prompt"), "CHORUS_SYSTEM_PROMPT");
    }

    #[test]
    fn test_missing_env_var_message() {
        let err = ConfigError::MissingEnvVar {
            env_var: to_env_var("backends.anthropic.api_key"),
        };
        assert_eq!(
            err.to_string(),
            "Missing required environment variable: CHORUS_BACKENDS__ANTHROPIC__API_KEY"
        );
    }
}
