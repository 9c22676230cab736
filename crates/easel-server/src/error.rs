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

/// Map a settings path such as `provider.api_key` to the variable that sets
/// it. Bare field names belong to the provider section.
pub fn to_env_var(field_path: &str) -> String {
    let path = if field_path.contains('.') {
        field_path.to_string()
    } else {
        format!("provider.{}", field_path)
    };
    format!("EASEL_{}", path.replace('.', "__").to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("api_key"), "EASEL_PROVIDER__API_KEY");
        assert_eq!(to_env_var("type"), "EASEL_PROVIDER__TYPE");
        assert_eq!(to_env_var("server.port"), "EASEL_SERVER__PORT");
    }
}
