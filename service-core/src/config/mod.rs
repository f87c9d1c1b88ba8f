use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::de::DeserializeOwned;

/// Load a typed configuration from an optional file plus prefixed environment
/// variables. Environment keys use `__` to separate nested sections, so
/// `SHARE__PLEX__API_BASE_URL` lands in `plex.api_base_url`. Keys named in
/// `list_keys` are split on commas.
pub fn load<T: DeserializeOwned>(
    file_name: &str,
    env_prefix: &str,
    list_keys: &[&str],
) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let mut environment = Environment::with_prefix(env_prefix)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true);
    if !list_keys.is_empty() {
        environment = environment.list_separator(",");
        for key in list_keys {
            environment = environment.with_list_parse_key(key);
        }
    }

    let config = Cfg::builder()
        .add_source(File::with_name(file_name).required(false))
        .add_source(environment)
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default = "default_port")]
        port: u16,
    }

    fn default_port() -> u16 {
        8080
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let sample: Sample = load("does-not-exist", "SERVICE_CORE_TEST", &[]).unwrap();
        assert_eq!(sample.port, 8080);
    }
}
