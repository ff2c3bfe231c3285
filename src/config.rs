use anyhow::{bail, Context};
use once_cell::sync::OnceCell;

pub const CLOUD_NAME_VAR: &str = "CLOUDINARY_CLOUD_NAME";
pub const API_KEY_VAR: &str = "CLOUDINARY_API_KEY";
pub const UPLOAD_PRESET_VAR: &str = "CLOUDINARY_UPLOAD_PRESET";
pub const FOLDER_VAR: &str = "CLOUDINARY_FOLDER";
pub const MAPBOX_ACCESS_TOKEN_VAR: &str = "MAPBOX_ACCESS_TOKEN";
pub const MAPBOX_DOWNLOAD_TOKEN_VAR: &str = "MAPBOX_DOWNLOAD_TOKEN";

/// Every variable that has to be present, in the order they are checked
pub const REQUIRED_VARS: [&str; 6] = [
    CLOUD_NAME_VAR,
    API_KEY_VAR,
    UPLOAD_PRESET_VAR,
    FOLDER_VAR,
    MAPBOX_ACCESS_TOKEN_VAR,
    MAPBOX_DOWNLOAD_TOKEN_VAR,
];

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

/// Settings of the image host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub upload_preset: String,
    /// Base path, under which all uploaded images are placed
    pub folder: String,
}

/// Tokens of the mapping service. Only carried, nothing in this crate calls the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapboxConfig {
    pub access_token: String,
    pub download_token: String,
}

/// The process configuration, read from the environment. \
/// There are no defaults: every variable in [`REQUIRED_VARS`] has to be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub cloudinary: CloudinaryConfig,
    pub mapbox: MapboxConfig,
}

impl Config {

    /// Reads the configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value. \
    /// Fails on the first variable that is absent or empty, naming it in the error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let require = |name: &str| -> anyhow::Result<String> {
            match lookup(name) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => bail!("Missing required environment variable: {}", name),
            }
        };
        Ok(Self {
            cloudinary: CloudinaryConfig {
                cloud_name: require(CLOUD_NAME_VAR)?,
                api_key: require(API_KEY_VAR)?,
                upload_preset: require(UPLOAD_PRESET_VAR)?,
                folder: require(FOLDER_VAR)?,
            },
            mapbox: MapboxConfig {
                access_token: require(MAPBOX_ACCESS_TOKEN_VAR)?,
                download_token: require(MAPBOX_DOWNLOAD_TOKEN_VAR)?,
            },
        })
    }

    /// Loads the process wide configuration. Call this once at startup, so a missing variable stops the program right away. \
    /// Calling it again returns the already loaded configuration.
    pub fn init() -> anyhow::Result<&'static Config> {
        GLOBAL_CONFIG.get_or_try_init(Self::from_env)
            .context("Could not load configuration")
    }

    /// The configuration loaded by [`Config::init()`], if it was loaded
    pub fn get() -> Option<&'static Config> {
        GLOBAL_CONFIG.get()
    }

}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use super::*;

    fn full_env() -> HashMap<&'static str, String> {
        REQUIRED_VARS.iter()
            .map(|name| (*name, format!("{}-value", name.to_lowercase())))
            .collect()
    }

    #[test]
    fn test_load_complete() {
        let env = full_env();
        let config = Config::from_lookup(|name| env.get(name).cloned()).unwrap();
        assert_eq!(config.cloudinary.cloud_name, "cloudinary_cloud_name-value");
        assert_eq!(config.cloudinary.upload_preset, "cloudinary_upload_preset-value");
        assert_eq!(config.cloudinary.folder, "cloudinary_folder-value");
        assert_eq!(config.mapbox.download_token, "mapbox_download_token-value");
    }

    #[test]
    fn test_missing_variable_is_named() {
        for missing in REQUIRED_VARS {
            let mut env = full_env();
            env.remove(missing);
            let err = Config::from_lookup(|name| env.get(name).cloned()).unwrap_err();
            assert!(err.to_string().contains(missing), "{} not named in: {}", missing, err);
        }
    }

    #[test]
    fn test_empty_variable_counts_as_missing() {
        let mut env = full_env();
        env.insert(UPLOAD_PRESET_VAR, String::new());
        let err = Config::from_lookup(|name| env.get(name).cloned()).unwrap_err();
        assert_eq!(err.to_string(), "Missing required environment variable: CLOUDINARY_UPLOAD_PRESET");
    }

    #[test]
    fn test_first_missing_wins() {
        let err = Config::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains(CLOUD_NAME_VAR));
    }
}
