use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error(
        "State store is not set. Set it with one of:\n\
        - the --state flag\n\
        - the KOPS_STATE_STORE environment variable\n\
        - state_store in ~/.config/kopsflow/config.yaml"
    )]
    StateStoreNotSet,

    #[error("Invalid feature flag {0:?}")]
    InvalidFeatureFlag(String),

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
