use crate::core::pipeline::RunConfig;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable \"{key}\"\n\tMessage: {message}")]
    Missing { key: String, message: String },
    #[error("Could not parse environment variable: {key}\n\tGot: {value}\n\tMessage: {message}")]
    Invalid {
        key: String,
        value: String,
        message: String,
    },
    #[error("Could not load parameter file {path:?}\n\tMessage: {message}")]
    Params { path: PathBuf, message: String },
}

pub trait Var {
    const NAME: &'static str;
    type Type;

    fn from_env() -> Result<Self::Type, ConfigError>;
}

/// JSON parameter file of the run
pub struct ParamsFile;
/// Overrides `cnn.checkpoint_path` of the parameter file
pub struct CheckpointRoot;
pub struct LogLevel;

fn read(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: String::new(),
            message: err.to_string(),
        }),
    }
}

fn parse_level(key: &str, value: String) -> Result<Level, ConfigError> {
    Level::from_str(&value).map_err(|err| ConfigError::Invalid {
        key: key.to_string(),
        value,
        message: err.to_string(),
    })
}

impl Var for ParamsFile {
    const NAME: &'static str = "FUSION_PARAMS";
    type Type = PathBuf;

    fn from_env() -> Result<PathBuf, ConfigError> {
        let path = std::env::var(Self::NAME).map_err(|err| ConfigError::Missing {
            key: Self::NAME.to_string(),
            message: err.to_string(),
        })?;
        Ok(PathBuf::from(path))
    }
}

impl Var for CheckpointRoot {
    const NAME: &str = "FUSION_CHECKPOINT_ROOT";
    type Type = Option<PathBuf>;

    fn from_env() -> Result<Self::Type, ConfigError> {
        Ok(read(Self::NAME)?.map(PathBuf::from))
    }
}

impl Var for LogLevel {
    const NAME: &str = "FUSION_LOG_LEVEL";
    type Type = Level;

    fn from_env() -> Result<Self::Type, ConfigError> {
        match read(Self::NAME)? {
            Some(value) => parse_level(Self::NAME, value),
            None => Ok(Level::INFO),
        }
    }
}

/// Where the run parameters come from and how they are overridden.
#[derive(Clone, Debug)]
pub struct Settings {
    pub params: PathBuf,
    pub checkpoint_root: Option<PathBuf>,
}

impl Settings {
    /// Reads the environment. `params` from the command line wins over `FUSION_PARAMS`.
    pub fn from_env(params: Option<PathBuf>) -> Result<Self, ConfigError> {
        let params = match params {
            Some(path) => path,
            None => ParamsFile::from_env()?,
        };
        let checkpoint_root = CheckpointRoot::from_env()?;

        tracing::info!(
            message = "Configuration loaded",
            params = ?params,
            checkpoint_root = ?checkpoint_root,
        );

        Ok(Self {
            params,
            checkpoint_root,
        })
    }

    /// Loads the parameter file and applies the overrides.
    pub fn run_config(&self) -> Result<RunConfig, ConfigError> {
        let mut config = RunConfig::load(&self.params).map_err(|err| ConfigError::Params {
            path: self.params.clone(),
            message: err.to_string(),
        })?;
        if let Some(root) = &self.checkpoint_root {
            config.cnn.checkpoint_path = root.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ingestion::{DataPaths, VolumeShape};
    use crate::core::train_config::TrainConfig;
    use tempfile::TempDir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("K", "debug".to_string()).unwrap(), Level::DEBUG);
        assert!(matches!(
            parse_level("K", "loud".to_string()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_checkpoint_root_overrides_params() {
        let dir = TempDir::new().unwrap();
        let params = dir.path().join("params.json");
        let config = RunConfig {
            cnn: TrainConfig::new(
                2,
                VolumeShape::new(8, 8, 8, 1),
                1e-3,
                1,
                2,
                vec!["CBF".to_string()],
                "/data/checkpoints",
            )
            .unwrap(),
            data: DataPaths {
                class_labels: "labels.csv".into(),
                splits: "splits.csv".into(),
                modalities: Vec::new(),
            },
        };
        config.save(&params).unwrap();

        let settings = Settings {
            params: params.clone(),
            checkpoint_root: Some(dir.path().join("ckpt")),
        };

        assert_eq!(
            settings.run_config().unwrap().cnn.checkpoint_path,
            dir.path().join("ckpt")
        );
    }

    #[test]
    fn test_missing_params_file() {
        let settings = Settings {
            params: "/nonexistent/params.json".into(),
            checkpoint_root: None,
        };

        assert!(matches!(settings.run_config(), Err(ConfigError::Params { .. })));
    }
}
