use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Default configuration directory, relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Environment variable that overrides [`CONFIGURATION_DIR`].
const CONFIGURATION_DIR_ENV_NAME: &str = "APP_CONFIGURATION_DIR";

const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested keys, e.g. `APP_MERGE__RANGE_COUNT`.
const ENV_SEPARATOR: &str = "__";

const LIST_SEPARATOR: &str = ",";

/// Implemented by top-level configuration structures.
pub trait Config {
    /// Keys whose environment values are parsed as comma separated lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

#[derive(Debug, Clone, Copy)]
enum ConfigFileKind {
    Base,
    Environment(Environment),
}

impl ConfigFileKind {
    fn stem(&self) -> &'static str {
        match self {
            ConfigFileKind::Base => "base",
            ConfigFileKind::Environment(env) => env.as_str(),
        }
    }
}

impl fmt::Display for ConfigFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFileKind::Base => f.write_str("base configuration"),
            ConfigFileKind::Environment(env) => write!(f, "{env} environment configuration"),
        }
    }
}

/// Errors raised while locating, merging or deserializing configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not locate {kind_description} in `{directory}`; attempted: {attempted}")]
    ConfigurationFileMissing {
        kind_description: String,
        directory: PathBuf,
        attempted: String,
    },

    #[error("failed to load {kind_description} from `{path}`: {source}")]
    ConfigurationFileLoad {
        kind_description: String,
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("failed to build configuration: {0}")]
    Builder(#[source] rust_cli_config::ConfigError),
}

/// Loads configuration for the current environment.
///
/// The directory is `APP_CONFIGURATION_DIR` when set, otherwise `./configuration`.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let directory = match std::env::var(CONFIGURATION_DIR_ENV_NAME) {
        Ok(directory) => PathBuf::from(directory),
        Err(_) => std::env::current_dir()
            .map_err(LoadConfigError::CurrentDir)?
            .join(CONFIGURATION_DIR),
    };
    let environment = Environment::load()?;

    load_config_from(&directory, environment)
}

/// Loads `base.*` and `{environment}.*` from `directory`, then applies `APP_` overrides.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            directory.to_path_buf(),
        ));
    }

    let mut builder = rust_cli_config::Config::builder();
    for kind in [ConfigFileKind::Base, ConfigFileKind::Environment(environment)] {
        builder = add_file(builder, directory, kind)?;
    }

    builder
        .add_source(environment_variables::<T>())
        .build()
        .map_err(LoadConfigError::Builder)?
        .try_deserialize()
        .map_err(LoadConfigError::Deserialization)
}

fn environment_variables<T: Config>() -> rust_cli_config::Environment {
    let source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true);

    if T::LIST_PARSE_KEYS.is_empty() {
        return source;
    }

    T::LIST_PARSE_KEYS
        .iter()
        .fold(source.list_separator(LIST_SEPARATOR), |source, key| {
            source.with_list_parse_key(key)
        })
}

/// Adds the first existing `{stem}.{extension}` file of `kind` to `builder`.
///
/// The sources collected so far are built once more, so a malformed file is reported by path
/// instead of surfacing later as an anonymous build error.
fn add_file(
    builder: ConfigBuilder<DefaultState>,
    directory: &Path,
    kind: ConfigFileKind,
) -> Result<ConfigBuilder<DefaultState>, LoadConfigError> {
    let mut attempted = Vec::with_capacity(CONFIG_FILE_EXTENSIONS.len());
    for extension in CONFIG_FILE_EXTENSIONS {
        let path = directory.join(format!("{}.{extension}", kind.stem()));
        if !path.is_file() {
            attempted.push(format!("`{}`", path.display()));
            continue;
        }

        let builder = builder.add_source(rust_cli_config::File::from(path.as_path()));
        if let Err(source) = builder.build_cloned() {
            return Err(LoadConfigError::ConfigurationFileLoad {
                kind_description: kind.to_string(),
                path,
                source,
            });
        }

        return Ok(builder);
    }

    Err(LoadConfigError::ConfigurationFileMissing {
        kind_description: kind.to_string(),
        directory: directory.to_path_buf(),
        attempted: attempted.join(", "),
    })
}
