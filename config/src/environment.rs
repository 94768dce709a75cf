use std::fmt;
use std::io;
use std::str::FromStr;

/// Variable selecting the runtime environment. Unset means [`Environment::Dev`].
const APP_ENVIRONMENT_ENV_NAME: &str = "APP_ENVIRONMENT";

/// Runtime environment of a reindex process.
///
/// Picks the `configuration/{environment}.*` file and whether logs are emitted as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    pub fn load() -> io::Result<Environment> {
        match std::env::var(APP_ENVIRONMENT_ENV_NAME) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Environment::Dev),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }

    pub fn is_prod(&self) -> bool {
        *self == Environment::Prod
    }
}

impl FromStr for Environment {
    type Err = io::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [Environment::Dev, Environment::Prod]
            .into_iter()
            .find(|environment| value.eq_ignore_ascii_case(environment.as_str()))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown environment `{value}`, expected `dev` or `prod`"),
                )
            })
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
