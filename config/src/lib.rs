//! Configuration types and loading for the reindex pipeline.
//!
//! Configuration is layered from `configuration/base.*`, `configuration/{environment}.*`
//! and `APP_`-prefixed environment variables. See [`load_config`].

use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod environment;
mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config};

/// A [`SecretString`] that can travel through serde.
///
/// Debug output stays redacted. Serialization exposes the secret, so only serialize it into
/// destinations that are themselves trusted (for example, generated configuration files).
#[derive(Clone, Debug)]
pub struct SerializableSecretString(SecretString);

impl ExposeSecret<String> for SerializableSecretString {
    fn expose_secret(&self) -> &String {
        self.0.expose_secret()
    }
}

impl From<String> for SerializableSecretString {
    fn from(value: String) -> Self {
        Self(Secret::new(value))
    }
}

impl Serialize for SerializableSecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.0.expose_secret())
    }
}

impl<'de> Deserialize<'de> for SerializableSecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;

        Ok(Self::from(value))
    }
}
