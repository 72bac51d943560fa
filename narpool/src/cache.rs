//! Binary caches.
//!
//! ## Cache Naming
//!
//! Cache names can be up to 50 characters long and can only consist of
//! ASCII alphanumeric characters (A-Za-z0-9), dashes ('-'), underscores
//! ('_'), and plus signs ('+'). They must also start with an alphanumeric
//! character (e.g., "_cache" is _not_ a valid cache name).

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};

use crate::error::{NarpoolError, NarpoolResult};

/// The maximum allowable length of a cache name.
pub const MAX_NAME_LENGTH: usize = 50;

lazy_static! {
    static ref CACHE_NAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-_+]{0,49}$").unwrap();
}

/// The name of a binary cache.
///
/// Names can only consist of ASCII alphanumeric characters (A-Za-z0-9),
/// dashes ('-'), underscores ('_'), and plus signs ('+').
#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq)]
#[serde(transparent)]
pub struct CacheName(#[serde(deserialize_with = "CacheName::deserialize")] String);

impl CacheName {
    /// Creates a cache name from a String.
    pub fn new(name: String) -> NarpoolResult<Self> {
        validate_cache_name(&name)?;
        Ok(Self(name))
    }

    /// Returns the string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deserializes a potentially-invalid cache name.
    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer).and_then(|s| {
            validate_cache_name(&s).map_err(|e| Error::custom(e.to_string()))?;
            Ok(s)
        })
    }
}

impl FromStr for CacheName {
    type Err = NarpoolError;

    fn from_str(name: &str) -> NarpoolResult<Self> {
        Self::new(name.to_owned())
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_cache_name(name: &str) -> NarpoolResult<()> {
    if CACHE_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(NarpoolError::InvalidCacheName {
            name: name.to_owned(),
        })
    }
}
