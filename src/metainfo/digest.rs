use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const DIGEST_PREFIX: &str = "sha256:";

/// Content fingerprint in the `sha256:<lowercase hex>` form.
///
/// Digests travel as plain strings, both on the wire and in metadata files, so two digests are
/// equal exactly when their textual forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(bytes))
    }

    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{DIGEST_PREFIX}{}", hex::encode(hasher.finalize())))
    }

    pub fn matches(&self, bytes: impl AsRef<[u8]>) -> bool {
        *self == Self::of(bytes)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Digest {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
