use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A similarity metric supported by the backing vector store.
///
/// Serialized with the backing store's own spelling (`"Cosine"`, `"Dot"`,
/// `"Euclid"`, `"Manhattan"`) so the value can go straight into a
/// collection definition. The lowercase configuration spellings are
/// accepted when deserializing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distance {
    #[default]
    #[serde(alias = "cosine")]
    Cosine,
    #[serde(alias = "dot")]
    Dot,
    #[serde(alias = "euclid", alias = "euclidean")]
    Euclid,
    #[serde(alias = "manhattan")]
    Manhattan,
}

impl Distance {
    /// All supported metrics, in declaration order.
    pub const ALL: [Self; 4] = [Self::Cosine, Self::Dot, Self::Euclid, Self::Manhattan];

    /// Lowercase name used in configuration files and on the command line.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Dot => "dot",
            Self::Euclid => "euclid",
            Self::Manhattan => "manhattan",
        }
    }

    /// Whether a higher score means a closer match for this metric.
    #[must_use]
    pub const fn higher_is_closer(&self) -> bool {
        matches!(self, Self::Cosine | Self::Dot)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "dot" | "dot_product" | "dotproduct" => Ok(Self::Dot),
            "euclid" | "euclidean" => Ok(Self::Euclid),
            "manhattan" => Ok(Self::Manhattan),
            other => Err(Error::InvalidData(format!(
                "unknown distance metric '{other}' (expected cosine, dot, euclid or manhattan)"
            ))),
        }
    }
}
