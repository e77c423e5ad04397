use std::fmt;

use serde::Serialize;

/// The family of embedding backends a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// ONNX sentence-transformer style models (FastEmbed, TEI, LM Studio).
    FastEmbed,
    /// OpenAI hosted embedding models.
    OpenAi,
}

impl Provider {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FastEmbed => "fastembed",
            Self::OpenAi => "openai",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An embedding model known to the registry.
///
/// Descriptors are compiled into the process and never change at runtime;
/// `width` is the exact length of every vector the model produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ModelDescriptor {
    pub name: &'static str,
    pub width: usize,
    pub provider: Provider,
    pub description: &'static str,
}

impl ModelDescriptor {
    #[must_use]
    pub const fn new(
        name: &'static str,
        width: usize,
        provider: Provider,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            width,
            provider,
            description,
        }
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}d, {})", self.name, self.width, self.provider)
    }
}
