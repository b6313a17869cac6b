//! Model registry and inference dispatch.
//!
//! One `ModelEntry` per cancer type is loaded at startup into an immutable
//! `ModelRegistry`; a `Dispatcher` borrows it (behind an `Arc`) to serve
//! predictions from any number of threads.

pub mod checkpoint;
pub mod dispatch;
pub mod entry;
pub mod network;
pub mod registry;
pub mod tensor;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

pub use checkpoint::{InputSize, Normalization};
pub use dispatch::{DeviceGate, Dispatcher, Health, Prediction};
pub use entry::{BrainInfo, ModelEntry, ModelInfo, ModelVariant};
pub use network::{Network, NetworkLoader};
pub use registry::{ModelRegistry, RegistryBuilder};

/// The three supported classification targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CancerKind {
    Brain,
    Lung,
    Skin,
}

impl CancerKind {
    pub const ALL: [CancerKind; 3] = [CancerKind::Brain, CancerKind::Lung, CancerKind::Skin];

    pub fn as_str(&self) -> &'static str {
        match self {
            CancerKind::Brain => "brain",
            CancerKind::Lung => "lung",
            CancerKind::Skin => "skin",
        }
    }

    /// Label reported back in predictions.
    pub fn display_name(&self) -> &'static str {
        match self {
            CancerKind::Brain => "Brain Tumor",
            CancerKind::Lung => "Lung Cancer",
            CancerKind::Skin => "Skin Cancer",
        }
    }

    /// Resize target used when a checkpoint lists an empty `input_size`.
    pub fn default_input_size(&self) -> u32 {
        match self {
            CancerKind::Brain | CancerKind::Lung => 224,
            CancerKind::Skin => 128,
        }
    }
}

impl fmt::Display for CancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "brain" => Ok(CancerKind::Brain),
            "lung" => Ok(CancerKind::Lung),
            "skin" => Ok(CancerKind::Skin),
            other => Err(format!(
                "invalid cancer type '{}', must be: brain, lung, or skin",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Brain".parse::<CancerKind>(), Ok(CancerKind::Brain));
        assert_eq!(" lung ".parse::<CancerKind>(), Ok(CancerKind::Lung));
        assert!("liver".parse::<CancerKind>().is_err());
    }

    #[test]
    fn serializes_as_lowercase_tag() {
        assert_eq!(serde_json::to_string(&CancerKind::Skin).unwrap(), "\"skin\"");
        assert_eq!(CancerKind::Skin.display_name(), "Skin Cancer");
    }
}
