//! Immutable per-container run context.

use serde::{Deserialize, Serialize};

use crate::annotation::{ContainerId, TagDescriptor};

/// Default review tag when tag mode is requested without a name.
pub const DEFAULT_TAG_NAME: &str = "need validation";

/// How invalid objects are handled. Run-wide; modes never mix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RunMode {
    /// Attach the review tag to invalid objects and their images.
    Tag { tag: TagDescriptor },
    /// Replace invalid geometries with corrected ones.
    Correct,
    /// Drop invalid objects and upload the cleaned annotations.
    Remove,
}

impl RunMode {
    /// Tag mode; an empty name falls back to [`DEFAULT_TAG_NAME`].
    pub fn tag(name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.trim().is_empty() {
            DEFAULT_TAG_NAME.to_string()
        } else {
            name
        };
        RunMode::Tag {
            tag: TagDescriptor::new(name),
        }
    }

    pub fn tag_descriptor(&self) -> Option<&TagDescriptor> {
        match self {
            RunMode::Tag { tag } => Some(tag),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Tag { .. } => "tag",
            RunMode::Correct => "correct",
            RunMode::Remove => "remove",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Tag { tag } => write!(f, "tag({})", tag.name),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Identifiers and mode of one container's run, passed by value down the
/// tree walk and into every task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    pub source_container: ContainerId,
    pub destination_container: ContainerId,
    pub container_name: String,
    pub mode: RunMode,
}

impl PipelineRun {
    pub fn new(
        source_container: ContainerId,
        destination_container: ContainerId,
        container_name: impl Into<String>,
        mode: RunMode,
    ) -> Self {
        Self {
            source_container,
            destination_container,
            container_name: container_name.into(),
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_mode_default_name() {
        let mode = RunMode::tag("  ");
        assert_eq!(mode.tag_descriptor().unwrap().name, DEFAULT_TAG_NAME);

        let mode = RunMode::tag("Invalid Annotation");
        assert_eq!(mode.tag_descriptor().unwrap().name, "Invalid Annotation");
        assert_eq!(mode.to_string(), "tag(Invalid Annotation)");
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(RunMode::Correct.name(), "correct");
        assert_eq!(RunMode::Remove.to_string(), "remove");
        assert!(RunMode::Correct.tag_descriptor().is_none());
    }
}
