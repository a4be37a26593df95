//! Declared protocols and what each can do.

use crate::stages::StageKind;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const CAPABILITY_INPUT_STAGING: &str = "input_staging";
pub const CAPABILITY_STEP_SEQUENCE: &str = "step_sequence";
pub const CAPABILITY_OUTPUT_REGISTRATION: &str = "output_registration";
/// Outputs can be opened in the vesicle viewer.
pub const CAPABILITY_VIEWER: &str = "viewer";

const KNOWN_CAPABILITIES: &[&str] = &[
    CAPABILITY_INPUT_STAGING,
    CAPABILITY_STEP_SEQUENCE,
    CAPABILITY_OUTPUT_REGISTRATION,
    CAPABILITY_VIEWER,
];

/// Declaration of one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolManifest {
    /// Dotted lowercase id, e.g. `pyseg.graphs`.
    pub id: String,
    pub label: String,
    pub capabilities: Vec<String>,
}

impl ProtocolManifest {
    /// Manifest of a built-in stage.
    pub fn for_stage(kind: StageKind) -> Self {
        let mut capabilities = vec![
            CAPABILITY_INPUT_STAGING,
            CAPABILITY_STEP_SEQUENCE,
            CAPABILITY_OUTPUT_REGISTRATION,
        ];
        if matches!(kind, StageKind::Graphs | StageKind::Fils | StageKind::Picking) {
            capabilities.push(CAPABILITY_VIEWER);
        }
        Self {
            id: kind.id().to_string(),
            label: kind.label().to_string(),
            capabilities: capabilities.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ManifestError::EmptyId);
        }
        if !is_dotted_id(id) {
            return Err(ManifestError::InvalidId(self.id.clone()));
        }
        if self.label.trim().is_empty() {
            return Err(ManifestError::EmptyLabel);
        }
        if self.capabilities.is_empty() {
            return Err(ManifestError::NoCapabilities);
        }

        let mut seen = BTreeSet::new();
        for capability in &self.capabilities {
            let capability = capability.trim();
            if !KNOWN_CAPABILITIES.contains(&capability) {
                return Err(ManifestError::UnknownCapability(capability.to_string()));
            }
            if !seen.insert(capability) {
                return Err(ManifestError::DuplicateCapability(capability.to_string()));
            }
        }
        Ok(())
    }
}

/// Lowercase ASCII segments joined by single `.`, `_` or `-`.
fn is_dotted_id(value: &str) -> bool {
    let starts_ok = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let ends_ok = !value.ends_with(['.', '_', '-']);
    let chars_ok = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    let no_double_separator = !value
        .as_bytes()
        .windows(2)
        .any(|pair| pair.iter().all(|b| matches!(b, b'.' | b'_' | b'-')));
    starts_ok && ends_ok && chars_ok && no_double_separator
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    EmptyId,
    InvalidId(String),
    EmptyLabel,
    NoCapabilities,
    UnknownCapability(String),
    DuplicateCapability(String),
    DuplicateProtocol(String),
}

impl Display for ManifestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => f.write_str("protocol id must not be empty"),
            Self::InvalidId(id) => write!(f, "protocol id is invalid: {id}"),
            Self::EmptyLabel => f.write_str("protocol label must not be empty"),
            Self::NoCapabilities => f.write_str("protocol declares no capabilities"),
            Self::UnknownCapability(value) => write!(f, "unknown capability: {value}"),
            Self::DuplicateCapability(value) => write!(f, "capability listed twice: {value}"),
            Self::DuplicateProtocol(id) => write!(f, "protocol already registered: {id}"),
        }
    }
}

impl Error for ManifestError {}

/// In-process index of protocol manifests.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    manifests: BTreeMap<String, ProtocolManifest>,
    by_capability: BTreeMap<String, BTreeSet<String>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in stage.
    pub fn builtin() -> Result<Self, ManifestError> {
        let mut registry = Self::new();
        for kind in StageKind::ALL {
            registry.register(ProtocolManifest::for_stage(kind))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, manifest: ProtocolManifest) -> Result<(), ManifestError> {
        manifest.validate()?;
        if self.manifests.contains_key(&manifest.id) {
            return Err(ManifestError::DuplicateProtocol(manifest.id));
        }
        for capability in &manifest.capabilities {
            self.by_capability
                .entry(capability.trim().to_string())
                .or_default()
                .insert(manifest.id.clone());
        }
        self.manifests.insert(manifest.id.clone(), manifest);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ProtocolManifest> {
        self.manifests.get(id)
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Manifests in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ProtocolManifest> {
        self.manifests.values()
    }

    pub fn with_capability(&self, capability: &str) -> Vec<&ProtocolManifest> {
        self.by_capability
            .get(capability)
            .map(|ids| ids.iter().filter_map(|id| self.manifests.get(id)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{ManifestError, ProtocolManifest, ProtocolRegistry, CAPABILITY_VIEWER};
    use crate::stages::StageKind;

    #[test]
    fn builtin_registry_indexes_viewer_protocols() {
        let registry = ProtocolRegistry::builtin().expect("built-in manifests are valid");
        assert_eq!(registry.len(), 5);
        let ids: Vec<_> = registry
            .with_capability(CAPABILITY_VIEWER)
            .into_iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["pyseg.fils", "pyseg.graphs", "pyseg.picking"]);
    }

    #[test]
    fn rejects_duplicates_and_bad_ids() {
        let mut registry = ProtocolRegistry::new();
        registry
            .register(ProtocolManifest::for_stage(StageKind::Preseg))
            .expect("first registration");
        assert_eq!(
            registry.register(ProtocolManifest::for_stage(StageKind::Preseg)),
            Err(ManifestError::DuplicateProtocol("pyseg.preseg".to_string()))
        );

        let mut bad = ProtocolManifest::for_stage(StageKind::Fils);
        bad.id = "PySeg..fils".to_string();
        assert!(matches!(bad.validate(), Err(ManifestError::InvalidId(_))));
    }

    #[test]
    fn rejects_unknown_and_repeated_capabilities() {
        let mut manifest = ProtocolManifest::for_stage(StageKind::Gfp);
        manifest.capabilities.push("teleport".to_string());
        assert_eq!(
            manifest.validate(),
            Err(ManifestError::UnknownCapability("teleport".to_string()))
        );

        let mut manifest = ProtocolManifest::for_stage(StageKind::Gfp);
        manifest.capabilities.push("step_sequence".to_string());
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::DuplicateCapability(_))
        ));
    }
}
