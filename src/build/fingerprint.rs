//! Layer fingerprints
//!
//! A fingerprint is the SHA256 of a step's kind, its normalized declared
//! inputs, and the parent layer's fingerprint. Every field is written
//! length-prefixed so distinct tuples never serialize to the same bytes.

use crate::build::step::StepKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Bumped whenever the hashed encoding changes
const ENCODING_VERSION: &[u8] = b"strata-layer-v1";

/// Length of the abbreviated form shown in build logs
pub const SHORT_LEN: usize = 12;

/// Content-derived identifier of a layer (64 lowercase hex chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a full hex fingerprint
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    /// Full hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display
    pub fn short(&self) -> &str {
        &self.0[..SHORT_LEN.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A declared input after resolution to content identifiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResolvedInput {
    /// Base image tag
    Image { tag: String },

    /// File from the build context, identified by its content
    File {
        path: String,
        digest: String,
        size_bytes: u64,
    },

    /// Path copied out of a built stage, identified by the stage's final layer
    StageFile { from: Fingerprint, path: String },

    /// Shell command string
    Command { command: String },

    /// Metadata key-value pair
    Label { key: String, value: String },
}

impl ResolvedInput {
    fn write_to(&self, hasher: &mut Sha256) {
        match self {
            Self::Image { tag } => {
                field(hasher, b"image");
                field(hasher, tag.as_bytes());
            }
            Self::File {
                path,
                digest,
                size_bytes,
            } => {
                field(hasher, b"file");
                field(hasher, path.as_bytes());
                field(hasher, digest.as_bytes());
                field(hasher, &size_bytes.to_le_bytes());
            }
            Self::StageFile { from, path } => {
                field(hasher, b"stage-file");
                field(hasher, from.as_str().as_bytes());
                field(hasher, path.as_bytes());
            }
            Self::Command { command } => {
                field(hasher, b"command");
                field(hasher, command.as_bytes());
            }
            Self::Label { key, value } => {
                field(hasher, b"label");
                field(hasher, key.as_bytes());
                field(hasher, value.as_bytes());
            }
        }
    }
}

fn field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Sort and deduplicate one step's inputs.
///
/// Order within a step is not significant; order between steps is.
pub fn normalize(mut inputs: Vec<ResolvedInput>) -> Vec<ResolvedInput> {
    inputs.sort();
    inputs.dedup();
    inputs
}

/// Compute the fingerprint of a step on top of `parent`.
///
/// `inputs` must already be normalized.
pub fn compute(
    kind: StepKind,
    inputs: &[ResolvedInput],
    parent: Option<&Fingerprint>,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    field(&mut hasher, ENCODING_VERSION);
    field(&mut hasher, kind.as_str().as_bytes());

    match parent {
        Some(fp) => field(&mut hasher, fp.as_str().as_bytes()),
        None => field(&mut hasher, b""),
    }

    hasher.update((inputs.len() as u64).to_le_bytes());
    for input in inputs {
        input.write_to(&mut hasher);
    }

    Fingerprint(hex::encode(hasher.finalize()))
}
