//! # Codec Registry
//!
//! Task payloads are opaque to the core, but they may reference objects the
//! standard encoding cannot carry (database connections, device handles,
//! foreign pointers). Callers register a per-class-tag pair of
//! user-supplied callbacks; at submit time every such reference is
//! serialized out-of-band into the frame's extension table while the main
//! payload keeps only a placeholder the caller's own encoding understands.
//! The receiving side consults the same registry to invert the mapping.
//!
//! When a codec is registered `vectorized`, all occurrences of its class in
//! one task are gathered into a single serializer call, and the
//! deserializer returns the list in the same order.
//!
//! The registry is per-profile and thread-safe; registration never travels
//! on a separate control plane: frames self-describe codecs by tag only,
//! and daemons must already have matching code loaded via sticky setup.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// An opaque reference object as seen by the core: a class tag plus the
/// caller-side bytes describing the referenced object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRef {
    pub class_tag: String,
    pub bytes: Vec<u8>,
}

impl ExternalRef {
    pub fn new(class_tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            class_tag: class_tag.into(),
            bytes,
        }
    }
}

/// User-supplied serializer: all gathered occurrences in, one blob out.
pub type SerializeFn = Arc<dyn Fn(Vec<Vec<u8>>) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// User-supplied deserializer: one blob in, the occurrence list out, in
/// the order the serializer received it.
pub type DeserializeFn = Arc<dyn Fn(Vec<u8>) -> anyhow::Result<Vec<Vec<u8>>> + Send + Sync>;

#[derive(Clone)]
struct Codec {
    serialize: SerializeFn,
    deserialize: DeserializeFn,
    vectorized: bool,
}

/// Codec failures surface at submit/delivery time, scoped to the tag that
/// produced them.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serializer for class {tag:?} failed: {cause}")]
    Serialize { tag: String, cause: anyhow::Error },
    #[error("deserializer for class {tag:?} failed: {cause}")]
    Deserialize { tag: String, cause: anyhow::Error },
}

/// Thread-safe `class_tag → (serialize, deserialize, vectorized)` mapping.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Arc<RwLock<HashMap<String, Codec>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the codec for a class tag.
    pub fn register(
        &self,
        tag: impl Into<String>,
        serialize: SerializeFn,
        deserialize: DeserializeFn,
        vectorized: bool,
    ) {
        self.codecs.write().insert(
            tag.into(),
            Codec {
                serialize,
                deserialize,
                vectorized,
            },
        );
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.codecs.read().contains_key(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.read().is_empty()
    }

    /// Encode external references into extension-table entries.
    ///
    /// Vectorized classes collapse to a single entry at the position of
    /// their first occurrence; everything else maps one entry per
    /// reference, in submission order. Unregistered tags pass through
    /// untouched.
    pub fn encode(&self, refs: &[ExternalRef]) -> Result<Vec<(String, Vec<u8>)>, CodecError> {
        let codecs = self.codecs.read();
        let mut entries = Vec::with_capacity(refs.len());
        let mut gathered: Vec<String> = Vec::new();

        for (i, r) in refs.iter().enumerate() {
            match codecs.get(&r.class_tag) {
                Some(codec) if codec.vectorized => {
                    if gathered.iter().any(|t| t == &r.class_tag) {
                        continue; // already emitted at first occurrence
                    }
                    let occurrences: Vec<Vec<u8>> = refs[i..]
                        .iter()
                        .filter(|other| other.class_tag == r.class_tag)
                        .map(|other| other.bytes.clone())
                        .collect();
                    let blob = (codec.serialize)(occurrences).map_err(|cause| {
                        CodecError::Serialize {
                            tag: r.class_tag.clone(),
                            cause,
                        }
                    })?;
                    gathered.push(r.class_tag.clone());
                    entries.push((r.class_tag.clone(), blob));
                }
                Some(codec) => {
                    let blob = (codec.serialize)(vec![r.bytes.clone()]).map_err(|cause| {
                        CodecError::Serialize {
                            tag: r.class_tag.clone(),
                            cause,
                        }
                    })?;
                    entries.push((r.class_tag.clone(), blob));
                }
                None => entries.push((r.class_tag.clone(), r.bytes.clone())),
            }
        }
        Ok(entries)
    }

    /// Invert [`encode`](CodecRegistry::encode): reconstruct the external
    /// references from extension-table entries.
    pub fn decode(
        &self,
        entries: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<ExternalRef>, CodecError> {
        let codecs = self.codecs.read();
        let mut refs = Vec::with_capacity(entries.len());

        for (tag, blob) in entries {
            match codecs.get(&tag) {
                Some(codec) => {
                    let occurrences =
                        (codec.deserialize)(blob).map_err(|cause| CodecError::Deserialize {
                            tag: tag.clone(),
                            cause,
                        })?;
                    for bytes in occurrences {
                        refs.push(ExternalRef::new(tag.clone(), bytes));
                    }
                }
                None => refs.push(ExternalRef::new(tag, blob)),
            }
        }
        Ok(refs)
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<String> = self.codecs.read().keys().cloned().collect();
        f.debug_struct("CodecRegistry").field("tags", &tags).finish()
    }
}
