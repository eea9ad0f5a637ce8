//! # Compute Profile Registry
//!
//! Every host operation is scoped to a named profile; `"default"` is
//! implicit. A profile owns its transport mode, listen URLs, TLS material,
//! daemon pool runtime, and sticky-setup payload. Profiles are fully
//! independent: configuring `"gpu"` leaves `"default"` untouched, and no
//! task ever crosses profiles.
//!
//! The table itself is process-wide behind a read-mostly lock, as is the
//! per-profile codec registry (which outlives pool reconfiguration so
//! codecs can be registered before the first `configure_daemons`).

use crate::codec::CodecRegistry;
use crate::direct::DirectPool;
use crate::dispatcher::Dispatcher;
use crate::transport::{TlsMaterial, TransportUrl};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The profile used when none is named.
pub const DEFAULT_PROFILE: &str = "default";

/// How tasks reach daemons in a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Through the FIFO/least-loaded dispatcher.
    DispatcherMediated,
    /// Straight onto a shared pull queue, no ordering guarantee.
    Direct,
}

/// The running pool behind a profile.
pub(crate) enum PoolRuntime {
    Mediated(Dispatcher),
    Direct(DirectPool),
}

/// One configured profile.
pub(crate) struct Profile {
    pub name: String,
    pub mode: DispatchMode,
    pub runtime: PoolRuntime,
    pub tls: Option<TlsMaterial>,
    pub daemon_count: usize,
}

impl Profile {
    /// The URLs daemons of this profile dial: one per slot in dispatcher
    /// mode, the shared queue URL in direct mode.
    pub fn daemon_urls(&self) -> Vec<TransportUrl> {
        match &self.runtime {
            PoolRuntime::Mediated(d) => d.daemon_urls().to_vec(),
            PoolRuntime::Direct(p) => vec![p.listen_url().clone()],
        }
    }
}

/// Process-wide profile table plus the per-profile codec registries.
#[derive(Default)]
pub(crate) struct ProfileTable {
    profiles: RwLock<HashMap<String, Arc<Profile>>>,
    codecs: RwLock<HashMap<String, CodecRegistry>>,
}

impl ProfileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Profile>> {
        self.profiles.read().get(name).cloned()
    }

    pub fn insert(&self, profile: Profile) -> Option<Arc<Profile>> {
        self.profiles
            .write()
            .insert(profile.name.clone(), Arc::new(profile))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Profile>> {
        self.profiles.write().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.read().keys().cloned().collect()
    }

    /// The codec registry for a profile, created on first touch so codecs
    /// can be registered before the pool exists.
    pub fn codecs(&self, name: &str) -> CodecRegistry {
        if let Some(registry) = self.codecs.read().get(name) {
            return registry.clone();
        }
        self.codecs
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Codec registries are created on first touch, shared by name, and
    /// isolated between profiles.
    #[test]
    fn codec_registries_are_per_profile_and_persistent() {
        use crate::codec::{DeserializeFn, SerializeFn};

        let table = ProfileTable::new();
        let ser: SerializeFn = std::sync::Arc::new(|v| Ok(v.concat()));
        let de: DeserializeFn = std::sync::Arc::new(|b| Ok(vec![b]));
        table.codecs("gpu").register("ExtRef", ser, de, false);

        // Same handle on re-access, invisible from other profiles.
        assert!(table.codecs("gpu").is_registered("ExtRef"));
        assert!(!table.codecs(DEFAULT_PROFILE).is_registered("ExtRef"));
        // No pool was ever configured for "gpu".
        assert!(table.get("gpu").is_none());
    }
}
