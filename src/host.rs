//! # Host Client Module
//!
//! The caller-facing surface of the dispatch core. A [`Host`] owns the
//! process-wide profile table and exposes the public operations: `submit`,
//! `poll`/`wait`, `cancel`, `configure_daemons`, `status`, `everywhere`,
//! `register_codec`, `saisei`, and the scope-safe [`Host::scoped_daemons`]
//! wrapper.
//!
//! Error policy: remote-origin failures (evaluation errors, interrupts,
//! timeouts, transport loss) are never raised here; they resolve the
//! task's [`Handle`] as typed [`TaskResult`] variants. Only local
//! programming errors (unknown profile on a query, invalid URL, port
//! taken, codec callback failure) return `Err`, and `submit` itself never
//! fails for a missing pool. A failed task never poisons its profile: the
//! daemon stays online and dispatch continues.

use crate::codec::{CodecRegistry, DeserializeFn, ExternalRef, SerializeFn};
use crate::daemon::{self, DaemonConfig, EchoEvaluator, Evaluator};
use crate::direct::DirectPool;
use crate::dispatcher::{DaemonRow, DispatchError, Dispatcher};
use crate::profile::{
    DispatchMode, PoolRuntime, Profile, ProfileTable, DEFAULT_PROFILE,
};
use crate::task::{DeadlineExceeded, Handle, Task, TaskResult};
use crate::transport::{TlsMaterial, TransportError, TransportUrl};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// TLS selection for `configure_daemons`.
#[derive(Debug, Clone)]
pub enum TlsConfig {
    /// Generate a self-signed certificate on first use; see
    /// [`TlsMaterial::ephemeral`].
    Ephemeral,
    /// Use CA-issued credentials loaded from PEM.
    Issued { cert_pem: String, key_pem: String },
}

/// Options for [`Host::configure_daemons`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Listen URL; its scheme picks the transport and activates TLS.
    pub url: Option<String>,
    /// TLS credentials. Defaults to ephemeral when the URL demands TLS.
    pub tls: Option<TlsConfig>,
    /// Route through the FIFO dispatcher (true) or the direct pull queue.
    pub dispatcher: bool,
    /// Profile name; `"default"` when absent.
    pub profile: Option<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            url: None,
            tls: None,
            dispatcher: true,
            profile: None,
        }
    }
}

/// Options for [`Host::submit`].
#[derive(Default)]
pub struct SubmitOptions {
    /// Opaque external references to carry through the codec registry.
    pub refs: Vec<ExternalRef>,
    /// Host-side deadline for the handle.
    pub timeout: Option<Duration>,
    /// Profile name; `"default"` when absent.
    pub profile: Option<String>,
}

/// Per-profile status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileStatus {
    pub connections: usize,
    pub daemons: DaemonReport,
}

/// The daemon field of a status snapshot: URL list in direct mode, the
/// full record matrix in dispatcher mode.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DaemonReport {
    Urls(Vec<String>),
    Matrix(Vec<DaemonRow>),
}

type EvaluatorFactory = Box<dyn Fn() -> Arc<dyn Evaluator> + Send + Sync>;

struct HostInner {
    profiles: ProfileTable,
    /// Factory for daemons spawned in-process (scoped pools, codec
    /// auto-launch). Deployments with a real evaluator override this.
    local_evaluator: EvaluatorFactory,
    local_daemons: Mutex<HashMap<String, Vec<JoinHandle<Result<(), TransportError>>>>>,
    /// Ephemeral TLS material per profile name, generated once on the
    /// first TLS configuration and reused across reconfiguration so
    /// already-emitted launch commands stay valid.
    tls_cache: Mutex<HashMap<String, TlsMaterial>>,
}

/// The host client. Cheap to clone; all clones share the same profile
/// table.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    /// A host whose locally spawned daemons echo tasks back.
    pub fn new() -> Self {
        Self::with_local_evaluator(Box::new(|| Arc::new(EchoEvaluator) as Arc<dyn Evaluator>))
    }

    /// A host whose locally spawned daemons run the given evaluator.
    pub fn with_local_evaluator(factory: EvaluatorFactory) -> Self {
        Self {
            inner: Arc::new(HostInner {
                profiles: ProfileTable::new(),
                local_evaluator: factory,
                local_daemons: Mutex::new(HashMap::new()),
                tls_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn profile_name(name: Option<&str>) -> String {
        name.unwrap_or(DEFAULT_PROFILE).to_string()
    }

    /// Configure the daemon pool of a profile.
    ///
    /// `n > 0` (re)creates the pool and returns the effective count;
    /// `n = 0` tears the profile down: every pending handle resolves to
    /// `Canceled`, daemons are told to shut down, sockets close. Errors
    /// are local: invalid URL, port taken, bad TLS material.
    pub async fn configure_daemons(
        &self,
        n: usize,
        options: PoolOptions,
    ) -> Result<usize, DispatchError> {
        let name = Self::profile_name(options.profile.as_deref());

        // Reconfiguration and teardown both start by stopping what runs.
        if let Some(existing) = self.inner.profiles.remove(&name) {
            match &existing.runtime {
                PoolRuntime::Mediated(d) => d.shutdown().await,
                PoolRuntime::Direct(p) => p.shutdown().await,
            }
            self.reap_local_daemons(&name).await;
        }
        if n == 0 {
            info!("profile {:?} torn down", name);
            return Ok(0);
        }

        let url_str = options
            .url
            .as_deref()
            .unwrap_or(crate::defaults::LISTEN_URL);
        let base_url = TransportUrl::parse(url_str).map_err(DispatchError::Transport)?;

        let tls = self.tls_material(&name, &base_url, options.tls.as_ref())?;
        let (mode, runtime) = if options.dispatcher {
            let dispatcher = Dispatcher::start(n, &base_url, tls.clone()).await?;
            (DispatchMode::DispatcherMediated, PoolRuntime::Mediated(dispatcher))
        } else {
            let pool = DirectPool::start(&base_url, tls.clone(), n).await?;
            (DispatchMode::Direct, PoolRuntime::Direct(pool))
        };

        self.inner.profiles.insert(Profile {
            name: name.clone(),
            mode,
            runtime,
            tls,
            daemon_count: n,
        });
        info!("profile {:?} configured with {} daemons", name, n);
        Ok(n)
    }

    fn tls_material(
        &self,
        name: &str,
        url: &TransportUrl,
        config: Option<&TlsConfig>,
    ) -> Result<Option<TlsMaterial>, DispatchError> {
        if !url.uses_tls() && config.is_none() {
            return Ok(None);
        }
        match config {
            Some(TlsConfig::Issued { cert_pem, key_pem }) => {
                Ok(Some(TlsMaterial::from_pem(cert_pem, key_pem)?))
            }
            // URL demands TLS with nothing specified, or ephemeral asked
            // for explicitly: generate once per profile and reuse.
            Some(TlsConfig::Ephemeral) | None => {
                let mut cache = self.inner.tls_cache.lock();
                if let Some(material) = cache.get(name) {
                    return Ok(Some(material.clone()));
                }
                let host = url.host().unwrap_or("localhost");
                let material = TlsMaterial::ephemeral(host)?;
                cache.insert(name.to_string(), material.clone());
                Ok(Some(material))
            }
        }
    }

    /// Submit a task. Returns the handle immediately and never suspends.
    /// The handle resolves when a result arrives, the deadline expires,
    /// or the task is canceled. Submitting against a profile nobody has
    /// configured is not an error: a single local daemon is brought up
    /// best-effort and the task queued on it. The only `Err` here is a
    /// failing codec callback at encode time.
    pub fn submit(
        &self,
        payload: Vec<u8>,
        options: SubmitOptions,
    ) -> Result<Handle, DispatchError> {
        let name = Self::profile_name(options.profile.as_deref());
        let registry = self.inner.profiles.codecs(&name);
        let extensions = registry.encode(&options.refs)?;

        let task = Task::new(payload, extensions, options.timeout, &name);
        let handle = Handle::new(task.task_id, &name);

        if let Some(timeout) = options.timeout {
            let timer_handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // Loses the race against a completed result by design.
                if timer_handle.resolve(TaskResult::Timeout) {
                    debug!("task {} timed out", timer_handle.task_id());
                }
            });
        }

        match self.inner.profiles.get(&name) {
            Some(profile) => {
                Self::enqueue(&profile, task, handle.clone());
            }
            None => {
                // No pool configured. Submit never fails for that: bring
                // one local daemon up and enqueue once it is ready. The
                // codec-scoped case gets a loud warning, a plain first
                // submit only a debug note.
                if !options.refs.is_empty() && !registry.is_empty() {
                    warn!(
                        "profile {:?} has codecs but no daemons; auto-launching one",
                        name
                    );
                } else {
                    debug!("profile {:?} has no daemons; auto-launching one", name);
                }
                let host = self.clone();
                let pending = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = host.auto_launch(&name, task, pending.clone()).await {
                        warn!("auto-launch for profile {:?} failed: {}", name, e);
                        // The task could not reach any daemon; resolve the
                        // handle so waiters never hang.
                        pending.resolve(TaskResult::TransportLost);
                    }
                });
            }
        }
        Ok(handle)
    }

    fn enqueue(profile: &Profile, task: Task, handle: Handle) {
        match &profile.runtime {
            PoolRuntime::Mediated(d) => d.submit(task, handle),
            PoolRuntime::Direct(p) => p.submit(task, handle),
        }
    }

    async fn auto_launch(
        &self,
        name: &str,
        task: Task,
        handle: Handle,
    ) -> Result<(), DispatchError> {
        // A concurrent submit or configure may have brought the pool up
        // in the meantime; reconfiguring would cancel its queue.
        if self.inner.profiles.get(name).is_none() {
            self.configure_daemons(
                1,
                PoolOptions {
                    profile: Some(name.to_string()),
                    ..PoolOptions::default()
                },
            )
            .await?;
            self.spawn_local_daemons(1, Some(name)).await?;
        }
        let profile = self
            .inner
            .profiles
            .get(name)
            .ok_or_else(|| DispatchError::UnknownProfile(name.to_string()))?;
        Self::enqueue(&profile, task, handle);
        Ok(())
    }

    /// Non-blocking check of a handle.
    pub fn poll(&self, handle: &Handle) -> Option<TaskResult> {
        handle.poll()
    }

    /// Suspend until the handle resolves, bounded by `limit` when given.
    pub async fn wait(
        &self,
        handle: &Handle,
        limit: Option<Duration>,
    ) -> Result<TaskResult, DeadlineExceeded> {
        match limit {
            Some(limit) => handle.wait_for(limit).await,
            None => Ok(handle.wait().await),
        }
    }

    /// Cancel a task. Idempotent: the handle resolves to `Canceled` now
    /// unless it already resolved to something else. An in-flight daemon
    /// is told to interrupt but the caller does not wait for it, and a late
    /// result is dropped on arrival.
    pub fn cancel(&self, handle: &Handle) {
        handle.resolve(TaskResult::Canceled);
        if let Some(profile) = self.inner.profiles.get(handle.profile()) {
            match &profile.runtime {
                PoolRuntime::Mediated(d) => d.cancel(handle.task_id()),
                PoolRuntime::Direct(p) => p.cancel(handle.task_id()),
            }
        }
    }

    /// Connections plus the daemon roster of a profile.
    pub async fn status(&self, profile: Option<&str>) -> Result<ProfileStatus, DispatchError> {
        let name = Self::profile_name(profile);
        let profile = self
            .inner
            .profiles
            .get(&name)
            .ok_or(DispatchError::UnknownProfile(name))?;
        match &profile.runtime {
            PoolRuntime::Mediated(d) => {
                let status = d.status().await?;
                Ok(ProfileStatus {
                    connections: status.connections,
                    daemons: DaemonReport::Matrix(status.daemons),
                })
            }
            PoolRuntime::Direct(p) => {
                let (connections, urls) = p.status();
                Ok(ProfileStatus {
                    connections,
                    daemons: DaemonReport::Urls(urls),
                })
            }
        }
    }

    /// Deliver a sticky-setup payload to all current and future daemons
    /// of the profile.
    pub fn everywhere(
        &self,
        payload: Vec<u8>,
        profile: Option<&str>,
    ) -> Result<(), DispatchError> {
        let name = Self::profile_name(profile);
        let profile = self
            .inner
            .profiles
            .get(&name)
            .ok_or(DispatchError::UnknownProfile(name))?;
        match &profile.runtime {
            PoolRuntime::Mediated(d) => d.everywhere(payload),
            PoolRuntime::Direct(p) => p.everywhere(payload),
        }
        Ok(())
    }

    /// Register a codec for a class tag on a profile. Codecs may be
    /// registered before the pool is configured.
    pub fn register_codec(
        &self,
        tag: impl Into<String>,
        serialize: SerializeFn,
        deserialize: DeserializeFn,
        vectorized: bool,
        profile: Option<&str>,
    ) {
        let name = Self::profile_name(profile);
        self.inner
            .profiles
            .codecs(&name)
            .register(tag, serialize, deserialize, vectorized);
    }

    /// The codec registry of a profile, for daemon-side decoding in
    /// embedded deployments.
    pub fn codec_registry(&self, profile: Option<&str>) -> CodecRegistry {
        self.inner
            .profiles
            .codecs(&Self::profile_name(profile))
    }

    /// Regenerate the listen URL of daemon slot `i` (dispatcher mode
    /// only), returning the fresh URL. The slot's instance counter goes
    /// negative until a fresh daemon connects.
    pub async fn saisei(
        &self,
        slot: usize,
        profile: Option<&str>,
    ) -> Result<TransportUrl, DispatchError> {
        let name = Self::profile_name(profile);
        let profile = self
            .inner
            .profiles
            .get(&name)
            .ok_or(DispatchError::UnknownProfile(name))?;
        match &profile.runtime {
            PoolRuntime::Mediated(d) => d.saisei(slot).await,
            PoolRuntime::Direct(_) => Err(DispatchError::NotMediated),
        }
    }

    /// The URLs daemons of a profile dial.
    pub fn daemon_urls(&self, profile: Option<&str>) -> Result<Vec<TransportUrl>, DispatchError> {
        let name = Self::profile_name(profile);
        let profile = self
            .inner
            .profiles
            .get(&name)
            .ok_or(DispatchError::UnknownProfile(name))?;
        Ok(profile.daemon_urls())
    }

    /// Emit the launch command for every daemon slot of a profile,
    /// embedding the TLS certificate when the profile carries one.
    pub fn launch_commands(
        &self,
        plan: &crate::launch::LaunchPlan,
        spec: &crate::launch::LaunchSpec,
        profile: Option<&str>,
    ) -> anyhow::Result<Vec<String>> {
        let name = Self::profile_name(profile);
        let profile = self
            .inner
            .profiles
            .get(&name)
            .ok_or(DispatchError::UnknownProfile(name))?;
        let urls = match profile.mode {
            DispatchMode::DispatcherMediated => profile.daemon_urls(),
            // Every direct-mode daemon dials the same shared URL.
            DispatchMode::Direct => vec![profile.daemon_urls()[0].clone(); profile.daemon_count],
        };
        let cert = profile.tls.as_ref().map(|m| m.cert_pem().to_string());
        crate::launch::launch_commands(plan, spec, &urls, cert.as_deref())
    }

    /// Spawn in-process daemons (one per slot in dispatcher mode, `n`
    /// against the shared URL in direct mode) running the host's local
    /// evaluator. Remote deployments launch the `taskgrid-daemon` binary
    /// via [`crate::launch`] instead.
    pub async fn spawn_local_daemons(
        &self,
        n: usize,
        profile: Option<&str>,
    ) -> Result<(), DispatchError> {
        let name = Self::profile_name(profile);
        let profile = self
            .inner
            .profiles
            .get(&name)
            .ok_or_else(|| DispatchError::UnknownProfile(name.clone()))?;

        let urls = profile.daemon_urls();
        let cert = profile
            .tls
            .as_ref()
            .map(|m| m.daemon_certificates().swap_remove(0));
        // Dispatcher slots accept one daemon each; continue from the first
        // slot not already covered by an earlier spawn.
        let already = self
            .inner
            .local_daemons
            .lock()
            .get(&name)
            .map_or(0, Vec::len);
        let targets: Vec<TransportUrl> = match profile.mode {
            DispatchMode::DispatcherMediated => {
                urls.into_iter().skip(already).take(n).collect()
            }
            DispatchMode::Direct => vec![urls[0].clone(); n],
        };

        let mut spawned = Vec::with_capacity(targets.len());
        for url in targets {
            let config = DaemonConfig {
                url,
                tls_cert_pem: cert.clone(),
                autoexit: true,
                seed: None,
            };
            spawned.push(daemon::spawn_local(
                config,
                (self.inner.local_evaluator)(),
            ));
        }
        self.inner
            .local_daemons
            .lock()
            .entry(name)
            .or_default()
            .append(&mut spawned);
        Ok(())
    }

    /// Wait for the profile's in-process daemons to finish after a
    /// teardown; abort stragglers.
    async fn reap_local_daemons(&self, name: &str) {
        let daemons = self.inner.local_daemons.lock().remove(name);
        for daemon in daemons.unwrap_or_default() {
            match tokio::time::timeout(Duration::from_secs(2), daemon).await {
                Ok(_) => {}
                // Autoexit finishes the daemon once its connection closes;
                // a straggler is detached, not leaked.
                Err(_) => debug!("local daemon for {:?} still draining at teardown", name),
            }
        }
    }

    /// Run `body` against a short-lived pool of `n` local daemons on a
    /// dedicated profile, guaranteeing teardown on all exit paths; a body
    /// error is propagated after the teardown completes.
    pub async fn scoped_daemons<F, Fut, T>(&self, n: usize, body: F) -> anyhow::Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let name = format!("scoped-{}", uuid::Uuid::new_v4().simple());
        self.configure_daemons(
            n,
            PoolOptions {
                profile: Some(name.clone()),
                ..PoolOptions::default()
            },
        )
        .await?;
        self.spawn_local_daemons(n, Some(&name)).await?;

        let outcome = body(name.clone()).await;

        self.configure_daemons(
            0,
            PoolOptions {
                profile: Some(name),
                ..PoolOptions::default()
            },
        )
        .await?;
        outcome
    }

    /// Names of every configured profile.
    pub fn profiles(&self) -> Vec<String> {
        self.inner.profiles.names()
    }
}
