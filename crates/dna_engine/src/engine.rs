//! The engine: one process-local owner of the DHT handle, the local
//! database, the identity session, and the worker pool.
//!
//! Consumers construct an engine against a DHT implementation, drive
//! it through the async request methods, and observe progress on the
//! event stream. Tests construct independent engines against a shared
//! in-process [`dna_spillway::MemoryDht`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use dna_proto::Fingerprint;
use dna_spillway::chunked::ChunkedStore;
use dna_spillway::dht::{Dht, DhtKey, DhtRecord, DhtWriter};
use dna_spillway::keys::{chunk_key, day_of, outbox_base};
use dna_spillway::retry::RetryPolicy;
use dna_spillway::sync::{ListenManager, HEARTBEAT_SECS};
use dna_store::vault::StoreVault;
use dna_store::Store;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{DebugRing, Event, EventBus};
use crate::identity::{
    session_from_seeds, IdentityLock, IdentitySeeds, KeyFiles, Session,
};
use crate::workers::{Job, WorkerPool};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) dht: Arc<dyn Dht>,
    pub(crate) chunked: Arc<ChunkedStore>,
    pub(crate) store: Store,
    pub(crate) session: Arc<RwLock<Option<Session>>>,
    pub(crate) events: EventBus,
    pub(crate) debug_ring: Arc<DebugRing>,
    pub(crate) listens: Arc<ListenManager>,
    pub(crate) retry: RetryPolicy,
    outbox_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    jobs: mpsc::Sender<Job>,
    workers: Mutex<Option<WorkerPool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    identity_lock: Mutex<Option<IdentityLock>>,
    shutting_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    self_ref: OnceLock<Weak<Engine>>,
}

impl Engine {
    /// Initialise storage, the DHT handle, and the worker pool.
    pub async fn create(config: EngineConfig, dht: Arc<dyn Dht>) -> Result<Arc<Self>, EngineError> {
        let db_dir = config.data_dir.join("db");
        std::fs::create_dir_all(&db_dir)?;

        let vault = StoreVault::new();
        let store = Store::open(&db_dir.join("messages.db"), vault).await?;

        // An interrupted password change is repaired before any load.
        KeyFiles::new(&config.data_dir).recover_password_change()?;

        let workers = WorkerPool::new(config.workers);
        let jobs = workers.sender();
        let (shutdown_tx, _) = broadcast::channel(1);

        let engine = Arc::new(Self {
            chunked: Arc::new(ChunkedStore::new(Arc::clone(&dht))),
            debug_ring: Arc::new(DebugRing::new(config.debug_ring)),
            listens: Arc::new(ListenManager::new(Arc::clone(&dht))),
            dht,
            store,
            session: Arc::new(RwLock::new(None)),
            events: EventBus::new(),
            retry: RetryPolicy::default(),
            outbox_locks: Mutex::new(HashMap::new()),
            jobs,
            workers: Mutex::new(Some(workers)),
            tasks: Mutex::new(Vec::new()),
            identity_lock: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            self_ref: OnceLock::new(),
            config,
        });
        let _ = engine.self_ref.set(Arc::downgrade(&engine));
        engine.events.emit(Event::DhtConnected);
        Ok(engine)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Opt-in diagnostic ring contents (never contains secrets).
    pub fn debug_log(&self) -> Vec<String> {
        self.debug_ring.snapshot()
    }

    pub(crate) fn key_files(&self) -> KeyFiles {
        KeyFiles::new(&self.config.data_dir)
    }

    fn strong(&self) -> Option<Arc<Engine>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    // ── Identity lifecycle ──────────────────────────────────────────────────

    pub fn has_identity(&self) -> bool {
        self.key_files().identity_exists()
    }

    /// Create and load a fresh identity. Key persistence and (when a
    /// name is given) name registration succeed together or not at
    /// all.
    pub async fn create_identity(
        &self,
        name: Option<&str>,
        seeds: IdentitySeeds,
        password: Option<&str>,
    ) -> Result<String, EngineError> {
        let (session, store_key) = session_from_seeds(&seeds, name.map(str::to_string))?;
        let fingerprint = session.fingerprint;

        let files = self.key_files();
        files.save_new(&session, &seeds, password)?;

        if let Err(e) = self.install_session(session, store_key).await {
            files.discard();
            return Err(e);
        }
        if let Err(e) = self.publish_profile().await {
            tracing::warn!(error = %e, "initial profile publish failed");
        }
        if let Some(name) = name {
            if let Err(e) = self.register_name(name).await {
                // Atomicity: registration failure unwinds persistence.
                self.uninstall_session().await;
                files.discard();
                return Err(e);
            }
        }
        Ok(fingerprint.to_hex())
    }

    /// Recreate an identity from its seeds (mnemonic restore).
    pub async fn restore_identity(
        &self,
        seeds: IdentitySeeds,
        password: Option<&str>,
    ) -> Result<String, EngineError> {
        let (session, store_key) = session_from_seeds(&seeds, None)?;
        let fingerprint = session.fingerprint;
        let files = self.key_files();
        files.save_new(&session, &seeds, password)?;
        self.install_session(session, store_key).await?;
        if let Err(e) = self.publish_profile().await {
            tracing::warn!(error = %e, "profile publish failed after restore");
        }
        Ok(fingerprint.to_hex())
    }

    /// Load the persisted identity. When `fingerprint` is given, the
    /// loaded identity must match it.
    pub async fn load_identity(
        &self,
        fingerprint: Option<&str>,
        password: Option<&str>,
    ) -> Result<String, EngineError> {
        let (session, store_key) = self.key_files().load(password)?;
        if let Some(expected) = fingerprint {
            if session.fingerprint.to_hex() != expected {
                return Err(EngineError::InvalidArg("fingerprint does not match stored identity".into()));
            }
        }
        let fp_hex = session.fingerprint.to_hex();
        self.install_session(session, store_key).await?;

        // Identity load triggers a poll and a retry sweep.
        if let Some(engine) = self.strong() {
            let sync_engine = Arc::clone(&engine);
            self.submit_job(async move {
                if let Err(e) = sync_engine.sync_all_contacts(false).await {
                    tracing::debug!(error = %e, "initial sync failed");
                }
            })
            .await;
            self.submit_job(async move {
                if let Err(e) = engine.retry_pending_messages().await {
                    tracing::debug!(error = %e, "initial retry sweep failed");
                }
            })
            .await;
        }
        Ok(fp_hex)
    }

    /// Rewrap the key files under a new password (crash-atomic).
    pub async fn change_password(
        &self,
        old: Option<&str>,
        new: Option<&str>,
    ) -> Result<(), EngineError> {
        self.key_files().change_password(old, new)
    }

    async fn install_session(&self, session: Session, store_key: [u8; 32]) -> Result<(), EngineError> {
        let lock = IdentityLock::acquire(&self.config.data_dir)?;
        {
            let mut guard = self.session.write().await;
            if guard.is_some() {
                return Err(EngineError::InvalidArg("an identity is already loaded".into()));
            }
            let fp = session.fingerprint.to_hex();
            *guard = Some(session);
            drop(guard);
            *self.identity_lock.lock() = Some(lock);
            self.store.vault.unlock(store_key).await;
            self.events.emit(Event::IdentityLoaded { fingerprint: fp });
        }
        self.start_listens().await;
        self.spawn_heartbeat();
        Ok(())
    }

    async fn uninstall_session(&self) {
        self.listens.cancel_all().await;
        self.store.vault.lock().await;
        *self.session.write().await = None;
        *self.identity_lock.lock() = None;
    }

    /// Publish (or refresh) our profile record under the profile key.
    pub(crate) async fn publish_profile(&self) -> Result<(), EngineError> {
        use dna_proto::identity::Profile;
        use dna_spillway::keys::{profile_key, writer_value_id};

        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Err(EngineError::NoIdentity);
        };
        let mut profile = Profile::new(
            unix_now(),
            &session.sign_public,
            &session.kem_public,
            session.name.clone(),
        );
        profile.sign_record(&session.sign_secret)?;
        let value =
            serde_json::to_vec(&profile).map_err(|e| EngineError::Internal(e.to_string()))?;
        let writer = DhtWriter { secret: &session.sign_secret, public: &session.sign_public };
        self.dht_put(
            &profile_key(&session.fingerprint),
            value,
            writer_value_id(&session.fingerprint),
            crate::keyserver::PERMANENT_TTL,
            writer,
        )
        .await
    }

    // ── DHT access with deadlines ───────────────────────────────────────────

    pub(crate) async fn dht_get(&self, key: &DhtKey) -> Result<Vec<DhtRecord>, EngineError> {
        tokio::time::timeout(self.config.dht_timeout, self.dht.get_all(key))
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(Into::into)
    }

    pub(crate) async fn dht_put(
        &self,
        key: &DhtKey,
        value: Vec<u8>,
        value_id: u64,
        ttl: Duration,
        writer: DhtWriter<'_>,
    ) -> Result<(), EngineError> {
        tokio::time::timeout(
            self.config.dht_timeout,
            self.dht.put_signed(key, value, value_id, ttl, writer),
        )
        .await
        .map_err(|_| EngineError::Timeout)?
        .map_err(Into::into)
    }

    // ── Shared engine plumbing ──────────────────────────────────────────────

    /// Per-contact mutex serialising read-modify-publish cycles on one
    /// daily bucket.
    pub(crate) fn outbox_lock(&self, peer: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.outbox_locks.lock();
        Arc::clone(
            locks
                .entry(peer.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    pub(crate) async fn submit_job<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.jobs.send(Box::pin(job)).await.is_ok()
    }

    // ── Listen wiring ───────────────────────────────────────────────────────

    pub(crate) async fn start_listens(&self) {
        let me = {
            let guard = self.session.read().await;
            match guard.as_ref() {
                Some(session) => session.fingerprint,
                None => return,
            }
        };
        let peers = match self.store.known_peers(&me.to_hex()).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(error = %e, "peer roster unavailable for listens");
                return;
            }
        };
        let today = day_of(unix_now());
        for peer_hex in peers {
            self.subscribe_contact(&peer_hex, today).await;
        }
    }

    /// Subscribe to `peer`'s outbox bucket (chunk 0) for `day`; pushed
    /// records enqueue a foreground sync on the worker pool.
    pub(crate) async fn subscribe_contact(&self, peer_hex: &str, day: u64) {
        let Ok(peer) = Fingerprint::from_hex(peer_hex) else {
            return;
        };
        let me = {
            let guard = self.session.read().await;
            match guard.as_ref() {
                Some(session) => session.fingerprint,
                None => return,
            }
        };
        let base = outbox_base(&peer, &me, day);
        let key = chunk_key(&base, 0);
        let (tx, mut rx) = mpsc::channel::<DhtRecord>(16);

        match self.listens.subscribe(&format!("dm:{peer_hex}"), &key, tx).await {
            Ok(true) => {}
            Ok(false) => return, // cap reached, poll-only
            Err(e) => {
                tracing::warn!(error = %e, "listen registration failed");
                return;
            }
        }

        let Some(engine) = self.strong() else { return };
        let peer_label = peer_hex.to_string();
        let handle = tokio::spawn(async move {
            // Listener context: never block here, hand off to workers.
            while let Some(_record) = rx.recv().await {
                engine.events.emit(Event::ContactOnline { fingerprint: peer_label.clone() });
                let sync_engine = Arc::clone(&engine);
                engine
                    .submit_job(async move {
                        if let Err(e) = sync_engine.sync_contact(&peer, false).await {
                            tracing::debug!(error = %e, "push-triggered sync failed");
                        }
                    })
                    .await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Day boundary: move every dm subscription to the new day's key
    /// and run a final sync that catches late writes to yesterday.
    pub(crate) async fn rotate_day_listens(&self, today: u64) {
        let labels = self.listens.labels();
        for label in labels {
            let Some(peer_hex) = label.strip_prefix("dm:") else {
                continue;
            };
            let peer_hex = peer_hex.to_string();
            self.subscribe_contact(&peer_hex, today).await;
            if let Ok(peer) = Fingerprint::from_hex(&peer_hex) {
                if let Err(e) = self.sync_contact(&peer, false).await {
                    tracing::debug!(error = %e, "day-rotation sync failed");
                }
            }
        }
    }

    fn spawn_heartbeat(&self) {
        let Some(engine) = self.strong() else { return };
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut day = day_of(unix_now());
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(HEARTBEAT_SECS)) => {}
                }
                let today = day_of(unix_now());
                if today != day {
                    day = today;
                    engine.rotate_day_listens(today).await;
                }
                engine.rotate_stale_geks().await;
                engine.verify_deferred_messages().await;
            }
        });
        self.tasks.lock().push(handle);
    }

    // ── Network-change hooks ────────────────────────────────────────────────

    /// Platform integration reports connectivity transitions here;
    /// reconnects trigger the retry sweep and a fresh sync.
    pub async fn notify_network_change(&self, connected: bool) {
        if !connected {
            self.events.emit(Event::DhtDisconnected);
            return;
        }
        self.events.emit(Event::DhtConnected);
        if let Some(engine) = self.strong() {
            let retry_engine = Arc::clone(&engine);
            self.submit_job(async move {
                if let Err(e) = retry_engine.retry_pending_messages().await {
                    tracing::debug!(error = %e, "reconnect retry sweep failed");
                }
            })
            .await;
            self.submit_job(async move {
                if let Err(e) = engine.sync_all_contacts(false).await {
                    tracing::debug!(error = %e, "reconnect sync failed");
                }
            })
            .await;
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────────

    /// Broadcast cancel, join workers, cancel listens, zeroise keys.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        self.listens.cancel_all().await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            handle.abort();
        }

        let pool = self.workers.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }

        self.uninstall_session().await;
        self.events.emit(Event::DhtDisconnected);
        tracing::info!("engine shut down");
    }
}
