//! The local peer.
//!
//! [`LocalPeer`] is the composition root: it owns the identity, the signed
//! entry, the DHT, the collection and the peer manager, and it orchestrates
//! the flows that span them: resolving addresses through the network,
//! mirroring remote catalogs, keeping our own entry signed and saved.
//!
//! Everything here is reachable through an `Arc<LocalPeer>`; background
//! loops hold clones and observe shutdown through the peer map and task
//! handles.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::{Address, ADDRESS_BINARY_SIZE};
use crate::config::Config;
use crate::data::{CatalogStore, Collection, MemoryCatalog, Post, PIECE_SIZE};
use crate::dht::Dht;
use crate::entry::{sort_by_distance, Entry};
use crate::error::{Result, ZifError};
use crate::identity::Keypair;
use crate::peer::Peer;
use crate::peer_manager::PeerManager;
use crate::seed::SeedManager;
use crate::server;
use crate::stream::{Dialer, StreamManager};

/// Period of the self-query loop that merges seed knowledge about us.
const QUERY_SELF_FREQUENCY: Duration = Duration::from_secs(5 * 60);

/// Peers contacted before an iterative resolve gives up.
const MAX_RESOLVE_STEPS: usize = 32;

/// State of one mirror operation, for the command surface.
#[derive(Clone, Debug, Default)]
pub struct MirrorProgress {
    pub piece: usize,
    pub total: usize,
    pub done: bool,
    pub error: Option<String>,
}

pub struct LocalPeer {
    keypair: Keypair,
    config: Config,
    data_dir: PathBuf,
    entry: RwLock<Entry>,
    dht: Dht,
    collection: Mutex<Collection>,
    catalog: Arc<dyn CatalogStore>,
    mirrored: Mutex<HashMap<Address, Arc<dyn CatalogStore>>>,
    peers: PeerManager,
    dialer: Box<dyn Dialer>,
    seed_managers: Mutex<HashMap<Address, SeedManager>>,
    mirror_progress: Mutex<HashMap<Address, MirrorProgress>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    exploring: AtomicBool,
}

impl LocalPeer {
    /// Bring up a node rooted at `data_dir`: load or generate the identity,
    /// restore the entry, the DHT table and the collection. Nothing starts
    /// listening until [`LocalPeer::listen`].
    pub fn new(
        config: Config,
        data_dir: impl Into<PathBuf>,
        catalog: Arc<dyn CatalogStore>,
        dialer: Box<dyn Dialer>,
    ) -> Result<Arc<LocalPeer>> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let keypair = Keypair::load_or_generate(data_dir.join("identity.dat"))?;
        let address = keypair.address();
        info!(%address, "local peer identity");

        let entry = match Self::load_entry(&data_dir, &keypair) {
            Some(entry) => entry,
            None => Entry::new(&keypair, "", "", "", 0),
        };

        let dht = Dht::open(address, data_dir.join("peers.db"))?;
        if let Err(e) = dht.load_table(data_dir.join("dht").join("table.dat")) {
            debug!(error = %e, "no saved routing table");
        }

        let collection = match Collection::load(data_dir.join("collection.dat")) {
            Ok(collection) => collection,
            Err(_) => {
                info!("created new collection");
                Collection::new()
            }
        };

        let peers = PeerManager::new(&config);

        Ok(Arc::new(LocalPeer {
            keypair,
            config,
            data_dir,
            entry: RwLock::new(entry),
            dht,
            collection: Mutex::new(collection),
            catalog,
            mirrored: Mutex::new(HashMap::new()),
            peers,
            dialer,
            seed_managers: Mutex::new(HashMap::new()),
            mirror_progress: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            exploring: AtomicBool::new(false),
        }))
    }

    fn load_entry(data_dir: &Path, keypair: &Keypair) -> Option<Entry> {
        let raw = std::fs::read_to_string(data_dir.join("entry.json")).ok()?;
        let entry = Entry::from_json(&raw).ok()?;
        // A stale entry for a different identity is useless
        if entry.address != keypair.address() {
            warn!("saved entry belongs to a different identity, discarding");
            return None;
        }
        Some(entry)
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn catalog(&self) -> &dyn CatalogStore {
        self.catalog.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// A clone of the current signed entry.
    pub fn entry(&self) -> Entry {
        self.entry.read().expect("entry lock poisoned").clone()
    }

    /// Re-sign the entry, stamping `updated`.
    pub fn sign_entry(&self) {
        let mut entry = self.entry.write().expect("entry lock poisoned");
        entry.sign(&self.keypair);
    }

    pub fn save_entry(&self) -> Result<()> {
        let json = self.entry().to_json()?;
        std::fs::write(self.data_dir.join("entry.json"), json)?;
        Ok(())
    }

    /// Mutate the entry, then re-sign and persist it.
    pub fn update_entry(&self, mutate: impl FnOnce(&mut Entry)) -> Result<()> {
        {
            let mut entry = self.entry.write().expect("entry lock poisoned");
            mutate(&mut entry);
            entry.sign(&self.keypair);
        }
        self.save_entry()
    }

    /// Record `seed` as a node mirroring our catalog. The seed list is not
    /// signed, so this does not invalidate the entry.
    pub fn add_seed(&self, seed: Address) -> Result<()> {
        {
            let mut entry = self.entry.write().expect("entry lock poisoned");
            if entry.seeds.contains(&seed) {
                return Ok(());
            }
            entry.seeds.push(seed);
        }
        self.save_entry()
    }

    /// Union seeds learned from the network into our own entry.
    pub fn merge_own_seeds(&self, incoming: &[Address]) -> Result<()> {
        let changed = {
            let mut entry = self.entry.write().expect("entry lock poisoned");
            entry.merge_seeds(incoming)
        };
        if changed {
            self.save_entry()?;
        }
        Ok(())
    }

    /// Start listening for the Zif protocol, plus the self-query loop and
    /// any seed managers persisted from earlier runs. Signs the entry, as
    /// every listen start does.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        {
            let mut entry = self.entry.write().expect("entry lock poisoned");
            if entry.port == 0 {
                entry.port = local.port();
            }
            entry.sign(&self.keypair);
        }
        self.save_entry()?;

        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.push(tokio::spawn(server::serve(self.clone(), listener)));
        tasks.push(tokio::spawn(query_self_loop(self.clone())));
        drop(tasks);

        for tracked in self.load_tracked() {
            self.start_seed_manager(tracked);
        }

        Ok(local)
    }

    /// Begin the periodic DHT exploration job. Idempotent.
    pub fn start_exploring(self: &Arc<Self>) {
        if self.exploring.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(crate::explore::run(self.clone()));
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Connect to a peer at a literal `host:port`, reusing a live
    /// connection when one exists.
    pub async fn connect_direct(self: &Arc<Self>, host: &str) -> Result<Arc<Peer>> {
        if let Some(existing) = self.peers.get_by_public(host) {
            return Ok(existing);
        }

        let manager =
            StreamManager::open(host, self.dialer.as_ref(), &self.entry(), &self.keypair).await?;
        let remote_entry = manager.remote().clone();

        if remote_entry.address == self.address() {
            manager.close().await;
            return Err(ZifError::protocol("connected to ourselves"));
        }

        let peer = Peer::new(manager);
        if let Err(e) = self.dht.insert(remote_entry) {
            debug!(error = %e, "could not store peer entry");
        }

        let registered = self
            .peers
            .register(self, peer.clone(), Some(host.to_string()))?;
        if !Arc::ptr_eq(&registered, &peer) {
            // Raced an inbound connection from the same peer; keep theirs
            peer.close().await;
            return Ok(registered);
        }

        // Both sides of a session accept streams
        tokio::spawn(server::listen_streams(self.clone(), peer.clone()));

        Ok(peer)
    }

    /// Connect to a peer by Zif address: resolve the entry, then dial its
    /// public address. Idempotent: a live peer is returned as-is.
    pub async fn connect(self: &Arc<Self>, addr: Address) -> Result<Arc<Peer>> {
        if addr == self.address() {
            return Err(ZifError::protocol("cannot connect to ourselves"));
        }

        if let Some(existing) = self.peers.get(&addr) {
            return Ok(existing);
        }

        let entry = self.resolve(addr).await?;
        self.connect_direct(&format!("{}:{}", entry.public_address, entry.port))
            .await
    }

    /// Locate the entry for `addr`: ourselves, then the local DHT, then an
    /// iterative walk asking ever-closer peers. Every verified entry seen
    /// along the way is inserted locally.
    pub async fn resolve(self: &Arc<Self>, addr: Address) -> Result<Entry> {
        debug!(target = %addr, "resolving");

        if addr == self.address() {
            return Ok(self.entry());
        }

        if let Some(entry) = self.dht.query(&addr)? {
            return Ok(entry);
        }

        let mut candidates = self.dht.find_closest(&addr)?;
        sort_by_distance(&mut candidates, &addr);

        let mut visited: HashSet<Address> = HashSet::new();
        let mut steps = 0usize;

        while let Some(candidate) = candidates.first().cloned() {
            candidates.remove(0);

            if candidate.address == self.address() || !visited.insert(candidate.address) {
                continue;
            }
            steps += 1;
            if steps > MAX_RESOLVE_STEPS {
                break;
            }

            let peer = match self.connect_to_entry(&candidate).await {
                Ok(peer) => peer,
                Err(e) => {
                    debug!(peer = %candidate.address, error = %e, "resolve step unreachable");
                    continue;
                }
            };

            if let Ok(entry) = peer.query(&addr).await {
                if entry.address == addr {
                    self.dht.insert(entry.clone())?;
                    return Ok(entry);
                }
            }

            match peer.find_closest(&addr).await {
                Ok(closer) => {
                    for entry in closer {
                        if entry.address == addr {
                            self.dht.insert(entry.clone())?;
                            return Ok(entry);
                        }
                        if let Err(e) = self.dht.insert(entry.clone()) {
                            debug!(error = %e, "discarding entry from resolve");
                            continue;
                        }
                        if !visited.contains(&entry.address) {
                            candidates.push(entry);
                        }
                    }
                    sort_by_distance(&mut candidates, &addr);
                }
                Err(e) => {
                    debug!(peer = %candidate.address, error = %e, "find closest failed");
                }
            }
        }

        Err(ZifError::AddressUnresolved(addr.encode()))
    }

    async fn connect_to_entry(self: &Arc<Self>, entry: &Entry) -> Result<Arc<Peer>> {
        if let Some(existing) = self.peers.get(&entry.address) {
            return Ok(existing);
        }
        self.connect_direct(&format!("{}:{}", entry.public_address, entry.port))
            .await
    }

    /// The entry for `addr`, from ourselves, the store, or the network.
    pub async fn query_entry(self: &Arc<Self>, addr: Address) -> Result<Entry> {
        if addr == self.address() {
            return Ok(self.entry());
        }
        if let Some(entry) = self.dht.query(&addr)? {
            return Ok(entry);
        }
        self.resolve(addr).await
    }

    /// Bootstrap from a known host: connect directly and pull its closest
    /// entries into our routing table.
    pub async fn bootstrap(self: &Arc<Self>, host: &str) -> Result<()> {
        let peer = self.connect_direct(host).await?;
        peer.bootstrap(&self.dht).await
    }

    /// Add a post to our own catalog: store it, refresh the affected piece
    /// hash, re-sign the collection root and the entry.
    pub fn add_post(&self, post: Post) -> Result<i64> {
        post.valid()?;
        info!(title = %post.title, "adding post");

        let id = self.catalog.insert_post(post)?;
        let piece_index = (id as usize) / PIECE_SIZE;
        let piece = self.catalog.query_piece(piece_index, PIECE_SIZE)?;

        let root = {
            let mut collection = self.collection.lock().expect("collection lock poisoned");
            collection.add_piece(&piece);
            collection.save(self.data_dir.join("collection.dat"))?;
            collection.root_hash()
        };

        let post_count = self.catalog.post_count() as i64;
        let signature = self.keypair.sign(&root).to_vec();
        self.update_entry(|entry| {
            entry.post_count = post_count;
            entry.collection_hash = root.to_vec();
            entry.collection_sig = signature;
        })?;

        Ok(id)
    }

    pub fn save_collection(&self) -> Result<()> {
        self.collection
            .lock()
            .expect("collection lock poisoned")
            .save(self.data_dir.join("collection.dat"))
    }

    /// Rebuild the hash list from the catalog store and re-sign the root.
    pub fn rebuild_collection(&self) -> Result<()> {
        let rebuilt = Collection::build(self.catalog.as_ref(), PIECE_SIZE)?;
        let root = rebuilt.root_hash();

        {
            let mut collection = self.collection.lock().expect("collection lock poisoned");
            *collection = rebuilt;
            collection.save(self.data_dir.join("collection.dat"))?;
        }

        let post_count = self.catalog.post_count() as i64;
        let signature = self.keypair.sign(&root).to_vec();
        self.update_entry(|entry| {
            entry.post_count = post_count;
            entry.collection_hash = root.to_vec();
            entry.collection_sig = signature;
        })
    }

    /// The signed hash list served for `target`: our own collection, or a
    /// mirrored one together with the owner's stored signature.
    pub fn collection_message(&self, target: &Address) -> Option<crate::message::MessageCollection> {
        use crate::message::MessageCollection;

        if *target == self.address() {
            let collection = self.collection.lock().expect("collection lock poisoned");
            let root = collection.root_hash();
            return Some(MessageCollection {
                hash: root.to_vec(),
                hash_list: collection.hash_list.clone(),
                size: collection.piece_count(),
                sig: self.keypair.sign(&root).to_vec(),
            });
        }

        // Serve a mirrored catalog with the owner's own signature
        let stored = Collection::load(self.data_dir.join(target.encode()).join("collection.dat")).ok()?;
        let entry = self.dht.query(target).ok()??;
        if entry.collection_hash != stored.root_hash().to_vec() {
            return None;
        }
        Some(MessageCollection {
            hash: entry.collection_hash.clone(),
            size: stored.piece_count(),
            hash_list: stored.hash_list,
            sig: entry.collection_sig,
        })
    }

    /// The catalog store answering piece requests for `target`.
    pub fn store_for(&self, target: &Address) -> Option<Arc<dyn CatalogStore>> {
        if *target == self.address() {
            return Some(self.catalog.clone());
        }
        self.mirrored
            .lock()
            .expect("mirrored map poisoned")
            .get(target)
            .cloned()
    }

    /// The store mirrored posts for `target` land in, created on demand.
    pub fn mirror_store(&self, target: &Address) -> Arc<dyn CatalogStore> {
        let mut mirrored = self.mirrored.lock().expect("mirrored map poisoned");
        mirrored
            .entry(*target)
            .or_insert_with(|| Arc::new(MemoryCatalog::new()))
            .clone()
    }

    /// Attach an externally-backed store for a mirrored catalog (the
    /// daemon plugs per-peer post databases in through this).
    pub fn attach_mirror_store(&self, target: Address, store: Arc<dyn CatalogStore>) {
        self.mirrored
            .lock()
            .expect("mirrored map poisoned")
            .insert(target, store);
    }

    /// Mirror a remote catalog, then register as one of its seeds and
    /// start tracking its seed set.
    pub async fn mirror(self: &Arc<Self>, target: Address) -> Result<()> {
        let peer = self.connect(target).await?;
        let store = self.mirror_store(&target);
        let collection_path = self.data_dir.join(target.encode()).join("collection.dat");

        let total = {
            let entry = peer.entry().await;
            (entry.post_count.max(0) as usize).div_ceil(PIECE_SIZE)
        };
        self.set_progress(target, MirrorProgress {
            piece: 0,
            total,
            done: false,
            error: None,
        });

        let (progress_tx, mut progress_rx) = mpsc::channel(100);
        let tracker = {
            let lp = self.clone();
            tokio::spawn(async move {
                while let Some(piece) = progress_rx.recv().await {
                    lp.update_progress(target, |p| p.piece = piece);
                }
            })
        };

        let result = peer
            .mirror(store.as_ref(), &collection_path, PIECE_SIZE, &progress_tx)
            .await;
        drop(progress_tx);
        let _ = tracker.await;

        match result {
            Ok(()) => {
                self.update_progress(target, |p| p.done = true);
            }
            Err(e) => {
                self.update_progress(target, |p| p.error = Some(e.to_string()));
                return Err(e);
            }
        }

        peer.request_add_peer(&target).await?;

        self.update_entry(|entry| {
            if !entry.seeding.contains(&target) {
                entry.seeding.push(target);
            }
        })?;

        self.start_seed_manager(target);
        self.save_tracked()?;

        Ok(())
    }

    pub fn mirror_progress(&self, target: &Address) -> Option<MirrorProgress> {
        self.mirror_progress
            .lock()
            .expect("progress map poisoned")
            .get(target)
            .cloned()
    }

    fn set_progress(&self, target: Address, progress: MirrorProgress) {
        self.mirror_progress
            .lock()
            .expect("progress map poisoned")
            .insert(target, progress);
    }

    fn update_progress(&self, target: Address, mutate: impl FnOnce(&mut MirrorProgress)) {
        let mut map = self.mirror_progress.lock().expect("progress map poisoned");
        mutate(map.entry(target).or_default());
    }

    /// Start a seed manager for `target` if one is not already running.
    pub fn start_seed_manager(self: &Arc<Self>, target: Address) {
        let mut managers = self.seed_managers.lock().expect("seed managers poisoned");
        if managers.contains_key(&target) {
            return;
        }
        managers.insert(target, SeedManager::start(self.clone(), target));
    }

    fn tracked_path(&self) -> PathBuf {
        self.data_dir.join("seeding.dat")
    }

    fn load_tracked(&self) -> Vec<Address> {
        let Ok(raw) = std::fs::read(self.tracked_path()) else {
            return Vec::new();
        };
        raw.chunks_exact(ADDRESS_BINARY_SIZE)
            .filter_map(|chunk| Address::from_bytes(chunk).ok())
            .collect()
    }

    fn save_tracked(&self) -> Result<()> {
        let managers = self.seed_managers.lock().expect("seed managers poisoned");
        let mut raw = Vec::with_capacity(managers.len() * ADDRESS_BINARY_SIZE);
        for addr in managers.keys() {
            raw.extend_from_slice(addr.as_bytes());
        }
        std::fs::write(self.tracked_path(), raw)?;
        Ok(())
    }

    /// Remove a peer after disconnect or heartbeat failure.
    pub async fn handle_close(&self, addr: &Address) {
        if let Some(peer) = self.peers.get(addr) {
            peer.close().await;
        }
        self.peers.remove(addr);
    }

    /// Read one of the mutable local entry fields.
    pub fn local_get(&self, key: &str) -> Result<String> {
        let entry = self.entry();
        match key {
            "name" => Ok(entry.name),
            "desc" => Ok(entry.desc),
            "public" => Ok(entry.public_address),
            "zif" => Ok(entry.address.encode()),
            "postcount" => Ok(entry.post_count.to_string()),
            "entry" => entry.to_json(),
            other => Err(ZifError::protocol(format!("unknown local key {other:?}"))),
        }
    }

    /// Set one of the mutable local entry fields; re-signs and saves.
    pub fn local_set(&self, key: &str, value: &str) -> Result<()> {
        match key {
            "name" => self.update_entry(|e| e.name = value.to_string()),
            "desc" => self.update_entry(|e| e.desc = value.to_string()),
            "public" => self.update_entry(|e| e.public_address = value.to_string()),
            other => Err(ZifError::protocol(format!(
                "local key {other:?} is not settable"
            ))),
        }
    }

    /// Flush state and stop every background task.
    pub async fn close(&self) {
        if let Err(e) = self.dht.save_table(self.data_dir.join("dht").join("table.dat")) {
            warn!(error = %e, "could not save routing table");
        }
        if let Err(e) = self.save_entry() {
            warn!(error = %e, "could not save entry");
        }

        for (_, manager) in self
            .seed_managers
            .lock()
            .expect("seed managers poisoned")
            .drain()
        {
            manager.stop();
        }

        self.peers.close_all().await;

        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
    }
}

/// Every five minutes, ask one random seed what it knows about us and
/// union its seed list into ours.
async fn query_self_loop(lp: Arc<LocalPeer>) {
    let mut interval = tokio::time::interval(QUERY_SELF_FREQUENCY);
    interval.tick().await;

    loop {
        interval.tick().await;

        let seeds = lp.entry().seeds;
        let pick = {
            let mut rng = rand::thread_rng();
            seeds.choose(&mut rng).copied()
        };
        let Some(pick) = pick else { continue };
        if pick == lp.address() {
            continue;
        }

        debug!(seed = %pick, "querying a seed for our own entry");
        match lp.connect(pick).await {
            Ok(peer) => match peer.query(&lp.address()).await {
                Ok(entry) => {
                    if let Err(e) = lp.merge_own_seeds(&entry.seeds) {
                        warn!(error = %e, "could not merge seeds");
                    }
                }
                Err(e) => debug!(seed = %pick, error = %e, "self query failed"),
            },
            Err(e) => debug!(seed = %pick, error = %e, "seed unreachable"),
        }
    }
}
