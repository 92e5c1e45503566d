//! Reference scanner over package manifests on disk.
//!
//! Each package is described by a `<Name>.pkg.json` manifest placed where the
//! package would live under a mounted content directory. The gatherer walks
//! the mounted directories, parses manifests in parallel and reports folders,
//! asset records, dependency data and cooked packages without metadata.
//!
//! [`BackgroundGatherer`] runs the same work on a worker thread and hands the
//! batches to the registry through a [`ScanChannel`].

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::asset::{AssetRecord, PackageData, PackageFlags, package_path_of, package_short_name};
use crate::config::ContentRoot;
use crate::filter::is_path_or_descendant;
use crate::scan_cache::{CachedManifest, ScanCache, mtime_nanos};
use crate::scanner::{
    AssetScanner, PackageDependencyData, ScanChannel, ScanRequest, ScanResults, SearchableName,
};

pub const MANIFEST_SUFFIX: &str = ".pkg.json";

const FILES_PER_BATCH: usize = 64;
const POLL_INTERVAL_MS: u64 = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestAsset {
    pub name: String,
    pub class: String,
    pub groups: String,
    pub tags: BTreeMap<String, String>,
    pub chunks: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageManifest {
    pub assets: Vec<ManifestAsset>,
    pub imports: Vec<String>,
    pub soft_references: Vec<String>,
    pub searchable_names: Vec<SearchableName>,
    pub package_flags: u32,
    /// 32 hex digits.
    pub package_guid: Option<String>,
    pub cooked: bool,
    pub cooked_version: u32,
}

/// Maps long package names onto content directories.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    roots: Vec<ContentRoot>,
}

impl MountTable {
    pub fn new(roots: Vec<ContentRoot>) -> Self {
        let mut table = Self::default();
        for root in roots {
            table.mount(root);
        }
        table
    }

    pub fn mount(&mut self, root: ContentRoot) {
        let mount_point = normalize_mount(&root.mount_point);
        self.roots.retain(|r| r.mount_point != mount_point);
        self.roots.push(ContentRoot {
            mount_point,
            directory: root.directory,
        });
    }

    pub fn roots(&self) -> &[ContentRoot] {
        &self.roots
    }

    /// `/content/Props/Chair.pkg.json` under `/Game` -> `/Game/Props/Chair`.
    pub fn package_name_for_file(&self, file: &Path) -> Option<String> {
        let file_name = file.file_name()?.to_str()?;
        let short_name = file_name.strip_suffix(MANIFEST_SUFFIX)?;
        self.roots.iter().find_map(|root| {
            let folder = file.parent()?.strip_prefix(&root.directory).ok()?;
            let mut name = root.mount_point.clone();
            for part in folder.components() {
                name.push('/');
                name.push_str(part.as_os_str().to_str()?);
            }
            name.push('/');
            name.push_str(short_name);
            Some(name)
        })
    }

    /// Content directory backing a long package path.
    pub fn directory_for_path(&self, package_path: &str) -> Option<PathBuf> {
        let package_path = normalize_mount(package_path);
        self.roots
            .iter()
            .filter(|root| is_path_or_descendant(&package_path, &root.mount_point))
            .max_by_key(|root| root.mount_point.len())
            .map(|root| {
                let rest = package_path[root.mount_point.len()..].trim_start_matches('/');
                if rest.is_empty() {
                    root.directory.clone()
                } else {
                    root.directory.join(rest)
                }
            })
    }

    pub fn file_for_package(&self, package_name: &str) -> Option<PathBuf> {
        let directory = self.directory_for_path(package_path_of(package_name))?;
        Some(directory.join(format!("{}{MANIFEST_SUFFIX}", package_short_name(package_name))))
    }
}

fn normalize_mount(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    hex::encode(digest)
}

fn parse_guid(package_name: &str, guid: Option<&str>) -> [u8; 16] {
    let mut out = [0u8; 16];
    let Some(guid) = guid else {
        return out;
    };
    match hex::decode(guid.replace('-', "")) {
        Ok(bytes) if bytes.len() == 16 => out.copy_from_slice(&bytes),
        _ => tracing::warn!(package = package_name, guid, "ignoring malformed package guid"),
    }
    out
}

pub struct Gatherer {
    mounts: MountTable,
    cache: Option<ScanCache>,
}

impl Gatherer {
    pub fn new(roots: Vec<ContentRoot>, cache: Option<ScanCache>) -> Self {
        Self {
            mounts: MountTable::new(roots),
            cache,
        }
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Every manifest below `directory`, sorted.
    pub fn find_manifests(&self, directory: &Path) -> Vec<PathBuf> {
        if !directory.is_dir() {
            return Vec::new();
        }
        let (tx, rx) = mpsc::channel();

        let walker = WalkBuilder::new(directory)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .build_parallel();

        walker.run(|| {
            let tx = tx.clone();
            Box::new(move |entry| {
                if let Ok(entry) = entry {
                    let path = entry.path();
                    if path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
                    {
                        let _ = tx.send(path.to_path_buf());
                    }
                }
                ignore::WalkState::Continue
            })
        });

        drop(tx);
        let mut files: Vec<PathBuf> = rx.iter().collect();
        files.sort();
        files
    }

    /// Manifest files for long package paths, plus the folders discovered on
    /// the way. Paths outside every mount are skipped.
    pub fn discover(&self, package_paths: &[String]) -> (Vec<String>, Vec<PathBuf>) {
        let mut folders: BTreeSet<String> = BTreeSet::new();
        let mut files = Vec::new();
        for path in package_paths {
            let Some(directory) = self.mounts.directory_for_path(path) else {
                tracing::warn!(path = path.as_str(), "search path is not under a mounted content root");
                continue;
            };
            if directory.is_dir() {
                folders.insert(normalize_mount(path));
            }
            for file in self.find_manifests(&directory) {
                if let Some(package) = self.mounts.package_name_for_file(&file) {
                    let folder = package_path_of(&package);
                    if !folder.is_empty() {
                        folders.insert(folder.to_string());
                    }
                }
                files.push(file);
            }
        }
        (folders.into_iter().collect(), files)
    }

    /// Scans the given long package paths and package names on the calling
    /// thread.
    pub fn gather(&self, package_paths: &[String], package_names: &[String]) -> ScanResults {
        let started = Instant::now();
        let (folders, mut files) = self.discover(package_paths);
        files.extend(
            package_names
                .iter()
                .filter_map(|name| self.mounts.file_for_package(name))
                .filter(|file| file.is_file()),
        );
        files.sort();
        files.dedup();

        let mut results = self.gather_files(&files, None);
        results.discovered_paths = folders;
        results.search_times.push(started.elapsed().as_secs_f64());
        results
    }

    /// Parses `files` in parallel, on `pool` when given.
    pub fn gather_files(&self, files: &[PathBuf], pool: Option<&ThreadPool>) -> ScanResults {
        let parse = || {
            files
                .par_iter()
                .map(|file| (file, self.load_manifest(file)))
                .collect::<Vec<_>>()
        };
        let parsed = match pool {
            Some(pool) => pool.install(parse),
            None => parse(),
        };

        let mut results = ScanResults::default();
        let mut fresh: Vec<(PathBuf, CachedManifest)> = Vec::new();
        for (file, outcome) in parsed {
            let entry = match outcome {
                Ok((entry, from_disk)) => {
                    if from_disk {
                        fresh.push((file.clone(), entry.clone()));
                    }
                    entry
                }
                Err(err) => {
                    tracing::warn!(file = %file.display(), "skipping package manifest: {err:#}");
                    continue;
                }
            };
            let Some(package_name) = self.mounts.package_name_for_file(file) else {
                continue;
            };
            append_package(&mut results, &package_name, entry);
        }

        if let Some(cache) = self.cache.as_ref()
            && let Err(err) = cache.put_many(&fresh)
        {
            tracing::warn!("failed to update scan cache: {err:#}");
        }
        results
    }

    fn load_manifest(&self, file: &Path) -> Result<(CachedManifest, bool)> {
        let mtime = mtime_nanos(file);
        if let Some(cache) = self.cache.as_ref()
            && let Some(entry) = cache.get_fresh(file, mtime)?
        {
            return Ok((entry, false));
        }

        let bytes = std::fs::read(file)
            .with_context(|| format!("Failed to read package manifest: {}", file.display()))?;
        let manifest: PackageManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse package manifest: {}", file.display()))?;
        Ok((
            CachedManifest {
                mtime_nanos: mtime,
                disk_size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
                content_hash: hash_content(&bytes),
                manifest,
            },
            true,
        ))
    }
}

fn append_package(results: &mut ScanResults, package_name: &str, entry: CachedManifest) {
    let CachedManifest {
        disk_size,
        content_hash,
        manifest,
        ..
    } = entry;

    if manifest.assets.is_empty() && manifest.cooked {
        results
            .cooked_packages_without_metadata
            .push(package_name.to_string());
    }
    let flags = PackageFlags::from_bits_retain(manifest.package_flags);
    for asset in manifest.assets {
        let mut record = AssetRecord::with_groups(package_name, &asset.groups, &asset.name, &asset.class);
        record.tags = asset.tags;
        record.chunk_ids = asset.chunks.into_iter().collect();
        record.package_flags = flags;
        results.asset_records.push(record);
    }

    results.dependency_data.push(PackageDependencyData {
        package_name: package_name.to_string(),
        package_data: PackageData {
            disk_size,
            package_guid: parse_guid(package_name, manifest.package_guid.as_deref()),
            content_hash,
            cooked_version: manifest.cooked_version,
        },
        imports: manifest.imports,
        soft_references: manifest.soft_references,
        searchable_names: manifest.searchable_names,
    });
}

/// Runs a [`Gatherer`] on a worker thread.
pub struct BackgroundGatherer {
    gatherer: Arc<Gatherer>,
    channel: ScanChannel,
    tx: Option<Sender<ScanRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundGatherer {
    pub fn spawn(gatherer: Gatherer, threads: usize) -> Self {
        let gatherer = Arc::new(gatherer);
        let channel = ScanChannel::new();
        let (tx, rx) = mpsc::channel::<ScanRequest>();
        let handle = spawn_worker(rx, Arc::clone(&gatherer), channel.clone(), threads);
        Self {
            gatherer,
            channel,
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn gatherer(&self) -> &Gatherer {
        &self.gatherer
    }

    /// Stops accepting requests and waits for queued work to finish.
    pub fn shutdown_and_drain(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn send(&self, request: ScanRequest) {
        if let Some(tx) = self.tx.as_ref() {
            self.channel.begin_request();
            self.channel.set_discovering(true);
            if tx.send(request).is_err() {
                tracing::warn!("background gatherer stopped, dropping scan request");
                self.channel.finish_request();
            }
        }
    }
}

impl Drop for BackgroundGatherer {
    fn drop(&mut self) {
        self.shutdown_and_drain();
    }
}

impl AssetScanner for BackgroundGatherer {
    fn get_and_drain_results(&mut self) -> ScanResults {
        self.channel.get_and_drain_results()
    }

    fn add_search_paths(&mut self, paths: &[String]) {
        if !paths.is_empty() {
            self.send(ScanRequest::Paths(paths.to_vec()));
        }
    }

    fn add_files(&mut self, package_names: &[String]) {
        if !package_names.is_empty() {
            self.send(ScanRequest::Files(package_names.to_vec()));
        }
    }

    fn prioritize_search_path(&mut self, path: &str) {
        self.send(ScanRequest::Prioritize(path.to_string()));
    }

    fn scan_synchronous(&mut self, paths: &[String], package_names: &[String]) -> ScanResults {
        self.gatherer.gather(paths, package_names)
    }
}

/// Moves files under `directory` to the front, keeping relative order.
fn prioritize(pending: &mut VecDeque<PathBuf>, directory: &Path) {
    let (mut front, back): (VecDeque<PathBuf>, VecDeque<PathBuf>) =
        pending.drain(..).partition(|file| file.starts_with(directory));
    front.extend(back);
    *pending = front;
}

fn spawn_worker(
    rx: Receiver<ScanRequest>,
    gatherer: Arc<Gatherer>,
    channel: ScanChannel,
    threads: usize,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                tracing::warn!("falling back to the global rayon pool: {err}");
                None
            }
        };
        let mut pending_paths: VecDeque<String> = VecDeque::new();
        let mut pending_files: VecDeque<PathBuf> = VecDeque::new();
        let mut priority: Option<PathBuf> = None;
        let mut pass_started: Option<Instant> = None;
        let mut disconnected = false;

        loop {
            let idle = pending_paths.is_empty() && pending_files.is_empty();
            let request = if idle {
                rx.recv_timeout(Duration::from_millis(POLL_INTERVAL_MS))
            } else {
                rx.try_recv().map_err(|err| match err {
                    mpsc::TryRecvError::Empty => RecvTimeoutError::Timeout,
                    mpsc::TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
                })
            };
            let received = request.is_ok();
            match request {
                Ok(ScanRequest::Paths(paths)) => pending_paths.extend(paths),
                Ok(ScanRequest::Files(names)) => pending_files.extend(
                    names
                        .iter()
                        .filter_map(|name| gatherer.mounts().file_for_package(name))
                        .filter(|file| file.is_file()),
                ),
                Ok(ScanRequest::Prioritize(path)) => {
                    priority = gatherer.mounts().directory_for_path(&path);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => disconnected = true,
            }
            if received {
                // the request's work is queued; only then may it stop counting
                if !(pending_paths.is_empty() && pending_files.is_empty()) {
                    channel.set_discovering(true);
                }
                channel.finish_request();
            }

            if !(pending_paths.is_empty() && pending_files.is_empty()) && pass_started.is_none() {
                pass_started = Some(Instant::now());
            }

            if let Some(path) = pending_paths.pop_front() {
                let (folders, files) = gatherer.discover(std::slice::from_ref(&path));
                pending_files.extend(files);
                channel.publish(ScanResults {
                    discovered_paths: folders,
                    ..ScanResults::default()
                });
            } else if !pending_files.is_empty() {
                if let Some(directory) = priority.take() {
                    prioritize(&mut pending_files, &directory);
                }
                let take = pending_files.len().min(FILES_PER_BATCH);
                let batch: Vec<PathBuf> = pending_files.drain(..take).collect();
                channel.publish(gatherer.gather_files(&batch, pool.as_ref()));
            }

            channel.set_pending(pending_files.len(), pending_paths.len());
            if pending_paths.is_empty() && pending_files.is_empty() {
                if let Some(started) = pass_started.take() {
                    channel.publish(ScanResults {
                        search_times: vec![started.elapsed().as_secs_f64()],
                        ..ScanResults::default()
                    });
                }
                if channel.requests_in_flight() == 0 {
                    channel.set_discovering(false);
                }
                if disconnected {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    fn write_manifest(root: &Path, rel: &str, body: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    fn content_root(directory: &Path) -> ContentRoot {
        ContentRoot {
            mount_point: "/Game".to_string(),
            directory: directory.to_path_buf(),
        }
    }

    #[test]
    fn mount_table_maps_files_and_paths_both_ways() {
        let mounts = MountTable::new(vec![content_root(Path::new("/data/content"))]);
        assert_eq!(
            mounts.package_name_for_file(Path::new("/data/content/Props/Chair.pkg.json")),
            Some("/Game/Props/Chair".to_string())
        );
        assert_eq!(mounts.package_name_for_file(Path::new("/elsewhere/Chair.pkg.json")), None);
        assert_eq!(
            mounts.file_for_package("/Game/Props/Chair"),
            Some(PathBuf::from("/data/content/Props/Chair.pkg.json"))
        );
        assert_eq!(mounts.directory_for_path("/Game"), Some(PathBuf::from("/data/content")));
        assert_eq!(mounts.directory_for_path("/GameData"), None);
    }

    #[test]
    fn gather_reports_records_dependencies_and_cooked_packages() {
        let root = temp_dir("asset-catalog-gather");
        write_manifest(
            &root,
            "Props/Chair.pkg.json",
            r#"{
                "assets": [{"name": "Chair", "class": "StaticMesh", "tags": {"Color": "Red"}, "chunks": [3]}],
                "imports": ["/Game/Materials/Wood"],
                "soft_references": ["/Game/Sounds/Creak"],
                "package_guid": "000102030405060708090a0b0c0d0e0f"
            }"#,
        );
        write_manifest(&root, "Cooked/Blob.pkg.json", r#"{"cooked": true, "cooked_version": 7}"#);
        write_manifest(&root, "Broken/Bad.pkg.json", "{not json");

        let gatherer = Gatherer::new(vec![content_root(&root)], None);
        let results = gatherer.gather(&["/Game".to_string()], &[]);

        assert_eq!(results.asset_records.len(), 1);
        let chair = &results.asset_records[0];
        assert_eq!(chair.object_path, "/Game/Props/Chair.Chair");
        assert_eq!(chair.tag("Color"), Some("Red"));
        assert!(chair.chunk_ids.contains(&3));

        assert_eq!(results.cooked_packages_without_metadata, vec!["/Game/Cooked/Blob"]);
        let chair_deps = results
            .dependency_data
            .iter()
            .find(|d| d.package_name == "/Game/Props/Chair")
            .unwrap();
        assert_eq!(chair_deps.imports, vec!["/Game/Materials/Wood"]);
        assert_eq!(chair_deps.package_data.package_guid[15], 0x0f);
        assert_eq!(chair_deps.package_data.content_hash.len(), 64);
        assert!(results.discovered_paths.contains(&"/Game/Props".to_string()));
        assert_eq!(results.search_times.len(), 1);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn prioritize_moves_matching_files_first() {
        let mut pending: VecDeque<PathBuf> = ["/c/A/1", "/c/B/1", "/c/A/2", "/c/B/2"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        prioritize(&mut pending, Path::new("/c/B"));
        let order: Vec<&str> = pending.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(order, vec!["/c/B/1", "/c/B/2", "/c/A/1", "/c/A/2"]);
    }

    #[test]
    fn background_gatherer_publishes_through_the_channel() {
        let root = temp_dir("asset-catalog-background");
        write_manifest(
            &root,
            "Maps/Arena.pkg.json",
            r#"{"assets": [{"name": "Arena", "class": "World"}]}"#,
        );

        let mut scanner = BackgroundGatherer::spawn(Gatherer::new(vec![content_root(&root)], None), 2);
        scanner.add_search_paths(&["/Game".to_string()]);

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut records = Vec::new();
        loop {
            let drained = scanner.get_and_drain_results();
            records.extend(drained.asset_records);
            if (!drained.is_discovering && !records.is_empty()) || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].package_name, "/Game/Maps/Arena");

        scanner.shutdown_and_drain();
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn a_request_sent_to_an_idle_worker_reports_discovering_until_published() {
        let root = temp_dir("asset-catalog-idle-request");
        write_manifest(&root, "Maps/Arena.pkg.json", r#"{"assets": [{"name": "Arena", "class": "World"}]}"#);

        let mut scanner = BackgroundGatherer::spawn(Gatherer::new(vec![content_root(&root)], None), 1);
        let deadline = Instant::now() + Duration::from_secs(10);
        // let the worker sit in its idle poll a few times
        while scanner.channel.is_discovering() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS * 3));

        for round in 0..20 {
            scanner.add_search_paths(&["/Game".to_string()]);
            assert!(scanner.get_and_drain_results().is_discovering, "round {round}");

            let mut records = Vec::new();
            loop {
                let drained = scanner.get_and_drain_results();
                records.extend(drained.asset_records);
                if !drained.is_discovering {
                    break;
                }
                assert!(Instant::now() < deadline, "worker never went idle");
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(records.len(), 1, "round {round}");
        }

        scanner.shutdown_and_drain();
        let _ = fs::remove_dir_all(root);
    }
}
