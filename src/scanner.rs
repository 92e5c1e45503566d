//! Contract between the live registry and whatever discovers content.
//!
//! A scanner only produces [`ScanResults`] batches. It never touches the
//! index; the registry pulls batches on its own thread through
//! [`AssetScanner::get_and_drain_results`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::asset::{AssetRecord, PackageData};

/// A name reference into another package, e.g. a row of a data table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SearchableName {
    pub package_name: String,
    pub object_name: Option<String>,
    pub value_name: String,
}

/// Everything a scan learned about the outgoing references of one package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDependencyData {
    pub package_name: String,
    pub package_data: PackageData,
    /// Packages imported by this one.
    pub imports: Vec<String>,
    pub soft_references: Vec<String>,
    pub searchable_names: Vec<SearchableName>,
}

impl PackageDependencyData {
    pub fn new(package_name: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            ..Self::default()
        }
    }
}

/// One drained batch. Within a batch every list is FIFO.
#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    pub discovered_paths: Vec<String>,
    pub asset_records: Vec<AssetRecord>,
    pub dependency_data: Vec<PackageDependencyData>,
    /// Cooked packages that were found without any asset metadata.
    pub cooked_packages_without_metadata: Vec<String>,
    /// Seconds spent per completed search pass.
    pub search_times: Vec<f64>,
    pub pending_files: usize,
    pub pending_paths: usize,
    pub is_discovering: bool,
}

impl ScanResults {
    pub fn has_work(&self) -> bool {
        !self.discovered_paths.is_empty()
            || !self.asset_records.is_empty()
            || !self.dependency_data.is_empty()
            || !self.cooked_packages_without_metadata.is_empty()
    }

    /// Moves the lists of `other` behind ours. Status fields take `other`'s
    /// values since they are newer.
    pub fn append(&mut self, mut other: ScanResults) {
        self.discovered_paths.append(&mut other.discovered_paths);
        self.asset_records.append(&mut other.asset_records);
        self.dependency_data.append(&mut other.dependency_data);
        self.cooked_packages_without_metadata
            .append(&mut other.cooked_packages_without_metadata);
        self.search_times.append(&mut other.search_times);
        self.pending_files = other.pending_files;
        self.pending_paths = other.pending_paths;
        self.is_discovering = other.is_discovering;
    }
}

pub trait AssetScanner: Send {
    /// Hands over everything gathered since the last call.
    fn get_and_drain_results(&mut self) -> ScanResults;

    /// Queues long package paths (`/Game/Props`) for background discovery.
    fn add_search_paths(&mut self, paths: &[String]);

    /// Queues individual long package names for background discovery.
    fn add_files(&mut self, package_names: &[String]);

    /// Hint to move work under `path` to the front.
    fn prioritize_search_path(&mut self, path: &str);

    /// Scans on the calling thread and returns the results directly.
    fn scan_synchronous(&mut self, paths: &[String], package_names: &[String]) -> ScanResults {
        let _ = (paths, package_names);
        ScanResults::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanRequest {
    Paths(Vec<String>),
    Files(Vec<String>),
    Prioritize(String),
}

#[derive(Debug, Default)]
struct Shared {
    results: Mutex<ScanResults>,
    requests: Mutex<Vec<ScanRequest>>,
    discovering: AtomicBool,
    pending_files: AtomicUsize,
    pending_paths: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Mutex guarded hand-off between a producer thread and the registry.
///
/// Clones share the same buffer: the producer keeps one and calls
/// [`ScanChannel::publish`], the registry owns another as its scanner.
#[derive(Debug, Clone, Default)]
pub struct ScanChannel {
    shared: Arc<Shared>,
}

impl ScanChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, results: ScanResults) {
        self.shared.results.lock().append(results);
    }

    pub fn set_discovering(&self, discovering: bool) {
        self.shared.discovering.store(discovering, Ordering::Release);
    }

    pub fn set_pending(&self, files: usize, paths: usize) {
        self.shared.pending_files.store(files, Ordering::Relaxed);
        self.shared.pending_paths.store(paths, Ordering::Relaxed);
    }

    /// True while the producer is busy or a request has not been picked up yet.
    pub fn is_discovering(&self) -> bool {
        self.shared.discovering.load(Ordering::Acquire) || self.requests_in_flight() > 0
    }

    /// Counts a request handed to the producer but not yet queued by it.
    pub fn begin_request(&self) {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Called by the producer once a request's work is in its own queues.
    pub fn finish_request(&self) {
        let _ = self
            .shared
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn requests_in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Requests sent by the registry since the last call, oldest first.
    pub fn take_requests(&self) -> Vec<ScanRequest> {
        std::mem::take(&mut *self.shared.requests.lock())
    }

    fn request(&self, request: ScanRequest) {
        self.shared.requests.lock().push(request);
    }

    fn drain(&self) -> ScanResults {
        // read the flag first: anything published before the producer went
        // idle is then already in the buffer
        let discovering = self.is_discovering();
        let mut results = std::mem::take(&mut *self.shared.results.lock());
        results.is_discovering = discovering;
        results.pending_files = self.shared.pending_files.load(Ordering::Relaxed);
        results.pending_paths = self.shared.pending_paths.load(Ordering::Relaxed);
        results
    }
}

impl AssetScanner for ScanChannel {
    fn get_and_drain_results(&mut self) -> ScanResults {
        self.drain()
    }

    fn add_search_paths(&mut self, paths: &[String]) {
        if !paths.is_empty() {
            self.request(ScanRequest::Paths(paths.to_vec()));
        }
    }

    fn add_files(&mut self, package_names: &[String]) {
        if !package_names.is_empty() {
            self.request(ScanRequest::Files(package_names.to_vec()));
        }
    }

    fn prioritize_search_path(&mut self, path: &str) {
        self.request(ScanRequest::Prioritize(path.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_batches_are_drained_in_order_across_threads() {
        let mut consumer = ScanChannel::new();
        let producer = consumer.clone();

        let worker = std::thread::spawn(move || {
            for idx in 0..3 {
                producer.publish(ScanResults {
                    discovered_paths: vec![format!("/Game/P{idx}")],
                    ..ScanResults::default()
                });
            }
            producer.set_pending(4, 1);
            producer.set_discovering(true);
        });
        worker.join().unwrap();

        let drained = consumer.get_and_drain_results();
        assert_eq!(drained.discovered_paths, vec!["/Game/P0", "/Game/P1", "/Game/P2"]);
        assert_eq!(drained.pending_files, 4);
        assert!(drained.is_discovering);
        assert!(!consumer.get_and_drain_results().has_work());
    }

    #[test]
    fn registry_requests_reach_the_producer() {
        let mut consumer = ScanChannel::new();
        let producer = consumer.clone();
        consumer.add_search_paths(&["/Game".to_string()]);
        consumer.add_files(&[]);
        consumer.prioritize_search_path("/Game/Maps");
        assert_eq!(
            producer.take_requests(),
            vec![
                ScanRequest::Paths(vec!["/Game".to_string()]),
                ScanRequest::Prioritize("/Game/Maps".to_string())
            ]
        );
        assert!(producer.take_requests().is_empty());
    }

    #[test]
    fn requests_in_flight_keep_the_channel_discovering() {
        let mut consumer = ScanChannel::new();
        let producer = consumer.clone();

        producer.begin_request();
        producer.set_discovering(false);
        assert!(consumer.is_discovering());
        assert!(consumer.get_and_drain_results().is_discovering);

        producer.finish_request();
        assert_eq!(producer.requests_in_flight(), 0);
        assert!(!consumer.get_and_drain_results().is_discovering);

        // an unmatched finish never wraps the counter
        producer.finish_request();
        assert_eq!(producer.requests_in_flight(), 0);
    }
}
