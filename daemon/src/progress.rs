/*
Copyright 2022 The Kuasar Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Progress reporting of image pushes and pulls.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::debug;
use podshim_common::{api::shim::TransferInfo, signal::ExitSignal};
use prost_types::Timestamp;
use tokio::sync::mpsc::{channel, Receiver};

use crate::client::{ContentStore, ImageService};

const PUSH_TICK: Duration = Duration::from_millis(100);
const PULL_TICK: Duration = Duration::from_millis(250);
const PUSH_POLL: Duration = Duration::from_millis(500);
const PUSH_WAIT: Duration = Duration::from_secs(60);

pub const STATUS_WAITING: &str = "waiting";
pub const STATUS_UPLOADING: &str = "uploading";
pub const STATUS_COMMITTING: &str = "committing";
pub const STATUS_DONE: &str = "done";
pub const STATUS_DOWNLOADING: &str = "downloading";
pub const STATUS_UNPACKING: &str = "unpacking";

/// Upload state of one ref, as recorded by the pusher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub offset: i64,
    pub total: i64,
    pub started_at: i64,
    pub updated_at: i64,
    /// Set while a registry upload session is open.
    pub upload_uuid: String,
}

pub trait StatusTracker: Send + Sync {
    fn get_status(&self, reference: &str) -> Option<Status>;
    fn set_status(&self, reference: &str, status: Status);
    fn remove_status(&self, reference: &str);
}

#[derive(Debug, Default)]
pub struct MemoryTracker {
    statuses: Mutex<HashMap<String, Status>>,
}

impl StatusTracker for MemoryTracker {
    fn get_status(&self, reference: &str) -> Option<Status> {
        let statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.get(reference).cloned()
    }

    fn set_status(&self, reference: &str, status: Status) {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.insert(reference.to_string(), status);
    }

    fn remove_status(&self, reference: &str) {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.remove(reference);
    }
}

#[cfg(test)]
impl MemoryTracker {
    fn len(&self) -> usize {
        self.statuses.lock().unwrap().len()
    }
}

#[derive(Default)]
struct Refs {
    ordered: Vec<String>,
    seen: HashSet<String>,
}

/// The refs of one push job, in the order they were first seen.
pub struct PushTracker {
    statuses: Arc<dyn StatusTracker>,
    refs: Mutex<Refs>,
    done: AtomicBool,
    last: Mutex<Option<Vec<TransferInfo>>>,
}

impl PushTracker {
    pub fn new(statuses: Arc<dyn StatusTracker>) -> Self {
        Self {
            statuses,
            refs: Mutex::new(Refs::default()),
            done: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    pub fn statuses(&self) -> Arc<dyn StatusTracker> {
        self.statuses.clone()
    }

    pub fn add(&self, reference: &str) {
        let mut refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
        if refs.seen.insert(reference.to_string()) {
            refs.ordered.push(reference.to_string());
        }
    }

    /// Marks the job as ended, subscribers send one last snapshot and stop.
    /// The job's statuses are dropped from the shared tracker; the final
    /// snapshot is kept here instead.
    pub fn finish(&self) {
        let last = self.current();
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(last);
        let refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
        for reference in &refs.ordered {
            self.statuses.remove_status(reference);
        }
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<TransferInfo> {
        if let Some(last) = self.last.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return last.clone();
        }
        self.current()
    }

    fn current(&self) -> Vec<TransferInfo> {
        let refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
        refs.ordered
            .iter()
            .map(|reference| match self.statuses.get_status(reference) {
                None => TransferInfo {
                    reference: reference.clone(),
                    status: STATUS_WAITING.to_string(),
                    ..Default::default()
                },
                Some(s) => {
                    let status = if s.offset < s.total {
                        STATUS_UPLOADING
                    } else if s.upload_uuid.is_empty() {
                        STATUS_DONE
                    } else {
                        STATUS_COMMITTING
                    };
                    TransferInfo {
                        reference: reference.clone(),
                        status: status.to_string(),
                        offset: s.offset,
                        total: s.total,
                        started_at: s.started_at,
                        updated_at: s.updated_at,
                    }
                }
            })
            .collect()
    }

    /// Publishes the full snapshot every tick until the job ends or the
    /// receiver goes away.
    pub fn subscribe(self: &Arc<Self>, exit: Arc<ExitSignal>) -> Receiver<Vec<TransferInfo>> {
        let (tx, rx) = channel(1);
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUSH_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = exit.wait() => return,
                }
                let done = tracker.is_done();
                if tx.send(tracker.snapshot()).await.is_err() || done {
                    return;
                }
            }
        });
        rx
    }
}

/// Running pushes keyed by image name.
#[derive(Default)]
pub struct PushJobs {
    jobs: Mutex<HashMap<String, Arc<PushTracker>>>,
}

impl PushJobs {
    pub fn insert(&self, image: &str, tracker: Arc<PushTracker>) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(image.to_string(), tracker);
    }

    pub fn get(&self, image: &str) -> Option<Arc<PushTracker>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(image).cloned()
    }

    pub fn remove(&self, image: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(image);
    }
}

/// Streams the progress of the push of `image`, waiting up to a minute for
/// the push to start. The stream is empty when no push shows up.
pub fn push_progress(
    jobs: Arc<PushJobs>,
    image: &str,
    exit: Arc<ExitSignal>,
) -> Receiver<Vec<TransferInfo>> {
    let (tx, rx) = channel(1);
    let image = image.to_string();
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + PUSH_WAIT;
        let tracker = loop {
            if let Some(t) = jobs.get(&image) {
                break t;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("not tracking a push of {}", image);
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(PUSH_POLL) => {}
                _ = exit.wait() => return,
                _ = tx.closed() => return,
            }
        };
        let mut updates = tracker.subscribe(exit);
        while let Some(snapshot) = updates.recv().await {
            if tx.send(snapshot).await.is_err() {
                return;
            }
        }
        debug!("push of {} done", image);
    });
    rx
}

/// Streams ingest statuses of `ns` until `image` is present. The stream is
/// empty when the image is already there.
pub fn pull_progress(
    images: Arc<dyn ImageService>,
    content: Arc<dyn ContentStore>,
    ns: &str,
    image: &str,
    exit: Arc<ExitSignal>,
) -> Receiver<Vec<TransferInfo>> {
    let (tx, rx) = channel(1);
    let ns = ns.to_string();
    let image = image.to_string();
    tokio::spawn(async move {
        loop {
            match images.image_status(&image).await {
                Ok(Some(_)) => {
                    debug!("pull of {} done", image);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("failed to get status of image {}: {}", image, e);
                    return;
                }
            }
            let statuses = match content.list_statuses(&ns).await {
                Ok(s) => s,
                Err(e) => {
                    debug!("failed to list content statuses: {}", e);
                    return;
                }
            };
            let snapshot = statuses
                .into_iter()
                .map(|s| {
                    let status = if s.offset == s.total {
                        STATUS_UNPACKING
                    } else if s.offset > 0 {
                        STATUS_DOWNLOADING
                    } else {
                        STATUS_WAITING
                    };
                    TransferInfo {
                        status: status.to_string(),
                        offset: s.offset,
                        total: s.total,
                        started_at: unix_nanos(&s.started_at),
                        updated_at: unix_nanos(&s.updated_at),
                        reference: s.r#ref,
                    }
                })
                .collect();
            if tx.send(snapshot).await.is_err() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(PULL_TICK) => {}
                _ = exit.wait() => return,
            }
        }
    });
    rx
}

fn unix_nanos(ts: &Option<Timestamp>) -> i64 {
    ts.as_ref()
        .map(|t| t.seconds * 1_000_000_000 + t.nanos as i64)
        .unwrap_or_default()
}

pub fn now_nanos() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}
