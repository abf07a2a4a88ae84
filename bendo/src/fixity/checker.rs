use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::bundle::{blob_entry, parse_bundle_key, BundleReader};
use crate::error::{CResult, Error};
use crate::fixity::{Fixity, FixityDb, FixityStatus};
use crate::item::ItemRegistry;
use crate::task::Stopper;

/// Default spacing between checks of one item: 273 days.
pub const NEXT_FIXITY_DURATION: Duration = Duration::from_secs(273 * 24 * 60 * 60);

/// Sleep while the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(60 * 60);

/// Sleep between sweeps for unscheduled items.
const SCAN_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

/// Back-off while tape is administratively disabled or a check errored.
const BACKOFF_SLEEP: Duration = Duration::from_secs(60);

/// The background fixity machinery: a checker loop draining due records
/// and a scanner loop keeping every item on the schedule. Both observe
/// the tape toggle and the stop signal at each iteration.
pub struct FixityTask {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    db: Arc<dyn FixityDb>,
    registry: Arc<ItemRegistry>,
    tape: Arc<AtomicBool>,
    stopper: Arc<Stopper>,
    next_duration: chrono::Duration,
}

impl FixityTask {
    pub fn new(
        db: Arc<dyn FixityDb>,
        registry: Arc<ItemRegistry>,
        tape: Arc<AtomicBool>,
        next_duration: Duration,
    ) -> CResult<Self> {
        let next_duration = chrono::Duration::from_std(next_duration)
            .map_err(|err| Error::Malformed(format!("fixity interval: {}", err)))?;
        Ok(FixityTask {
            inner: Arc::new(Inner {
                db,
                registry,
                tape,
                stopper: Arc::new(Stopper::new()),
                next_duration,
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the checker and scanner loops.
    pub fn start(&self) -> CResult<()> {
        let mut handles = self.handles.lock()?;

        let inner = self.inner.clone();
        handles.push(
            std::thread::Builder::new().name("fixity-check".to_string()).spawn(move || loop {
                if inner.stopper.is_stopped() {
                    return;
                }
                if !inner.tape.load(Ordering::SeqCst) {
                    if inner.stopper.wait_for(BACKOFF_SLEEP) {
                        return;
                    }
                    continue;
                }
                let sleep = match check_once(&inner) {
                    Ok(true) => continue, // more work may be due
                    Ok(false) => IDLE_SLEEP,
                    Err(err) => {
                        log::error!("fixity check failed: {}", err);
                        BACKOFF_SLEEP
                    }
                };
                if inner.stopper.wait_for(sleep) {
                    return;
                }
            })?,
        );

        let inner = self.inner.clone();
        handles.push(
            std::thread::Builder::new().name("fixity-scan".to_string()).spawn(move || loop {
                if inner.stopper.is_stopped() {
                    return;
                }
                if inner.tape.load(Ordering::SeqCst) {
                    if let Err(err) = scan_once(&inner) {
                        log::error!("fixity scan failed: {}", err);
                    }
                    if inner.stopper.wait_for(SCAN_SLEEP) {
                        return;
                    }
                } else if inner.stopper.wait_for(BACKOFF_SLEEP) {
                    return;
                }
            })?,
        );
        Ok(())
    }

    /// Stops both loops and waits for them.
    pub fn stop(&self) {
        self.inner.stopper.stop();
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    log::error!("fixity loop panicked");
                }
            }
        }
    }

    /// Processes at most one due record; true when one was processed.
    /// Exposed for operational use alongside the background loop.
    pub fn check_once(&self) -> CResult<bool> {
        check_once(&self.inner)
    }

    /// Sweeps for items without a scheduled record, booking each at a
    /// random point within the check interval to spread the load.
    pub fn scan_once(&self) -> CResult<()> {
        scan_once(&self.inner)
    }
}

fn check_once(inner: &Inner) -> CResult<bool> {
    let id = inner.db.next_fixity(Utc::now())?;
    if id == 0 {
        return Ok(false);
    }
    let mut rec = match inner.db.get_fixity(id)? {
        Some(rec) => rec,
        None => return Ok(true), // deleted underneath us
    };
    log::info!("fixity check of item {} begins", rec.item);

    let (status, notes) = match validate_item(&inner.registry, &rec.item) {
        Ok(outcome) => outcome,
        Err(err) => (FixityStatus::Error, err.to_string()),
    };
    log::info!("fixity check of item {} ended {}", rec.item, status);
    rec.status = status;
    rec.notes = notes;
    inner.db.update_fixity(&rec)?;

    // Keep the item on the schedule unless another appointment exists.
    if inner.db.lookup_check(&rec.item)?.is_none() {
        inner.db.update_fixity(&Fixity {
            id: 0,
            item: rec.item.clone(),
            scheduled_time: Utc::now() + inner.next_duration,
            status: FixityStatus::Scheduled,
            notes: String::new(),
        })?;
    }
    Ok(true)
}

fn scan_once(inner: &Inner) -> CResult<()> {
    let interval = inner.next_duration.num_seconds().max(1);
    for item in inner.registry.list()? {
        if inner.db.lookup_check(&item)?.is_some() {
            continue;
        }
        let offset = rand::thread_rng().gen_range(0..interval);
        inner.db.update_fixity(&Fixity {
            id: 0,
            item,
            scheduled_time: Utc::now() + chrono::Duration::seconds(offset),
            status: FixityStatus::Scheduled,
            notes: String::new(),
        })?;
    }
    Ok(())
}

/// Verifies one item end to end: every bundle's entries against the
/// bundle manifests, then every live blob's recorded digests against the
/// manifest of the bundle holding it. Checksum problems come back as
/// `Mismatch` with the concatenated messages; system failures (a bundle
/// that cannot be opened, store errors) are returned as `Err` and recorded
/// as an `error` outcome by the caller.
pub fn validate_item(registry: &ItemRegistry, item_id: &str) -> CResult<(FixityStatus, String)> {
    let item = registry.item(item_id)?;
    let store = registry.store();

    let mut problems = Vec::new();
    let mut readers: BTreeMap<u32, BundleReader> = BTreeMap::new();
    for key in store.list_prefix(&format!("{}-", item_id))? {
        let sequence = match parse_bundle_key(&key) {
            Some((id, sequence)) if id == item_id => sequence,
            _ => continue,
        };
        let reader = BundleReader::open(store.as_ref(), &key)?;
        match reader.verify() {
            Ok(()) => {}
            Err(Error::Validation(msgs)) => {
                problems.extend(msgs.into_iter().map(|m| format!("{}: {}", key, m)))
            }
            Err(err) => return Err(err),
        }
        readers.insert(sequence, reader);
    }

    for blob in item.blobs.iter().filter(|b| !b.deleted()) {
        let entry = blob_entry(blob.id);
        let reader = match readers.get(&blob.bundle) {
            Some(reader) => reader,
            None => {
                problems.push(format!("bundle {} holding blob {} is missing", blob.bundle, blob.id));
                continue;
            }
        };
        match reader.checksum(&entry) {
            None => problems.push(format!("blob {} is absent from bundle {}", blob.id, blob.bundle)),
            Some(checksum) => {
                if checksum.md5 != blob.md5 {
                    problems.push(format!("blob {} MD5 differs from the item record", blob.id));
                }
                if checksum.sha256 != blob.sha256 {
                    problems.push(format!("blob {} SHA-256 differs from the item record", blob.id));
                }
            }
        }
        if reader.entry_size(&entry) != Some(blob.size) {
            problems.push(format!("blob {} size differs from the item record", blob.id));
        }
    }

    if problems.is_empty() {
        Ok((FixityStatus::Ok, String::new()))
    } else {
        Ok((FixityStatus::Mismatch, problems.join("; ")))
    }
}
