use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{CResult, Error};
use crate::item::writer::IDEAL_BUNDLE_SIZE;
use crate::item::{BlobId, ItemRegistry, ItemWriter};
use crate::tx::{Command, TxStatus, TxStore};
use crate::upload::FragmentStore;

/// Queue capacity; producers block once this many commits are waiting.
const QUEUE_DEPTH: usize = 100;

/// How long a `sleep` command stalls its worker.
const SLEEP_COMMAND: Duration = Duration::from_secs(1);

/// Everything a commit worker needs, passed by handle rather than held in
/// globals so the whole pipeline tears down with the server.
#[derive(Clone)]
pub struct CommitEnv {
    pub txs: Arc<TxStore>,
    pub uploads: Arc<FragmentStore>,
    pub registry: Arc<ItemRegistry>,
    pub ideal_bundle_size: u64,
    /// Delete staged uploads after their transaction finishes cleanly.
    /// Off by default; the conservative policy leaves them for operator
    /// cleanup.
    pub delete_uploads: bool,
}

impl CommitEnv {
    pub fn new(txs: Arc<TxStore>, uploads: Arc<FragmentStore>, registry: Arc<ItemRegistry>) -> Self {
        CommitEnv {
            txs,
            uploads,
            registry,
            ideal_bundle_size: IDEAL_BUNDLE_SIZE,
            delete_uploads: false,
        }
    }
}

/// A bounded pool of worker threads draining the commit queue. Enqueueing
/// blocks when the queue is full; `stop` closes the queue, drains what is
/// already in flight, and joins the workers.
pub struct CommitPool {
    sender: Mutex<Option<SyncSender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CommitPool {
    /// Starts `n` workers (at least one).
    pub fn start(n: usize, env: CommitEnv) -> CResult<CommitPool> {
        let (sender, receiver) = mpsc::sync_channel(QUEUE_DEPTH);
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::new();
        for i in 0..n.max(1) {
            let env = env.clone();
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("commit-{}", i))
                .spawn(move || worker_loop(env, receiver))?;
            workers.push(handle);
        }
        Ok(CommitPool { sender: Mutex::new(Some(sender)), workers: Mutex::new(workers) })
    }

    /// Queues a transaction id for processing. Blocks on back-pressure
    /// when the queue is full.
    pub fn enqueue(&self, tx_id: &str) -> CResult<()> {
        let sender = self.sender.lock()?;
        match sender.as_ref() {
            Some(sender) => sender
                .send(tx_id.to_string())
                .map_err(|_| Error::Internal("commit queue is closed".to_string())),
            None => Err(Error::Internal("commit pool is stopped".to_string())),
        }
    }

    /// Closes the queue and waits for the workers to drain it.
    pub fn stop(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                if handle.join().is_err() {
                    log::error!("commit worker panicked");
                }
            }
        }
    }
}

fn worker_loop(env: CommitEnv, receiver: Arc<Mutex<Receiver<String>>>) {
    loop {
        let tx_id = {
            let receiver = match receiver.lock() {
                Ok(receiver) => receiver,
                Err(_) => return,
            };
            match receiver.recv() {
                Ok(tx_id) => tx_id,
                Err(_) => return, // queue closed and drained
            }
        };
        process(&env, &tx_id);
    }
}

/// Runs one transaction to a terminal state: verify the referenced
/// uploads, then execute the command list in order against an item
/// writer. Command-level errors are accumulated so unrelated commands
/// still make progress; the transaction ends in `Error` when any
/// accumulated.
fn process(env: &CommitEnv, tx_id: &str) {
    let tx = match env.txs.get(tx_id) {
        Some(tx) => tx,
        None => return, // cancelled before a worker got to it
    };
    let rec = match tx.record() {
        Ok(rec) => rec,
        Err(err) => {
            log::error!("cannot read transaction {}: {}", tx_id, err);
            return;
        }
    };
    if rec.status.terminal() {
        return;
    }
    log::info!("commit {} against item {} begins", tx_id, rec.item_id);

    if let Err(err) = tx.modify(|r| r.status = TxStatus::Checking) {
        log::error!("cannot advance transaction {}: {}", tx_id, err);
        return;
    }
    let mut errors = verify_files(env, &rec.commands);
    if !errors.is_empty() {
        finish(env, tx_id, TxStatus::Error, BTreeMap::new(), errors);
        return;
    }

    if let Err(err) = tx.modify(|r| r.status = TxStatus::Ingest) {
        log::error!("cannot advance transaction {}: {}", tx_id, err);
        return;
    }
    let mut blob_map = BTreeMap::new();
    match ItemWriter::open(&env.registry, &rec.item_id, &rec.creator) {
        Err(err) => errors.push(err.to_string()),
        Ok(mut writer) => {
            writer.set_ideal_size(env.ideal_bundle_size);
            for cmd in &rec.commands {
                if let Err(err) = execute(env, &mut writer, &mut blob_map, cmd) {
                    errors.push(err.to_string());
                }
            }
            if let Err(err) = writer.close() {
                errors.push(err.to_string());
            }
        }
    }

    let status = if errors.is_empty() { TxStatus::Finished } else { TxStatus::Error };
    finish(env, tx_id, status, blob_map, errors);

    if status == TxStatus::Finished && env.delete_uploads {
        for cmd in &rec.commands {
            if let Command::Add(fid) = cmd {
                if let Err(err) = env.uploads.delete(fid) {
                    log::warn!("cannot delete ingested upload {}: {}", fid, err);
                }
            }
        }
    }
}

/// Looks up and verifies every upload referenced by an `add` command.
fn verify_files(env: &CommitEnv, commands: &[Command]) -> Vec<String> {
    let mut errors = Vec::new();
    for cmd in commands {
        let fid = match cmd {
            Command::Add(fid) => fid,
            _ => continue,
        };
        match env.uploads.lookup(fid) {
            None => errors.push(format!("upload {} is missing", fid)),
            Some(file) => match file.verify() {
                Ok(true) => {}
                Ok(false) => errors.push(format!("upload {} failed checksum verification", fid)),
                Err(err) => errors.push(format!("cannot verify upload {}: {}", fid, err)),
            },
        }
    }
    errors
}

fn execute(
    env: &CommitEnv,
    writer: &mut ItemWriter,
    blob_map: &mut BTreeMap<String, BlobId>,
    cmd: &Command,
) -> CResult<()> {
    match cmd {
        Command::Add(fid) => {
            let file = env
                .uploads
                .lookup(fid)
                .ok_or_else(|| Error::NoKey(format!("upload {}", fid)))?;
            let stat = file.stat()?;
            let mut reader = file.open()?;
            let md5 = (!stat.md5.is_empty()).then(|| stat.md5.clone());
            let sha256 = (!stat.sha256.is_empty()).then(|| stat.sha256.clone());
            let bid = writer.write_blob(&mut reader, Some(stat.size), md5, sha256)?;
            if !stat.mime_type.is_empty() {
                writer.set_mime_type(bid, &stat.mime_type)?;
            }
            blob_map.insert(fid.clone(), bid);
            Ok(())
        }
        Command::Slot(name, target) => {
            let bid = match blob_map.get(target) {
                Some(bid) => *bid,
                None => target
                    .parse()
                    .map_err(|_| Error::Malformed(format!("slot target {:?}", target)))?,
            };
            writer.set_slot(name, bid)
        }
        Command::Delete(bid) => writer.delete_blob(*bid),
        Command::Note(text) => {
            writer.set_note(text);
            Ok(())
        }
        Command::Sleep => {
            std::thread::sleep(SLEEP_COMMAND);
            Ok(())
        }
    }
}

/// Records the terminal state of a transaction.
fn finish(
    env: &CommitEnv,
    tx_id: &str,
    status: TxStatus,
    blob_map: BTreeMap<String, BlobId>,
    errors: Vec<String>,
) {
    let tx = match env.txs.get(tx_id) {
        Some(tx) => tx,
        None => return, // cancelled while running; nothing left to record
    };
    let outcome = tx.modify(|r| {
        r.blob_map = blob_map;
        r.errors.extend(errors);
        r.status = status;
    });
    match outcome {
        Ok(()) => log::info!("commit {} ended {:?}", tx_id, status),
        Err(err) => log::error!("cannot finish transaction {}: {}", tx_id, err),
    }
}

/// Requeues restartable transactions after a process restart. Open,
/// waiting, and checking records are run again from the top. A record
/// caught mid-ingest is marked errored instead: its item writer may have
/// already produced bundles, and re-running it could ingest content twice
/// whenever an upload carries no digest for the dedup check to key on.
pub fn requeue(env: &CommitEnv, pool: &CommitPool) -> CResult<()> {
    for tx_id in env.txs.list()? {
        let tx = match env.txs.get(&tx_id) {
            Some(tx) => tx,
            None => continue,
        };
        let rec = tx.record()?;
        match rec.status {
            TxStatus::Finished | TxStatus::Error => {}
            TxStatus::Ingest => {
                tx.modify(|r| {
                    r.errors.push("interrupted during ingest; needs manual review".to_string());
                    r.status = TxStatus::Error;
                })?;
                log::warn!("transaction {} was interrupted during ingest", tx_id);
            }
            TxStatus::Open | TxStatus::Waiting | TxStatus::Checking => {
                tx.modify(|r| r.status = TxStatus::Waiting)?;
                pool.enqueue(&tx_id)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::store::memory::Memory;
    use crate::store::Store;
    use crate::tx::TxRecord;

    fn env() -> (CommitEnv, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(Memory::new());
        let txs = Arc::new(TxStore::new(store.clone()));
        let uploads = Arc::new(FragmentStore::new(store.clone()));
        let registry = Arc::new(ItemRegistry::new(store.clone(), None));
        (CommitEnv::new(txs, uploads, registry), store)
    }

    fn stage(env: &CommitEnv, id: &str, content: &[u8]) -> CResult<()> {
        let file = env.uploads.create(id, "tester")?.expect("fresh upload id");
        let mut w = file.append()?;
        w.write_all(content).map_err(Error::from)?;
        w.close()
    }

    fn run(env: &CommitEnv, item: &str, commands: Vec<Command>) -> CResult<TxRecord> {
        let tx = env.txs.create(item, "tester")?;
        tx.modify(|r| {
            r.commands = commands;
            r.status = TxStatus::Waiting;
        })?;
        let id = tx.id().to_string();
        let pool = CommitPool::start(2, env.clone())?;
        pool.enqueue(&id)?;
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let rec = tx.record()?;
            if rec.status.terminal() {
                pool.stop();
                return Ok(rec);
            }
            if Instant::now() > deadline {
                pool.stop();
                return Err(Error::Timeout);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn add_and_slot() -> CResult<()> {
        let (env, _) = env();
        stage(&env, "u1", b"hello world")?;

        let rec = run(
            &env,
            "zxcv",
            vec![
                Command::Add("u1".into()),
                Command::Slot("greeting".into(), "u1".into()),
                Command::Note("first".into()),
            ],
        )?;
        assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);
        assert_eq!(rec.blob_map.get("u1"), Some(&1));

        let item = env.registry.item("zxcv")?;
        assert_eq!(item.versions.len(), 1);
        assert_eq!(item.versions[0].note, "first");
        assert_eq!(item.versions[0].slots["greeting"], 1);

        // The conservative policy keeps the staged upload around.
        assert!(env.uploads.lookup("u1").is_some());
        Ok(())
    }

    #[test]
    fn missing_upload_fails_checking() -> CResult<()> {
        let (env, _) = env();
        let rec = run(&env, "zxcv", vec![Command::Add("ghost".into())])?;
        assert_eq!(rec.status, TxStatus::Error);
        assert!(rec.errors.iter().any(|e| e.contains("ghost")));
        // Nothing was written.
        assert!(matches!(env.registry.item("zxcv"), Err(Error::NoItem(_))));
        Ok(())
    }

    #[test]
    fn bad_upload_digest_fails_checking() -> CResult<()> {
        let (env, _) = env();
        stage(&env, "u1", b"hello world")?;
        env.uploads.lookup("u1").expect("staged").set_md5(vec![0; 16])?;

        let rec = run(&env, "zxcv", vec![Command::Add("u1".into())])?;
        assert_eq!(rec.status, TxStatus::Error);
        assert!(rec.errors.iter().any(|e| e.contains("checksum")));
        Ok(())
    }

    #[test]
    fn command_errors_do_not_stop_later_commands() -> CResult<()> {
        let (env, _) = env();
        stage(&env, "u1", b"content")?;

        // The delete refers to a blob that does not exist; the add after
        // it still lands.
        let rec = run(
            &env,
            "zxcv",
            vec![Command::Delete(9), Command::Add("u1".into())],
        )?;
        assert_eq!(rec.status, TxStatus::Error);
        assert_eq!(rec.blob_map.get("u1"), Some(&1));
        assert_eq!(env.registry.item("zxcv")?.blobs.len(), 1);
        Ok(())
    }

    #[test]
    fn delete_uploads_policy() -> CResult<()> {
        let (mut base, _) = env();
        base.delete_uploads = true;
        stage(&base, "u1", b"content")?;
        let rec = run(&base, "zxcv", vec![Command::Add("u1".into())])?;
        assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);
        assert!(base.uploads.lookup("u1").is_none());
        Ok(())
    }

    #[test]
    fn requeue_after_restart() -> CResult<()> {
        let (env, _) = env();
        stage(&env, "u1", b"content")?;

        // Simulate records left behind by a dead process.
        let waiting = env.txs.create("aaa", "t")?;
        waiting.modify(|r| {
            r.commands = vec![Command::Add("u1".into())];
            r.status = TxStatus::Waiting;
        })?;
        let ingest = env.txs.create("bbb", "t")?;
        ingest.modify(|r| r.status = TxStatus::Ingest)?;
        let done = env.txs.create("ccc", "t")?;
        done.modify(|r| r.status = TxStatus::Finished)?;

        let pool = CommitPool::start(1, env.clone())?;
        requeue(&env, &pool)?;

        let deadline = Instant::now() + Duration::from_secs(30);
        while !waiting.record()?.status.terminal() {
            assert!(Instant::now() < deadline, "commit never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        pool.stop();

        assert_eq!(waiting.record()?.status, TxStatus::Finished);
        assert_eq!(ingest.record()?.status, TxStatus::Error);
        assert_eq!(done.record()?.status, TxStatus::Finished);
        Ok(())
    }
}
