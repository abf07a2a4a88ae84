//! Transactions: the unit of change to an item. A transaction records a
//! command list and progresses through a fixed status ladder as the commit
//! workers pick it up. At most one non-terminal transaction may exist per
//! item, which is what serializes all writes to an item. Records persist
//! as JSON under the `tx:` key prefix and survive restarts.

pub mod commit;

pub use commit::{CommitEnv, CommitPool};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::item::BlobId;
use crate::store::{get_bytes, prefix::Prefix, replace_bytes, Store};

/// Transaction lifecycle. `Finished` and `Error` are terminal; terminal
/// records are immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Open,
    Checking,
    Waiting,
    Ingest,
    Finished,
    Error,
}

impl TxStatus {
    pub fn terminal(self) -> bool {
        matches!(self, TxStatus::Finished | TxStatus::Error)
    }
}

/// One step of a transaction, decoded from the JSON wire shape of a string
/// array: `["add", id]`, `["slot", name, target]`, `["delete", blobid]`,
/// `["note", text]`, `["sleep"]`. Anything else is rejected when the
/// command list is attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub enum Command {
    /// Ingest the named upload as a new blob.
    Add(String),
    /// Bind a slot to a blob: the target is an upload id previously added
    /// in this transaction, or a decimal blob id.
    Slot(String, String),
    /// Tombstone a blob.
    Delete(BlobId),
    /// Set the note on the new version.
    Note(String),
    /// Testing hook: stall the worker briefly.
    Sleep,
}

impl TryFrom<Vec<String>> for Command {
    type Error = Error;

    fn try_from(fields: Vec<String>) -> CResult<Command> {
        let malformed = || Error::Malformed(format!("bad command {:?}", fields));
        match fields.first().map(String::as_str) {
            Some("add") if fields.len() == 2 => Ok(Command::Add(fields[1].clone())),
            Some("slot") if fields.len() == 3 => {
                Ok(Command::Slot(fields[1].clone(), fields[2].clone()))
            }
            Some("delete") if fields.len() == 2 => {
                fields[1].parse().map(Command::Delete).map_err(|_| malformed())
            }
            Some("note") if fields.len() == 2 => Ok(Command::Note(fields[1].clone())),
            Some("sleep") if fields.len() == 1 => Ok(Command::Sleep),
            _ => Err(malformed()),
        }
    }
}

impl From<Command> for Vec<String> {
    fn from(cmd: Command) -> Vec<String> {
        match cmd {
            Command::Add(id) => vec!["add".into(), id],
            Command::Slot(name, target) => vec!["slot".into(), name, target],
            Command::Delete(bid) => vec!["delete".into(), bid.to_string()],
            Command::Note(text) => vec!["note".into(), text],
            Command::Sleep => vec!["sleep".into()],
        }
    }
}

/// Decodes a request body of the form `[["cmd", args...], ...]`, rejecting
/// malformed shapes with `Malformed`.
pub fn commands_from_json(raw: &[u8]) -> CResult<Vec<Command>> {
    serde_json::from_slice(raw).map_err(|err| Error::Malformed(err.to_string()))
}

/// The persistent record of one commit attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Status")]
    pub status: TxStatus,

    #[serde(rename = "Started")]
    pub started: DateTime<Utc>,

    #[serde(rename = "Modified")]
    pub modified: DateTime<Utc>,

    #[serde(rename = "ItemID")]
    pub item_id: String,

    #[serde(rename = "Creator", default, skip_serializing_if = "String::is_empty")]
    pub creator: String,

    #[serde(rename = "Commands", default)]
    pub commands: Vec<Command>,

    /// Upload id to assigned blob id, filled in during ingest.
    #[serde(rename = "BlobMap", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blob_map: BTreeMap<String, BlobId>,

    #[serde(rename = "Errors", default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// A live transaction: the record plus its persistence lock. Workers and
/// inspection requests share one handle per id.
pub struct TxHandle {
    id: String,
    store: Arc<dyn Store>,
    rec: Mutex<TxRecord>,
}

impl TxHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A snapshot of the record.
    pub fn record(&self) -> CResult<TxRecord> {
        Ok(self.rec.lock()?.clone())
    }

    /// Applies a mutation and persists the record before returning.
    /// Refused once the record is terminal.
    pub fn modify(&self, apply: impl FnOnce(&mut TxRecord)) -> CResult<()> {
        let mut rec = self.rec.lock()?;
        if rec.status.terminal() {
            return Err(Error::Conflict(format!("transaction {} is finished", self.id)));
        }
        apply(&mut rec);
        rec.modified = Utc::now();
        let raw = serde_json::to_vec(&*rec)?;
        replace_bytes(self.store.as_ref(), &self.id, &raw)
    }
}

/// All known transactions, persisted under the `tx:` prefix of the shared
/// store.
pub struct TxStore {
    store: Arc<dyn Store>,
    txs: RwLock<HashMap<String, Arc<TxHandle>>>,
}

impl TxStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        TxStore { store: Arc::new(Prefix::new(store, "tx:")), txs: RwLock::new(HashMap::new()) }
    }

    /// Reloads every persisted record. Called once at startup.
    pub fn load(&self) -> CResult<()> {
        let mut txs = self.txs.write()?;
        for id in self.store.list()? {
            let rec: TxRecord = match get_bytes(self.store.as_ref(), &id)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(Error::from))
            {
                Ok(rec) => rec,
                Err(err) => {
                    log::warn!("skipping unreadable transaction record {}: {}", id, err);
                    continue;
                }
            };
            txs.insert(
                id.clone(),
                Arc::new(TxHandle { id, store: self.store.clone(), rec: Mutex::new(rec) }),
            );
        }
        Ok(())
    }

    /// Opens a new transaction against `item_id`. Rejected with `Existing`
    /// while any non-terminal transaction for the item exists.
    pub fn create(&self, item_id: &str, creator: &str) -> CResult<Arc<TxHandle>> {
        crate::item::valid_item_id(item_id)?;
        let mut txs = self.txs.write()?;
        for handle in txs.values() {
            let rec = handle.rec.lock()?;
            if rec.item_id == item_id && !rec.status.terminal() {
                return Err(Error::Existing(format!("transaction for item {}", item_id)));
            }
        }

        let now = Utc::now();
        let id = format!("t{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff);
        let rec = TxRecord {
            id: id.clone(),
            status: TxStatus::Open,
            started: now,
            modified: now,
            item_id: item_id.to_string(),
            creator: creator.to_string(),
            commands: Vec::new(),
            blob_map: BTreeMap::new(),
            errors: Vec::new(),
        };
        let raw = serde_json::to_vec(&rec)?;
        replace_bytes(self.store.as_ref(), &id, &raw)?;
        let handle = Arc::new(TxHandle {
            id: id.clone(),
            store: self.store.clone(),
            rec: Mutex::new(rec),
        });
        txs.insert(id, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TxHandle>> {
        self.txs.read().ok()?.get(id).cloned()
    }

    /// Every transaction id, sorted.
    pub fn list(&self) -> CResult<Vec<String>> {
        let txs = self.txs.read()?;
        let mut ids: Vec<String> = txs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Best-effort removal. A worker already executing the transaction
    /// runs it to completion; only the record is withdrawn here.
    pub fn delete(&self, id: &str) -> CResult<()> {
        self.txs.write()?.remove(id);
        match self.store.delete(id) {
            Ok(()) | Err(Error::NoKey(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
