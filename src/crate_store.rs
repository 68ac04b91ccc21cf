//! Keyed storage for crates.
//!
//! Every store keeps its crates behind a single mutex, so a transition on one
//! id is applied atomically with respect to any other mutation. The game
//! service layers per-crate locks on top for multi-step transitions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ConflictReason, GameError, GameResult};
use crate::types::{Crate, CrateState};

const STORE_FILE_VERSION: u8 = 1;

pub trait CrateStore: Send + Sync {
    /// All crates ordered by the numeric suffix of their id.
    fn list(&self) -> Vec<Crate>;

    fn get(&self, id: &str) -> GameResult<Crate>;

    /// Moves a crate between floor and carried. Re-entering the current
    /// state (picking up a carried crate, dropping a floor crate) is a
    /// conflict.
    fn set_state(&self, id: &str, state: CrateState) -> GameResult<Crate>;

    fn remove(&self, id: &str) -> GameResult<Crate>;

    /// Replaces the whole crate set.
    fn replace_all(&self, crates: Vec<Crate>);

    fn len(&self) -> usize {
        self.list().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct CrateTable {
    crates: HashMap<String, Crate>,
}

impl CrateTable {
    fn from_crates(crates: Vec<Crate>) -> Self {
        Self {
            crates: crates
                .into_iter()
                .map(|krate| (krate.id.clone(), krate))
                .collect(),
        }
    }

    fn list(&self) -> Vec<Crate> {
        let mut crates: Vec<Crate> = self.crates.values().cloned().collect();
        crates.sort_by(|a, b| {
            crate_order_key(&a.id)
                .cmp(&crate_order_key(&b.id))
                .then_with(|| a.id.cmp(&b.id))
        });
        crates
    }

    fn get(&self, id: &str) -> GameResult<Crate> {
        self.crates
            .get(id)
            .cloned()
            .ok_or_else(|| GameError::NotFound(id.to_string()))
    }

    fn set_state(&mut self, id: &str, state: CrateState) -> GameResult<Crate> {
        let current = self
            .crates
            .get_mut(id)
            .ok_or_else(|| GameError::NotFound(id.to_string()))?;
        match (&current.state, &state) {
            (CrateState::OnFloor, CrateState::Carried { .. })
            | (CrateState::Carried { .. }, CrateState::OnFloor) => {}
            (CrateState::Carried { .. }, CrateState::Carried { .. }) => {
                return Err(GameError::Conflict(ConflictReason::AlreadyCarried));
            }
            (CrateState::OnFloor, CrateState::OnFloor) => {
                return Err(GameError::Conflict(ConflictReason::NotCarried));
            }
        }
        current.state = state;
        Ok(current.clone())
    }

    fn remove(&mut self, id: &str) -> GameResult<Crate> {
        self.crates
            .remove(id)
            .ok_or_else(|| GameError::NotFound(id.to_string()))
    }
}

/// Orders `crate_2` before `crate_10`; ids without a numeric suffix go last.
pub fn crate_order_key(crate_id: &str) -> u64 {
    crate_id
        .rsplit('_')
        .next()
        .and_then(|suffix| suffix.parse::<u64>().ok())
        .unwrap_or(u64::MAX)
}

fn lock_table(table: &Mutex<CrateTable>) -> MutexGuard<'_, CrateTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemoryCrateStore {
    table: Mutex<CrateTable>,
}

impl MemoryCrateStore {
    pub fn new(crates: Vec<Crate>) -> Self {
        Self {
            table: Mutex::new(CrateTable::from_crates(crates)),
        }
    }
}

impl CrateStore for MemoryCrateStore {
    fn list(&self) -> Vec<Crate> {
        lock_table(&self.table).list()
    }

    fn get(&self, id: &str) -> GameResult<Crate> {
        lock_table(&self.table).get(id)
    }

    fn set_state(&self, id: &str, state: CrateState) -> GameResult<Crate> {
        lock_table(&self.table).set_state(id, state)
    }

    fn remove(&self, id: &str) -> GameResult<Crate> {
        lock_table(&self.table).remove(id)
    }

    fn replace_all(&self, crates: Vec<Crate>) {
        *lock_table(&self.table) = CrateTable::from_crates(crates);
    }

    fn len(&self) -> usize {
        lock_table(&self.table).crates.len()
    }
}

#[derive(Debug, Serialize)]
struct CrateStoreFile<'a> {
    version: u8,
    #[serde(rename = "savedAt")]
    saved_at: String,
    crates: &'a [Crate],
}

#[derive(Debug, Deserialize)]
struct CrateStoreFileRaw {
    version: u8,
    crates: Vec<serde_json::Value>,
}

/// Crate store persisted as a versioned JSON document. The in-memory table is
/// authoritative. Every successful mutation hands a copy of the crate list to
/// a dedicated writer thread, so request handlers never wait on disk I/O.
/// Dropping the store flushes the last pending write.
#[derive(Debug)]
pub struct JsonFileCrateStore {
    file_path: PathBuf,
    table: Mutex<CrateTable>,
    writer: Option<FileWriter>,
}

#[derive(Debug)]
struct FileWriter {
    tx: mpsc::UnboundedSender<Vec<Crate>>,
    handle: thread::JoinHandle<()>,
}

impl FileWriter {
    fn spawn(file_path: PathBuf) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Crate>>();
        let handle = thread::Builder::new()
            .name("crate-store-writer".to_string())
            .spawn(move || {
                while let Some(mut crates) = rx.blocking_recv() {
                    // Only the newest state matters.
                    while let Ok(newer) = rx.try_recv() {
                        crates = newer;
                    }
                    write_crates_file(&file_path, &crates);
                }
            })?;
        Ok(Self { tx, handle })
    }
}

impl JsonFileCrateStore {
    pub fn open(file_path: PathBuf) -> Self {
        let crates = load_crates(&file_path);
        debug!(path = %file_path.display(), count = crates.len(), "loaded crate store");
        let writer = match FileWriter::spawn(file_path.clone()) {
            Ok(writer) => Some(writer),
            Err(error) => {
                warn!(%error, "crate store writer unavailable, writing inline");
                None
            }
        };
        Self {
            file_path,
            table: Mutex::new(CrateTable::from_crates(crates)),
            writer,
        }
    }

    /// Called with the table lock held so queued states keep mutation order.
    fn persist(&self, table: &CrateTable) {
        let crates = table.list();
        match self.writer.as_ref() {
            Some(writer) => {
                if let Err(mpsc::error::SendError(crates)) = writer.tx.send(crates) {
                    write_crates_file(&self.file_path, &crates);
                }
            }
            None => write_crates_file(&self.file_path, &crates),
        }
    }
}

impl Drop for JsonFileCrateStore {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        drop(writer.tx);
        if writer.handle.join().is_err() {
            warn!(path = %self.file_path.display(), "crate store writer panicked");
        }
    }
}

impl CrateStore for JsonFileCrateStore {
    fn list(&self) -> Vec<Crate> {
        lock_table(&self.table).list()
    }

    fn get(&self, id: &str) -> GameResult<Crate> {
        lock_table(&self.table).get(id)
    }

    fn set_state(&self, id: &str, state: CrateState) -> GameResult<Crate> {
        let mut table = lock_table(&self.table);
        let updated = table.set_state(id, state)?;
        self.persist(&table);
        Ok(updated)
    }

    fn remove(&self, id: &str) -> GameResult<Crate> {
        let mut table = lock_table(&self.table);
        let removed = table.remove(id)?;
        self.persist(&table);
        Ok(removed)
    }

    fn replace_all(&self, crates: Vec<Crate>) {
        let mut table = lock_table(&self.table);
        *table = CrateTable::from_crates(crates);
        self.persist(&table);
    }

    fn len(&self) -> usize {
        lock_table(&self.table).crates.len()
    }
}

fn write_crates_file(file_path: &Path, crates: &[Crate]) {
    if let Some(parent) = file_path.parent() {
        if let Err(error) = fs::create_dir_all(parent) {
            warn!(path = %parent.display(), %error, "failed to create crate store dir");
            return;
        }
    }

    let payload = CrateStoreFile {
        version: STORE_FILE_VERSION,
        saved_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        crates,
    };
    let text = match serde_json::to_string_pretty(&payload) {
        Ok(text) => text,
        Err(error) => {
            warn!(path = %file_path.display(), %error, "failed to serialize crate store");
            return;
        }
    };

    let tmp_path = file_path.with_extension("json.tmp");
    let result = fs::write(&tmp_path, text).and_then(|_| fs::rename(&tmp_path, file_path));
    if let Err(error) = result {
        warn!(path = %file_path.display(), %error, "failed to write crate store");
    }
}

fn load_crates(path: &Path) -> Vec<Crate> {
    let text = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(error) => {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), %error, "failed to read crate store");
            }
            return Vec::new();
        }
    };
    let parsed = match serde_json::from_str::<CrateStoreFileRaw>(&text) {
        Ok(value) if value.version == STORE_FILE_VERSION => value,
        Ok(value) => {
            warn!(path = %path.display(), version = value.version, "unsupported crate store version");
            return Vec::new();
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to parse crate store");
            return Vec::new();
        }
    };

    let mut crates: HashMap<String, Crate> = HashMap::new();
    for raw in parsed.crates {
        let krate: Crate = match serde_json::from_value(raw) {
            Ok(krate) => krate,
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping invalid crate entry");
                continue;
            }
        };
        if krate.id.trim().is_empty() {
            continue;
        }
        crates.insert(krate.id.clone(), krate);
    }
    crates.into_values().collect()
}
