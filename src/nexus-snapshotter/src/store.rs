//! Transactional metadata store.
//!
//! Snapshot records live in a single-file embedded database. Every
//! multi-step operation runs inside exactly one transaction: the closure
//! passed to [`MetaStore::with_write`] either commits as a whole or aborts
//! as a whole, so readers in other transactions never observe partial
//! writes. This is the only serialization point in the snapshotter — there
//! is deliberately no process-wide mutex around snapshot operations.

use chrono::{DateTime, Utc};
use redb::{Database, ReadOnlyTable, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::snapshot::{Info, Kind, Snapshot, Usage, WalkFilter};

const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Key in [`SEQUENCES`] holding the next snapshot id. Ids are never reused.
const NEXT_ID_KEY: &str = "next-snapshot-id";

/// Stored form of one snapshot, keyed by its client-visible key (active and
/// view snapshots) or name (committed snapshots).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Record {
    pub(crate) id: u64,
    pub(crate) kind: Kind,
    pub(crate) parent: String,
    pub(crate) labels: HashMap<String, String>,
    pub(crate) size: u64,
    pub(crate) inodes: u64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

fn make_info(key: &str, record: &Record) -> Info {
    Info {
        id: record.id.to_string(),
        name: key.to_string(),
        parent: record.parent.clone(),
        kind: record.kind,
        labels: record.labels.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

/// Read operations shared by read and write transactions.
pub(crate) trait SnapshotReader {
    fn record(&self, key: &str) -> Result<Option<Record>>;
    fn for_each_record(&self, f: &mut dyn FnMut(&str, &Record) -> Result<()>) -> Result<()>;

    fn require_record(&self, key: &str) -> Result<Record> {
        self.record(key)?
            .ok_or_else(|| Error::NotFound(format!("snapshot {key}")))
    }

    fn get_info(&self, key: &str) -> Result<(Info, Usage)> {
        let record = self.require_record(key)?;
        let usage = Usage {
            size: record.size,
            inodes: record.inodes,
        };
        Ok((make_info(key, &record), usage))
    }

    /// Resolves a snapshot and its ancestor id chain, newest parent first.
    fn get_snapshot(&self, key: &str) -> Result<Snapshot> {
        let record = self.require_record(key)?;
        let mut parent_ids = Vec::new();
        let mut next = record.parent.clone();
        while !next.is_empty() {
            let ancestor = self
                .record(&next)?
                .ok_or_else(|| Error::NotFound(format!("ancestor snapshot {next}")))?;
            parent_ids.push(ancestor.id.to_string());
            next = ancestor.parent;
        }
        Ok(Snapshot {
            id: record.id.to_string(),
            kind: record.kind,
            parent_ids,
        })
    }

    /// Maps every live snapshot id to its key. Directories on disk whose
    /// name is absent from this map are orphans.
    fn id_map(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        self.for_each_record(&mut |key, record| {
            map.insert(record.id.to_string(), key.to_string());
            Ok(())
        })?;
        Ok(map)
    }

    fn walk(&self, filter: &WalkFilter, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        self.for_each_record(&mut |key, record| {
            let info = make_info(key, record);
            if filter.matches(&info) {
                f(&info)?;
            }
            Ok(())
        })
    }
}

pub(crate) struct WriteTx<'txn> {
    snapshots: Table<'txn, &'static str, &'static [u8]>,
    sequences: Table<'txn, &'static str, u64>,
}

pub(crate) struct ReadTx {
    snapshots: ReadOnlyTable<&'static str, &'static [u8]>,
}

fn decode_record(bytes: &[u8]) -> Result<Record> {
    Ok(serde_json::from_slice(bytes)?)
}

fn iterate<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    f: &mut dyn FnMut(&str, &Record) -> Result<()>,
) -> Result<()> {
    for entry in table.iter()? {
        let (key, value) = entry?;
        let record = decode_record(value.value())?;
        f(key.value(), &record)?;
    }
    Ok(())
}

impl SnapshotReader for WriteTx<'_> {
    fn record(&self, key: &str) -> Result<Option<Record>> {
        match self.snapshots.get(key)? {
            Some(guard) => Ok(Some(decode_record(guard.value())?)),
            None => Ok(None),
        }
    }

    fn for_each_record(&self, f: &mut dyn FnMut(&str, &Record) -> Result<()>) -> Result<()> {
        iterate(&self.snapshots, f)
    }
}

impl SnapshotReader for ReadTx {
    fn record(&self, key: &str) -> Result<Option<Record>> {
        match self.snapshots.get(key)? {
            Some(guard) => Ok(Some(decode_record(guard.value())?)),
            None => Ok(None),
        }
    }

    fn for_each_record(&self, f: &mut dyn FnMut(&str, &Record) -> Result<()>) -> Result<()> {
        iterate(&self.snapshots, f)
    }
}

impl WriteTx<'_> {
    fn put(&mut self, key: &str, record: &Record) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.snapshots.insert(key, bytes.as_slice())?;
        Ok(())
    }

    fn next_id(&mut self) -> Result<u64> {
        let current = self
            .sequences
            .get(NEXT_ID_KEY)?
            .map(|guard| guard.value())
            .unwrap_or(1);
        self.sequences.insert(NEXT_ID_KEY, current + 1)?;
        Ok(current)
    }

    /// Creates a new snapshot record.
    ///
    /// A non-empty `parent` must name an existing committed snapshot:
    /// a missing parent is `NotFound`, an uncommitted one is reported as
    /// invalid argument (see [`Error::ParentNotCommitted`]).
    pub(crate) fn create_snapshot(
        &mut self,
        kind: Kind,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Snapshot> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("snapshot key is empty".into()));
        }
        if self.record(key)?.is_some() {
            return Err(Error::AlreadyExists(format!("snapshot {key}")));
        }

        let mut parent_ids = Vec::new();
        if !parent.is_empty() {
            let parent_record = self
                .record(parent)?
                .ok_or_else(|| Error::NotFound(format!("parent snapshot {parent}")))?;
            if parent_record.kind != Kind::Committed {
                return Err(Error::ParentNotCommitted {
                    parent: parent.to_string(),
                });
            }
            parent_ids.push(parent_record.id.to_string());
            let mut next = parent_record.parent;
            while !next.is_empty() {
                let ancestor = self
                    .record(&next)?
                    .ok_or_else(|| Error::NotFound(format!("ancestor snapshot {next}")))?;
                parent_ids.push(ancestor.id.to_string());
                next = ancestor.parent;
            }
        }

        let id = self.next_id()?;
        let now = Utc::now();
        let record = Record {
            id,
            kind,
            parent: parent.to_string(),
            labels,
            size: 0,
            inodes: 0,
            created_at: now,
            updated_at: now,
        };
        self.put(key, &record)?;

        Ok(Snapshot {
            id: id.to_string(),
            kind,
            parent_ids,
        })
    }

    /// Turns the active snapshot at `key` into a committed snapshot named
    /// `name`, retiring the active record in the same transaction. A second
    /// concurrent commit of the same key therefore fails with `NotFound`.
    pub(crate) fn commit_active(
        &mut self,
        key: &str,
        name: &str,
        usage: Usage,
        labels: HashMap<String, String>,
    ) -> Result<String> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name is empty".into()));
        }
        if self.record(name)?.is_some() {
            return Err(Error::AlreadyExists(format!("snapshot {name}")));
        }
        let record = self.require_record(key)?;
        if record.kind != Kind::Active {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {key} is not active"
            )));
        }

        self.snapshots.remove(key)?;

        let mut merged = record.labels;
        merged.extend(labels);
        let committed = Record {
            id: record.id,
            kind: Kind::Committed,
            parent: record.parent,
            labels: merged,
            size: usage.size,
            inodes: usage.inodes,
            created_at: record.created_at,
            updated_at: Utc::now(),
        };
        self.put(name, &committed)?;
        Ok(record.id.to_string())
    }

    /// Removes the record for `key`, refusing when other snapshots still
    /// reference it as their parent.
    pub(crate) fn remove(&mut self, key: &str) -> Result<(String, Kind)> {
        let record = self.require_record(key)?;

        let mut has_child = false;
        self.for_each_record(&mut |_, candidate| {
            if candidate.parent == key {
                has_child = true;
            }
            Ok(())
        })?;
        if has_child {
            return Err(Error::FailedPrecondition(format!(
                "cannot remove snapshot {key}: has children"
            )));
        }

        self.snapshots.remove(key)?;
        Ok((record.id.to_string(), record.kind))
    }

    /// Updates a snapshot's mutable fields. Only labels may change; an empty
    /// fieldpath list replaces the label set, `labels` replaces it
    /// explicitly, and `labels.<key>` copies a single entry (removing it
    /// when absent from `info.labels`).
    pub(crate) fn update_info(&mut self, info: &Info, fieldpaths: &[String]) -> Result<Info> {
        let mut record = self.require_record(&info.name)?;

        if fieldpaths.is_empty() {
            record.labels = info.labels.clone();
        } else {
            for path in fieldpaths {
                if path == "labels" {
                    record.labels = info.labels.clone();
                } else if let Some(label) = path.strip_prefix("labels.") {
                    match info.labels.get(label) {
                        Some(value) => {
                            record.labels.insert(label.to_string(), value.clone());
                        }
                        None => {
                            record.labels.remove(label);
                        }
                    }
                } else {
                    return Err(Error::InvalidArgument(format!(
                        "cannot update field {path}"
                    )));
                }
            }
        }

        record.updated_at = Utc::now();
        self.put(&info.name, &record)?;
        Ok(make_info(&info.name, &record))
    }
}

/// The embedded metadata database.
pub(crate) struct MetaStore {
    db: Database,
}

impl MetaStore {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(SNAPSHOTS)?;
            txn.open_table(SEQUENCES)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Runs `f` inside a write transaction. The transaction commits only if
    /// `f` returns `Ok`; any error aborts it, leaving the store untouched.
    pub(crate) fn with_write<T>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_write()?;
        let result = {
            let mut tx = WriteTx {
                snapshots: txn.open_table(SNAPSHOTS)?,
                sequences: txn.open_table(SEQUENCES)?,
            };
            f(&mut tx)
        };
        match result {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.abort()?;
                Err(err)
            }
        }
    }

    /// Runs `f` against a consistent read snapshot of the store.
    pub(crate) fn with_read<T>(&self, f: impl FnOnce(&ReadTx) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_read()?;
        let tx = ReadTx {
            snapshots: txn.open_table(SNAPSHOTS)?,
        };
        f(&tx)
    }
}
