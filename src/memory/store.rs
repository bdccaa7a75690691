//! Durable, similarity-indexed failure corpus.
//!
//! Layout on disk:
//! - `<path>`: the versioned index, rewritten atomically on [`MemoryStore::flush`]
//! - `<path>.wal`: one JSON record per line, appended and synced on every
//!   [`MemoryStore::ingest`], removed once a flush has folded it into the index
//! - `<path>.ids`: the highest objective id handed out so far, rewritten
//!   atomically by [`MemoryStore::reserve_objective_ids`]
//!
//! Opening a store replays any WAL left behind by a process that ingested but
//! never flushed. Search is an exact scan ranked by cosine similarity, which
//! is plenty for a corpus that grows by a handful of records per cycle.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::embedding::{Embedder, cosine_similarity};
use super::types::{INDEX_VERSION, IndexFile, MemoryError, MemoryRecord, MemoryResult, RecordKind, ScoredRecord};

/// Similarity-indexed store of past failures.
pub struct MemoryStore {
    path: Option<PathBuf>,
    embedder: Arc<dyn Embedder>,
    records: Vec<MemoryRecord>,
    /// Records ingested since the last flush
    pending: usize,
    /// Highest objective id reserved by planners
    reserved: u64,
}

impl MemoryStore {
    /// Open the store at `path`, loading the index and replaying the WAL.
    ///
    /// A missing index starts a fresh store holding one placeholder record.
    pub fn open(path: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> MemoryResult<Self> {
        let path = path.into();
        let mut store = Self {
            path: Some(path.clone()),
            embedder,
            records: Vec::new(),
            pending: 0,
            reserved: 0,
        };

        if path.exists() {
            store.records = store.load_index(&path)?;
            info!(path = %path.display(), records = store.records.len(), "loaded memory index");
        }

        store.reserved = store.load_reserved()?;

        let replayed = store.replay_wal()?;
        if replayed > 0 {
            info!(replayed, "recovered unflushed memory records");
            store.pending = replayed;
        }

        if store.records.is_empty() {
            store.push_embedded(MemoryRecord::placeholder());
        }
        Ok(store)
    }

    /// A store that never touches disk
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        let mut store = Self {
            path: None,
            embedder,
            records: Vec::new(),
            pending: 0,
            reserved: 0,
        };
        store.push_embedded(MemoryRecord::placeholder());
        store
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total records, placeholder included. Never zero.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of failure records
    pub fn failure_count(&self) -> usize {
        self.records.iter().filter(|r| r.kind == RecordKind::Failure).count()
    }

    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    /// Records waiting for a flush
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Append a record.
    ///
    /// The embedding is always recomputed with this store's embedder. The
    /// record is synced to the WAL before it becomes searchable. Returns
    /// `false` if the same failure was already stored.
    pub fn ingest(&mut self, mut record: MemoryRecord) -> MemoryResult<bool> {
        if self.records.iter().any(|r| r.same_entry(&record)) {
            debug!(test_case_id = record.metadata.test_case_id, "memory record already present");
            return Ok(false);
        }

        record.embedding = self.embedder.embed(&record.content);

        if let Some(wal) = self.wal_path() {
            if let Some(parent) = wal.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&wal)?;
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            file.sync_data()?;
        }

        self.records.push(record);
        self.pending += 1;
        Ok(true)
    }

    /// Fold pending records into the index file.
    ///
    /// The index is replaced atomically; the WAL is dropped only after the
    /// new index is in place.
    pub fn flush(&mut self) -> MemoryResult<()> {
        let Some(path) = self.path.clone() else {
            self.pending = 0;
            return Ok(());
        };
        if self.pending == 0 && path.exists() {
            return Ok(());
        }

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let index = IndexFile {
            version: INDEX_VERSION,
            embedder: self.embedder.name().to_string(),
            dimension: self.embedder.dimension(),
            records: self.records.clone(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer(&mut tmp, &index)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;

        if let Some(wal) = self.wal_path() {
            if wal.exists() {
                fs::remove_file(&wal)?;
            }
        }

        info!(path = %path.display(), records = self.records.len(), flushed = self.pending, "memory index flushed");
        self.pending = 0;
        Ok(())
    }

    /// Highest objective id seen so far, stored or reserved. Zero when none.
    pub fn last_objective_id(&self) -> u64 {
        self.records
            .iter()
            .map(|r| r.metadata.test_case_id)
            .max()
            .unwrap_or(0)
            .max(self.reserved)
    }

    /// Mark every id up to `id` as taken.
    ///
    /// Persisted before returning, so a later process never hands the same id
    /// to a different objective. Lower marks are ignored.
    pub fn reserve_objective_ids(&mut self, id: u64) -> MemoryResult<()> {
        if id <= self.reserved {
            return Ok(());
        }
        if let Some(ids) = self.ids_path() {
            let dir = match ids.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            writeln!(tmp, "{}", id)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&ids)?;
        }
        debug!(id, "objective ids reserved");
        self.reserved = id;
        Ok(())
    }

    /// The `k` records most similar to `query`, most similar first.
    ///
    /// Equal scores keep insertion order.
    pub fn retrieve(&self, query: &str, k: usize) -> Vec<ScoredRecord> {
        if k == 0 {
            return Vec::new();
        }
        let query_vector = self.embedder.embed(query);

        let mut scored: Vec<(f32, usize)> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (cosine_similarity(&query_vector, &r.embedding), i))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        scored
            .into_iter()
            .take(k)
            .map(|(score, i)| ScoredRecord {
                score,
                record: self.records[i].clone(),
            })
            .collect()
    }

    fn wal_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|p| {
            let mut name = p.as_os_str().to_owned();
            name.push(".wal");
            PathBuf::from(name)
        })
    }

    fn ids_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|p| {
            let mut name = p.as_os_str().to_owned();
            name.push(".ids");
            PathBuf::from(name)
        })
    }

    fn load_reserved(&self) -> MemoryResult<u64> {
        let Some(ids) = self.ids_path() else {
            return Ok(0);
        };
        if !ids.exists() {
            return Ok(0);
        }
        let text = fs::read_to_string(&ids)?;
        text.trim()
            .parse()
            .map_err(|_| MemoryError::Incompatible(format!("unreadable id mark in {}", ids.display())))
    }

    fn load_index(&self, path: &Path) -> MemoryResult<Vec<MemoryRecord>> {
        let data = fs::read_to_string(path)?;
        let index: IndexFile = serde_json::from_str(&data)?;

        if index.version != INDEX_VERSION {
            return Err(MemoryError::Incompatible(format!(
                "index version {} (expected {})",
                index.version, INDEX_VERSION
            )));
        }
        if index.embedder != self.embedder.name() || index.dimension != self.embedder.dimension() {
            return Err(MemoryError::Incompatible(format!(
                "index built with {}/{} but store uses {}/{}",
                index.embedder,
                index.dimension,
                self.embedder.name(),
                self.embedder.dimension()
            )));
        }
        Ok(index.records)
    }

    fn replay_wal(&mut self) -> MemoryResult<usize> {
        let Some(wal) = self.wal_path() else {
            return Ok(0);
        };
        if !wal.exists() {
            return Ok(0);
        }

        let mut replayed = 0;
        // Bytes up to the end of the last newline-terminated entry
        let mut complete: u64 = 0;
        let mut reader = BufReader::new(File::open(&wal)?);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                // A torn final entry from a crash mid-append
                break;
            }
            complete += read as u64;

            let text = String::from_utf8_lossy(&line);
            if text.trim().is_empty() {
                continue;
            }
            let mut record: MemoryRecord = match serde_json::from_str(&text) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable memory WAL entry");
                    continue;
                }
            };
            if self.records.iter().any(|r| r.same_entry(&record)) {
                continue;
            }
            if record.embedding.len() != self.embedder.dimension() {
                record.embedding = self.embedder.embed(&record.content);
            }
            self.records.push(record);
            replayed += 1;
        }

        let len = fs::metadata(&wal)?.len();
        if len > complete {
            warn!(discarded = len - complete, "truncating torn memory WAL tail");
            let file = OpenOptions::new().write(true).open(&wal)?;
            file.set_len(complete)?;
            file.sync_data()?;
        }
        Ok(replayed)
    }

    fn push_embedded(&mut self, mut record: MemoryRecord) {
        record.embedding = self.embedder.embed(&record.content);
        self.records.push(record);
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("path", &self.path)
            .field("embedder", &self.embedder.name())
            .field("records", &self.records.len())
            .field("pending", &self.pending)
            .field("reserved", &self.reserved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HashingEmbedder, RecordMetadata};

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::default())
    }

    fn failure(id: u64, env: &str, content: &str) -> MemoryRecord {
        MemoryRecord::failure(
            content,
            RecordMetadata {
                test_case_id: id,
                environment: env.to_string(),
                screenshots: vec![format!("tc{:04}_{}_final.png", id, env)],
            },
        )
    }

    #[test]
    fn test_fresh_store_holds_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("index.json"), embedder()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.records()[0].is_placeholder());
        assert_eq!(store.failure_count(), 0);

        let hits = store.retrieve("past failures", 3);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_ingest_then_retrieve() {
        let mut store = MemoryStore::in_memory(embedder());
        store
            .ingest(failure(1, "Mobile", "Identical pair 8 and 8 stayed on the board after clicking"))
            .unwrap();
        store
            .ingest(failure(2, "Desktop", "Analyzer timed out waiting for a verdict"))
            .unwrap();

        let hits = store.retrieve("pair stayed on the board", 2);
        assert_eq!(hits[0].record.metadata.test_case_id, 1);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let mut store = MemoryStore::in_memory(embedder());
        assert!(store.ingest(failure(1, "Mobile", "x")).unwrap());
        assert!(!store.ingest(failure(1, "Mobile", "x")).unwrap());
        assert!(store.ingest(failure(1, "Desktop", "x")).unwrap());
        assert_eq!(store.failure_count(), 2);
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory").join("index.json");

        let mut store = MemoryStore::open(&path, embedder()).unwrap();
        store.ingest(failure(7, "Desktop", "Sum pair was rejected")).unwrap();
        store.flush().unwrap();
        assert_eq!(store.pending(), 0);
        assert!(!dir.path().join("memory").join("index.json.wal").exists());

        let reloaded = MemoryStore::open(&path, embedder()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.failure_count(), 1);
        assert_eq!(reloaded.retrieve("sum pair rejected", 1)[0].record.metadata.test_case_id, 7);
    }

    #[test]
    fn test_unflushed_records_survive_via_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        {
            let mut store = MemoryStore::open(&path, embedder()).unwrap();
            store.ingest(failure(3, "Mobile", "Board did not change")).unwrap();
            // dropped without flush
        }

        let mut recovered = MemoryStore::open(&path, embedder()).unwrap();
        assert_eq!(recovered.failure_count(), 1);
        assert_eq!(recovered.pending(), 1);

        recovered.flush().unwrap();
        let reloaded = MemoryStore::open(&path, embedder()).unwrap();
        assert_eq!(reloaded.failure_count(), 1);
        assert_eq!(reloaded.pending(), 0);
    }

    #[test]
    fn test_torn_wal_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let mut store = MemoryStore::open(&path, embedder()).unwrap();
            store.ingest(failure(4, "Mobile", "first")).unwrap();
        }
        let mut wal = OpenOptions::new()
            .append(true)
            .open(dir.path().join("index.json.wal"))
            .unwrap();
        wal.write_all(b"{\"kind\":\"failure\",\"cont").unwrap();

        let store = MemoryStore::open(&path, embedder()).unwrap();
        assert_eq!(store.failure_count(), 1);
    }

    #[test]
    fn test_ingest_after_torn_wal_survives_another_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let wal_path = dir.path().join("index.json.wal");
        {
            let mut store = MemoryStore::open(&path, embedder()).unwrap();
            store.ingest(failure(4, "Mobile", "first")).unwrap();
        }
        let mut wal = OpenOptions::new().append(true).open(&wal_path).unwrap();
        wal.write_all(b"{\"kind\":\"failure\",\"cont").unwrap();
        drop(wal);

        {
            let mut store = MemoryStore::open(&path, embedder()).unwrap();
            assert!(fs::read(&wal_path).unwrap().ends_with(b"\n"));
            store.ingest(failure(5, "Desktop", "second")).unwrap();
            // dropped without flush
        }

        let store = MemoryStore::open(&path, embedder()).unwrap();
        assert_eq!(store.failure_count(), 2);
        assert_eq!(store.pending(), 2);
    }

    #[test]
    fn test_reserved_ids_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory").join("index.json");
        {
            let mut store = MemoryStore::open(&path, embedder()).unwrap();
            assert_eq!(store.last_objective_id(), 0);
            store.reserve_objective_ids(1004).unwrap();
            store.reserve_objective_ids(1001).unwrap();
            assert_eq!(store.last_objective_id(), 1004);
        }

        let mut store = MemoryStore::open(&path, embedder()).unwrap();
        assert_eq!(store.last_objective_id(), 1004);

        store.ingest(failure(1010, "Mobile", "stored later")).unwrap();
        assert_eq!(store.last_objective_id(), 1010);
    }

    #[test]
    fn test_incompatible_embedder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let mut store = MemoryStore::open(&path, embedder()).unwrap();
        store.flush().unwrap();

        let result = MemoryStore::open(&path, Arc::new(HashingEmbedder::new(16)));
        assert!(matches!(result, Err(MemoryError::Incompatible(_))));
    }

    #[test]
    fn test_retrieve_zero_k() {
        let store = MemoryStore::in_memory(embedder());
        assert!(store.retrieve("anything", 0).is_empty());
    }
}
