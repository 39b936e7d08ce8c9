//! Append-only JSONL event log, one record per line.
//!
//! Appends are serialized across processes by the `events` lock. Each
//! process caches the last `seq` together with the file length it saw; when
//! the length changed (another process appended) the last record is read
//! back from the tail of the file.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{EventRecord, NewEvent};
use crate::error::CoreError;
use crate::lock::{Expect, LockManager, PathGuard};
use crate::ports::{EventQuery, EventSink};

const TAIL_WINDOW: u64 = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
struct SeqCache {
    file_len: u64,
    last_seq: u64,
}

pub struct JsonlEventLog {
    path: PathBuf,
    guard: PathGuard,
    locks: LockManager,
    cache: Arc<Mutex<Option<SeqCache>>>,
}

impl JsonlEventLog {
    /// Open (or create on first append) `file_name` under the trusted root.
    pub fn open(guard: &PathGuard, file_name: &str, locks: LockManager) -> Result<Self, CoreError> {
        let path = guard.resolve(file_name, Expect::File)?;
        Ok(Self {
            path,
            guard: guard.clone(),
            locks,
            cache: Arc::new(Mutex::new(None)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonlEventLog {
    async fn append(&self, event: NewEvent) -> Result<EventRecord, CoreError> {
        let _lock = self.locks.acquire("events").await?;
        self.guard.verify(&self.path, Expect::File)?;

        let mut cache = self.cache.lock().await;
        let path = self.path.clone();
        let known = *cache;
        let (record, updated) =
            tokio::task::spawn_blocking(move || append_blocking(&path, known, event)).await??;
        *cache = Some(updated);
        Ok(record)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>, CoreError> {
        let path = self.path.clone();
        let records = tokio::task::spawn_blocking(move || read_all(&path)).await??;
        let matching = records.into_iter().filter(|r| query.matches(r)).collect();
        Ok(query.apply_limit(matching))
    }
}

fn append_blocking(
    path: &Path,
    known: Option<SeqCache>,
    event: NewEvent,
) -> Result<(EventRecord, SeqCache), CoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let len = file.metadata()?.len();

    let last_seq = match known {
        Some(cache) if cache.file_len == len => cache.last_seq,
        _ => last_seq_of(&mut file, len)?,
    };

    // 前回のクラッシュで途中まで書かれた行があれば改行で閉じる
    let mut prefix = String::new();
    if len > 0 && !ends_with_newline(&mut file, len)? {
        warn!(path = %path.display(), "event log ends with a partial line, closing it");
        prefix.push('\n');
    }

    let record = event.into_record(last_seq + 1);
    let line = format!("{prefix}{}\n", serde_json::to_string(&record)?);
    file.write_all(line.as_bytes())?;
    file.sync_data()?;

    let cache = SeqCache {
        file_len: len + line.len() as u64,
        last_seq: record.seq,
    };
    Ok((record, cache))
}

fn ends_with_newline(file: &mut File, len: u64) -> Result<bool, CoreError> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Highest `seq` in the file, reading only the tail when possible.
fn last_seq_of(file: &mut File, len: u64) -> Result<u64, CoreError> {
    if len == 0 {
        return Ok(0);
    }
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut tail)?;

    let text = String::from_utf8_lossy(&tail);
    let found = text
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<EventRecord>(line).ok())
        .map(|r| r.seq)
        .next();

    match found {
        Some(seq) => Ok(seq),
        None if start > 0 => {
            // 最終行が窓より長い
            file.seek(SeekFrom::Start(0))?;
            let reader = BufReader::new(&*file);
            Ok(reader
                .lines()
                .map_while(Result::ok)
                .filter_map(|line| serde_json::from_str::<EventRecord>(&line).ok())
                .map(|r| r.seq)
                .max()
                .unwrap_or(0))
        }
        None => Ok(0),
    }
}

fn read_all(path: &Path) -> Result<Vec<EventRecord>, CoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(&line) {
            Ok(r) => records.push(r),
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable event line"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityType;
    use crate::lock::LockPolicy;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> JsonlEventLog {
        let guard = PathGuard::new(dir.path()).unwrap();
        let locks = LockManager::files(&guard, "locks", LockPolicy::default()).unwrap();
        JsonlEventLog::open(&guard, "events.jsonl", locks).unwrap()
    }

    fn ev(id: &str, transition: &str) -> NewEvent {
        NewEvent::new(EntityType::Task, id, transition, Utc::now())
    }

    #[tokio::test]
    async fn seq_is_monotonic_and_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);

        for i in 0..5 {
            let rec = log.append(ev("t1", "claimed")).await.unwrap();
            assert_eq!(rec.seq, i + 1);
        }
        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 5);
    }

    #[tokio::test]
    async fn second_writer_continues_the_sequence() {
        let dir = TempDir::new().unwrap();
        let a = open(&dir);
        let b = open(&dir);

        a.append(ev("t1", "created")).await.unwrap();
        a.append(ev("t1", "claimed")).await.unwrap();
        let rec = b.append(ev("t2", "created")).await.unwrap();
        assert_eq!(rec.seq, 3);
        let rec = a.append(ev("t1", "completed")).await.unwrap();
        assert_eq!(rec.seq, 4);
    }

    #[tokio::test]
    async fn concurrent_appends_never_reuse_seq() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(open(&dir));

        let mut joins = Vec::new();
        for i in 0..20 {
            let log = Arc::clone(&log);
            joins.push(tokio::spawn(async move {
                log.append(ev(&format!("t{i}"), "created")).await.unwrap().seq
            }));
        }
        let mut seqs = Vec::new();
        for j in joins {
            seqs.push(j.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn partial_trailing_line_is_skipped_and_closed() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.append(ev("t1", "created")).await.unwrap();

        let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
        f.write_all(br#"{"seq":2,"times"#).unwrap();
        drop(f);

        let fresh = open(&dir);
        let rec = fresh.append(ev("t1", "claimed")).await.unwrap();
        assert_eq!(rec.seq, 2);

        let all = fresh.query(&EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].transition, "claimed");
    }

    #[tokio::test]
    async fn query_filters_and_limits() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        for t in ["created", "claimed", "stale", "claimed", "completed"] {
            log.append(ev("t1", t)).await.unwrap();
        }
        log.append(ev("t2", "created")).await.unwrap();

        let q = EventQuery {
            limit: Some(2),
            ..EventQuery::for_entity(EntityType::Task, "t1")
        };
        let recs = log.query(&q).await.unwrap();
        let names: Vec<_> = recs.iter().map(|r| r.transition.as_str()).collect();
        assert_eq!(names, vec!["claimed", "completed"]);

        let claimed = log
            .query(&EventQuery {
                transition: Some("claimed".into()),
                ..EventQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        assert!(log.query(&EventQuery::default()).await.unwrap().is_empty());
    }
}
