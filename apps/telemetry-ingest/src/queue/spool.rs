//! Local journal queue.
//!
//! All file access happens on one `spool-writer` thread that owns the journal and the
//! dead-letter log. Both files are a fixed header followed by `[len u32 LE][crc32c u32 LE]
//! [json payload]` frames. A torn tail left by a crash is truncated on open; everything
//! before it is replayed into memory. Lease deadlines are in-memory only, so a restart makes
//! every unacked job deliverable again, but each delivery is journaled so its attempt still
//! counts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

use super::{JobQueue, QueueError, QueueStatus};
use crate::config::IngestConfig;
use crate::readings::{DeadLetter, QueuedJob};

const JOURNAL_MAGIC: &[u8; 8] = b"TIQJRNL1";
const DEAD_LETTER_MAGIC: &[u8; 8] = b"TIQDEAD1";
const LOG_VERSION: u32 = 1;
const LOG_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 8;
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const JOURNAL_FILE: &str = "journal.log";
const DEAD_LETTER_FILE: &str = "dead_letters.log";

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub dir: PathBuf,
    pub lease: Duration,
    pub poll_interval: Duration,
    /// Rewrite the journal once this many records describe jobs that are gone or superseded.
    pub compact_after: u64,
}

impl SpoolConfig {
    pub fn from_ingest(config: &IngestConfig) -> Self {
        Self {
            dir: config.spool_dir.clone(),
            lease: Duration::from_secs(config.lease_seconds),
            poll_interval: Duration::from_millis(config.queue_poll_interval_ms),
            compact_after: config.spool_compact_after,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Enqueued {
        job: QueuedJob,
    },
    Acked {
        job_id: Uuid,
    },
    Leased {
        job_id: Uuid,
        attempts: u32,
    },
    Retry {
        job_id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: String,
    },
    DeadLettered {
        job_id: Uuid,
    },
}

#[derive(Debug)]
enum SpoolCommand {
    Enqueue {
        job: QueuedJob,
        respond_to: oneshot::Sender<Result<Uuid, QueueError>>,
    },
    Dequeue {
        respond_to: oneshot::Sender<Result<Option<QueuedJob>, QueueError>>,
    },
    Ack {
        job_id: Uuid,
        respond_to: oneshot::Sender<Result<(), QueueError>>,
    },
    Nack {
        job_id: Uuid,
        attempts: u32,
        delay: Duration,
        error: String,
        respond_to: oneshot::Sender<Result<(), QueueError>>,
    },
    DeadLetter {
        job: QueuedJob,
        attempts: u32,
        reason: String,
        respond_to: oneshot::Sender<Result<(), QueueError>>,
    },
    ListDeadLetters {
        limit: usize,
        respond_to: oneshot::Sender<Result<Vec<DeadLetter>, QueueError>>,
    },
    Status {
        respond_to: oneshot::Sender<Result<QueueStatus, QueueError>>,
    },
}

#[derive(Clone)]
pub struct SpoolQueue {
    tx: mpsc::UnboundedSender<SpoolCommand>,
    ready: Arc<Notify>,
    poll_interval: Duration,
}

impl SpoolQueue {
    /// Recovers the journal synchronously, then hands it to the writer thread.
    pub fn open(config: SpoolConfig) -> Result<Self, QueueError> {
        fs::create_dir_all(&config.dir)?;
        let poll_interval = config.poll_interval;
        let runtime = SpoolRuntime::open(config)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<SpoolCommand>();

        std::thread::Builder::new()
            .name("spool-writer".to_string())
            .spawn(move || run_spool_thread(runtime, &mut rx))?;

        Ok(Self {
            tx,
            ready: Arc::new(Notify::new()),
            poll_interval,
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, QueueError>>) -> SpoolCommand,
    ) -> Result<T, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| QueueError::Unavailable("spool thread stopped".to_string()))?;
        rx.await
            .map_err(|_| QueueError::Unavailable("spool thread dropped response".to_string()))?
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<Uuid, QueueError> {
        let job_id = self
            .request(|respond_to| SpoolCommand::Enqueue { job, respond_to })
            .await?;
        self.ready.notify_one();
        Ok(job_id)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(job) = self
                .request(|respond_to| SpoolCommand::Dequeue { respond_to })
                .await?
            {
                return Ok(Some(job));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(self.poll_interval);
            let _ = tokio::time::timeout(nap, self.ready.notified()).await;
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.request(|respond_to| SpoolCommand::Ack { job_id, respond_to })
            .await
    }

    async fn nack(
        &self,
        job_id: Uuid,
        attempts: u32,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let error = error.to_string();
        self.request(|respond_to| SpoolCommand::Nack {
            job_id,
            attempts,
            delay,
            error,
            respond_to,
        })
        .await?;
        if delay.is_zero() {
            self.ready.notify_one();
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        job: &QueuedJob,
        attempts: u32,
        reason: &str,
    ) -> Result<(), QueueError> {
        let job = job.clone();
        let reason = reason.to_string();
        self.request(|respond_to| SpoolCommand::DeadLetter {
            job,
            attempts,
            reason,
            respond_to,
        })
        .await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.request(|respond_to| SpoolCommand::ListDeadLetters { limit, respond_to })
            .await
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.request(|respond_to| SpoolCommand::Status { respond_to })
            .await
    }
}

fn run_spool_thread(mut runtime: SpoolRuntime, rx: &mut mpsc::UnboundedReceiver<SpoolCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            SpoolCommand::Enqueue { job, respond_to } => {
                let _ = respond_to.send(runtime.enqueue(job));
            }
            SpoolCommand::Dequeue { respond_to } => {
                let _ = respond_to.send(runtime.dequeue());
            }
            SpoolCommand::Ack { job_id, respond_to } => {
                let _ = respond_to.send(runtime.ack(job_id));
            }
            SpoolCommand::Nack {
                job_id,
                attempts,
                delay,
                error,
                respond_to,
            } => {
                let _ = respond_to.send(runtime.nack(job_id, attempts, delay, error));
            }
            SpoolCommand::DeadLetter {
                job,
                attempts,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(runtime.dead_letter(&job, attempts, &reason));
            }
            SpoolCommand::ListDeadLetters { limit, respond_to } => {
                let listed: Vec<DeadLetter> = runtime
                    .dead_letters
                    .iter()
                    .rev()
                    .take(limit)
                    .cloned()
                    .collect();
                let _ = respond_to.send(Ok(listed));
            }
            SpoolCommand::Status { respond_to } => {
                let _ = respond_to.send(Ok(runtime.status()));
            }
        }
    }
    tracing::debug!("spool thread exiting");
}

const LEASE_EXPIRED: &str = "lease expired before the job was settled";

/// Where a live job currently sits. Each job is indexed in exactly one of the runtime's
/// ready, delayed or leased maps, matching its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Ready,
    Delayed(DateTime<Utc>),
    Leased(Instant),
}

impl Slot {
    fn for_attempt_at(next_attempt_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if next_attempt_at > now {
            Slot::Delayed(next_attempt_at)
        } else {
            Slot::Ready
        }
    }
}

struct SpoolEntry {
    job: QueuedJob,
    seq: u64,
    slot: Slot,
}

struct SpoolRuntime {
    config: SpoolConfig,
    journal_path: PathBuf,
    journal: fs::File,
    dead_letter_log: fs::File,
    jobs: HashMap<Uuid, SpoolEntry>,
    ready: BTreeMap<u64, Uuid>,
    delayed: BTreeMap<(DateTime<Utc>, u64), Uuid>,
    leased: BTreeMap<(Instant, u64), Uuid>,
    next_seq: u64,
    dead_letters: Vec<DeadLetter>,
    dead_letter_ids: HashSet<Uuid>,
    obsolete_records: u64,
}

impl SpoolRuntime {
    fn open(config: SpoolConfig) -> Result<Self, QueueError> {
        let journal_path = config.dir.join(JOURNAL_FILE);
        let dead_letter_path = config.dir.join(DEAD_LETTER_FILE);

        let (dead_letter_log, dead_payloads) = open_log(&dead_letter_path, DEAD_LETTER_MAGIC)?;
        let (journal, journal_payloads) = open_log(&journal_path, JOURNAL_MAGIC)?;

        let mut runtime = Self {
            config,
            journal_path,
            journal,
            dead_letter_log,
            jobs: HashMap::new(),
            ready: BTreeMap::new(),
            delayed: BTreeMap::new(),
            leased: BTreeMap::new(),
            next_seq: 0,
            dead_letters: Vec::new(),
            dead_letter_ids: HashSet::new(),
            obsolete_records: 0,
        };

        for payload in dead_payloads {
            match serde_json::from_slice::<DeadLetter>(&payload) {
                Ok(record) => {
                    if runtime.dead_letter_ids.insert(record.job_id) {
                        runtime.dead_letters.push(record);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "skipping undecodable dead letter"),
            }
        }
        let replayed_at = Instant::now();
        for payload in journal_payloads {
            match serde_json::from_slice::<JournalRecord>(&payload) {
                Ok(record) => runtime.replay(record, replayed_at),
                Err(err) => tracing::warn!(error = %err, "skipping undecodable journal record"),
            }
        }

        tracing::info!(
            pending = runtime.jobs.len(),
            dead_letters = runtime.dead_letters.len(),
            "spool recovered"
        );
        Ok(runtime)
    }

    /// A job whose last journaled record is `Leased` comes back with a lease that has
    /// already lapsed, so its next delivery is reported as a redelivery.
    fn replay(&mut self, record: JournalRecord, replayed_at: Instant) {
        match record {
            JournalRecord::Enqueued { job } => {
                if self.dead_letter_ids.contains(&job.job_id) {
                    self.obsolete_records += 1;
                    return;
                }
                self.insert_job(job);
            }
            JournalRecord::Acked { job_id } | JournalRecord::DeadLettered { job_id } => {
                self.remove_job(job_id);
                self.obsolete_records += 2;
            }
            JournalRecord::Leased { job_id, attempts } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.job.attempts = entry.job.attempts.max(attempts);
                    self.place(job_id, Slot::Leased(replayed_at));
                }
                self.obsolete_records += 1;
            }
            JournalRecord::Retry {
                job_id,
                attempts,
                next_attempt_at,
                last_error,
            } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.job.attempts = attempts;
                    entry.job.next_attempt_at = next_attempt_at;
                    entry.job.last_error = Some(last_error);
                    self.place(job_id, Slot::for_attempt_at(next_attempt_at, Utc::now()));
                }
                self.obsolete_records += 1;
            }
        }
    }

    fn link(&mut self, job_id: Uuid, seq: u64, slot: Slot) {
        match slot {
            Slot::Ready => {
                self.ready.insert(seq, job_id);
            }
            Slot::Delayed(at) => {
                self.delayed.insert((at, seq), job_id);
            }
            Slot::Leased(until) => {
                self.leased.insert((until, seq), job_id);
            }
        }
    }

    fn unlink(&mut self, seq: u64, slot: Slot) {
        match slot {
            Slot::Ready => {
                self.ready.remove(&seq);
            }
            Slot::Delayed(at) => {
                self.delayed.remove(&(at, seq));
            }
            Slot::Leased(until) => {
                self.leased.remove(&(until, seq));
            }
        }
    }

    fn place(&mut self, job_id: Uuid, slot: Slot) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let (seq, previous) = (entry.seq, entry.slot);
        entry.slot = slot;
        self.unlink(seq, previous);
        self.link(job_id, seq, slot);
    }

    fn insert_job(&mut self, job: QueuedJob) {
        if self.jobs.contains_key(&job.job_id) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let job_id = job.job_id;
        let slot = Slot::for_attempt_at(job.next_attempt_at, Utc::now());
        self.jobs.insert(job_id, SpoolEntry { job, seq, slot });
        self.link(job_id, seq, slot);
    }

    fn remove_job(&mut self, job_id: Uuid) -> bool {
        let Some(entry) = self.jobs.remove(&job_id) else {
            return false;
        };
        self.unlink(entry.seq, entry.slot);
        true
    }

    fn enqueue(&mut self, job: QueuedJob) -> Result<Uuid, QueueError> {
        let job_id = job.job_id;
        if self.jobs.contains_key(&job_id) || self.dead_letter_ids.contains(&job_id) {
            return Ok(job_id);
        }
        let record = JournalRecord::Enqueued { job };
        append_frame(&mut self.journal, &serde_json::to_vec(&record)?, true)?;
        if let JournalRecord::Enqueued { job } = record {
            self.insert_job(job);
        }
        Ok(job_id)
    }

    /// Moves delayed jobs whose time has come and lapsed leases back to the ready map.
    fn promote_due(&mut self, now: DateTime<Utc>, now_instant: Instant) {
        while let Some((&(at, seq), &job_id)) = self.delayed.first_key_value() {
            if at > now {
                break;
            }
            if self.jobs.contains_key(&job_id) {
                self.place(job_id, Slot::Ready);
            } else {
                self.delayed.remove(&(at, seq));
            }
        }
        while let Some((&(until, seq), &job_id)) = self.leased.first_key_value() {
            if until > now_instant {
                break;
            }
            match self.jobs.get_mut(&job_id) {
                Some(entry) => {
                    tracing::warn!(job_id = %job_id, attempts = entry.job.attempts, "lease expired; redelivering job");
                    entry.job.last_error = Some(LEASE_EXPIRED.to_string());
                    self.place(job_id, Slot::Ready);
                }
                None => {
                    self.leased.remove(&(until, seq));
                }
            }
        }
    }

    /// Leases the oldest ready job. The delivery is journaled before the job is handed out
    /// so a worker that dies mid-write still spends an attempt.
    fn dequeue(&mut self) -> Result<Option<QueuedJob>, QueueError> {
        self.promote_due(Utc::now(), Instant::now());
        let Some((_, &job_id)) = self.ready.first_key_value() else {
            return Ok(None);
        };
        let Some(entry) = self.jobs.get(&job_id) else {
            return Ok(None);
        };
        let attempts = entry.job.attempts.saturating_add(1);

        // Not fsynced: the page cache outlives a crashed process, which is the case this covers.
        let record = JournalRecord::Leased { job_id, attempts };
        append_frame(&mut self.journal, &serde_json::to_vec(&record)?, false)?;
        self.obsolete_records += 1;

        self.place(job_id, Slot::Leased(Instant::now() + self.config.lease));
        Ok(self.jobs.get_mut(&job_id).map(|entry| {
            entry.job.attempts = attempts;
            entry.job.clone()
        }))
    }

    fn ack(&mut self, job_id: Uuid) -> Result<(), QueueError> {
        if !self.jobs.contains_key(&job_id) {
            return Ok(());
        }
        // Not fsynced: losing an ack only causes a redelivery, which persistence tolerates.
        let record = JournalRecord::Acked { job_id };
        append_frame(&mut self.journal, &serde_json::to_vec(&record)?, false)?;
        self.remove_job(job_id);
        self.obsolete_records += 2;
        self.maybe_compact();
        Ok(())
    }

    fn nack(
        &mut self,
        job_id: Uuid,
        attempts: u32,
        delay: Duration,
        error: String,
    ) -> Result<(), QueueError> {
        if !self.jobs.contains_key(&job_id) {
            return Err(QueueError::UnknownJob(job_id));
        }
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        let next_attempt_at = now + delay;
        let record = JournalRecord::Retry {
            job_id,
            attempts,
            next_attempt_at,
            last_error: error.clone(),
        };
        append_frame(&mut self.journal, &serde_json::to_vec(&record)?, true)?;
        if let Some(entry) = self.jobs.get_mut(&job_id) {
            entry.job.attempts = attempts;
            entry.job.next_attempt_at = next_attempt_at;
            entry.job.last_error = Some(error);
        }
        self.place(job_id, Slot::for_attempt_at(next_attempt_at, now));
        self.obsolete_records += 1;
        Ok(())
    }

    fn dead_letter(
        &mut self,
        job: &QueuedJob,
        attempts: u32,
        reason: &str,
    ) -> Result<(), QueueError> {
        if self.dead_letter_ids.contains(&job.job_id) {
            self.remove_job(job.job_id);
            return Ok(());
        }
        let record = DeadLetter::from_job(job, attempts, reason, Utc::now());
        append_frame(
            &mut self.dead_letter_log,
            &serde_json::to_vec(&record)?,
            true,
        )?;
        self.dead_letter_ids.insert(record.job_id);
        self.dead_letters.push(record);

        // Replay already skips jobs present in the dead-letter log, so this frame only
        // lets compaction account for the removal.
        let marker = JournalRecord::DeadLettered { job_id: job.job_id };
        if let Err(err) = serde_json::to_vec(&marker)
            .map_err(QueueError::from)
            .and_then(|payload| append_frame(&mut self.journal, &payload, false))
        {
            tracing::warn!(job_id = %job.job_id, error = %err, "failed to journal dead-letter marker");
        }
        if self.remove_job(job.job_id) {
            self.obsolete_records += 2;
        }
        self.maybe_compact();
        Ok(())
    }

    fn status(&self) -> QueueStatus {
        let now_instant = Instant::now();
        let leased = self
            .leased
            .keys()
            .filter(|(until, _)| *until > now_instant)
            .count() as u64;
        QueueStatus {
            backend: "spool",
            pending: self.jobs.len() as u64 - leased,
            leased,
            dead_letters: self.dead_letters.len() as u64,
            oldest_pending_at: self.jobs.values().map(|entry| entry.job.enqueued_at).min(),
        }
    }

    fn maybe_compact(&mut self) {
        if self.obsolete_records < self.config.compact_after.max(1) {
            return;
        }
        match self.compact() {
            Ok(()) => {
                tracing::debug!(live_jobs = self.jobs.len(), "compacted spool journal");
                self.obsolete_records = 0;
            }
            Err(err) => tracing::warn!(error = %err, "spool journal compaction failed"),
        }
    }

    /// Rewrites the journal with one `Enqueued` record per live job (carrying its current
    /// attempt and retry state) and swaps it in with a rename.
    fn compact(&mut self) -> Result<(), QueueError> {
        let tmp = self.journal_path.with_extension("log.tmp");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp)?;
        write_log_header(&mut file, JOURNAL_MAGIC)?;
        let mut live: Vec<&SpoolEntry> = self.jobs.values().collect();
        live.sort_by_key(|entry| entry.seq);
        for entry in live {
            let record = JournalRecord::Enqueued {
                job: entry.job.clone(),
            };
            append_frame(&mut file, &serde_json::to_vec(&record)?, false)?;
        }
        file.sync_data()?;
        fs::rename(&tmp, &self.journal_path)?;
        sync_dir(&self.config.dir);
        file.seek(SeekFrom::End(0))?;
        self.journal = file;
        Ok(())
    }
}

fn open_log(path: &Path, magic: &[u8; 8]) -> Result<(fs::File, Vec<Vec<u8>>), QueueError> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;

    if file.metadata()?.len() < LOG_HEADER_LEN as u64 {
        file.set_len(0)?;
        write_log_header(&mut file, magic)?;
        file.sync_data()?;
        if let Some(parent) = path.parent() {
            sync_dir(parent);
        }
        return Ok((file, Vec::new()));
    }

    let mut header = [0u8; LOG_HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if &header[0..8] != magic {
        return Err(QueueError::Unavailable(format!(
            "{} is not a spool log",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if version != LOG_VERSION {
        return Err(QueueError::Unavailable(format!(
            "{} has unsupported version {version}",
            path.display()
        )));
    }

    let payloads = recover_frames(&mut file)?;
    Ok((file, payloads))
}

fn write_log_header(file: &mut fs::File, magic: &[u8; 8]) -> Result<(), QueueError> {
    let created_wall_ms = Utc::now().timestamp_millis();
    let mut header = [0u8; LOG_HEADER_LEN];
    header[0..8].copy_from_slice(magic);
    header[8..12].copy_from_slice(&LOG_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(LOG_HEADER_LEN as u32).to_le_bytes());
    header[16..24].copy_from_slice(&created_wall_ms.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

/// Reads every intact frame and truncates whatever follows the last one.
fn recover_frames(file: &mut fs::File) -> Result<Vec<Vec<u8>>, QueueError> {
    file.seek(SeekFrom::Start(LOG_HEADER_LEN as u64))?;
    let mut pos = LOG_HEADER_LEN as u64;
    let mut payloads = Vec::new();
    while let Some(payload) = read_next_frame_payload(file)? {
        pos += (FRAME_HEADER_LEN + payload.len()) as u64;
        payloads.push(payload);
    }
    let end = file.metadata()?.len();
    if end > pos {
        tracing::warn!(discarded_bytes = end - pos, "truncating torn spool tail");
        file.set_len(pos)?;
        file.sync_data()?;
    }
    file.seek(SeekFrom::Start(pos))?;
    Ok(payloads)
}

fn read_next_frame_payload(file: &mut fs::File) -> Result<Option<Vec<u8>>, QueueError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len == 0 || len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    match file.read_exact(&mut payload) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    if crc32c(&payload) != crc {
        return Ok(None);
    }

    Ok(Some(payload))
}

fn append_frame(file: &mut fs::File, payload: &[u8], sync: bool) -> Result<(), QueueError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(QueueError::TooLarge {
            size: payload.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c(payload).to_le_bytes());
    frame.extend_from_slice(payload);

    let start = file.stream_position()?;
    let written = file.write_all(&frame).and_then(|()| {
        if sync {
            file.sync_data()
        } else {
            Ok(())
        }
    });
    if let Err(err) = written {
        // Leave no partial frame behind for later appends to build on.
        let _ = file.set_len(start);
        let _ = file.seek(SeekFrom::Start(start));
        return Err(err.into());
    }
    Ok(())
}

fn sync_dir(dir: &Path) {
    if let Err(err) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %err, "directory sync failed");
    }
}
