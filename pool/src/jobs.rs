/// Job Manager - single owner of the pool's mining work
///
/// Hands out job templates with strictly increasing ids, keeps a bounded
/// window of recent jobs for share validation, and fans new jobs out to
/// subscribed sessions over a broadcast channel.
///
/// A job handed to one session outside the broadcast (after an accepted
/// share) is pinned for that session, so rotations triggered by other
/// sessions cannot push it out of the window. Clean rotations still drop it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::WorkConfig;
use crate::stratum::protocol::{Method, Notification};

/// Capacity of the job broadcast channel. Slow sessions skip ahead.
const JOB_FEED_CAPACITY: usize = 16;

/// Monotonic job identifier, rendered as (at least) 8 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Parse the hex form miners echo back in `mining.submit`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s.len() > 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(Self)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobDecodeError {
    #[error("mining.notify expects 9 params, got {0}")]
    Arity(usize),

    #[error("invalid mining.notify field `{0}`")]
    Field(&'static str),
}

/// One unit of work. Never mutated once built; superseded by a newer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub job_id: JobId,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branch: Vec<String>,
    /// Block version, 8 hex digits big-endian
    pub version: String,
    /// Compact target, 8 hex digits big-endian
    pub bits: String,
    /// Unix time the job was created (`ntime`)
    pub time: u32,
    pub clean_jobs: bool,
}

impl JobTemplate {
    pub fn ntime_hex(&self) -> String {
        format!("{:08x}", self.time)
    }

    /// `[job_id, prevhash, coinb1, coinb2, merkle_branch, version, nbits, ntime, clean_jobs]`
    pub fn to_notify_params(&self) -> Vec<Value> {
        self.notify_params(self.clean_jobs)
    }

    fn notify_params(&self, clean_jobs: bool) -> Vec<Value> {
        vec![
            json!(self.job_id.to_string()),
            json!(self.prev_hash),
            json!(self.coinbase1),
            json!(self.coinbase2),
            json!(self.merkle_branch),
            json!(self.version),
            json!(self.bits),
            json!(self.ntime_hex()),
            json!(clean_jobs),
        ]
    }

    pub fn from_notify_params(params: &[Value]) -> Result<Self, JobDecodeError> {
        if params.len() != 9 {
            return Err(JobDecodeError::Arity(params.len()));
        }

        let text = |i: usize, name: &'static str| -> Result<String, JobDecodeError> {
            params[i].as_str().map(|s| s.to_string()).ok_or(JobDecodeError::Field(name))
        };

        let job_id = JobId::parse(&text(0, "job_id")?).ok_or(JobDecodeError::Field("job_id"))?;
        let merkle_branch = params[4]
            .as_array()
            .ok_or(JobDecodeError::Field("merkle_branch"))?
            .iter()
            .map(|v| v.as_str().map(|s| s.to_string()).ok_or(JobDecodeError::Field("merkle_branch")))
            .collect::<Result<Vec<_>, _>>()?;
        let time = u32::from_str_radix(&text(7, "ntime")?, 16).map_err(|_| JobDecodeError::Field("ntime"))?;
        let clean_jobs = params[8].as_bool().ok_or(JobDecodeError::Field("clean_jobs"))?;

        Ok(Self {
            job_id,
            prev_hash: text(1, "prevhash")?,
            coinbase1: text(2, "coinb1")?,
            coinbase2: text(3, "coinb2")?,
            merkle_branch,
            version: text(5, "version")?,
            bits: text(6, "nbits")?,
            time,
            clean_jobs,
        })
    }

    pub fn notification(&self) -> Notification {
        Notification::new(Method::Notify.as_str(), self.to_notify_params())
    }

    /// Same job, but tell the miner to drop whatever it was working on.
    pub fn clean_notification(&self) -> Notification {
        Notification::new(Method::Notify.as_str(), self.notify_params(true))
    }
}

struct JobState {
    counter: u64,
    current: Option<Arc<JobTemplate>>,
    recent: HashMap<JobId, Arc<JobTemplate>>,
    order: VecDeque<JobId>,
    /// Jobs kept past the window for the sessions working on them
    pins: HashMap<JobId, usize>,
}

pub struct JobManager {
    work: WorkConfig,
    history: usize,
    state: Mutex<JobState>,
    feed: broadcast::Sender<Arc<JobTemplate>>,
}

impl JobManager {
    pub fn new(work: WorkConfig, history: usize) -> Self {
        let (feed, _) = broadcast::channel(JOB_FEED_CAPACITY);
        Self {
            work,
            history: history.max(1),
            state: Mutex::new(JobState {
                counter: 0,
                current: None,
                recent: HashMap::new(),
                order: VecDeque::new(),
                pins: HashMap::new(),
            }),
            feed,
        }
    }

    /// Next identifier. Never reused, even if the caller drops it.
    pub fn next_job_id(&self) -> JobId {
        let mut state = self.state.lock();
        Self::bump(&mut state)
    }

    /// Latest job, built lazily on first use.
    pub fn current_job(&self) -> Arc<JobTemplate> {
        let mut state = self.state.lock();
        if let Some(job) = &state.current {
            return job.clone();
        }
        self.install(&mut state, true)
    }

    /// Build a new job with a fresh id and time and make it current.
    ///
    /// With `clean_jobs` every previously issued job stops being valid.
    pub fn rotate_job(&self, clean_jobs: bool) -> Arc<JobTemplate> {
        let mut state = self.state.lock();
        self.install(&mut state, clean_jobs)
    }

    /// [`current_job`](Self::current_job), pinned until [`release`](Self::release).
    pub fn current_job_pinned(&self) -> Arc<JobTemplate> {
        let mut state = self.state.lock();
        let job = match state.current.clone() {
            Some(job) => job,
            None => self.install(&mut state, true),
        };
        *state.pins.entry(job.job_id).or_default() += 1;
        job
    }

    /// [`rotate_job`](Self::rotate_job), pinned until [`release`](Self::release).
    pub fn rotate_job_pinned(&self, clean_jobs: bool) -> Arc<JobTemplate> {
        let mut state = self.state.lock();
        let job = self.install(&mut state, clean_jobs);
        *state.pins.entry(job.job_id).or_default() += 1;
        job
    }

    /// Drop one pin. The job expires now if it already left the window.
    pub fn release(&self, id: JobId) {
        let mut state = self.state.lock();
        let Some(count) = state.pins.get_mut(&id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            state.pins.remove(&id);
            if !state.order.contains(&id) {
                state.recent.remove(&id);
            }
        }
    }

    /// A job that is still accepting submissions.
    pub fn job(&self, id: JobId) -> Option<Arc<JobTemplate>> {
        self.state.lock().recent.get(&id).cloned()
    }

    pub fn find(&self, job_id: &str) -> Option<Arc<JobTemplate>> {
        JobId::parse(job_id).and_then(|id| self.job(id))
    }

    /// Join the broadcast group.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<JobTemplate>> {
        self.feed.subscribe()
    }

    /// Push a job to every subscriber; returns how many were listening.
    pub fn broadcast(&self, job: Arc<JobTemplate>) -> usize {
        self.feed.send(job).unwrap_or(0)
    }

    fn bump(state: &mut JobState) -> JobId {
        state.counter += 1;
        JobId(state.counter)
    }

    fn install(&self, state: &mut JobState, clean_jobs: bool) -> Arc<JobTemplate> {
        let job_id = Self::bump(state);
        let job = Arc::new(JobTemplate {
            job_id,
            prev_hash: self.work.prev_hash.clone(),
            coinbase1: self.work.coinbase1.clone(),
            coinbase2: self.work.coinbase2.clone(),
            merkle_branch: self.work.merkle_branch.clone(),
            version: self.work.version.clone(),
            bits: self.work.bits.clone(),
            time: now_secs(),
            clean_jobs,
        });

        if clean_jobs {
            state.recent.clear();
            state.order.clear();
            state.pins.clear();
        }
        state.recent.insert(job_id, job.clone());
        state.order.push_back(job_id);
        while state.order.len() > self.history {
            if let Some(oldest) = state.order.pop_front() {
                if !state.pins.contains_key(&oldest) {
                    state.recent.remove(&oldest);
                }
            }
        }

        state.current = Some(job.clone());
        tracing::debug!("New job {} (clean_jobs={})", job_id, clean_jobs);
        job
    }
}

fn now_secs() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(history: usize) -> JobManager {
        JobManager::new(WorkConfig::default(), history)
    }

    #[test]
    fn test_job_id_format() {
        assert_eq!(JobId::new(1).to_string(), "00000001");
        assert_eq!(JobId::new(0xabc).to_string(), "00000abc");
        assert_eq!(JobId::parse("0000001f"), Some(JobId::new(31)));
        assert_eq!(JobId::parse("xyz"), None);
        assert_eq!(JobId::parse(""), None);
    }

    #[test]
    fn test_ids_strictly_increase_across_operations() {
        let jobs = manager(8);
        let mut seen = Vec::new();

        for i in 0..200 {
            let id = match i % 4 {
                0 => jobs.next_job_id(),
                1 => jobs.rotate_job(false).job_id,
                2 => jobs.rotate_job(true).job_id,
                _ => {
                    // current_job never mints a new id once one exists
                    let current = jobs.current_job().job_id;
                    assert_eq!(Some(&current), seen.last());
                    continue;
                }
            };
            if let Some(last) = seen.last() {
                assert!(id > *last, "{} should follow {}", id, last);
            }
            seen.push(id);
        }

        let mut dedup = seen.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), seen.len());
    }

    #[test]
    fn test_current_job_is_lazy_and_stable() {
        let jobs = manager(8);
        let first = jobs.current_job();
        assert_eq!(first.job_id, JobId::new(1));
        assert!(first.clean_jobs);
        assert_eq!(jobs.current_job(), first);

        let rotated = jobs.rotate_job(false);
        assert_eq!(jobs.current_job(), rotated);
        assert!(rotated.job_id > first.job_id);
        assert!(!rotated.clean_jobs);
    }

    #[test]
    fn test_templates_are_not_mutated_by_rotation() {
        let jobs = manager(8);
        let first = jobs.current_job();
        let snapshot = (*first).clone();
        jobs.rotate_job(true);
        assert_eq!(*first, snapshot);
    }

    #[test]
    fn test_clean_rotation_invalidates_older_jobs() {
        let jobs = manager(8);
        let a = jobs.current_job();
        let b = jobs.rotate_job(false);
        assert!(jobs.job(a.job_id).is_some());
        assert!(jobs.job(b.job_id).is_some());

        let c = jobs.rotate_job(true);
        assert!(jobs.job(a.job_id).is_none());
        assert!(jobs.job(b.job_id).is_none());
        assert!(jobs.find(&c.job_id.to_string()).is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let jobs = manager(3);
        let ids: Vec<JobId> = (0..5).map(|_| jobs.rotate_job(false).job_id).collect();
        assert!(jobs.job(ids[0]).is_none());
        assert!(jobs.job(ids[1]).is_none());
        for id in &ids[2..] {
            assert!(jobs.job(*id).is_some());
        }
    }

    #[test]
    fn test_pinned_job_outlives_history() {
        let jobs = manager(2);
        let pinned = jobs.rotate_job_pinned(false);
        let ids: Vec<JobId> = (0..5).map(|_| jobs.rotate_job(false).job_id).collect();

        assert!(jobs.job(pinned.job_id).is_some());
        assert!(jobs.job(ids[0]).is_none());

        jobs.release(pinned.job_id);
        assert!(jobs.job(pinned.job_id).is_none());
        // releasing twice is harmless
        jobs.release(pinned.job_id);
    }

    #[test]
    fn test_pins_are_counted() {
        let jobs = manager(1);
        let a = jobs.current_job_pinned();
        let b = jobs.current_job_pinned();
        assert_eq!(a.job_id, b.job_id);
        jobs.rotate_job(false);

        jobs.release(a.job_id);
        assert!(jobs.job(a.job_id).is_some());
        jobs.release(b.job_id);
        assert!(jobs.job(a.job_id).is_none());
    }

    #[test]
    fn test_release_inside_window_keeps_job() {
        let jobs = manager(4);
        let job = jobs.rotate_job_pinned(false);
        jobs.release(job.job_id);
        assert!(jobs.job(job.job_id).is_some());
    }

    #[test]
    fn test_clean_rotation_drops_pinned_jobs() {
        let jobs = manager(4);
        let pinned = jobs.rotate_job_pinned(false);
        jobs.rotate_job(true);
        assert!(jobs.job(pinned.job_id).is_none());
        jobs.release(pinned.job_id);
    }

    #[test]
    fn test_notify_roundtrip() {
        let jobs = manager(8);
        let job = jobs.rotate_job(false);

        let note = job.notification();
        assert_eq!(note.method, "mining.notify");
        assert_eq!(note.id, Value::Null);

        let wire = serde_json::to_string(&note).unwrap();
        let parsed: Notification = serde_json::from_str(&wire).unwrap();
        let decoded = JobTemplate::from_notify_params(&parsed.params).unwrap();
        assert_eq!(decoded, *job);
    }

    #[test]
    fn test_clean_notification_overrides_flag_only() {
        let jobs = manager(8);
        let job = jobs.rotate_job(false);
        let decoded = JobTemplate::from_notify_params(&job.clean_notification().params).unwrap();
        assert!(decoded.clean_jobs);
        assert_eq!(decoded.job_id, job.job_id);
        assert_eq!(decoded.merkle_branch, job.merkle_branch);
    }

    #[test]
    fn test_decode_rejects_bad_params() {
        assert_eq!(JobTemplate::from_notify_params(&[json!("01")]), Err(JobDecodeError::Arity(1)));

        let jobs = manager(8);
        let mut params = jobs.current_job().to_notify_params();
        params[7] = json!("not-hex");
        assert_eq!(JobTemplate::from_notify_params(&params), Err(JobDecodeError::Field("ntime")));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let jobs = manager(8);
        let mut rx = jobs.subscribe();
        assert_eq!(jobs.broadcast(jobs.current_job()), 1);

        let job = jobs.rotate_job(false);
        jobs.broadcast(job.clone());

        assert_eq!(rx.recv().await.unwrap().job_id, JobId::new(1));
        assert_eq!(rx.recv().await.unwrap(), job);
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let jobs = manager(8);
        assert_eq!(jobs.broadcast(jobs.current_job()), 0);
    }
}
