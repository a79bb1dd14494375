/// Per-connection Stratum session
///
/// Tracks negotiation progress for one miner and turns each request into the
/// ordered list of lines to send back: the id-correlated response first, then
/// any pushes (`mining.set_difficulty`, `mining.notify`) it triggers.
///
/// The session never touches the socket. The server feeds it requests and
/// writes whatever it returns through the connection's writer task.

use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::protocol::{
    AuthorizeParams, ConfigureParams, Message, Method, Notification, Request, Response, StratumError,
    SubmitParams, SubscribeParams,
};
use crate::config::Config;
use crate::jobs::{JobId, JobManager, JobTemplate};
use crate::metrics::prometheus as metrics;
use crate::shares::{ShareContext, ShareLedger, ShareValidator};

const VERSION_ROLLING: &str = "version-rolling";

/// Process-wide extranonce1 source; every subscription gets a fresh value.
static NEXT_EXTRANONCE1: AtomicU32 = AtomicU32::new(1);

fn next_extranonce1() -> String {
    format!("{:08x}", NEXT_EXTRANONCE1.fetch_add(1, Ordering::Relaxed))
}

/// Objects shared by every session on one server.
pub struct PoolContext {
    pub config: Config,
    pub jobs: Arc<JobManager>,
    pub validator: ShareValidator,
    pub ledger: ShareLedger,
}

impl PoolContext {
    pub fn new(config: Config) -> Self {
        let jobs = Arc::new(JobManager::new(config.work.clone(), config.job_history));
        let validator = ShareValidator::new(config.share_validation, config.job_history);
        Self { config, jobs, validator, ledger: ShareLedger::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, nothing negotiated
    Connected,
    /// `mining.configure` seen, not yet subscribed
    Configured,
    /// Extranonce issued; not yet allowed to receive work
    Subscribed,
    /// Receives jobs and may submit shares
    Authorized,
}

#[derive(Debug)]
struct Subscription {
    extranonce1: String,
    user_agent: Option<String>,
    /// Taken by the server once the session is authorized
    job_feed: Option<broadcast::Receiver<Arc<JobTemplate>>>,
}

pub struct Session {
    pub session_id: String,
    pub peer_addr: Option<SocketAddr>,
    state: SessionState,
    configured: bool,
    version_mask: Option<u32>,
    subscription: Option<Subscription>,
    worker_name: Option<String>,
    difficulty: f64,
    share_count: u64,
    last_job_id: Option<JobId>,
    /// Still pinned for shares that were in flight when the job changed
    prior_job_id: Option<JobId>,
    ctx: Arc<PoolContext>,
}

impl Session {
    pub fn new(ctx: Arc<PoolContext>, peer_addr: Option<SocketAddr>) -> Self {
        let session_id = Uuid::new_v4().simple().to_string();
        ctx.ledger.register(&session_id);

        Self {
            session_id,
            peer_addr,
            state: SessionState::Connected,
            configured: false,
            version_mask: None,
            subscription: None,
            worker_name: None,
            difficulty: ctx.config.difficulty,
            share_count: 0,
            last_job_id: None,
            prior_job_id: None,
            ctx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn is_authorized(&self) -> bool {
        self.state == SessionState::Authorized
    }

    pub fn worker_name(&self) -> Option<&str> {
        self.worker_name.as_deref()
    }

    pub fn extranonce1(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.extranonce1.as_str())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.subscription.as_ref().and_then(|s| s.user_agent.as_deref())
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn version_mask(&self) -> Option<u32> {
        self.version_mask
    }

    pub fn share_count(&self) -> u64 {
        self.share_count
    }

    pub fn last_job_id(&self) -> Option<JobId> {
        self.last_job_id
    }

    /// Hand the broadcast receiver to a push task. Only yields once, and only when authorized.
    pub fn take_job_feed(&mut self) -> Option<broadcast::Receiver<Arc<JobTemplate>>> {
        if !self.is_authorized() {
            return None;
        }
        self.subscription.as_mut().and_then(|s| s.job_feed.take())
    }

    /// Process one request. The response is always first.
    pub fn handle(&mut self, request: &Request) -> Vec<Message> {
        let method = Method::parse(&request.method);
        tracing::debug!("Session {} handling {}", self.session_id, method.as_str());

        let outcome = match method {
            Method::Configure => self.handle_configure(request),
            Method::Subscribe => self.handle_subscribe(request),
            Method::Authorize => self.handle_authorize(request),
            Method::Submit => self.handle_submit(request),
            Method::ExtranonceSubscribe => Ok((json!(true), Vec::new())),
            Method::SuggestDifficulty => {
                tracing::debug!("Ignoring suggested difficulty {:?} (static difficulty)", request.params);
                Ok((json!(true), Vec::new()))
            }
            _ => Err(StratumError::unknown_method(&request.method)),
        };

        match outcome {
            Ok((result, pushes)) => {
                let mut out = Vec::with_capacity(1 + pushes.len());
                out.push(Response::success(request.id.clone(), result).into());
                out.extend(pushes.into_iter().map(Message::from));
                out
            }
            Err(error) => vec![Response::error(request.id.clone(), error).into()],
        }
    }

    fn handle_configure(&mut self, request: &Request) -> Result<(Value, Vec<Notification>), StratumError> {
        let params = ConfigureParams::try_from(request)?;
        let mut result = Map::new();

        for ext in &params.extensions {
            if ext == VERSION_ROLLING {
                let requested = params.version_rolling_mask.unwrap_or(u32::MAX);
                let granted = requested & self.ctx.config.version_rolling_mask();
                if granted == 0 {
                    self.version_mask = None;
                    result.insert(VERSION_ROLLING.to_string(), json!(false));
                } else {
                    self.version_mask = Some(granted);
                    result.insert(VERSION_ROLLING.to_string(), json!(true));
                    result.insert(format!("{}.mask", VERSION_ROLLING), json!(format!("{:08x}", granted)));
                }
            } else {
                result.insert(ext.clone(), json!(false));
            }
        }

        self.configured = true;
        if self.state == SessionState::Connected {
            self.state = SessionState::Configured;
        }
        tracing::debug!("Session {} configured: {:?}", self.session_id, result);

        Ok((Value::Object(result), Vec::new()))
    }

    fn handle_subscribe(&mut self, request: &Request) -> Result<(Value, Vec<Notification>), StratumError> {
        let params = SubscribeParams::try_from(request)?;

        if self.subscription.is_none() {
            self.subscription = Some(Subscription {
                extranonce1: next_extranonce1(),
                user_agent: params.user_agent,
                job_feed: Some(self.ctx.jobs.subscribe()),
            });
            self.state = SessionState::Subscribed;
            tracing::info!(
                "Session {} subscribed (agent: {})",
                self.session_id,
                self.user_agent().unwrap_or("unknown")
            );
        }

        let extranonce1 = self.extranonce1().unwrap_or_default().to_string();
        let result = json!([
            [
                [Method::SetDifficulty.as_str(), self.session_id],
                [Method::Notify.as_str(), self.session_id]
            ],
            extranonce1,
            self.ctx.config.extranonce2_size
        ]);

        Ok((result, vec![Notification::set_difficulty(self.difficulty)]))
    }

    fn handle_authorize(&mut self, request: &Request) -> Result<(Value, Vec<Notification>), StratumError> {
        if self.subscription.is_none() {
            return Err(StratumError::not_subscribed());
        }
        let params = AuthorizeParams::try_from(request)?;

        self.ctx.ledger.set_worker(&self.session_id, &params.worker_name);
        self.worker_name = Some(params.worker_name);
        self.state = SessionState::Authorized;

        let job = self.ctx.jobs.current_job_pinned();
        self.track_job(job.job_id);
        tracing::info!(
            "Authorized worker {} on session {} from {} (job {})",
            self.worker_name().unwrap_or_default(),
            self.session_id,
            self.peer(),
            job.job_id
        );

        Ok((json!(true), vec![job.clean_notification()]))
    }

    fn handle_submit(&mut self, request: &Request) -> Result<(Value, Vec<Notification>), StratumError> {
        if !self.is_authorized() {
            return Err(StratumError::unauthorized());
        }
        let share = SubmitParams::try_from(request)?;

        let job = self.ctx.jobs.find(&share.job_id);
        let ctx = ShareContext {
            extranonce1: self.extranonce1().unwrap_or_default(),
            extranonce2_size: self.ctx.config.extranonce2_size,
            difficulty: self.difficulty,
            version_mask: self.version_mask,
        };

        match self.ctx.validator.validate(job.as_deref(), &share, &ctx) {
            Ok(outcome) => {
                self.share_count += 1;
                self.ctx.ledger.record(&self.session_id, true);
                metrics::inc_accepted();

                match outcome.share_difficulty {
                    Some(achieved) => tracing::info!(
                        "Share accepted from {} (job {}, diff {:.3}, #{})",
                        share.worker_name, share.job_id, achieved, self.share_count
                    ),
                    None => tracing::info!(
                        "Share accepted from {} (job {}, nonce {}, #{})",
                        share.worker_name, share.job_id, share.nonce, self.share_count
                    ),
                }
                if outcome.block_candidate {
                    metrics::inc_block_candidates();
                    tracing::info!(
                        "Block candidate from {}: {}",
                        share.worker_name,
                        outcome.hash.as_deref().unwrap_or_default()
                    );
                }

                let next = self.ctx.jobs.rotate_job_pinned(false);
                self.track_job(next.job_id);
                self.ctx.validator.forget_expired(|id| self.ctx.jobs.job(id).is_some());
                Ok((json!(true), vec![next.notification()]))
            }
            Err(rejection) => {
                let error = rejection.to_stratum_error();
                self.ctx.ledger.record(&self.session_id, false);
                metrics::inc_rejected(error.code);
                tracing::warn!(
                    "Share rejected from {} (job {}): {}",
                    share.worker_name, share.job_id, rejection
                );
                Err(error)
            }
        }
    }

    /// Make `job` the session's current pinned job. The one before it stays
    /// pinned; anything older is released.
    fn track_job(&mut self, job: JobId) {
        if let Some(stale) = self.prior_job_id.take() {
            self.ctx.jobs.release(stale);
        }
        self.prior_job_id = self.last_job_id.replace(job);
    }

    fn peer(&self) -> String {
        self.peer_addr.map_or_else(|| "-".to_string(), |addr| addr.to_string())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for job in [self.prior_job_id.take(), self.last_job_id.take()].into_iter().flatten() {
            self.ctx.jobs.release(job);
        }
        self.ctx.ledger.remove(&self.session_id);
    }
}
