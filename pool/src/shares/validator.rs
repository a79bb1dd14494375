/// Share Validator - policy-driven checks for `mining.submit`
///
/// Legacy policy accepts every well-formed share without looking at it.
/// Hardened policy rebuilds the 80-byte block header from the job and the
/// miner's nonce fields, double-SHA256 hashes it and requires:
/// - a job that is still live
/// - extranonce2 of the size handed out at subscribe
/// - a sane ntime
/// - no earlier identical submission
/// - a hash at or below the session's share target

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::config::ShareValidation;
use crate::jobs::{JobId, JobTemplate};
use crate::stratum::protocol::{StratumError, SubmitParams};

/// Difficulty-1 target (0x00000000ffff0000...) as a float.
const DIFF1_TARGET: f64 = 2.695953529101131e67; // 0xffff * 2^208

/// How far ahead of wall-clock a rolled ntime may be.
const MAX_NTIME_DRIFT_SECS: i64 = 7200;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShareRejection {
    #[error("job {0} not found or stale")]
    StaleJob(String),

    #[error("duplicate share")]
    Duplicate,

    #[error("share difficulty {share:.4} below target {target}")]
    LowDifficulty { share: f64, target: f64 },

    #[error("extranonce2 must be {expected} bytes of hex")]
    BadExtranonce2 { expected: usize },

    #[error("ntime {0} out of range")]
    BadNtime(String),

    #[error("malformed {0}")]
    Malformed(&'static str),
}

impl ShareRejection {
    pub fn to_stratum_error(&self) -> StratumError {
        match self {
            ShareRejection::StaleJob(_) => StratumError::job_not_found(),
            ShareRejection::Duplicate => StratumError::duplicate_share(),
            ShareRejection::LowDifficulty { .. } => StratumError::low_difficulty(),
            other => StratumError::other(other.to_string()),
        }
    }
}

/// Session-side facts the validator needs alongside the submission.
#[derive(Debug, Clone)]
pub struct ShareContext<'a> {
    pub extranonce1: &'a str,
    pub extranonce2_size: usize,
    pub difficulty: f64,
    /// Negotiated version-rolling mask, if any
    pub version_mask: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShareOutcome {
    /// Achieved difficulty (hardened policy only)
    pub share_difficulty: Option<f64>,
    /// Hash also meets the job's network target
    pub block_candidate: bool,
    /// Block hash in display (big-endian) hex
    pub hash: Option<String>,
}

pub struct ShareValidator {
    policy: ShareValidation,
    history: usize,
    seen: Mutex<BTreeMap<JobId, HashSet<String>>>,
}

impl ShareValidator {
    pub fn new(policy: ShareValidation, history: usize) -> Self {
        Self { policy, history: history.max(1), seen: Mutex::new(BTreeMap::new()) }
    }

    pub fn policy(&self) -> ShareValidation {
        self.policy
    }

    /// `job` is the live template the submission names, if the job manager still has it.
    pub fn validate(
        &self,
        job: Option<&JobTemplate>,
        share: &SubmitParams,
        ctx: &ShareContext<'_>,
    ) -> Result<ShareOutcome, ShareRejection> {
        match self.policy {
            ShareValidation::Legacy => Ok(ShareOutcome::default()),
            ShareValidation::Hardened => self.validate_hardened(job, share, ctx),
        }
    }

    fn validate_hardened(
        &self,
        job: Option<&JobTemplate>,
        share: &SubmitParams,
        ctx: &ShareContext<'_>,
    ) -> Result<ShareOutcome, ShareRejection> {
        let job = job.ok_or_else(|| ShareRejection::StaleJob(share.job_id.clone()))?;

        let extranonce2 = hex::decode(&share.extranonce2)
            .ok()
            .filter(|b| b.len() == ctx.extranonce2_size)
            .ok_or(ShareRejection::BadExtranonce2 { expected: ctx.extranonce2_size })?;

        let ntime = parse_u32_hex(&share.ntime).ok_or(ShareRejection::Malformed("ntime"))?;
        let now = chrono::Utc::now().timestamp();
        if ntime < job.time || i64::from(ntime) > now + MAX_NTIME_DRIFT_SECS {
            return Err(ShareRejection::BadNtime(share.ntime.clone()));
        }

        let nonce = parse_u32_hex(&share.nonce).ok_or(ShareRejection::Malformed("nonce"))?;
        let version = rolled_version(job, share.version_bits.as_deref(), ctx.version_mask)?;

        let key = format!(
            "{}:{}:{}:{:08x}:{:08x}:{:08x}",
            ctx.extranonce1,
            hex::encode(&extranonce2),
            job.job_id,
            ntime,
            nonce,
            version
        );
        if self.is_duplicate(job.job_id, &key) {
            return Err(ShareRejection::Duplicate);
        }

        let extranonce1 = hex::decode(ctx.extranonce1).map_err(|_| ShareRejection::Malformed("extranonce1"))?;
        let header = build_header(job, &extranonce1, &extranonce2, version, ntime, nonce)?;
        let hash = sha256d(&header);
        let achieved = share_difficulty(&hash);

        if achieved < ctx.difficulty {
            return Err(ShareRejection::LowDifficulty { share: achieved, target: ctx.difficulty });
        }

        let bits = parse_u32_hex(&job.bits).ok_or(ShareRejection::Malformed("nbits"))?;
        let block_candidate = meets_target(&hash, &target_from_bits(bits));

        self.remember(job.job_id, key);

        Ok(ShareOutcome {
            share_difficulty: Some(achieved),
            block_candidate,
            hash: Some(display_hex(&hash)),
        })
    }

    fn is_duplicate(&self, job_id: JobId, key: &str) -> bool {
        self.seen.lock().get(&job_id).is_some_and(|set| set.contains(key))
    }

    fn remember(&self, job_id: JobId, key: String) {
        self.seen.lock().entry(job_id).or_default().insert(key);
    }

    /// Drop duplicate keys of expired jobs once more than `history` jobs are tracked.
    pub fn forget_expired(&self, is_live: impl Fn(JobId) -> bool) {
        let mut seen = self.seen.lock();
        if seen.len() > self.history {
            seen.retain(|id, _| is_live(*id));
        }
    }
}

fn parse_u32_hex(s: &str) -> Option<u32> {
    if s.len() != 8 {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

fn rolled_version(job: &JobTemplate, bits: Option<&str>, mask: Option<u32>) -> Result<u32, ShareRejection> {
    let base = parse_u32_hex(&job.version).ok_or(ShareRejection::Malformed("version"))?;
    let Some(bits) = bits else {
        return Ok(base);
    };
    let rolled = parse_u32_hex(bits).ok_or(ShareRejection::Malformed("version bits"))?;
    let mask = mask.ok_or(ShareRejection::Malformed("version bits without version-rolling"))?;
    if rolled & !mask != 0 {
        return Err(ShareRejection::Malformed("version bits outside negotiated mask"));
    }
    Ok((base & !mask) | (rolled & mask))
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Hash the coinbase, then climb the branch. Result is in internal byte order.
pub fn merkle_root(coinbase: &[u8], branch: &[[u8; 32]]) -> [u8; 32] {
    let mut root = sha256d(coinbase);
    for node in branch {
        let mut joined = [0u8; 64];
        joined[..32].copy_from_slice(&root);
        joined[32..].copy_from_slice(node);
        root = sha256d(&joined);
    }
    root
}

/// Reconstruct the candidate header a miner hashed for this job.
pub fn build_header(
    job: &JobTemplate,
    extranonce1: &[u8],
    extranonce2: &[u8],
    version: u32,
    ntime: u32,
    nonce: u32,
) -> Result<[u8; 80], ShareRejection> {
    let coinbase1 = hex::decode(&job.coinbase1).map_err(|_| ShareRejection::Malformed("coinb1"))?;
    let coinbase2 = hex::decode(&job.coinbase2).map_err(|_| ShareRejection::Malformed("coinb2"))?;

    let mut coinbase = Vec::with_capacity(coinbase1.len() + extranonce1.len() + extranonce2.len() + coinbase2.len());
    coinbase.extend_from_slice(&coinbase1);
    coinbase.extend_from_slice(extranonce1);
    coinbase.extend_from_slice(extranonce2);
    coinbase.extend_from_slice(&coinbase2);

    let branch = job
        .merkle_branch
        .iter()
        .map(|h| decode_32(h).ok_or(ShareRejection::Malformed("merkle branch")))
        .collect::<Result<Vec<_>, _>>()?;
    let root = merkle_root(&coinbase, &branch);

    let prev_hash = decode_32(&job.prev_hash).ok_or(ShareRejection::Malformed("prevhash"))?;
    let bits = parse_u32_hex(&job.bits).ok_or(ShareRejection::Malformed("nbits"))?;

    Ok(header_bytes(version, &prev_hash, &root, ntime, bits, nonce))
}

/// Serialize an 80-byte header. `prev_hash` is in Stratum order (each 32-bit word byte-swapped).
pub fn header_bytes(version: u32, prev_hash: &[u8; 32], merkle_root: &[u8; 32], ntime: u32, bits: u32, nonce: u32) -> [u8; 80] {
    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&version.to_le_bytes());
    for (i, word) in prev_hash.chunks_exact(4).enumerate() {
        let at = 4 + i * 4;
        header[at..at + 4].copy_from_slice(&[word[3], word[2], word[1], word[0]]);
    }
    header[36..68].copy_from_slice(merkle_root);
    header[68..72].copy_from_slice(&ntime.to_le_bytes());
    header[72..76].copy_from_slice(&bits.to_le_bytes());
    header[76..80].copy_from_slice(&nonce.to_le_bytes());
    header
}

fn decode_32(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Difficulty a hash achieves, relative to the difficulty-1 target.
pub fn share_difficulty(hash: &[u8; 32]) -> f64 {
    let value = hash.iter().rev().fold(0.0f64, |acc, b| acc * 256.0 + f64::from(*b));
    if value == 0.0 {
        return f64::INFINITY;
    }
    DIFF1_TARGET / value
}

/// Expand compact `nBits` into a big-endian 256-bit target.
pub fn target_from_bits(bits: u32) -> [u8; 32] {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let mut target = [0u8; 32];
    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return target;
    }

    let bytes = mantissa.to_be_bytes(); // [0, m2, m1, m0]
    for (i, b) in bytes[1..].iter().enumerate() {
        // byte i of the mantissa sits `exponent - 1 - i` bytes above the least significant end
        let Some(pos_from_end) = exponent.checked_sub(1 + i) else { continue };
        if pos_from_end < 32 {
            target[31 - pos_from_end] = *b;
        }
    }
    target
}

/// `hash` in internal (little-endian) order against a big-endian target.
pub fn meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    let mut be = *hash;
    be.reverse();
    be <= *target
}

fn display_hex(hash: &[u8; 32]) -> String {
    let mut be = *hash;
    be.reverse();
    hex::encode(be)
}
