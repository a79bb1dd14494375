use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use prometheus::core::Collector;
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_CANDIDATES: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static MALFORMED_LINES: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();

static REJECTED_BY_REASON: OnceLock<IntCounterVec> = OnceLock::new();

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap())
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap())
}

fn block_candidates() -> &'static IntCounter {
    BLOCK_CANDIDATES.get_or_init(|| {
        IntCounter::new(
            "block_candidates_total",
            "Shares whose hash also met the network target",
        )
        .unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new(
            "job_broadcasts_total",
            "Total mining.notify broadcasts sent",
        )
        .unwrap()
    })
}

fn malformed_lines() -> &'static IntCounter {
    MALFORMED_LINES.get_or_init(|| {
        IntCounter::new("stratum_malformed_lines_total", "Lines discarded by the codec").unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS
        .get_or_init(|| IntGauge::new("active_connections", "Open Stratum connections").unwrap())
}

fn rejected_by_reason() -> &'static IntCounterVec {
    REJECTED_BY_REASON.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_rejected_by_reason_total", "Rejected shares by Stratum error code"),
            &["code"],
        )
        .unwrap()
    })
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected(code: i32) {
    rejected().inc();
    rejected_by_reason().with_label_values(&[code.to_string().as_str()]).inc();
}

pub fn inc_block_candidates() {
    block_candidates().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_malformed_lines() {
    malformed_lines().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn active_connection_count() -> i64 {
    active_connections().get()
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(block_candidates().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(malformed_lines().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(rejected_by_reason().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_pool_counters() {
        inc_accepted();
        inc_rejected(21);
        inc_job_broadcasts();

        let text = render();
        assert!(text.contains("shares_accepted_total"));
        assert!(text.contains("shares_rejected_total"));
        assert!(text.contains("job_broadcasts_total"));
        assert!(text.contains("active_connections"));
        assert!(text.contains(r#"shares_rejected_by_reason_total{code="21"}"#));
    }
}
