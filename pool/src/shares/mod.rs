/// Mining shares module
///
/// Share validation policy (legacy / hardened) and the per-session share ledger.

pub mod validator;
pub mod ledger;

pub use validator::{ShareContext, ShareOutcome, ShareRejection, ShareValidator};
pub use ledger::{LedgerSnapshot, SessionStats, ShareLedger};
