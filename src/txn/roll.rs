//! Commit and abort.
//!
//! Commit verifies every read version, marks the monitor record for roll
//! forward, rolls the writes forward and deletes the monitor record. Abort
//! rolls the writes back and deletes the monitor record. Once the monitor is
//! marked, the server finishes a commit on its own, so failures past that
//! point are reported as abandoned steps rather than errors.

use tracing::{debug, warn};

use super::{monitor, Txn, TxnKey, TxnState};
use crate::{
    config::{Policy, TxnPolicy},
    conn::Executor,
    error::{Error, Result, ResultCode},
    wire::{
        key::Key,
        proto::{info1, info2, info4, FieldType, MessageBuilder, OpType, ParticleType},
    },
};

const BIN_ROLL_FORWARD: &str = "fwd";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStatus {
    Ok,
    AlreadyCommitted,
    /// Committed, but some writes were not rolled forward by the client. The
    /// server completes them.
    RollForwardAbandoned,
    /// Committed, but the monitor record was not deleted.
    CloseAbandoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortStatus {
    Ok,
    AlreadyAborted,
    RollBackAbandoned,
    CloseAbandoned,
}

fn record_key(namespace: &str, tracked: &TxnKey) -> Result<Key> {
    Key::from_digest(namespace, &tracked.set, tracked.digest)
}

fn namespace(txn: &Txn) -> Result<String> {
    txn.namespace()
        .ok_or_else(|| Error::client("Transaction namespace is not set"))
}

fn verify(executor: &dyn Executor, txn: &Txn, policy: &Policy) -> Result<()> {
    let reads = txn.reads();
    if reads.is_empty() {
        return Ok(());
    }
    let ns = namespace(txn)?;
    for tracked in &reads {
        let key = record_key(&ns, tracked)?;
        let request = key
            .write_fields(MessageBuilder::new(
                info1::READ | info1::NOBINDATA,
                0,
                0,
                info4::MRT_VERIFY_READ,
            ))
            .field_u64_le(FieldType::MrtId, txn.id())
            .record_version(tracked.version)
            .build();
        executor.execute(&key, &request, false, policy)?;
    }
    Ok(())
}

fn mark_roll_forward(executor: &dyn Executor, txn: &Txn, policy: &Policy) -> Result<()> {
    let monitor = monitor::monitor_key(txn)?;
    let request = monitor
        .write_fields(MessageBuilder::new(0, info2::WRITE, 0, 0))
        .op(OpType::Write, ParticleType::Bool, BIN_ROLL_FORWARD, &[1])
        .build();
    executor.execute(&monitor, &request, true, policy)?;
    Ok(())
}

/// Sends the roll command for every written key. Returns false when any of
/// them failed; the rest are still attempted.
fn roll(executor: &dyn Executor, txn: &Txn, policy: &Policy, flag: u8) -> Result<bool> {
    let writes = txn.writes();
    if writes.is_empty() {
        return Ok(true);
    }
    let ns = namespace(txn)?;
    let mut all = true;
    for tracked in &writes {
        let key = record_key(&ns, tracked)?;
        let request = key
            .write_fields(MessageBuilder::new(
                0,
                info2::WRITE | info2::DURABLE_DELETE,
                0,
                flag,
            ))
            .field_u64_le(FieldType::MrtId, txn.id())
            .build();
        if let Err(e) = executor.execute(&key, &request, true, policy) {
            warn!(txn = txn.id(), ?key, "Transaction roll failed: {}", e);
            all = false;
        }
    }
    Ok(all)
}

/// Deletes the monitor record when nothing is left for the server to
/// resolve.
fn close(executor: &dyn Executor, txn: &Txn, policy: &Policy) -> Result<()> {
    if !txn.close_monitor() {
        return Ok(());
    }
    let monitor = monitor::monitor_key(txn)?;
    let request = monitor
        .write_fields(MessageBuilder::new(
            0,
            info2::WRITE | info2::DELETE | info2::DURABLE_DELETE,
            0,
            0,
        ))
        .build();
    executor.execute(&monitor, &request, true, policy)?;
    Ok(())
}

/// Commits `txn`.
///
/// A failed verify aborts the transaction: the writes are rolled back and a
/// `TxnFailed` error is returned. Committing an aborted transaction is an
/// `MrtAborted` error.
pub fn commit(executor: &dyn Executor, txn: &Txn, policy: &TxnPolicy) -> Result<CommitStatus> {
    match txn.state() {
        TxnState::Committed => return Ok(CommitStatus::AlreadyCommitted),
        TxnState::Aborted => Err(Error::new(
            ResultCode::MrtAborted,
            "Transaction already aborted",
        ))?,
        TxnState::Verified => {}
        TxnState::Open => {
            if let Err(e) = verify(executor, txn, &policy.verify) {
                debug!(txn = txn.id(), error = %e, "transaction verify failed");
                txn.set_state(TxnState::Aborted);
                if txn.set_roll_attempted() {
                    match roll(executor, txn, &policy.roll, info4::MRT_ROLL_BACK) {
                        Ok(true) => {
                            if let Err(e) = close(executor, txn, &policy.roll) {
                                warn!(txn = txn.id(), "Transaction close failed: {}", e);
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!(txn = txn.id(), "Transaction roll back failed: {}", e),
                    }
                }
                Err(Error::new(
                    ResultCode::TxnFailed,
                    format!("Transaction verify failed. Transaction aborted: {}", e),
                ))?
            }
            txn.set_state(TxnState::Verified);
        }
    }

    if txn.monitor_exists() {
        if let Err(e) = mark_roll_forward(executor, txn, &policy.roll) {
            if e.code == ResultCode::MrtAborted {
                txn.set_state(TxnState::Aborted);
            } else {
                txn.set_in_doubt(e.in_doubt || e.is_timeout());
            }
            Err(Error::new(
                ResultCode::TxnFailed,
                format!("Transaction mark roll forward failed: {}", e),
            )
            .with_in_doubt(txn.in_doubt()))?
        }
    }
    txn.set_state(TxnState::Committed);
    txn.set_in_doubt(false);

    if !txn.set_roll_attempted() {
        return Ok(CommitStatus::AlreadyCommitted);
    }
    if !roll(executor, txn, &policy.roll, info4::MRT_ROLL_FORWARD)? {
        return Ok(CommitStatus::RollForwardAbandoned);
    }
    if let Err(e) = close(executor, txn, &policy.roll) {
        warn!(txn = txn.id(), "Transaction close failed: {}", e);
        return Ok(CommitStatus::CloseAbandoned);
    }
    Ok(CommitStatus::Ok)
}

/// Aborts `txn`, rolling its writes back. Aborting a committed transaction
/// is an `MrtCommitted` error.
pub fn abort(executor: &dyn Executor, txn: &Txn, policy: &TxnPolicy) -> Result<AbortStatus> {
    match txn.state() {
        TxnState::Committed => Err(Error::new(
            ResultCode::MrtCommitted,
            "Transaction already committed",
        ))?,
        TxnState::Aborted => return Ok(AbortStatus::AlreadyAborted),
        TxnState::Open | TxnState::Verified => {}
    }
    txn.set_state(TxnState::Aborted);

    if !txn.set_roll_attempted() {
        return Ok(AbortStatus::AlreadyAborted);
    }
    if !roll(executor, txn, &policy.roll, info4::MRT_ROLL_BACK)? {
        return Ok(AbortStatus::RollBackAbandoned);
    }
    if let Err(e) = close(executor, txn, &policy.roll) {
        warn!(txn = txn.id(), "Transaction close failed: {}", e);
        return Ok(AbortStatus::CloseAbandoned);
    }
    Ok(AbortStatus::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        txn::tests::{key, response, Scripted},
        wire::proto::Message,
    };

    fn kinds(sent: &[Message]) -> Vec<&'static str> {
        sent.iter()
            .map(|msg| {
                let h = &msg.header;
                if h.info4 & info4::MRT_VERIFY_READ != 0 {
                    "verify"
                } else if h.info4 & info4::MRT_ROLL_FORWARD != 0 {
                    "forward"
                } else if h.info4 & info4::MRT_ROLL_BACK != 0 {
                    "back"
                } else if h.info2 & info2::DELETE != 0 {
                    "close"
                } else if msg.op(BIN_ROLL_FORWARD).is_some() {
                    "mark"
                } else {
                    "other"
                }
            })
            .collect()
    }

    /// One read and one written key, with the monitor record in place.
    fn txn_with_keys() -> Txn {
        let txn = Txn::new();
        txn.set_ns("test").unwrap();
        let r = key(1);
        let w = key(2);
        txn.on_read(&r.digest, &r.set, 11);
        txn.on_write(&w.digest, &w.set, 0, ResultCode::Ok);
        txn.set_deadline(500);
        txn
    }

    #[test]
    fn commit_verifies_marks_rolls_and_closes() {
        let txn = txn_with_keys();
        let exec = Scripted::default();
        let status = commit(&exec, &txn, &TxnPolicy::default()).unwrap();
        assert_eq!(status, CommitStatus::Ok);
        assert_eq!(txn.state(), TxnState::Committed);
        let sent = exec.sent();
        assert_eq!(kinds(&sent), ["verify", "mark", "forward", "close"]);
        assert_eq!(sent[0].record_version(), Some(11));

        assert_eq!(commit(&exec, &txn, &TxnPolicy::default()).unwrap(), CommitStatus::AlreadyCommitted);
        let err = abort(&exec, &txn, &TxnPolicy::default()).unwrap_err();
        assert_eq!(err.code, ResultCode::MrtCommitted);
    }

    #[test]
    fn a_version_mismatch_aborts() {
        let txn = txn_with_keys();
        let exec = Scripted::default();
        exec.push(Ok(response(ResultCode::MrtVersionMismatch, None, None)));
        let err = commit(&exec, &txn, &TxnPolicy::default()).unwrap_err();
        assert_eq!(err.code, ResultCode::TxnFailed);
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(kinds(&exec.sent()), ["verify", "back", "close"]);

        let err = commit(&exec, &txn, &TxnPolicy::default()).unwrap_err();
        assert_eq!(err.code, ResultCode::MrtAborted);
        assert_eq!(abort(&exec, &txn, &TxnPolicy::default()).unwrap(), AbortStatus::AlreadyAborted);
    }

    #[test]
    fn failed_roll_forward_is_reported_not_raised() {
        let txn = txn_with_keys();
        let exec = Scripted::default();
        exec.push(Ok(response(ResultCode::Ok, None, None)));
        exec.push(Ok(response(ResultCode::Ok, None, None)));
        exec.push(Err(Error::timeout()));
        let status = commit(&exec, &txn, &TxnPolicy::default()).unwrap();
        assert_eq!(status, CommitStatus::RollForwardAbandoned);
        assert_eq!(txn.state(), TxnState::Committed);
        // the monitor record stays for the server
        assert_eq!(kinds(&exec.sent()), ["verify", "mark", "forward"]);
    }

    #[test]
    fn a_timed_out_mark_leaves_the_commit_in_doubt() {
        let txn = txn_with_keys();
        let exec = Scripted::default();
        exec.push(Ok(response(ResultCode::Ok, None, None)));
        exec.push(Err(Error::timeout()));
        let err = commit(&exec, &txn, &TxnPolicy::default()).unwrap_err();
        assert!(err.in_doubt);
        assert!(txn.in_doubt());
        assert_eq!(txn.state(), TxnState::Verified);

        // a retry skips the verify
        let status = commit(&exec, &txn, &TxnPolicy::default()).unwrap();
        assert_eq!(status, CommitStatus::Ok);
        assert_eq!(kinds(&exec.sent()), ["verify", "mark", "mark", "forward", "close"]);
    }

    #[test]
    fn abort_rolls_back_and_closes() {
        let txn = txn_with_keys();
        let exec = Scripted::default();
        assert_eq!(abort(&exec, &txn, &TxnPolicy::default()).unwrap(), AbortStatus::Ok);
        assert_eq!(kinds(&exec.sent()), ["back", "close"]);
        assert_eq!(txn.state(), TxnState::Aborted);
    }

    #[test]
    fn in_doubt_writes_keep_the_monitor_on_abort() {
        let txn = txn_with_keys();
        let k = key(3);
        txn.on_write_in_doubt(&k.digest, &k.set);
        let exec = Scripted::default();
        exec.push(Ok(response(ResultCode::Ok, None, None)));
        exec.push(Err(Error::timeout()));
        assert_eq!(
            abort(&exec, &txn, &TxnPolicy::default()).unwrap(),
            AbortStatus::RollBackAbandoned
        );

        let txn = txn_with_keys();
        txn.on_write_in_doubt(&k.digest, &k.set);
        let exec = Scripted::default();
        assert_eq!(abort(&exec, &txn, &TxnPolicy::default()).unwrap(), AbortStatus::Ok);
        assert_eq!(kinds(&exec.sent()), ["back", "back"]);
    }

    #[test]
    fn transactions_without_writes_only_verify() {
        let txn = Txn::new();
        txn.set_ns("test").unwrap();
        let r = key(1);
        txn.on_read(&r.digest, &r.set, 4);
        let exec = Scripted::default();
        assert_eq!(commit(&exec, &txn, &TxnPolicy::default()).unwrap(), CommitStatus::Ok);
        assert_eq!(kinds(&exec.sent()), ["verify"]);
    }
}
