//! Registration of written keys with the transaction monitor record.
//!
//! The monitor record lives in the transaction's namespace under a reserved
//! set, keyed by the transaction id. It holds the id and the ordered unique
//! list of digests the server has to roll when the transaction ends.

use tracing::debug;

use super::Txn;
use crate::{
    config::Policy,
    conn::Executor,
    error::{Error, Result},
    wire::{
        key::{Key, UserKey},
        msgpack,
        proto::{info2, Message, MessageBuilder, OpType, ParticleType},
    },
};

/// Reserved set holding monitor records.
pub const MONITOR_SET: &str = "<ERO~MRT";

const BIN_ID: &str = "id";
const BIN_DIGESTS: &str = "keyds";

/// A record of a batch, as far as the monitor is concerned.
#[derive(Clone, Debug)]
pub struct BatchRecord {
    pub key: Key,
    pub has_write: bool,
}

/// Key of the monitor record of `txn`. The namespace must be bound.
pub fn monitor_key(txn: &Txn) -> Result<Key> {
    let namespace = txn
        .namespace()
        .ok_or_else(|| Error::client("Transaction namespace is not set"))?;
    Key::new(&namespace, MONITOR_SET, UserKey::Int(txn.id() as i64))
}

/// Operate request appending `digests` to the monitor record, creating the
/// record with the id bin first when it doesn't exist yet.
fn add_keys_request(txn: &Txn, monitor: &Key, digests: &[&[u8]]) -> Result<Vec<u8>> {
    let builder = MessageBuilder::new(0, info2::WRITE | info2::RESPOND_ALL_OPS, 0, 0)
        .txn_ttl(txn.timeout());
    let mut builder = monitor.write_fields(builder);
    if !txn.monitor_exists() {
        builder = builder.op(
            OpType::Write,
            ParticleType::Integer,
            BIN_ID,
            &(txn.id() as i64).to_be_bytes(),
        );
    }
    let payload = match digests {
        [digest] => msgpack::list_append_unique_blob(digest)?,
        _ => msgpack::list_append_unique_blobs(digests)?,
    };
    Ok(builder
        .op(OpType::CdtModify, ParticleType::Blob, BIN_DIGESTS, &payload)
        .build())
}

/// Monitor operations reuse the command's timing but always go to the
/// master.
fn send(executor: &dyn Executor, txn: &Txn, policy: &Policy, digests: &[&[u8]]) -> Result<Message> {
    let monitor = monitor_key(txn)?;
    let request = add_keys_request(txn, &monitor, digests)?;
    let msg = executor.execute(&monitor, &request, true, &policy.monitor_copy())?;
    if let Some(deadline) = msg.mrt_deadline() {
        txn.set_deadline(deadline);
    }
    debug!(txn = txn.id(), keys = digests.len(), "added keys to transaction monitor");
    Ok(msg)
}

/// Registers `key` before it is written. Keys already written under the
/// transaction are skipped.
pub fn add_key(executor: &dyn Executor, txn: &Txn, policy: &Policy, key: &Key) -> Result<()> {
    if txn.writes_contain(key) {
        return Ok(());
    }
    txn.set_ns(&key.namespace)?;
    send(executor, txn, policy, &[&key.digest[..]])?;
    Ok(())
}

/// Registers every key of a batch write.
pub fn add_keys_batch(executor: &dyn Executor, txn: &Txn, policy: &Policy, keys: &[Key]) -> Result<()> {
    let digests = batch_digests(txn, keys.iter().map(|key| (key, true)))?;
    send(executor, txn, policy, &digests)?;
    Ok(())
}

/// Registers the keys of the writing records of a batch. A read-only batch
/// sends nothing.
pub fn add_keys_records(
    executor: &dyn Executor,
    txn: &Txn,
    policy: &Policy,
    records: &[BatchRecord],
) -> Result<()> {
    let digests = batch_digests(txn, records.iter().map(|rec| (&rec.key, rec.has_write)))?;
    if digests.is_empty() {
        return Ok(());
    }
    send(executor, txn, policy, &digests)?;
    Ok(())
}

/// Binds the namespace for every key, including read-only ones, and
/// collects the digests to register.
fn batch_digests<'a>(
    txn: &Txn,
    keys: impl Iterator<Item = (&'a Key, bool)>,
) -> Result<Vec<&'a [u8]>> {
    let mut digests = Vec::new();
    for (key, has_write) in keys {
        txn.set_ns(&key.namespace)?;
        if has_write {
            digests.push(&key.digest[..]);
        }
    }
    Ok(digests)
}

#[cfg(feature = "async")]
mod pipelined {
    use super::*;
    use crate::pipe::event_loop::EventLoops;

    async fn send_async(loops: &EventLoops, txn: &Txn, policy: &Policy, digests: &[&[u8]]) -> Result<()> {
        let monitor = monitor_key(txn)?;
        let request = add_keys_request(txn, &monitor, digests)?;
        let msg = loops
            .execute(&monitor, request, true, &policy.monitor_copy())
            .await?;
        if let Some(deadline) = msg.mrt_deadline() {
            txn.set_deadline(deadline);
        }
        Ok(())
    }

    /// Pipelined [`add_key`].
    pub async fn add_key_async(loops: &EventLoops, txn: &Txn, policy: &Policy, key: &Key) -> Result<()> {
        if txn.writes_contain(key) {
            return Ok(());
        }
        txn.set_ns(&key.namespace)?;
        send_async(loops, txn, policy, &[&key.digest[..]]).await
    }

    /// Pipelined [`add_keys_records`].
    pub async fn add_keys_records_async(
        loops: &EventLoops,
        txn: &Txn,
        policy: &Policy,
        records: &[BatchRecord],
    ) -> Result<()> {
        let digests = batch_digests(txn, records.iter().map(|rec| (&rec.key, rec.has_write)))?;
        if digests.is_empty() {
            return Ok(());
        }
        send_async(loops, txn, policy, &digests).await
    }
}

#[cfg(feature = "async")]
pub use pipelined::{add_key_async, add_keys_records_async};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ResultCode,
        txn::tests::{key, response, Scripted},
    };

    #[test]
    fn first_add_creates_the_record() {
        let txn = Txn::new();
        let exec = Scripted::default();
        exec.push(Ok(response(ResultCode::Ok, None, Some(99))));
        add_key(&exec, &txn, &Policy::default(), &key(1)).unwrap();
        add_key(&exec, &txn, &Policy::default(), &key(2)).unwrap();

        let sent = exec.sent();
        assert_eq!(sent.len(), 2);
        let names: Vec<_> = sent[0].ops.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, [BIN_ID, BIN_DIGESTS]);
        // the record exists now, only the digest is appended
        let names: Vec<_> = sent[1].ops.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, [BIN_DIGESTS]);
        assert_eq!(txn.deadline(), 99);

        let monitor = monitor_key(&txn).unwrap();
        assert_eq!(monitor.set, MONITOR_SET);
        assert_eq!(monitor.namespace, "test");
    }

    #[test]
    fn read_only_batches_send_nothing() {
        let txn = Txn::new();
        let exec = Scripted::default();
        let records = [
            BatchRecord { key: key(1), has_write: false },
            BatchRecord { key: key(2), has_write: false },
        ];
        add_keys_records(&exec, &txn, &Policy::default(), &records).unwrap();
        assert!(exec.sent().is_empty());
        assert_eq!(txn.namespace().as_deref(), Some("test"));

        let records = [
            BatchRecord { key: key(1), has_write: false },
            BatchRecord { key: key(2), has_write: true },
        ];
        add_keys_records(&exec, &txn, &Policy::default(), &records).unwrap();
        assert_eq!(exec.sent().len(), 1);
    }

    #[test]
    fn batches_reject_foreign_namespaces() {
        let txn = Txn::new();
        let exec = Scripted::default();
        let other = Key::new("other", "demo", UserKey::Int(1)).unwrap();
        let err = add_keys_batch(&exec, &txn, &Policy::default(), &[key(1), other]).unwrap_err();
        assert_eq!(err.code, ResultCode::Param);
        assert!(exec.sent().is_empty());
    }
}
