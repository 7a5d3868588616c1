//! Multi-record transactions.
//!
//! A [`Txn`] tracks the version of every record read and the digest of every
//! record written under it. Written keys are registered with a monitor
//! record on the server before the write is sent (see [`monitor`]); commit
//! and abort then verify the reads and roll the writes (see [`roll`]).

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

use crate::{
    config::Policy,
    conn::Executor,
    error::{Error, Result, ResultCode},
    wire::{
        key::{Digest, Key, NAMESPACE_MAX_SIZE},
        proto::{FieldType, Message, MessageBuilder},
    },
};

pub mod monitor;
pub mod roll;

pub use roll::{abort, commit, AbortStatus, CommitStatus};

const DEFAULT_CAPACITY: usize = 128;
const MIN_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Open,
    /// Every read version was confirmed; the commit may still be rolling.
    Verified,
    Committed,
    Aborted,
}

/// A key tracked by a transaction. Written keys carry version 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnKey {
    pub digest: Digest,
    pub set: String,
    pub version: u64,
}

/// Digest keyed table. Each table has its own lock: commands of one
/// transaction may run on several threads at once.
#[derive(Default)]
struct KeyTable(Mutex<HashMap<Digest, TxnKey>>);

impl KeyTable {
    fn with_capacity(capacity: usize) -> Self {
        Self(Mutex::new(HashMap::with_capacity(capacity)))
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.0.lock().capacity()
    }

    fn put(&self, digest: &Digest, set: &str, version: u64) {
        let mut table = self.0.lock();
        match table.get_mut(digest) {
            Some(key) => key.version = version,
            None => {
                table.insert(
                    *digest,
                    TxnKey {
                        digest: *digest,
                        set: set.to_owned(),
                        version,
                    },
                );
            }
        }
    }

    fn remove(&self, digest: &Digest) {
        self.0.lock().remove(digest);
    }

    fn version(&self, digest: &Digest) -> u64 {
        self.0.lock().get(digest).map_or(0, |key| key.version)
    }

    fn contains(&self, digest: &Digest) -> bool {
        self.0.lock().contains_key(digest)
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }

    fn snapshot(&self) -> Vec<TxnKey> {
        self.0.lock().values().cloned().collect()
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}

/// A multi-record transaction. Every command in it must use the same
/// namespace.
pub struct Txn {
    id: u64,
    namespace: Mutex<Option<String>>,
    reads: KeyTable,
    writes: KeyTable,
    timeout: AtomicU32,
    deadline: AtomicU32,
    state: Mutex<TxnState>,
    write_in_doubt: AtomicBool,
    in_doubt: AtomicBool,
    roll_attempted: AtomicBool,
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("namespace", &*self.namespace.lock())
            .field("state", &self.state())
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}

impl Default for Txn {
    fn default() -> Self {
        Self::new()
    }
}

impl Txn {
    /// A transaction with a random id and default table capacities.
    pub fn new() -> Self {
        Self::build(DEFAULT_CAPACITY, DEFAULT_CAPACITY)
    }

    /// Sizes the key tables for the expected number of reads and writes.
    /// Each table gets twice the expected count, at least 16 before doubling.
    pub fn with_capacity(reads: usize, writes: usize) -> Self {
        let size = |expected: usize| expected.max(MIN_CAPACITY) * 2;
        Self::build(size(reads), size(writes))
    }

    fn build(reads: usize, writes: usize) -> Self {
        let mut rng = rand::thread_rng();
        // zero is not a valid id
        let id = loop {
            let id: u64 = rng.gen();
            if id != 0 {
                break id;
            }
        };
        Self {
            id,
            namespace: Mutex::new(None),
            reads: KeyTable::with_capacity(reads),
            writes: KeyTable::with_capacity(writes),
            timeout: AtomicU32::new(0),
            deadline: AtomicU32::new(0),
            state: Mutex::new(TxnState::Open),
            write_in_doubt: AtomicBool::new(false),
            in_doubt: AtomicBool::new(false),
            roll_attempted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn namespace(&self) -> Option<String> {
        self.namespace.lock().clone()
    }

    /// Client side transaction timeout in seconds. Zero leaves the server's
    /// configured duration in effect.
    pub fn timeout(&self) -> u32 {
        self.timeout.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, seconds: u32) {
        self.timeout.store(seconds, Ordering::Relaxed);
    }

    /// Server deadline of the monitor record, zero until the record exists.
    pub fn deadline(&self) -> u32 {
        self.deadline.load(Ordering::Acquire)
    }

    pub(crate) fn set_deadline(&self, deadline: u32) {
        self.deadline.store(deadline, Ordering::Release);
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        trace!(txn = self.id, ?state, "transaction state");
        *self.state.lock() = state;
    }

    /// A write may have been applied without the client knowing.
    pub fn write_in_doubt(&self) -> bool {
        self.write_in_doubt.load(Ordering::Acquire)
    }

    /// The commit outcome is unknown to the client.
    pub fn in_doubt(&self) -> bool {
        self.in_doubt.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_doubt(&self, in_doubt: bool) {
        self.in_doubt.store(in_doubt, Ordering::Release);
    }

    /// Records the version a read returned. Reads without a version (e.g.
    /// record not found) are not tracked.
    pub fn on_read(&self, digest: &Digest, set: &str, version: u64) {
        if version != 0 {
            self.reads.put(digest, set, version);
        }
    }

    pub fn read_version(&self, key: &Key) -> u64 {
        self.reads.version(&key.digest)
    }

    /// Records a write outcome. A write returning a version is verified at
    /// commit like a read; a successful write without one moves the key from
    /// the reads to the writes.
    pub fn on_write(&self, digest: &Digest, set: &str, version: u64, code: ResultCode) {
        if version != 0 {
            self.reads.put(digest, set, version);
        } else if code == ResultCode::Ok {
            self.reads.remove(digest);
            self.writes.put(digest, set, 0);
        }
    }

    /// The write may or may not have happened. The key has to be rolled
    /// either way and the monitor record must survive for the server.
    pub fn on_write_in_doubt(&self, digest: &Digest, set: &str) {
        self.write_in_doubt.store(true, Ordering::Release);
        self.reads.remove(digest);
        self.writes.put(digest, set, 0);
    }

    pub fn writes_contain(&self, key: &Key) -> bool {
        self.writes.contains(&key.digest)
    }

    /// Binds the transaction to `namespace` on first use.
    pub fn set_ns(&self, namespace: &str) -> Result<()> {
        let mut current = self.namespace.lock();
        match current.as_deref() {
            None => {
                if namespace.is_empty() || namespace.len() >= NAMESPACE_MAX_SIZE {
                    Err(Error::param(format!("Invalid namespace '{}'", namespace)))?
                }
                *current = Some(namespace.to_owned());
                Ok(())
            }
            Some(ns) if ns == namespace => Ok(()),
            Some(ns) => Err(Error::param(format!(
                "Namespace must be the same for all commands in the MRT. orig: {} new: {}",
                ns, namespace
            ))),
        }
    }

    /// Commands are only allowed while the transaction is open.
    pub fn verify_command(&self) -> Result<()> {
        let state = self.state();
        if state != TxnState::Open {
            Err(Error::client(format!(
                "Command not allowed in current MRT state: {:?}",
                state
            )))?
        }
        Ok(())
    }

    pub fn monitor_exists(&self) -> bool {
        self.deadline() != 0
    }

    /// The monitor record may be deleted once the transaction ends. A write
    /// in doubt leaves it for the server to resolve.
    pub fn close_monitor(&self) -> bool {
        self.monitor_exists() && !self.write_in_doubt()
    }

    /// True only for the first caller.
    pub fn set_roll_attempted(&self) -> bool {
        !self.roll_attempted.swap(true, Ordering::AcqRel)
    }

    /// Forgets every tracked key, the namespace and the deadline.
    pub fn clear(&self) {
        *self.namespace.lock() = None;
        self.deadline.store(0, Ordering::Release);
        self.reads.clear();
        self.writes.clear();
    }

    pub fn reads(&self) -> Vec<TxnKey> {
        self.reads.snapshot()
    }

    pub fn writes(&self) -> Vec<TxnKey> {
        self.writes.snapshot()
    }

    pub fn read_count(&self) -> usize {
        self.reads.len()
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Adds the transaction fields a record command carries: the id, the
    /// version read earlier if any, and for writes the monitor deadline.
    pub fn write_fields(&self, builder: MessageBuilder, key: &Key, is_write: bool) -> MessageBuilder {
        let mut builder = builder.field_u64_le(FieldType::MrtId, self.id);
        let version = self.read_version(key);
        if version != 0 {
            builder = builder.record_version(version);
        }
        let deadline = self.deadline();
        if is_write && deadline != 0 {
            builder = builder.field(FieldType::MrtDeadline, &deadline.to_le_bytes());
        }
        builder
    }

    /// Applies a command response to the key tables.
    pub fn on_response(&self, key: &Key, msg: &Message, is_write: bool) {
        let version = msg.record_version().unwrap_or(0);
        if is_write {
            self.on_write(&key.digest, &key.set, version, msg.result_code());
        } else {
            self.on_read(&key.digest, &key.set, version);
        }
    }
}

/// Runs a record command, inside `policy.txn` when set.
///
/// Under a transaction, a write first registers its key with the monitor
/// record and every command binds the namespace. `build` receives the
/// transaction to add its fields to the request. The response, or an in
/// doubt failure, is recorded in the key tables.
pub fn execute(
    executor: &dyn Executor,
    policy: &Policy,
    key: &Key,
    is_write: bool,
    build: impl FnOnce(Option<&Txn>) -> Vec<u8>,
) -> Result<Message> {
    let Some(txn) = policy.txn.as_deref() else {
        let request = build(None);
        return executor.execute(key, &request, is_write, policy);
    };
    txn.verify_command()?;
    if is_write {
        monitor::add_key(executor, txn, policy, key)?;
    } else {
        txn.set_ns(&key.namespace)?;
    }

    let request = build(Some(txn));
    match executor.execute(key, &request, is_write, policy) {
        Ok(msg) => {
            txn.on_response(key, &msg, is_write);
            Ok(msg)
        }
        Err(e) => {
            if is_write && e.in_doubt {
                txn.on_write_in_doubt(&key.digest, &key.set);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::wire::{
        key::UserKey,
        proto::{info1, info2, PROTO_HEADER_SIZE},
    };

    /// Executor answering from a script and recording every request.
    #[derive(Default)]
    pub(crate) struct Scripted {
        pub(crate) requests: Mutex<Vec<Message>>,
        /// Result per request in order; missing entries succeed.
        pub(crate) results: Mutex<Vec<Result<Message>>>,
    }

    pub(crate) fn response(code: ResultCode, version: Option<u64>, deadline: Option<u32>) -> Message {
        let mut builder = MessageBuilder::new(0, 0, 0, 0);
        if let Some(version) = version {
            builder = builder.record_version(version);
        }
        if let Some(deadline) = deadline {
            builder = builder.field(FieldType::MrtDeadline, &deadline.to_le_bytes());
        }
        let mut frame = builder.build();
        frame[PROTO_HEADER_SIZE + 5] = code.code() as u8;
        Message::parse(&frame[PROTO_HEADER_SIZE..]).unwrap().0
    }

    impl Scripted {
        pub(crate) fn push(&self, result: Result<Message>) {
            self.results.lock().push(result);
        }

        pub(crate) fn sent(&self) -> Vec<Message> {
            self.requests.lock().clone()
        }
    }

    impl Executor for Scripted {
        fn execute(&self, _key: &Key, request: &[u8], _is_write: bool, _policy: &Policy) -> Result<Message> {
            let (msg, _) = Message::parse(&request[PROTO_HEADER_SIZE..])?;
            self.requests.lock().push(msg);
            let mut results = self.results.lock();
            let result = if results.is_empty() {
                Ok(response(ResultCode::Ok, None, None))
            } else {
                results.remove(0)
            };
            result.and_then(|msg| match msg.result_code() {
                ResultCode::Ok => Ok(msg),
                code => Err(Error::new(code, code.to_string())),
            })
        }
    }

    pub(crate) fn key(n: i64) -> Key {
        Key::new("test", "demo", UserKey::Int(n)).unwrap()
    }

    fn put(txn: &Txn, k: &Key) -> Vec<u8> {
        txn.write_fields(k.write_fields(MessageBuilder::new(0, info2::WRITE, 0, 0)), k, true)
            .build()
    }

    #[test]
    fn ids_are_random_and_non_zero() {
        let a = Txn::new();
        let b = Txn::with_capacity(1, 1);
        assert_ne!(a.id(), 0);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), TxnState::Open);
    }

    #[test]
    fn requested_capacities_are_doubled() {
        let txn = Txn::with_capacity(100, 3);
        assert!(txn.reads.capacity() >= 200);
        assert!(txn.writes.capacity() >= 32);
        assert!(Txn::with_capacity(0, 0).reads.capacity() >= 32);
    }

    #[test]
    fn versionless_reads_are_not_tracked() {
        let txn = Txn::new();
        let k = key(1);
        txn.on_read(&k.digest, &k.set, 0);
        assert_eq!(txn.read_count(), 0);
        txn.on_read(&k.digest, &k.set, 7);
        txn.on_read(&k.digest, &k.set, 9);
        assert_eq!(txn.read_version(&k), 9);
        assert_eq!(txn.read_count(), 1);
    }

    #[test]
    fn failed_writes_without_a_version_change_nothing() {
        let txn = Txn::new();
        let k = key(1);
        txn.on_read(&k.digest, &k.set, 3);
        txn.on_write(&k.digest, &k.set, 0, ResultCode::Generation);
        assert_eq!(txn.read_version(&k), 3);
        assert!(!txn.writes_contain(&k));
    }

    #[test]
    fn in_doubt_writes_keep_the_monitor() {
        let txn = Txn::new();
        let k = key(1);
        txn.set_deadline(100);
        assert!(txn.close_monitor());
        txn.on_read(&k.digest, &k.set, 3);
        txn.on_write_in_doubt(&k.digest, &k.set);
        assert!(txn.writes_contain(&k));
        assert_eq!(txn.read_count(), 0);
        assert!(txn.write_in_doubt());
        assert!(!txn.close_monitor());
    }

    #[test]
    fn namespaces_cannot_be_mixed() {
        let txn = Txn::new();
        txn.set_ns("test").unwrap();
        txn.set_ns("test").unwrap();
        let err = txn.set_ns("bar").unwrap_err();
        assert_eq!(err.code, ResultCode::Param);
        txn.clear();
        txn.set_ns("bar").unwrap();
    }

    #[test]
    fn commands_need_an_open_transaction() {
        let txn = Txn::new();
        txn.verify_command().unwrap();
        txn.set_state(TxnState::Committed);
        assert_eq!(txn.verify_command().unwrap_err().code, ResultCode::Client);
        assert!(txn.set_roll_attempted());
        assert!(!txn.set_roll_attempted());
    }

    #[test]
    fn writes_register_with_the_monitor_once() {
        let txn = Arc::new(Txn::new());
        let policy = Policy::builder().txn(txn.clone()).build();
        let exec = Scripted::default();
        let k = key(5);

        // monitor add answers with the deadline, the write itself succeeds
        exec.push(Ok(response(ResultCode::Ok, None, Some(30))));
        execute(&exec, &policy, &k, true, |txn| put(txn.unwrap(), &k)).unwrap();
        assert_eq!(txn.deadline(), 30);
        assert!(txn.writes_contain(&k));
        assert_eq!(txn.namespace().as_deref(), Some("test"));

        execute(&exec, &policy, &k, true, |txn| put(txn.unwrap(), &k)).unwrap();
        let sent = exec.sent();
        // add key, write, write
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].field(FieldType::MrtId), Some(&txn.id().to_le_bytes()[..]));
        assert_eq!(sent[2].mrt_deadline(), Some(30));
    }

    #[test]
    fn reads_record_their_version() {
        let txn = Arc::new(Txn::new());
        let policy = Policy::builder().txn(txn.clone()).build();
        let exec = Scripted::default();
        let k = key(6);
        exec.push(Ok(response(ResultCode::Ok, Some(42), None)));
        execute(&exec, &policy, &k, false, |txn| {
            txn.unwrap()
                .write_fields(k.write_fields(MessageBuilder::new(info1::READ, 0, 0, 0)), &k, false)
                .build()
        })
        .unwrap();
        assert_eq!(txn.read_version(&k), 42);
        assert_eq!(exec.sent().len(), 1);
    }

    #[test]
    fn in_doubt_failures_are_tracked() {
        let txn = Arc::new(Txn::new());
        let policy = Policy::builder().txn(txn.clone()).build();
        let exec = Scripted::default();
        let k = key(7);
        exec.push(Ok(response(ResultCode::Ok, None, Some(30))));
        exec.push(Err(Error::timeout().with_in_doubt(true)));
        let err = execute(&exec, &policy, &k, true, |txn| put(txn.unwrap(), &k)).unwrap_err();
        assert!(err.is_timeout());
        assert!(txn.write_in_doubt());
        assert!(txn.writes_contain(&k));
    }

    #[derive(Clone, Debug)]
    enum Event {
        Read(u8, u64),
        Write(u8, u64, bool),
        InDoubt(u8),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            (0u8..8, 0u64..4).prop_map(|(k, v)| Event::Read(k, v)),
            (0u8..8, 0u64..4, any::<bool>()).prop_map(|(k, v, ok)| Event::Write(k, v, ok)),
            (0u8..8).prop_map(Event::InDoubt),
        ]
    }

    proptest! {
        #[test]
        fn tables_follow_the_last_event(events in prop::collection::vec(event(), 0..64)) {
            let txn = Txn::new();
            // expected (read version, written) per key
            let mut model: HashMap<u8, (u64, bool)> = HashMap::new();
            for event in &events {
                match *event {
                    Event::Read(k, v) => {
                        txn.on_read(&[k; 20], "s", v);
                        if v != 0 {
                            model.entry(k).or_default().0 = v;
                        }
                    }
                    Event::Write(k, v, ok) => {
                        let code = if ok { ResultCode::Ok } else { ResultCode::Generation };
                        txn.on_write(&[k; 20], "s", v, code);
                        let entry = model.entry(k).or_default();
                        if v != 0 {
                            entry.0 = v;
                        } else if ok {
                            *entry = (0, true);
                        }
                    }
                    Event::InDoubt(k) => {
                        txn.on_write_in_doubt(&[k; 20], "s");
                        *model.entry(k).or_default() = (0, true);
                    }
                }
            }
            for k in 0u8..8 {
                let (version, written) = model.get(&k).copied().unwrap_or_default();
                let key = Key::from_digest("test", "s", [k; 20]).unwrap();
                prop_assert_eq!(txn.read_version(&key), version);
                prop_assert_eq!(txn.writes_contain(&key), written);
            }
        }
    }
}
