//! Transactions against an in-memory record store that plays the server
//! side of the monitor, verify and roll protocol.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use synapse::{
    txn::{self, monitor::MONITOR_SET, TxnState},
    wire::proto::{info1, info2, info4, FieldType, Message, MessageBuilder, PROTO_HEADER_SIZE},
    AbortStatus, CommitStatus, Digest, Error, Executor, Key, Policy, Result, ResultCode, Txn, TxnPolicy,
    UserKey,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Record {
    version: u64,
    /// Written under a transaction and not rolled yet.
    provisional: bool,
    rolled_back: bool,
}

#[derive(Default)]
struct Store {
    records: Mutex<HashMap<Digest, Record>>,
    monitors: Mutex<HashMap<Digest, Vec<Vec<u8>>>>,
    log: Mutex<Vec<&'static str>>,
}

fn reply(code: ResultCode, version: Option<u64>, deadline: Option<u32>) -> Result<Message> {
    let mut builder = MessageBuilder::new(0, 0, 0, 0);
    if let Some(version) = version {
        builder = builder.record_version(version);
    }
    if let Some(deadline) = deadline {
        builder = builder.field(FieldType::MrtDeadline, &deadline.to_le_bytes());
    }
    let mut frame = builder.build();
    frame[PROTO_HEADER_SIZE + 5] = code.code() as u8;
    let (msg, _) = Message::parse(&frame[PROTO_HEADER_SIZE..])?;
    match msg.result_code() {
        ResultCode::Ok => Ok(msg),
        code => Err(Error::new(code, code.to_string())),
    }
}

impl Store {
    fn insert(&self, key: &Key, version: u64) {
        self.records.lock().insert(
            key.digest,
            Record {
                version,
                ..Default::default()
            },
        );
    }

    fn record(&self, key: &Key) -> Record {
        self.records.lock().get(&key.digest).cloned().unwrap_or_default()
    }

    fn log(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }
}

impl Executor for Store {
    fn execute(&self, key: &Key, request: &[u8], _is_write: bool, _policy: &Policy) -> Result<Message> {
        let (msg, _) = Message::parse(&request[PROTO_HEADER_SIZE..])?;
        let h = msg.header;
        let mut records = self.records.lock();

        if key.set == MONITOR_SET {
            let mut monitors = self.monitors.lock();
            if h.info2 & info2::DELETE != 0 {
                self.log.lock().push("close");
                monitors.remove(&key.digest);
                return reply(ResultCode::Ok, None, None);
            }
            if msg.op("fwd").is_some() {
                self.log.lock().push("mark");
                return reply(ResultCode::Ok, None, None);
            }
            self.log.lock().push("monitor");
            let payload = msg.op("keyds").map(|op| op.value.clone()).unwrap_or_default();
            monitors.entry(key.digest).or_default().push(payload);
            return reply(ResultCode::Ok, None, Some(1_000));
        }

        if h.info4 & info4::MRT_VERIFY_READ != 0 {
            self.log.lock().push("verify");
            let current = records.get(&key.digest).map_or(0, |r| r.version);
            return match msg.record_version() {
                Some(version) if version == current => reply(ResultCode::Ok, None, None),
                _ => reply(ResultCode::MrtVersionMismatch, None, None),
            };
        }
        if h.info4 & (info4::MRT_ROLL_FORWARD | info4::MRT_ROLL_BACK) != 0 {
            let record = records.entry(key.digest).or_default();
            record.provisional = false;
            if h.info4 & info4::MRT_ROLL_BACK != 0 {
                self.log.lock().push("roll back");
                record.rolled_back = true;
            } else {
                self.log.lock().push("roll forward");
            }
            return reply(ResultCode::Ok, None, None);
        }
        if h.info2 & info2::WRITE != 0 {
            self.log.lock().push("write");
            assert!(msg.field(FieldType::MrtId).is_some());
            let record = records.entry(key.digest).or_default();
            record.version += 1;
            record.provisional = true;
            // writes under a transaction answer without a version
            return reply(ResultCode::Ok, None, None);
        }
        self.log.lock().push("read");
        match records.get(&key.digest) {
            Some(record) => reply(ResultCode::Ok, Some(record.version), None),
            None => reply(ResultCode::RecordNotFound, None, None),
        }
    }
}

fn key(n: i64) -> Key {
    Key::new("test", "accounts", UserKey::Int(n)).unwrap()
}

fn get(store: &Store, policy: &Policy, key: &Key) -> Result<Message> {
    txn::execute(store, policy, key, false, |txn| {
        let builder = key.write_fields(MessageBuilder::new(info1::READ | info1::GET_ALL, 0, 0, 0));
        match txn {
            Some(txn) => txn.write_fields(builder, key, false).build(),
            None => builder.build(),
        }
    })
}

fn put(store: &Store, policy: &Policy, key: &Key) -> Result<Message> {
    txn::execute(store, policy, key, true, |txn| {
        let builder = key.write_fields(MessageBuilder::new(0, info2::WRITE, 0, 0));
        match txn {
            Some(txn) => txn.write_fields(builder, key, true).build(),
            None => builder.build(),
        }
    })
}

#[test]
fn commit_verifies_reads_and_rolls_writes_forward() {
    let store = Store::default();
    store.insert(&key(1), 10);
    let txn = Arc::new(Txn::new());
    let policy = Policy::builder().txn(txn.clone()).build();

    get(&store, &policy, &key(1)).unwrap();
    put(&store, &policy, &key(2)).unwrap();
    put(&store, &policy, &key(2)).unwrap();
    assert_eq!(txn.read_count(), 1);
    assert_eq!(txn.write_count(), 1);
    assert!(txn.monitor_exists());

    let status = txn::commit(&store, &txn, &TxnPolicy::default()).unwrap();
    assert_eq!(status, CommitStatus::Ok);
    assert_eq!(txn.state(), TxnState::Committed);
    assert_eq!(
        store.log(),
        ["read", "monitor", "write", "write", "verify", "mark", "roll forward", "close"]
    );
    assert!(!store.record(&key(2)).provisional);
    assert!(store.monitors.lock().is_empty());

    // committing again is harmless, aborting is not allowed
    assert_eq!(
        txn::commit(&store, &txn, &TxnPolicy::default()).unwrap(),
        CommitStatus::AlreadyCommitted
    );
    let err = txn::abort(&store, &txn, &TxnPolicy::default()).unwrap_err();
    assert_eq!(err.code, ResultCode::MrtCommitted);
    assert_eq!(put(&store, &policy, &key(3)).unwrap_err().code, ResultCode::Client);
}

#[test]
fn concurrent_update_fails_verify_and_rolls_back() {
    let store = Store::default();
    store.insert(&key(1), 10);
    let txn = Arc::new(Txn::new());
    let policy = Policy::builder().txn(txn.clone()).build();

    get(&store, &policy, &key(1)).unwrap();
    put(&store, &policy, &key(2)).unwrap();
    // another client updates the record read above
    store.insert(&key(1), 11);

    let err = txn::commit(&store, &txn, &TxnPolicy::default()).unwrap_err();
    assert_eq!(err.code, ResultCode::TxnFailed);
    assert!(err.message.starts_with("Transaction verify failed"));
    assert_eq!(txn.state(), TxnState::Aborted);
    assert!(store.record(&key(2)).rolled_back);
    assert!(store.monitors.lock().is_empty());

    assert_eq!(
        txn::abort(&store, &txn, &TxnPolicy::default()).unwrap(),
        AbortStatus::AlreadyAborted
    );
    let err = txn::commit(&store, &txn, &TxnPolicy::default()).unwrap_err();
    assert_eq!(err.code, ResultCode::MrtAborted);
}

#[test]
fn abort_rolls_back_every_write() {
    let store = Store::default();
    let txn = Arc::new(Txn::new());
    let policy = Policy::builder().txn(txn.clone()).build();

    for n in 1..=3 {
        put(&store, &policy, &key(n)).unwrap();
    }
    // one monitor add per new key
    assert_eq!(store.log().iter().filter(|&&op| op == "monitor").count(), 3);

    let status = txn::abort(&store, &txn, &TxnPolicy::default()).unwrap();
    assert_eq!(status, AbortStatus::Ok);
    for n in 1..=3 {
        let record = store.record(&key(n));
        assert!(record.rolled_back && !record.provisional);
    }
    assert_eq!(store.log().last(), Some(&"close"));
}

#[test]
fn commands_outside_a_transaction_skip_the_monitor() {
    let store = Store::default();
    let policy = Policy::default();
    let err = get(&store, &policy, &key(9)).unwrap_err();
    assert_eq!(err.code, ResultCode::RecordNotFound);
    assert_eq!(store.log(), ["read"]);
}

#[test]
fn transactions_stay_in_one_namespace() {
    let store = Store::default();
    let txn = Arc::new(Txn::new());
    let policy = Policy::builder().txn(txn.clone()).build();
    put(&store, &policy, &key(1)).unwrap();

    let other = Key::new("other", "accounts", UserKey::Int(1)).unwrap();
    let err = put(&store, &policy, &other).unwrap_err();
    assert_eq!(err.code, ResultCode::Param);
    assert_eq!(store.log(), ["monitor", "write"]);
}
