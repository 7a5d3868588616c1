use std::{
    io::{self, Read},
    time::{Duration, Instant},
};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace};

use crate::wire::proto::{info3, MessageType, PROTO_HEADER_SIZE};

const AUTH_HEADER_SIZE: usize = 10;
/// Proto header plus the first 4 bytes of the message header, which exposes
/// info3 at offset 11.
const MULTI_HEADER_SIZE: usize = 12;
const DRAIN_CHUNK: usize = 16 * 1024;

/// How far the interrupted command had read its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadState {
    AuthHeader,
    Proto,
    Detail,
    Complete,
}

/// Snapshot handed over by a command that timed out mid-response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interrupted {
    pub state: ReadState,
    /// Header bytes already read in `AuthHeader` or `Proto`.
    pub header: Vec<u8>,
    /// Body bytes still unread in `Detail`.
    pub remaining: usize,
    /// The group being read in `Detail` carried the last group flag.
    pub last_group: bool,
}

impl Interrupted {
    pub fn at_header(state: ReadState, header: &[u8]) -> Self {
        Self {
            state,
            header: header.to_vec(),
            remaining: 0,
            last_group: false,
        }
    }

    pub fn in_detail(remaining: usize, last_group: bool) -> Self {
        Self {
            state: ReadState::Detail,
            header: Vec::new(),
            remaining,
            last_group,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainStatus {
    /// The response was fully consumed; the connection can be pooled.
    Complete,
    /// No data right now and the recovery deadline has not passed.
    Pending,
    /// The connection can't be recovered and must be closed.
    Abort,
}

/// Drains the rest of a response abandoned by a timed out command so the
/// connection can go back to its pool instead of being closed.
#[derive(Debug)]
pub struct ConnRecover {
    state: ReadState,
    is_single: bool,
    check_return_code: bool,
    header: [u8; MULTI_HEADER_SIZE],
    length: usize,
    offset: usize,
    remaining: usize,
    last_group: bool,
    aborted: bool,
    deadline: Instant,
    drained: usize,
}

impl ConnRecover {
    /// Starts recovery from where the command stopped. `timeout_delay`
    /// bounds how long draining may take overall.
    pub fn new(interrupted: Interrupted, is_single: bool, timeout_delay: Duration) -> Self {
        let mut this = Self {
            state: interrupted.state,
            is_single,
            check_return_code: false,
            header: [0; MULTI_HEADER_SIZE],
            length: 0,
            offset: 0,
            remaining: interrupted.remaining,
            last_group: interrupted.last_group,
            aborted: false,
            deadline: Instant::now() + timeout_delay,
            drained: 0,
        };
        match interrupted.state {
            ReadState::AuthHeader => {
                this.length = AUTH_HEADER_SIZE;
                this.is_single = true;
                this.check_return_code = true;
                this.state = ReadState::Proto;
                this.take_header(&interrupted.header);
            }
            ReadState::Proto => {
                this.length = if is_single {
                    PROTO_HEADER_SIZE
                } else {
                    MULTI_HEADER_SIZE
                };
                this.take_header(&interrupted.header);
            }
            ReadState::Detail | ReadState::Complete => {}
        }
        this
    }

    fn take_header(&mut self, read: &[u8]) {
        let n = read.len().min(self.length);
        self.header[..n].copy_from_slice(&read[..n]);
        self.offset = n;
        if self.offset >= self.length && !self.finish_header() {
            self.aborted = true;
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Bytes consumed from the socket so far.
    pub fn drained(&self) -> usize {
        self.drained
    }

    /// Validates a complete header and moves to `Detail`. False means the
    /// connection can't be recovered.
    fn finish_header(&mut self) -> bool {
        if self.check_return_code && self.header[self.length - 1] != 0 {
            debug!("authentication failed, connection not recoverable");
            return false;
        }
        if !self.is_single {
            if self.header[1] == MessageType::Compressed as u8 {
                // compressed groups would need the decompression state
                debug!("compressed multi-message response, connection not recoverable");
                return false;
            }
            if self.header[self.length - 1] & info3::LAST != 0 {
                self.last_group = true;
            }
        }
        let size = BigEndian::read_uint(&self.header[2..PROTO_HEADER_SIZE], 6) as usize;
        let already = self.length - PROTO_HEADER_SIZE;
        if size < already {
            return false;
        }
        self.remaining = size - already;
        self.offset = 0;
        self.check_return_code = false;
        self.state = ReadState::Detail;
        true
    }

    /// Reads whatever is available without waiting longer than the reader's
    /// own timeout.
    pub fn drain<R: Read>(&mut self, reader: &mut R) -> DrainStatus {
        if self.aborted {
            return DrainStatus::Abort;
        }
        let mut scratch = [0u8; DRAIN_CHUNK];
        loop {
            match self.state {
                ReadState::AuthHeader | ReadState::Proto => {
                    while self.offset < self.length {
                        match reader.read(&mut self.header[self.offset..self.length]) {
                            Ok(0) => return self.abort(),
                            Ok(n) => {
                                self.offset += n;
                                self.drained += n;
                            }
                            Err(e) => {
                                if let Some(status) = self.on_error(e) {
                                    return status;
                                }
                            }
                        }
                    }
                    if !self.finish_header() {
                        return self.abort();
                    }
                }
                ReadState::Detail => {
                    while self.remaining > 0 {
                        let len = self.remaining.min(DRAIN_CHUNK);
                        match reader.read(&mut scratch[..len]) {
                            Ok(0) => return self.abort(),
                            Ok(n) => {
                                self.remaining -= n;
                                self.drained += n;
                            }
                            Err(e) => {
                                if let Some(status) = self.on_error(e) {
                                    return status;
                                }
                            }
                        }
                    }
                    if self.is_single || self.last_group {
                        trace!(drained = self.drained, "connection recovered");
                        self.state = ReadState::Complete;
                    } else {
                        self.length = MULTI_HEADER_SIZE;
                        self.offset = 0;
                        self.state = ReadState::Proto;
                    }
                }
                ReadState::Complete => return DrainStatus::Complete,
            }
        }
    }

    /// `None` to retry the read, otherwise the status to report.
    fn on_error(&mut self, e: io::Error) -> Option<DrainStatus> {
        match e.kind() {
            io::ErrorKind::Interrupted => None,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                if Instant::now() >= self.deadline {
                    debug!("connection recovery deadline passed");
                    Some(self.abort())
                } else {
                    Some(DrainStatus::Pending)
                }
            }
            _ => Some(self.abort()),
        }
    }

    fn abort(&mut self) -> DrainStatus {
        self.aborted = true;
        self.state = ReadState::Complete;
        DrainStatus::Abort
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use proptest::prelude::*;

    use super::*;
    use crate::wire::proto::{MessageType, ProtoHeader};

    /// Serves `data` in the given chunk sizes, reporting WouldBlock between
    /// chunks.
    struct Chunked {
        data: VecDeque<u8>,
        chunks: VecDeque<usize>,
        blocked: bool,
    }

    impl Chunked {
        fn new(data: Vec<u8>, chunks: Vec<usize>) -> Self {
            Self {
                data: data.into(),
                chunks: chunks.into(),
                blocked: false,
            }
        }
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() || self.blocked {
                self.blocked = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let chunk = self.chunks.pop_front().unwrap_or(usize::MAX).max(1);
            let n = chunk.min(buf.len()).min(self.data.len());
            for b in buf.iter_mut().take(n) {
                *b = self.data.pop_front().unwrap();
            }
            self.blocked = true;
            Ok(n)
        }
    }

    fn single_response(body_len: usize) -> Vec<u8> {
        let mut data = ProtoHeader::new(MessageType::Message, body_len)
            .to_bytes()
            .to_vec();
        data.extend(std::iter::repeat(0xab).take(body_len));
        data
    }

    fn group(body_len: usize, last: bool) -> Vec<u8> {
        let mut data = single_response(body_len.max(4));
        data[8] = 22;
        data[11] = if last { info3::LAST } else { 0 };
        data
    }

    fn drain_all(recover: &mut ConnRecover, reader: &mut Chunked) -> DrainStatus {
        for _ in 0..100_000 {
            match recover.drain(reader) {
                DrainStatus::Pending => continue,
                other => return other,
            }
        }
        DrainStatus::Pending
    }

    proptest! {
        #[test]
        fn any_chunking_consumes_exactly_the_response(
            body_len in 1usize..40_000,
            chunks in prop::collection::vec(1usize..5_000, 0..64),
        ) {
            let data = single_response(body_len);
            let total = data.len();
            let mut reader = Chunked::new(data, chunks);
            let mut recover = ConnRecover::new(
                Interrupted::at_header(ReadState::Proto, &[]),
                true,
                Duration::from_secs(30),
            );
            prop_assert_eq!(drain_all(&mut recover, &mut reader), DrainStatus::Complete);
            prop_assert_eq!(recover.drained(), total);
            prop_assert!(reader.data.is_empty());
        }
    }

    #[test]
    fn one_byte_at_a_time_and_all_at_once_agree() {
        for chunks in [vec![1; 200], vec![usize::MAX]] {
            let mut reader = Chunked::new(single_response(100), chunks);
            let mut recover = ConnRecover::new(
                Interrupted::at_header(ReadState::Proto, &[]),
                true,
                Duration::from_secs(30),
            );
            assert_eq!(drain_all(&mut recover, &mut reader), DrainStatus::Complete);
            assert_eq!(recover.drained(), 108);
        }
    }

    #[test]
    fn resumes_from_a_partial_header() {
        let data = single_response(50);
        let mut reader = Chunked::new(data[3..].to_vec(), vec![]);
        let mut recover = ConnRecover::new(
            Interrupted::at_header(ReadState::Proto, &data[..3]),
            true,
            Duration::from_secs(30),
        );
        assert_eq!(drain_all(&mut recover, &mut reader), DrainStatus::Complete);
        assert!(reader.data.is_empty());
    }

    #[test]
    fn resumes_mid_detail() {
        let mut reader = Chunked::new(vec![0; 70], vec![7]);
        let mut recover =
            ConnRecover::new(Interrupted::in_detail(70, false), true, Duration::from_secs(30));
        assert_eq!(drain_all(&mut recover, &mut reader), DrainStatus::Complete);
        assert_eq!(recover.drained(), 70);
    }

    #[test]
    fn multi_message_responses_stop_after_the_last_group() {
        let mut data = group(300, false);
        data.extend(group(1000, false));
        data.extend(group(22, true));
        let total = data.len();
        // bytes after the last group belong to nobody and must not be read
        data.extend([9u8; 5]);
        let mut reader = Chunked::new(data, vec![13; 1000]);
        let mut recover = ConnRecover::new(
            Interrupted::at_header(ReadState::Proto, &[]),
            false,
            Duration::from_secs(30),
        );
        assert_eq!(drain_all(&mut recover, &mut reader), DrainStatus::Complete);
        assert_eq!(recover.drained(), total);
        assert_eq!(reader.data.len(), 5);
    }

    #[test]
    fn compressed_groups_abort() {
        let mut data = group(100, false);
        data[1] = MessageType::Compressed as u8;
        let mut reader = Chunked::new(data, vec![]);
        let mut recover = ConnRecover::new(
            Interrupted::at_header(ReadState::Proto, &[]),
            false,
            Duration::from_secs(30),
        );
        assert_eq!(drain_all(&mut recover, &mut reader), DrainStatus::Abort);
    }

    #[test]
    fn failed_auth_aborts_immediately() {
        let mut header = ProtoHeader::new(MessageType::Admin, 16).to_bytes().to_vec();
        header.extend([0, 65]);
        let mut recover = ConnRecover::new(
            Interrupted::at_header(ReadState::AuthHeader, &header),
            true,
            Duration::from_secs(30),
        );
        let mut reader = Chunked::new(vec![0; 14], vec![]);
        assert_eq!(recover.drain(&mut reader), DrainStatus::Abort);
    }

    #[test]
    fn successful_auth_drains_its_body() {
        let mut data = ProtoHeader::new(MessageType::Admin, 16).to_bytes().to_vec();
        data.extend([0, 0]);
        data.extend([1u8; 14]);
        let mut reader = Chunked::new(data, vec![4]);
        let mut recover = ConnRecover::new(
            Interrupted::at_header(ReadState::AuthHeader, &[]),
            true,
            Duration::from_secs(30),
        );
        assert_eq!(drain_all(&mut recover, &mut reader), DrainStatus::Complete);
        assert!(reader.data.is_empty());
    }

    #[test]
    fn passing_the_deadline_while_blocked_aborts() {
        let mut reader = Chunked::new(Vec::new(), vec![]);
        let mut recover =
            ConnRecover::new(Interrupted::in_detail(10, false), true, Duration::ZERO);
        assert_eq!(recover.drain(&mut reader), DrainStatus::Abort);

        let mut recover =
            ConnRecover::new(Interrupted::in_detail(10, false), true, Duration::from_secs(30));
        assert_eq!(recover.drain(&mut reader), DrainStatus::Pending);
    }

    #[test]
    fn closed_peer_aborts() {
        struct Closed;
        impl Read for Closed {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        let mut recover =
            ConnRecover::new(Interrupted::in_detail(10, false), true, Duration::from_secs(30));
        assert_eq!(recover.drain(&mut Closed), DrainStatus::Abort);
    }
}
