//! Scan definitions and their resumable page state.
//!
//! A paginated scan remembers, per partition, the last digest it returned
//! and whether the partition is finished. [`Scan::to_bytes`] captures that
//! state so a scan can be stopped and resumed later, possibly by another
//! process.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    error::{Error, Result},
    wire::key::{partition_id, Digest, BIN_NAME_MAX_SIZE, DIGEST_SIZE, NAMESPACE_MAX_SIZE, SET_MAX_SIZE},
};

/// Encoding version written first by [`Scan::to_bytes`].
const PAGE_STATE_VERSION: u8 = 1;

const FLAG_NO_BINS: u8 = 1 << 0;
const FLAG_CONCURRENT: u8 = 1 << 1;
const FLAG_PAGINATE: u8 = 1 << 2;
const FLAG_PARTS: u8 = 1 << 3;

const PART_DONE: u8 = 1 << 0;
const PART_DIGEST: u8 = 1 << 1;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Auto = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Priority::Auto,
            1 => Priority::Low,
            2 => Priority::Medium,
            3 => Priority::High,
            other => Err(Error::param(format!("Invalid scan priority {}", other)))?,
        })
    }
}

/// Progress of one partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionStatus {
    pub part_id: u16,
    /// Last digest returned, the scan resumes after it.
    pub digest: Option<Digest>,
    /// Last bval returned, used by queries.
    pub bval: u64,
    pub done: bool,
}

/// Progress of every partition a scan covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionsStatus {
    pub part_begin: u16,
    pub part_count: u16,
    pub done: bool,
    pub parts: Vec<PartitionStatus>,
}

impl PartitionsStatus {
    pub fn new(part_begin: u16, part_count: u16) -> Self {
        let parts = (part_begin..part_begin + part_count)
            .map(|part_id| PartitionStatus {
                part_id,
                ..Default::default()
            })
            .collect();
        Self {
            part_begin,
            part_count,
            done: false,
            parts,
        }
    }

    pub fn get(&self, part_id: u16) -> Option<&PartitionStatus> {
        part_id
            .checked_sub(self.part_begin)
            .and_then(|i| self.parts.get(i as usize))
    }

    pub fn get_mut(&mut self, part_id: u16) -> Option<&mut PartitionStatus> {
        part_id
            .checked_sub(self.part_begin)
            .and_then(|i| self.parts.get_mut(i as usize))
    }

    /// Records a returned record so that a resumed scan skips it.
    pub fn set_last(&mut self, part_id: u16, digest: Digest, bval: u64) {
        if let Some(part) = self.get_mut(part_id) {
            part.digest = Some(digest);
            part.bval = bval;
        }
    }

    pub fn mark_done(&mut self, part_id: u16) {
        if let Some(part) = self.get_mut(part_id) {
            part.done = true;
        }
        self.done = self.parts.iter().all(|part| part.done);
    }

    /// Partitions still to be scanned.
    pub fn remaining(&self) -> impl Iterator<Item = &PartitionStatus> {
        self.parts.iter().filter(|part| !part.done)
    }
}

/// Partitions a scan covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionFilter {
    pub begin: u16,
    pub count: u16,
    /// Start after this digest in the `begin` partition.
    pub digest: Option<Digest>,
}

impl PartitionFilter {
    pub fn all(n_partitions: u16) -> Self {
        Self::range(0, n_partitions)
    }

    pub fn id(part_id: u16) -> Self {
        Self::range(part_id, 1)
    }

    pub fn range(begin: u16, count: u16) -> Self {
        Self {
            begin,
            count,
            digest: None,
        }
    }

    /// The partition owning `digest`, starting after that record.
    pub fn after(digest: Digest, n_partitions: u16) -> Self {
        Self {
            begin: partition_id(&digest, n_partitions),
            count: 1,
            digest: Some(digest),
        }
    }

    /// Fresh progress for the covered partitions.
    pub fn status(&self, n_partitions: u16) -> Result<PartitionsStatus> {
        let end = self.begin as u32 + self.count as u32;
        if self.count == 0 || end > n_partitions as u32 {
            Err(Error::param(format!(
                "Invalid partition range: begin {} count {} partitions {}",
                self.begin, self.count, n_partitions
            )))?
        }
        let mut status = PartitionsStatus::new(self.begin, self.count);
        if let Some(digest) = self.digest {
            status.set_last(self.begin, digest, 0);
        }
        Ok(status)
    }
}

/// A scan of a namespace or set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scan {
    pub namespace: String,
    /// Empty scans the whole namespace.
    pub set: String,
    /// Bins to return. Empty returns all of them.
    pub select: Vec<String>,
    pub no_bins: bool,
    /// Scan nodes in parallel.
    pub concurrent: bool,
    pub paginate: bool,
    pub priority: Priority,
    /// Percent of the data to scan, 1 to 100.
    pub percent: u8,
    /// TTL applied by background scans, 0 for the namespace default.
    pub ttl: u32,
    /// Stop after this many records, 0 for no limit.
    pub max_records: u64,
    /// Records per second per node, 0 for no limit.
    pub records_per_second: u32,
    /// Page state, present once the scan ran or a filter was applied.
    pub parts_all: Option<PartitionsStatus>,
}

impl Scan {
    pub fn new(namespace: &str, set: &str) -> Result<Self> {
        if namespace.is_empty() || namespace.len() >= NAMESPACE_MAX_SIZE {
            Err(Error::param(format!("Invalid namespace: {}", namespace)))?
        }
        if set.len() >= SET_MAX_SIZE {
            Err(Error::param(format!("Invalid set: {}", set)))?
        }
        Ok(Self {
            namespace: namespace.to_owned(),
            set: set.to_owned(),
            select: Vec::new(),
            no_bins: false,
            concurrent: false,
            paginate: false,
            priority: Priority::Auto,
            percent: 100,
            ttl: 0,
            max_records: 0,
            records_per_second: 0,
            parts_all: None,
        })
    }

    pub fn select(&mut self, bin: &str) -> Result<()> {
        if bin.is_empty() || bin.len() >= BIN_NAME_MAX_SIZE {
            Err(Error::param(format!("Invalid bin name: {}", bin)))?
        }
        self.select.push(bin.to_owned());
        Ok(())
    }

    pub fn set_percent(&mut self, percent: u8) -> Result<()> {
        if percent == 0 || percent > 100 {
            Err(Error::param(format!("Invalid scan percent {}", percent)))?
        }
        self.percent = percent;
        Ok(())
    }

    /// Restricts the scan to `filter`, replacing any page state.
    pub fn set_partitions(&mut self, filter: &PartitionFilter, n_partitions: u16) -> Result<()> {
        self.parts_all = Some(filter.status(n_partitions)?);
        Ok(())
    }

    /// A paginated scan with every partition done has nothing left.
    pub fn is_done(&self) -> bool {
        self.parts_all.as_ref().is_some_and(|parts| parts.done)
    }

    /// Serializes the scan definition and its page state.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.parts_all.as_ref().map_or(0, |p| p.parts.len() * 31));
        // writes into a Vec don't fail
        let _ = self.write(&mut buf);
        buf
    }

    fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_u8(PAGE_STATE_VERSION)?;
        write_str(w, &self.namespace)?;
        write_str(w, &self.set)?;

        let mut flags = 0;
        if self.no_bins {
            flags |= FLAG_NO_BINS;
        }
        if self.concurrent {
            flags |= FLAG_CONCURRENT;
        }
        if self.paginate {
            flags |= FLAG_PAGINATE;
        }
        if self.parts_all.is_some() {
            flags |= FLAG_PARTS;
        }
        w.write_u8(flags)?;
        w.write_u8(self.priority as u8)?;
        w.write_u8(self.percent)?;
        w.write_u32::<BigEndian>(self.ttl)?;
        w.write_u64::<BigEndian>(self.max_records)?;
        w.write_u32::<BigEndian>(self.records_per_second)?;

        w.write_u16::<BigEndian>(self.select.len() as u16)?;
        for bin in &self.select {
            write_str(w, bin)?;
        }

        if let Some(parts) = &self.parts_all {
            w.write_u16::<BigEndian>(parts.part_begin)?;
            w.write_u16::<BigEndian>(parts.part_count)?;
            w.write_u8(parts.done as u8)?;
            w.write_u16::<BigEndian>(parts.parts.len() as u16)?;
            for part in &parts.parts {
                w.write_u16::<BigEndian>(part.part_id)?;
                let mut flags = 0;
                if part.done {
                    flags |= PART_DONE;
                }
                if part.digest.is_some() {
                    flags |= PART_DIGEST;
                }
                w.write_u8(flags)?;
                if let Some(digest) = &part.digest {
                    w.write_all(digest)?;
                }
                w.write_u64::<BigEndian>(part.bval)?;
            }
        }
        Ok(())
    }

    /// Restores a scan written by [`Scan::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(bytes);
        let scan = Self::read(&mut r).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::param("Scan bytes are truncated"),
            _ => Error::param(format!("Invalid scan bytes: {}", e)),
        })??;
        if r.position() != bytes.len() as u64 {
            Err(Error::param(format!(
                "Scan bytes have {} trailing bytes",
                bytes.len() as u64 - r.position()
            )))?
        }
        Ok(scan)
    }

    /// The outer result carries read failures, the inner one invalid
    /// content.
    fn read(r: &mut Cursor<&[u8]>) -> std::io::Result<Result<Self>> {
        let version = r.read_u8()?;
        if version != PAGE_STATE_VERSION {
            return Ok(Err(Error::param(format!(
                "Unsupported scan bytes version {}",
                version
            ))));
        }
        let namespace = read_str(r)?;
        let set = read_str(r)?;
        let flags = r.read_u8()?;
        let priority = match Priority::try_from(r.read_u8()?) {
            Ok(priority) => priority,
            Err(e) => return Ok(Err(e)),
        };
        let percent = r.read_u8()?;
        let ttl = r.read_u32::<BigEndian>()?;
        let max_records = r.read_u64::<BigEndian>()?;
        let records_per_second = r.read_u32::<BigEndian>()?;

        let n_bins = r.read_u16::<BigEndian>()?;
        let mut select = Vec::with_capacity(n_bins as usize);
        for _ in 0..n_bins {
            select.push(read_str(r)?);
        }

        let parts_all = if flags & FLAG_PARTS != 0 {
            let part_begin = r.read_u16::<BigEndian>()?;
            let part_count = r.read_u16::<BigEndian>()?;
            let done = r.read_u8()? != 0;
            let n_parts = r.read_u16::<BigEndian>()?;
            let mut parts = Vec::with_capacity(n_parts as usize);
            for _ in 0..n_parts {
                let part_id = r.read_u16::<BigEndian>()?;
                let part_flags = r.read_u8()?;
                let digest = if part_flags & PART_DIGEST != 0 {
                    let mut digest = [0u8; DIGEST_SIZE];
                    r.read_exact(&mut digest)?;
                    Some(digest)
                } else {
                    None
                };
                let bval = r.read_u64::<BigEndian>()?;
                parts.push(PartitionStatus {
                    part_id,
                    digest,
                    bval,
                    done: part_flags & PART_DONE != 0,
                });
            }
            Some(PartitionsStatus {
                part_begin,
                part_count,
                done,
                parts,
            })
        } else {
            None
        };

        Ok(Ok(Self {
            namespace,
            set,
            select,
            no_bins: flags & FLAG_NO_BINS != 0,
            concurrent: flags & FLAG_CONCURRENT != 0,
            paginate: flags & FLAG_PAGINATE != 0,
            priority,
            percent,
            ttl,
            max_records,
            records_per_second,
            parts_all,
        }))
    }
}

fn write_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    w.write_u16::<BigEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())
}

fn read_str(r: &mut Cursor<&[u8]>) -> std::io::Result<String> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
