use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use base64::Engine as _;
use hashbrown::HashMap;

use super::node::Node;
use crate::{
    error::{Error, Result},
    wire::key::{partition_id, Digest, NAMESPACE_MAX_SIZE},
};

/// Replica levels tracked per partition: master and first prole.
pub const MAX_REPLICAS: usize = 2;

/// Which copy of a partition a command is sent to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replica {
    /// Always the master.
    Master,
    /// Alternate between master and prole across commands.
    Any,
    /// Master first, prole on retry.
    Sequence,
}

/// Owners of one partition. Slots are swapped by the tender and loaded
/// lock-free by commands.
#[derive(Default)]
pub struct Partition {
    nodes: [ArcSwapOption<Node>; MAX_REPLICAS],
    regime: AtomicU32,
}

/// Partition ownership of one namespace.
pub struct PartitionTable {
    namespace: String,
    partitions: Vec<Partition>,
}

impl std::fmt::Debug for PartitionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionTable")
            .field("namespace", &self.namespace)
            .field("size", &self.partitions.len())
            .finish()
    }
}

pub type PartitionTables = HashMap<String, Arc<PartitionTable>>;

impl PartitionTable {
    pub fn new(namespace: &str, n_partitions: usize) -> Self {
        Self {
            namespace: namespace.to_owned(),
            partitions: (0..n_partitions).map(|_| Partition::default()).collect(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn master(&self, pid: usize) -> Option<Arc<Node>> {
        self.partitions.get(pid).and_then(|p| p.nodes[0].load_full())
    }

    pub fn prole(&self, pid: usize) -> Option<Arc<Node>> {
        self.partitions.get(pid).and_then(|p| p.nodes[1].load_full())
    }

    pub fn regime(&self, pid: usize) -> u32 {
        self.partitions
            .get(pid)
            .map_or(0, |p| p.regime.load(Ordering::Acquire))
    }

    /// True when `node` owns any replica of any partition.
    pub fn contains_node(&self, node: &Arc<Node>) -> bool {
        self.partitions.iter().any(|p| {
            p.nodes.iter().any(|slot| holds(slot, node))
        })
    }

    /// Applies one ownership bit. Taking over a slot forces the previous
    /// holder to reload its map; an update from an older regime is ignored.
    fn update(&self, pid: usize, level: usize, node: &Arc<Node>, owns: bool, regime: u32) {
        let p = &self.partitions[pid];
        let slot = &p.nodes[level];
        let current = slot.load_full();
        let is_current = holds(slot, node);
        if owns {
            let stored = p.regime.load(Ordering::Acquire);
            if regime < stored {
                return;
            }
            if regime > stored {
                p.regime.store(regime, Ordering::Release);
            }
            if !is_current {
                slot.store(Some(node.clone()));
                if let Some(prev) = current {
                    prev.force_partition_refresh();
                }
            }
        } else if is_current {
            slot.store(None);
        }
    }

    /// Chooses the node for `digest`. `use_master` is the caller's
    /// preference under `Replica::Sequence`; `Replica::Any` alternates using
    /// `counter`. Returns `None` when no suitable active owner is known.
    pub fn get_node(
        &self,
        digest: &Digest,
        replica: Replica,
        use_master: bool,
        counter: &AtomicUsize,
    ) -> Option<Arc<Node>> {
        let pid = partition_id(digest, self.partitions.len() as u16) as usize;
        let master = self.master(pid);
        if replica == Replica::Master {
            return active(master);
        }
        let prole = match self.prole(pid) {
            Some(prole) => prole,
            None => return active(master),
        };
        let master = match master {
            Some(master) => master,
            None => return active(Some(prole)),
        };
        let use_master = match replica {
            Replica::Any => counter.fetch_add(1, Ordering::Relaxed) & 1 == 1,
            _ => use_master,
        };
        if use_master {
            active(Some(master)).or_else(|| active(Some(prole)))
        } else {
            active(Some(prole)).or_else(|| active(Some(master)))
        }
    }
}

fn holds(slot: &ArcSwapOption<Node>, node: &Arc<Node>) -> bool {
    match &*slot.load() {
        Some(n) => Arc::ptr_eq(n, node),
        None => false,
    }
}

fn active(node: Option<Arc<Node>>) -> Option<Arc<Node>> {
    node.filter(|n| n.is_active())
}

/// Info command carrying the partition map, by server generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicasFormat {
    /// `replicas-master` (level 0) or `replicas-prole` (level 1):
    /// `ns:bitmap;...`
    Level(usize),
    /// `replicas-all`: `ns:count,bitmap,...;...`
    All,
    /// `replicas`: `ns:regime,count,bitmap,...;...`
    Regime,
}

/// One namespace's decoded ownership bitmaps from a single node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceReplicas {
    pub namespace: String,
    pub regime: u32,
    /// Level of `bitmaps[0]`.
    pub first_level: usize,
    pub bitmaps: Vec<Vec<u8>>,
}

/// Length of a base64 encoded bitmap covering `n_partitions` bits.
pub fn encoded_bitmap_len(n_partitions: usize) -> usize {
    let bytes = (n_partitions + 7) / 8;
    4 * ((bytes + 2) / 3)
}

/// Decodes a whole replicas response. Any invalid namespace rejects the
/// whole response so that a map is never half applied.
pub fn parse_replicas(
    s: &str,
    format: ReplicasFormat,
    n_partitions: usize,
) -> Result<Vec<NamespaceReplicas>> {
    let expected_len = encoded_bitmap_len(n_partitions);
    let mut out = Vec::new();
    for entry in s.split(|c| c == ';' || c == '\n').filter(|e| !e.is_empty()) {
        let (namespace, rest) = entry
            .split_once(':')
            .ok_or_else(|| Error::client(format!("Partition update. Invalid entry {}", entry)))?;
        if namespace.is_empty() || namespace.len() >= NAMESPACE_MAX_SIZE {
            Err(Error::client(format!(
                "Partition update. Invalid partition namespace {}",
                namespace
            )))?
        }
        let decode = |b64: &str| -> Result<Vec<u8>> {
            if b64.len() != expected_len {
                Err(Error::client(format!(
                    "Partition update. unexpected partition map encoded length {} for namespace {}",
                    b64.len(),
                    namespace
                )))?
            }
            Ok(base64::engine::general_purpose::STANDARD.decode(b64)?)
        };
        let number = |s: Option<&str>| -> Result<u32> {
            s.and_then(|s| s.parse().ok()).ok_or_else(|| {
                Error::client(format!("Partition update. Invalid replicas for namespace {}", namespace))
            })
        };

        let (regime, first_level, bitmaps) = match format {
            ReplicasFormat::Level(level) => (0, level, vec![decode(rest)?]),
            ReplicasFormat::All | ReplicasFormat::Regime => {
                let mut parts = rest.split(',');
                let regime = match format {
                    ReplicasFormat::Regime => number(parts.next())?,
                    _ => 0,
                };
                let count = number(parts.next())? as usize;
                let bitmaps = parts.map(decode).collect::<Result<Vec<_>>>()?;
                if bitmaps.len() != count {
                    Err(Error::client(format!(
                        "Partition update. Expected {} replicas for namespace {}, got {}",
                        count,
                        namespace,
                        bitmaps.len()
                    )))?
                }
                (regime, 0, bitmaps)
            }
        };
        out.push(NamespaceReplicas {
            namespace: namespace.to_owned(),
            regime,
            first_level,
            bitmaps,
        });
    }
    Ok(out)
}

/// Applies decoded bitmaps of `node` to existing tables, creating tables for
/// unseen namespaces. Returns the new tables so the caller can publish them
/// in one copy.
pub fn apply_replicas(
    tables: &PartitionTables,
    updates: &[NamespaceReplicas],
    node: &Arc<Node>,
    n_partitions: usize,
) -> Vec<Arc<PartitionTable>> {
    let mut added: Vec<Arc<PartitionTable>> = Vec::new();
    for update in updates {
        let table = match tables.get(&update.namespace) {
            Some(table) => table.clone(),
            None => match added.iter().find(|t| t.namespace == update.namespace) {
                Some(table) => table.clone(),
                None => {
                    let table = Arc::new(PartitionTable::new(&update.namespace, n_partitions));
                    added.push(table.clone());
                    table
                }
            },
        };
        for (i, bitmap) in update.bitmaps.iter().enumerate() {
            let level = update.first_level + i;
            if level >= MAX_REPLICAS {
                break;
            }
            for pid in 0..table.len() {
                let owns = bitmap[pid >> 3] & (0x80 >> (pid & 7)) != 0;
                table.update(pid, level, node, owns, update.regime);
            }
        }
    }
    added
}

/// True when `node` owns a replica in any namespace.
pub fn tables_contain_node(tables: &PartitionTables, node: &Arc<Node>) -> bool {
    tables.values().any(|table| table.contains_node(node))
}
