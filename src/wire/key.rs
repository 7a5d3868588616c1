use std::fmt;

use ripemd::{Digest as _, Ripemd160};

use super::proto::{FieldType, MessageBuilder, ParticleType};
use crate::{
    error::{Error, Result},
    net::hex::ToHex,
};

pub const DIGEST_SIZE: usize = 20;
pub const NAMESPACE_MAX_SIZE: usize = 32;
pub const SET_MAX_SIZE: usize = 64;
/// Bin names are at most 15 bytes.
pub const BIN_NAME_MAX_SIZE: usize = 16;

/// RIPEMD-160 of the set name followed by the typed user key.
pub type Digest = [u8; DIGEST_SIZE];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UserKey {
    Int(i64),
    Str(String),
    Blob(Vec<u8>),
}

impl UserKey {
    fn particle(&self) -> ParticleType {
        match self {
            UserKey::Int(_) => ParticleType::Integer,
            UserKey::Str(_) => ParticleType::String,
            UserKey::Blob(_) => ParticleType::Blob,
        }
    }

    fn value_bytes(&self) -> Vec<u8> {
        match self {
            UserKey::Int(v) => v.to_be_bytes().to_vec(),
            UserKey::Str(s) => s.as_bytes().to_vec(),
            UserKey::Blob(b) => b.clone(),
        }
    }
}

/// Record address. The digest is computed once at construction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub namespace: String,
    pub set: String,
    pub user_key: Option<UserKey>,
    pub digest: Digest,
}

impl Key {
    pub fn new(namespace: &str, set: &str, user_key: UserKey) -> Result<Self> {
        check_names(namespace, set)?;
        let mut hasher = Ripemd160::new();
        hasher.update(set.as_bytes());
        hasher.update([user_key.particle() as u8]);
        hasher.update(user_key.value_bytes());
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&hasher.finalize());
        Ok(Self {
            namespace: namespace.to_owned(),
            set: set.to_owned(),
            user_key: Some(user_key),
            digest,
        })
    }

    pub fn from_digest(namespace: &str, set: &str, digest: Digest) -> Result<Self> {
        check_names(namespace, set)?;
        Ok(Self {
            namespace: namespace.to_owned(),
            set: set.to_owned(),
            user_key: None,
            digest,
        })
    }

    /// Adds the namespace, set and digest fields that address this record.
    pub fn write_fields(&self, builder: MessageBuilder) -> MessageBuilder {
        let builder = builder.field(FieldType::Namespace, self.namespace.as_bytes());
        let builder = if self.set.is_empty() {
            builder
        } else {
            builder.field(FieldType::SetName, self.set.as_bytes())
        };
        builder.field(FieldType::Digest, &self.digest)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.set, self.digest.hex())
    }
}

fn check_names(namespace: &str, set: &str) -> Result<()> {
    if namespace.is_empty() || namespace.len() >= NAMESPACE_MAX_SIZE {
        Err(Error::param(format!("Invalid namespace '{}'", namespace)))?
    }
    if set.len() >= SET_MAX_SIZE {
        Err(Error::param(format!("Invalid set '{}'", set)))?
    }
    Ok(())
}

/// Partition that owns a digest.
pub fn partition_id(digest: &Digest, n_partitions: u16) -> u16 {
    let id = u16::from_le_bytes([digest[0], digest[1]]);
    if n_partitions == 0 {
        0
    } else {
        id % n_partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_covers_set_and_key_type() {
        let a = Key::new("test", "demo", UserKey::Int(1)).unwrap();
        let b = Key::new("test", "demo", UserKey::Str("1".into())).unwrap();
        let c = Key::new("test", "other", UserKey::Int(1)).unwrap();
        let d = Key::new("other", "demo", UserKey::Int(1)).unwrap();
        assert_ne!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        // namespace is not hashed
        assert_eq!(a.digest, d.digest);
    }

    #[test]
    fn names_are_bounded() {
        assert!(Key::new("", "s", UserKey::Int(1)).is_err());
        assert!(Key::new(&"n".repeat(32), "s", UserKey::Int(1)).is_err());
        assert!(Key::new("n", &"s".repeat(64), UserKey::Int(1)).is_err());
    }

    #[test]
    fn partition_ids_use_the_low_digest_bytes() {
        let mut digest = [0u8; DIGEST_SIZE];
        digest[0] = 0x34;
        digest[1] = 0x12;
        assert_eq!(partition_id(&digest, 4096), 0x1234 % 4096);
    }
}
