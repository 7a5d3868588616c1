//! List operation payloads for the transaction monitor record, packed with
//! `rmp`.

use rmp::encode;

use super::proto::ParticleType;
use crate::error::Result;

pub mod list {
    pub const APPEND: i64 = 1;
    pub const APPEND_ITEMS: i64 = 2;

    pub const ORDERED: i64 = 1;

    pub const ADD_UNIQUE: i64 = 1;
    pub const NO_FAIL: i64 = 4;
    pub const PARTIAL: i64 = 8;
}

const UNIQUE_FLAGS: i64 = list::ADD_UNIQUE | list::NO_FAIL | list::PARTIAL;

/// Blobs travel under a str header with a leading particle type byte.
fn write_blob(buf: &mut Vec<u8>, b: &[u8]) -> Result<()> {
    encode::write_str_len(buf, b.len() as u32 + 1)?;
    buf.push(ParticleType::Blob as u8);
    buf.extend_from_slice(b);
    Ok(())
}

fn write_order_and_flags(buf: &mut Vec<u8>) -> Result<()> {
    encode::write_sint(buf, list::ORDERED)?;
    encode::write_sint(buf, UNIQUE_FLAGS)?;
    Ok(())
}

/// `[APPEND_ITEMS, [blob...], order, flags]` with ordered, unique, no-fail,
/// partial semantics.
pub fn list_append_unique_blobs(items: &[&[u8]]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + items.len() * 24);
    encode::write_array_len(&mut buf, 4)?;
    encode::write_sint(&mut buf, list::APPEND_ITEMS)?;
    encode::write_array_len(&mut buf, items.len() as u32)?;
    for item in items {
        write_blob(&mut buf, item)?;
    }
    write_order_and_flags(&mut buf)?;
    Ok(buf)
}

/// `[APPEND, blob, order, flags]`, the single item form.
pub fn list_append_unique_blob(item: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + item.len());
    encode::write_array_len(&mut buf, 4)?;
    encode::write_sint(&mut buf, list::APPEND)?;
    write_blob(&mut buf, item)?;
    write_order_and_flags(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_append_layout() {
        let digest = [7u8; 20];
        let bytes = list_append_unique_blob(&digest).unwrap();
        assert_eq!(&bytes[..3], &[0x94, 0x01, 0xa0 | 21]);
        assert_eq!(bytes[3], ParticleType::Blob as u8);
        assert_eq!(&bytes[4..24], &digest);
        assert_eq!(&bytes[24..], &[0x01, 13]);
    }

    #[test]
    fn batch_append_wraps_items_in_a_list() {
        let a = [1u8; 20];
        let b = [2u8; 20];
        let bytes = list_append_unique_blobs(&[&a, &b]).unwrap();
        assert_eq!(&bytes[..3], &[0x94, 0x02, 0x92]);
        // two blobs of header + type byte + digest
        assert_eq!(bytes.len(), 3 + 2 * 22 + 2);
        assert_eq!(bytes[3 + 22], 0xa0 | 21);
        assert_eq!(bytes[3 + 22 + 2], 2);
    }
}
