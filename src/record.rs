use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Sentinel stored in the value-size field to mark a tombstone.
pub(crate) const TOMBSTONE: u32 = u32::MAX;

/// Bytes occupied by the fixed record header: crc + timestamp + key size + value size.
pub(crate) const HEADER_LEN: u64 = 4 + 8 + 2 + 4;

/// Bytes occupied by the fixed hint-entry header: timestamp + key size + value size + value offset.
pub(crate) const HINT_HEADER_LEN: u64 = 8 + 2 + 4 + 8;

/// Largest encodable key, bounded by the 2-byte key-size field.
pub(crate) const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Largest encodable value. One value of the 4-byte size space is reserved
/// for the tombstone sentinel.
pub(crate) const MAX_VALUE_LEN: usize = (u32::MAX - 1) as usize;

/// A single decoded log record. A `None` value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub timestamp: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Record {
    /// Total encoded size of this record on disk.
    pub fn encoded_len(&self) -> u64 {
        encoded_len(self.key.len(), self.value.as_ref().map_or(0, Vec::len))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&self.key, self.value.as_deref(), self.timestamp)
    }
}

pub(crate) fn encoded_len(key_len: usize, value_len: usize) -> u64 {
    HEADER_LEN + key_len as u64 + value_len as u64
}

// Encode a key/value pair in the on-disk record format.
// Fixed-width header                  Variable-length body
//+=====+=====+=====+====== - - - - - +============== - - +
//| u32 | u64 | u16 | u32             | [u8] | [u8] |
//+=====+=====+=====+====== - - - - - +============== - - +
// crc (4 bytes, over all following fields)
// timestamp (8 bytes)
// key_size (2 bytes)
// value_size (4 bytes, 0xFFFFFFFF for tombstones)
// key (key_size bytes)
// value (value_size bytes, absent for tombstones)
pub(crate) fn encode(key: &[u8], value: Option<&[u8]>, timestamp: u64) -> Result<Vec<u8>> {
    let value_len = value.map_or(0, <[u8]>::len);
    let mut body = Vec::<u8>::with_capacity(HEADER_LEN as usize - 4 + key.len() + value_len);

    body.write_u64::<BigEndian>(timestamp)?;
    body.write_u16::<BigEndian>(key.len() as u16)?;
    body.write_u32::<BigEndian>(value.map_or(TOMBSTONE, |v| v.len() as u32))?;
    body.write_all(key)?;
    if let Some(value) = value {
        body.write_all(value)?;
    }

    let mut bytes = Vec::<u8>::with_capacity(4 + body.len());
    bytes.write_u32::<BigEndian>(CRC32.checksum(&body))?;
    bytes.write_all(&body)?;
    Ok(bytes)
}

/// Read and verify the next record from `reader`, where `remaining` bounds
/// the bytes left before end-of-file. Returns the record and its total
/// encoded size. Any failure, a short read included, means the bytes at the
/// reader's position do not form a complete record.
pub(crate) fn read_from<R: Read>(reader: &mut R, remaining: u64) -> Result<(Record, u64)> {
    let crc = reader.read_u32::<BigEndian>()?;
    let timestamp = reader.read_u64::<BigEndian>()?;
    let key_len = reader.read_u16::<BigEndian>()?;
    let value_size = reader.read_u32::<BigEndian>()?;

    if key_len == 0 {
        return Err(Error::Corruption("record with zero-length key".to_owned()));
    }
    let value_len = if value_size == TOMBSTONE { 0 } else { value_size as u64 };
    if encoded_len(key_len as usize, 0) + value_len > remaining {
        return Err(Error::Corruption("record extends beyond end of file".to_owned()));
    }

    let mut key = vec![0; key_len as usize];
    reader.read_exact(&mut key)?;

    let value = if value_size == TOMBSTONE {
        None
    } else {
        let mut value = vec![0; value_size as usize];
        reader.read_exact(&mut value)?;
        Some(value)
    };

    let mut body =
        Vec::<u8>::with_capacity(HEADER_LEN as usize - 4 + key.len() + value.as_ref().map_or(0, Vec::len));
    body.write_u64::<BigEndian>(timestamp)?;
    body.write_u16::<BigEndian>(key_len)?;
    body.write_u32::<BigEndian>(value_size)?;
    body.write_all(&key)?;
    if let Some(value) = &value {
        body.write_all(value)?;
    }

    let computed = CRC32.checksum(&body);
    if crc != computed {
        return Err(Error::Corruption(format!(
            "record checksum mismatch, stored {:08x}, computed {:08x}",
            crc, computed
        )));
    }

    let record = Record { timestamp, key, value };
    let len = record.encoded_len();
    Ok((record, len))
}

/// A hint-file entry pointing at one live record in the paired segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HintEntry {
    pub timestamp: u64,
    pub value_size: u32,
    pub value_offset: u64,
    pub key: Vec<u8>,
}

impl HintEntry {
    // Hint-entry layout, big-endian:
    //+=====+=====+=====+=====+======== - - +
    //| u64 | u16 | u32 | u64 | [u8] |
    //+=====+=====+=====+=====+======== - - +
    // timestamp (8 bytes)
    // key_size (2 bytes)
    // value_size (4 bytes)
    // value_offset (8 bytes)
    // key (key_size bytes)
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.timestamp)?;
        writer.write_u16::<BigEndian>(self.key.len() as u16)?;
        writer.write_u32::<BigEndian>(self.value_size)?;
        writer.write_u64::<BigEndian>(self.value_offset)?;
        writer.write_all(&self.key)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let timestamp = reader.read_u64::<BigEndian>()?;
        let key_len = reader.read_u16::<BigEndian>()?;
        let value_size = reader.read_u32::<BigEndian>()?;
        let value_offset = reader.read_u64::<BigEndian>()?;

        if key_len == 0 || value_size == TOMBSTONE {
            return Err(Error::Corruption("malformed hint entry".to_owned()));
        }

        let mut key = vec![0; key_len as usize];
        reader.read_exact(&mut key)?;

        Ok(HintEntry { timestamp, value_size, value_offset, key })
    }

    pub fn encoded_len(&self) -> u64 {
        HINT_HEADER_LEN + self.key.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_value() -> Result<()> {
        let bytes = encode(b"key1", Some(b"value1"), 42)?;
        assert_eq!(bytes.len() as u64, encoded_len(4, 6));

        let (record, len) = read_from(&mut bytes.as_slice(), bytes.len() as u64)?;
        assert_eq!(len, bytes.len() as u64);
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.key, b"key1");
        assert_eq!(record.value.as_deref(), Some(b"value1".as_slice()));
        Ok(())
    }

    #[test]
    fn roundtrip_tombstone() -> Result<()> {
        let bytes = encode(b"key1", None, 7)?;
        assert_eq!(bytes.len() as u64, HEADER_LEN + 4);

        let (record, _) = read_from(&mut bytes.as_slice(), bytes.len() as u64)?;
        assert_eq!(record.value, None);
        Ok(())
    }

    #[test]
    fn empty_value_is_not_a_tombstone() -> Result<()> {
        let bytes = encode(b"key1", Some(b""), 7)?;
        let (record, _) = read_from(&mut bytes.as_slice(), bytes.len() as u64)?;
        assert_eq!(record.value.as_deref(), Some(b"".as_slice()));
        Ok(())
    }

    #[test]
    fn flipped_bit_fails_checksum() -> Result<()> {
        let mut bytes = encode(b"key1", Some(b"value1"), 42)?;
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;

        assert!(matches!(read_from(&mut bytes.as_slice(), bytes.len() as u64), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn short_read_is_an_error() {
        let bytes = encode(b"key1", Some(b"value1"), 42).unwrap();
        assert!(read_from(&mut bytes[..bytes.len() - 1].as_ref(), bytes.len() as u64 - 1).is_err());
    }

    #[test]
    fn hint_roundtrip() -> Result<()> {
        let entry = HintEntry {
            timestamp: 99,
            value_size: 6,
            value_offset: 1234,
            key: b"key1".to_vec(),
        };
        let mut bytes = Vec::new();
        entry.write_to(&mut bytes)?;
        assert_eq!(bytes.len() as u64, entry.encoded_len());

        let decoded = HintEntry::read_from(&mut bytes.as_slice())?;
        assert_eq!(decoded, entry);
        Ok(())
    }
}
