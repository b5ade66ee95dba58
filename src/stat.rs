//! Stat records: the metadata blob of `Rstat`/`Twstat` and directory reads.

use core::fmt;

use crate::error::{DecodeError, EncodeError};
use crate::message::{Message, read_qid, read_str, read_u16, read_u32, read_u64};
use crate::protocol::{Perm, Qid, QidType};

/// Fixed part of a stat record after its own size field.
///
/// type[2] dev[4] qid[13] mode[4] atime[4] mtime[4] length[8] and four
/// empty string length prefixes.
const STAT_FIXED: usize = 2 + 4 + 13 + 4 + 4 + 4 + 8 + 4 * 2;

/// Directory entry metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dir {
    pub type_: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: Perm,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Dir {
    /// A record whose every field means "leave unchanged" in a `Twstat`.
    pub fn dont_touch() -> Self {
        Self {
            type_: u16::MAX,
            dev: u32::MAX,
            qid: Qid::new(u64::MAX, u32::MAX, QidType::from_bits_retain(u8::MAX)),
            mode: Perm::from_bits_retain(u32::MAX),
            atime: u32::MAX,
            mtime: u32::MAX,
            length: u64::MAX,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode.contains(Perm::DIR)
    }

    /// Encode as size[2] followed by the record.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let strings = [
            ("name", &self.name),
            ("uid", &self.uid),
            ("gid", &self.gid),
            ("muid", &self.muid),
        ];
        let mut size = STAT_FIXED;
        for (field, value) in strings {
            if value.len() > u16::MAX as usize {
                return Err(EncodeError::StatTooLarge {
                    field,
                    len: value.len(),
                });
            }
            size += value.len();
        }
        let size = u16::try_from(size).map_err(|_| EncodeError::StatTooLarge {
            field: "stat",
            len: size,
        })?;

        let mut msg = Message::raw();
        msg.push_u16(size);
        msg.push_u16(self.type_);
        msg.push_u32(self.dev);
        msg.push_qid(&self.qid);
        msg.push_u32(self.mode.bits());
        msg.push_u32(self.atime);
        msg.push_u32(self.mtime);
        msg.push_u64(self.length);
        for (_, value) in strings {
            msg.push_str(value);
        }
        debug_assert_eq!(msg.len(), size as usize + 2);
        Ok(msg.into_inner())
    }

    /// Decode exactly one record.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut offset = 0;
        let dir = Self::decode_at(buf, &mut offset)?;
        if offset != buf.len() {
            return Err(DecodeError::TrailingBytes(buf.len() - offset));
        }
        Ok(dir)
    }

    fn decode_at(buf: &[u8], offset: &mut usize) -> Result<Self, DecodeError> {
        let size = read_u16(buf, offset)? as usize;
        if size < STAT_FIXED || buf.len() - *offset < size {
            return Err(DecodeError::Malformed("stat record size"));
        }
        let record = &buf[*offset..*offset + size];
        *offset += size;

        let mut pos = 0usize;
        let dir = Self {
            type_: read_u16(record, &mut pos)?,
            dev: read_u32(record, &mut pos)?,
            qid: read_qid(record, &mut pos)?,
            mode: Perm::from_bits_retain(read_u32(record, &mut pos)?),
            atime: read_u32(record, &mut pos)?,
            mtime: read_u32(record, &mut pos)?,
            length: read_u64(record, &mut pos)?,
            name: read_str(record, &mut pos)?,
            uid: read_str(record, &mut pos)?,
            gid: read_str(record, &mut pos)?,
            muid: read_str(record, &mut pos)?,
        };
        if pos != record.len() {
            return Err(DecodeError::Malformed("stat record has trailing bytes"));
        }
        Ok(dir)
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' '{}' '{}' '{}' q {} m {} at {} mt {} l {} t {} d {}",
            self.name,
            self.uid,
            self.gid,
            self.muid,
            self.qid,
            self.mode,
            self.atime,
            self.mtime,
            self.length,
            self.type_,
            self.dev
        )
    }
}

/// Parse the concatenated stat records returned by a directory read.
pub fn read_dir_entries(data: &[u8]) -> Result<Vec<Dir>, DecodeError> {
    let mut offset = 0usize;
    let mut entries = Vec::new();
    while offset < data.len() {
        entries.push(Dir::decode_at(data, &mut offset)?);
    }
    Ok(entries)
}

/// Answer a directory read from a full listing.
///
/// Returns the whole records starting at byte `offset` of the packed listing
/// that fit in `count` bytes. An empty result means the listing is exhausted,
/// so a record too large for `count` on its own is an error.
pub fn pack_dir_entries(entries: &[Dir], offset: u64, count: u32) -> Result<Vec<u8>, EncodeError> {
    let mut pos = 0u64;
    let mut out = Vec::new();
    for dir in entries {
        let record = dir.encode()?;
        let start = pos;
        pos += record.len() as u64;
        if start < offset {
            continue;
        }
        if out.len() + record.len() > count as usize {
            if out.is_empty() {
                return Err(EncodeError::DirEntryTooLarge {
                    len: record.len(),
                    count,
                });
            }
            break;
        }
        out.extend_from_slice(&record);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dir {
        Dir {
            qid: Qid::new(42, 3, QidType::FILE),
            mode: Perm::from_bits_retain(0o644),
            atime: 1_700_000_000,
            mtime: 1_700_000_100,
            length: 11,
            name: "dummy".into(),
            uid: "glenda".into(),
            gid: "sys".into(),
            ..Default::default()
        }
    }

    #[test]
    fn record_layout() {
        let bytes = sample().encode().unwrap();
        let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        assert_eq!(size + 2, bytes.len());
        assert_eq!(size, STAT_FIXED + "dummy".len() + "glenda".len() + "sys".len());
        // qid type, version, path after type[2] dev[4]
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[9..13], &3u32.to_le_bytes());
        assert_eq!(&bytes[13..21], &42u64.to_le_bytes());
        assert_eq!(Dir::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn directory_listing() {
        let mut listing = sample().encode().unwrap();
        let mut other = sample();
        other.name = "sub".into();
        other.mode = Perm::DIR | Perm::from_bits_retain(0o755);
        other.qid = Qid::new(43, 0, QidType::DIR);
        listing.extend(other.encode().unwrap());

        let entries = read_dir_entries(&listing).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "dummy");
        assert!(entries[1].is_dir());
        assert!(entries[1].qid.is_dir());
    }

    #[test]
    fn packing_respects_offset_and_count() {
        let mut second = sample();
        second.name = "other".into();
        let entries = vec![sample(), second];
        let first_len = sample().encode().unwrap().len();

        let all = pack_dir_entries(&entries, 0, 8192).unwrap();
        assert_eq!(read_dir_entries(&all).unwrap(), entries);

        let one = pack_dir_entries(&entries, 0, first_len as u32).unwrap();
        assert_eq!(one.len(), first_len);

        let rest = pack_dir_entries(&entries, first_len as u64, 8192).unwrap();
        assert_eq!(read_dir_entries(&rest).unwrap()[0].name, "other");
        assert!(pack_dir_entries(&entries, all.len() as u64, 8192).unwrap().is_empty());
    }

    #[test]
    fn record_larger_than_count_is_an_error() {
        let entries = vec![sample()];
        let len = sample().encode().unwrap().len();
        assert_eq!(
            pack_dir_entries(&entries, 0, len as u32 - 1),
            Err(EncodeError::DirEntryTooLarge {
                len,
                count: len as u32 - 1
            })
        );
        // past the end is still an ordinary empty read
        assert!(pack_dir_entries(&entries, len as u64, 1).unwrap().is_empty());
    }

    #[test]
    fn truncated_record() {
        let bytes = sample().encode().unwrap();
        assert!(matches!(
            Dir::decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Malformed(_))
        ));
        assert!(read_dir_entries(&bytes[..5]).is_err());
    }

    #[test]
    fn dont_touch_survives_the_wire() {
        let dir = Dir::dont_touch();
        let decoded = Dir::decode(&dir.encode().unwrap()).unwrap();
        assert_eq!(decoded, dir);
        assert_eq!(decoded.length, u64::MAX);
    }
}
