//! Module implement serialized keys and mutation buffers.
//!
//! A mutation buffer is a sequence of `[key][value]` pairs. Serialized key
//! layout:
//!
//! ```text
//! vint(len) control row \0 family qualifier \0 flag [timestamp] [revision]
//! ```
//!
//! Timestamp and revision are little-endian i64, present as per the control
//! byte. Value layout is `vint(len) bytes`.

use cbordata::Cborize;

use std::{cmp, convert::TryFrom, fmt};

use crate::{clock::REVISION_NULL, util, Error, Result};

/// Key carries a revision.
pub const HAVE_REVISION: u8 = 0x80;
/// Key carries a client supplied timestamp.
pub const HAVE_TIMESTAMP: u8 = 0x40;
/// Timestamp to be assigned by the server.
pub const AUTO_TIMESTAMP: u8 = 0x20;
/// Revision doubles as the timestamp.
pub const REV_IS_TS: u8 = 0x10;

const CELLKEY_VER: u32 = 0x00010001;
const CELL_VER: u32 = 0x00020001;

/// Mutation type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    DeleteRow = 0,
    DeleteColumnFamily = 1,
    DeleteCell = 2,
    DeleteCellVersion = 3,
    Insert = 255,
}

impl TryFrom<u8> for Flag {
    type Error = Error;

    fn try_from(val: u8) -> Result<Flag> {
        match val {
            0 => Ok(Flag::DeleteRow),
            1 => Ok(Flag::DeleteColumnFamily),
            2 => Ok(Flag::DeleteCell),
            3 => Ok(Flag::DeleteCellVersion),
            255 => Ok(Flag::Insert),
            _ => err_at!(DecodeFail, msg: "invalid key flag {}", val),
        }
    }
}

impl Flag {
    pub fn is_delete(&self) -> bool {
        !matches!(self, Flag::Insert)
    }
}

/// Decoded key of a single mutation.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub row: Vec<u8>,
    pub family: u8,
    pub qualifier: Vec<u8>,
    pub flag: Flag,
    /// None, timestamp shall be assigned by the server.
    pub timestamp: Option<i64>,
    /// None, revision shall be assigned by the server.
    pub revision: Option<i64>,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Key<{}:{}:{} {:?} ts:{:?} rev:{:?}>",
            String::from_utf8_lossy(&self.row),
            self.family,
            String::from_utf8_lossy(&self.qualifier),
            self.flag,
            self.timestamp,
            self.revision,
        )
    }
}

impl Key {
    pub fn insert(row: &[u8], family: u8, qualifier: &[u8]) -> Key {
        Key {
            row: row.to_vec(),
            family,
            qualifier: qualifier.to_vec(),
            flag: Flag::Insert,
            timestamp: None,
            revision: None,
        }
    }

    pub fn delete_row(row: &[u8]) -> Key {
        Key {
            row: row.to_vec(),
            family: 0,
            qualifier: vec![],
            flag: Flag::DeleteRow,
            timestamp: None,
            revision: None,
        }
    }

    pub fn delete(row: &[u8], family: u8, qualifier: &[u8], flag: Flag) -> Key {
        Key {
            row: row.to_vec(),
            family,
            qualifier: qualifier.to_vec(),
            flag,
            timestamp: None,
            revision: None,
        }
    }

    pub fn set_timestamp(&mut self, timestamp: i64) -> &mut Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn set_revision(&mut self, revision: i64) -> &mut Self {
        self.revision = Some(revision);
        self
    }

    pub fn to_control(&self) -> u8 {
        match (self.timestamp, self.revision) {
            (None, None) => AUTO_TIMESTAMP,
            (Some(_), None) => HAVE_TIMESTAMP,
            (None, Some(_)) => HAVE_REVISION | REV_IS_TS,
            (Some(_), Some(_)) => HAVE_TIMESTAMP | HAVE_REVISION,
        }
    }

    /// Return the effective timestamp, revision when timestamp is automatic.
    pub fn to_timestamp(&self) -> i64 {
        self.timestamp.or(self.revision).unwrap_or(REVISION_NULL)
    }

    pub fn to_revision(&self) -> i64 {
        self.revision.unwrap_or(REVISION_NULL)
    }

    /// Serialize key, prefixed with its length, into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize> {
        if self.row.contains(&0) || self.qualifier.contains(&0) {
            err_at!(InvalidInput, msg: "NUL byte in row or qualifier {:?}", self)?
        }

        let control = self.to_control();
        let mut body = Vec::with_capacity(self.row.len() + self.qualifier.len() + 21);
        body.push(control);
        body.extend_from_slice(&self.row);
        body.push(0);
        body.push(self.family);
        body.extend_from_slice(&self.qualifier);
        body.push(0);
        body.push(self.flag as u8);
        if let (true, Some(ts)) = (control & HAVE_TIMESTAMP != 0, self.timestamp) {
            util::encode_i64(&mut body, ts);
        }
        if let (true, Some(rev)) = (control & HAVE_REVISION != 0, self.revision) {
            util::encode_i64(&mut body, rev);
        }

        let n = buf.len();
        util::encode_bytes(buf, &body)?;
        Ok(buf.len() - n)
    }

    /// Decode a length prefixed key from `buf`, advancing `buf`.
    pub fn decode(buf: &mut &[u8]) -> Result<Key> {
        let mut body = util::decode_bytes(buf)?;

        let control = util::decode_u8(&mut body)?;
        let row = take_until_nul(&mut body, "row")?;
        let family = util::decode_u8(&mut body)?;
        let qualifier = take_until_nul(&mut body, "qualifier")?;
        let flag = Flag::try_from(util::decode_u8(&mut body)?)?;

        let (timestamp, revision) = if control & REV_IS_TS != 0 {
            (None, Some(util::decode_i64(&mut body)?))
        } else {
            let ts = match control & HAVE_TIMESTAMP {
                0 => None,
                _ => Some(util::decode_i64(&mut body)?),
            };
            let rev = match control & HAVE_REVISION {
                0 => None,
                _ => Some(util::decode_i64(&mut body)?),
            };
            (ts, rev)
        };

        if !body.is_empty() {
            err_at!(DecodeFail, msg: "{} trailing bytes in key", body.len())?
        }

        Ok(Key {
            row,
            family,
            qualifier,
            flag,
            timestamp,
            revision,
        })
    }
}

/// Stamp `revision` on a key that lacks one, return true if stamped.
/// Keys with automatic timestamp shall use the revision as timestamp,
/// that is, they are encoded with `REV_IS_TS`.
pub fn stamp_revision(key: &mut Key, revision: i64) -> bool {
    match key.revision {
        Some(_) => false,
        None => {
            key.revision = Some(revision);
            true
        }
    }
}

fn take_until_nul(buf: &mut &[u8], what: &str) -> Result<Vec<u8>> {
    match buf.iter().position(|b| *b == 0) {
        Some(n) => {
            let val = buf[..n].to_vec();
            *buf = &buf[(n + 1)..];
            Ok(val)
        }
        None => err_at!(DecodeFail, msg: "unterminated {}", what),
    }
}

/// Append a key, value pair into mutation buffer `buf`.
pub fn encode_mutation(buf: &mut Vec<u8>, key: &Key, value: &[u8]) -> Result<usize> {
    let n = key.encode(buf)?;
    let m = buf.len();
    util::encode_bytes(buf, value)?;
    Ok(n + (buf.len() - m))
}

/// Mutation decoded from a buffer, along with its position in the buffer.
#[derive(Clone, Debug)]
pub struct Mutation<'a> {
    /// byte offset of this mutation within the buffer.
    pub offset: usize,
    /// length of serialized key and value.
    pub length: usize,
    pub key: Key,
    pub value: &'a [u8],
}

/// Iterate over the mutations in a serialized buffer. On the first
/// malformed mutation, iterator returns the error and stops.
pub struct Mutations<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Mutations<'a> {
    pub fn new(buf: &'a [u8]) -> Mutations<'a> {
        Mutations { buf, offset: 0 }
    }
}

impl<'a> Iterator for Mutations<'a> {
    type Item = Result<Mutation<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.len() {
            return None;
        }

        let buf: &'a [u8] = self.buf;
        let mut rd: &'a [u8] = &buf[self.offset..];
        let start = rd.len();
        let res = Key::decode(&mut rd).and_then(|key| {
            let value = util::decode_bytes(&mut rd)?;
            Ok((key, value))
        });
        match res {
            Ok((key, value)) => {
                let length = start - rd.len();
                let offset = self.offset;
                self.offset += length;
                Some(Ok(Mutation {
                    offset,
                    length,
                    key,
                    value,
                }))
            }
            Err(err) => {
                self.offset = self.buf.len();
                Some(Err(err))
            }
        }
    }
}

/// Validate mutation buffer, and return the number of mutations in it.
pub fn count_mutations(buf: &[u8]) -> Result<usize> {
    let mut n = 0;
    for item in Mutations::new(buf) {
        item?;
        n += 1;
    }
    Ok(n)
}

/// Resolved key, as stored in range and cell stores. Sort order is row,
/// column-family, qualifier ascending and then timestamp, revision
/// descending, so that newer versions are seen first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Cborize)]
pub struct CellKey {
    pub row: Vec<u8>,
    pub family: u32,
    pub qualifier: Vec<u8>,
    pub timestamp: i64,
    pub revision: i64,
    pub flag: u32,
}

impl CellKey {
    const ID: u32 = CELLKEY_VER;

    pub fn to_flag(&self) -> Result<Flag> {
        Flag::try_from(err_at!(FailConvert, u8::try_from(self.flag))?)
    }

    pub fn is_delete(&self) -> bool {
        self.flag != Flag::Insert as u32
    }
}

impl From<&Key> for CellKey {
    fn from(key: &Key) -> CellKey {
        CellKey {
            row: key.row.clone(),
            family: key.family as u32,
            qualifier: key.qualifier.clone(),
            timestamp: key.to_timestamp(),
            revision: key.to_revision(),
            flag: key.flag as u32,
        }
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &CellKey) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &CellKey) -> cmp::Ordering {
        self.row
            .cmp(&other.row)
            .then(self.family.cmp(&other.family))
            .then(self.qualifier.cmp(&other.qualifier))
            .then(other.timestamp.cmp(&self.timestamp))
            .then(other.revision.cmp(&self.revision))
            .then(self.flag.cmp(&other.flag))
    }
}

/// A cell is a resolved key along with its value.
#[derive(Clone, Debug, PartialEq, Eq, Cborize)]
pub struct Cell {
    pub key: CellKey,
    pub value: Vec<u8>,
}

impl Cell {
    const ID: u32 = CELL_VER;

    pub fn new(key: CellKey, value: Vec<u8>) -> Cell {
        Cell { key, value }
    }

    /// Approximate memory footprint of this cell.
    pub fn footprint(&self) -> usize {
        self.key.row.len() + self.key.qualifier.len() + self.value.len() + 32
    }
}

#[cfg(test)]
#[path = "key_test.rs"]
mod key_test;
