use crc::{Crc, CRC_32_ISCSI};

use std::convert::TryFrom;

use crate::{
    commit_log::{MAGIC_DATA, MAGIC_LINK},
    compress::{create_block_codec, BlockCodec, CompressionType},
    util, Result,
};

/// Current block header version.
pub const BLOCK_HEADER_VERSION: u8 = 1;
/// Header length for version 0.
pub const HEADER_LENGTH_V0: usize = 28;
/// Header length for version 1, adds revision and cluster-id.
pub const HEADER_LENGTH_V1: usize = 44;

// magic, checksum, version, header-length.
const PEEK_LENGTH: usize = 14;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub(crate) fn checksum32(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

fn checksum16(data: &[u8]) -> u16 {
    let val = checksum32(data);
    ((val >> 16) as u16) ^ ((val & 0xFFFF) as u16)
}

/// Block header, little-endian layout:
///
/// ```text
/// magic:10 hdr-checksum:2 version:1 header-length:1 compression:1 flags:1
/// data-checksum:4 data-length:4 data-zlength:4 [revision:8 cluster-id:8]
/// ```
///
/// Header checksum is computed over the bytes following the checksum
/// field. Data checksum is computed over the uncompressed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockHeader {
    pub magic: [u8; 10],
    pub version: u8,
    pub compression: CompressionType,
    pub flags: u8,
    pub data_checksum: u32,
    pub data_length: u32,
    pub data_zlength: u32,
    pub revision: i64,
    pub cluster_id: u64,
}

impl BlockHeader {
    pub fn new(magic: &[u8; 10], revision: i64, cluster_id: u64) -> BlockHeader {
        BlockHeader {
            magic: *magic,
            version: BLOCK_HEADER_VERSION,
            compression: CompressionType::None,
            flags: 0,
            data_checksum: 0,
            data_length: 0,
            data_zlength: 0,
            revision,
            cluster_id,
        }
    }

    pub fn encoded_length(&self) -> usize {
        match self.version {
            0 => HEADER_LENGTH_V0,
            _ => HEADER_LENGTH_V1,
        }
    }

    pub fn is_link(&self) -> bool {
        &self.magic == MAGIC_LINK
    }

    pub fn is_data(&self) -> bool {
        &self.magic == MAGIC_DATA
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(HEADER_LENGTH_V1);
        util::encode_u8(&mut body, self.version);
        util::encode_u8(&mut body, self.encoded_length() as u8);
        util::encode_u8(&mut body, self.compression as u8);
        util::encode_u8(&mut body, self.flags);
        util::encode_u32(&mut body, self.data_checksum);
        util::encode_u32(&mut body, self.data_length);
        util::encode_u32(&mut body, self.data_zlength);
        if self.version >= 1 {
            util::encode_i64(&mut body, self.revision);
            util::encode_u64(&mut body, self.cluster_id);
        }

        buf.extend_from_slice(&self.magic);
        util::encode_u16(buf, checksum16(&body));
        buf.extend_from_slice(&body);
    }

    /// Return the header length, from the leading bytes of a header.
    pub fn peek_length(buf: &[u8]) -> Result<usize> {
        if buf.len() < PEEK_LENGTH {
            err_at!(Truncated, msg: "block header {}/{}", buf.len(), PEEK_LENGTH)?
        }
        let n = buf[PEEK_LENGTH - 1] as usize;
        match n {
            HEADER_LENGTH_V0 | HEADER_LENGTH_V1 => Ok(n),
            n => err_at!(BadHeader, msg: "header length {}", n),
        }
    }

    /// Decode header from `buf`, validating magic, header length, header
    /// checksum and compression type.
    pub fn decode(buf: &[u8]) -> Result<BlockHeader> {
        let n = Self::peek_length(buf)?;
        if buf.len() < n {
            err_at!(Truncated, msg: "block header {}/{}", buf.len(), n)?
        }

        let mut magic = [0_u8; 10];
        magic.copy_from_slice(&buf[..10]);
        if &magic != MAGIC_DATA && &magic != MAGIC_LINK {
            err_at!(BadMagic, msg: "{:?}", String::from_utf8_lossy(&magic))?
        }

        let mut rd: &[u8] = &buf[10..n];
        let checksum = util::decode_u16(&mut rd)?;
        if checksum != checksum16(rd) {
            err_at!(BadHeader, msg: "header checksum mismatch {:x}", checksum)?
        }

        let version = util::decode_u8(&mut rd)?;
        let header_length = util::decode_u8(&mut rd)? as usize;
        let want = if version == 0 {
            HEADER_LENGTH_V0
        } else {
            HEADER_LENGTH_V1
        };
        if header_length != want {
            err_at!(BadHeader, msg: "version {} length {}", version, header_length)?
        }
        let compression = CompressionType::try_from(util::decode_u8(&mut rd)?)?;
        let flags = util::decode_u8(&mut rd)?;
        let data_checksum = util::decode_u32(&mut rd)?;
        let data_length = util::decode_u32(&mut rd)?;
        let data_zlength = util::decode_u32(&mut rd)?;
        let (revision, cluster_id) = match version {
            0 => (crate::clock::REVISION_NULL, 0),
            _ => (util::decode_i64(&mut rd)?, util::decode_u64(&mut rd)?),
        };

        Ok(BlockHeader {
            magic,
            version,
            compression,
            flags,
            data_checksum,
            data_length,
            data_zlength,
            revision,
            cluster_id,
        })
    }
}

/// Compress `payload` using `codec` and return the serialized block,
/// header followed by compressed payload. If compression does not shrink
/// the payload, it is stored uncompressed.
pub fn encode_block(
    codec: &dyn BlockCodec,
    magic: &[u8; 10],
    revision: i64,
    cluster_id: u64,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut header = BlockHeader::new(magic, revision, cluster_id);

    let zdata = match codec.to_type() {
        CompressionType::None => None,
        typ => {
            let zdata = codec.deflate(payload)?;
            if zdata.len() < payload.len() {
                header.compression = typ;
                Some(zdata)
            } else {
                None
            }
        }
    };
    let zblock: &[u8] = zdata.as_deref().unwrap_or(payload);

    header.data_checksum = checksum32(payload);
    header.data_length = err_at!(FailConvert, u32::try_from(payload.len()))?;
    header.data_zlength = err_at!(FailConvert, u32::try_from(zblock.len()))?;

    let mut buf = Vec::with_capacity(header.encoded_length() + zblock.len());
    header.encode(&mut buf);
    buf.extend_from_slice(zblock);
    Ok(buf)
}

/// Decompress `zblock` described by `header` and verify its checksum.
pub fn inflate_block(header: &BlockHeader, zblock: &[u8]) -> Result<Vec<u8>> {
    if zblock.len() != header.data_zlength as usize {
        err_at!(
            Truncated, msg: "zblock {}/{}", zblock.len(), header.data_zlength
        )?
    }

    let codec = create_block_codec(header.compression);
    let payload = codec.inflate(zblock, header.data_length as usize)?;

    let checksum = checksum32(&payload);
    if checksum != header.data_checksum {
        err_at!(
            ChecksumMismatch,
            msg: "computed {:x}, header {:x}", checksum, header.data_checksum
        )
    } else {
        Ok(payload)
    }
}

/// Decode a serialized block, header and payload, and return the header
/// and uncompressed payload.
pub fn decode_block(buf: &[u8]) -> Result<(BlockHeader, Vec<u8>)> {
    let header = BlockHeader::decode(buf)?;
    let n = header.encoded_length();
    let m = n + header.data_zlength as usize;
    if buf.len() < m {
        err_at!(Truncated, msg: "block {}/{}", buf.len(), m)?
    }
    let payload = inflate_block(&header, &buf[n..m])?;
    Ok((header, payload))
}

#[cfg(test)]
#[path = "header_test.rs"]
mod header_test;
