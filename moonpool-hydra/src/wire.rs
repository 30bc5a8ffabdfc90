//! Binary format of logged mutation records.
//!
//! Every record in a changelog, and every record the leader ships to its
//! followers, has the same byte layout:
//!
//! ```text
//! [length:4][checksum:4][header_length:4][header:H][payload:N]
//! ```
//!
//! - **length**: total record size including the 12-byte prefix (little-endian u32)
//! - **checksum**: CRC32C over `header_length + header + payload`
//! - **header**: the encoded [`MutationHeader`]
//! - **payload**: the business mutation bytes, untouched
//!
//! The header body, all integers little-endian:
//!
//! ```text
//! reign:4 segment_id:4 record_id:4 sequence_number:8 epoch:8
//! timestamp_micros:8 random_seed:8 prev_random_seed:8
//! has_mutation_id:1 [mutation_id:16] type_length:2 type:UTF-8
//! ```
//!
//! Recovery and replication decode exactly what was written, so the random
//! seed and mutation id seen by the automaton are identical on every peer.

use crate::types::{EpochId, MutationId, Version};

/// Size of the fixed record prefix: length, checksum, header length.
pub const RECORD_PREFIX_SIZE: usize = 12;

/// Maximum record size (64MiB).
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Size of the header body without the optional id and type string.
const FIXED_HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8 + 8 + 8 + 8 + 1 + 2;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the record.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed from the data.
        actual: u32,
    },

    /// Record exceeds the maximum allowed size.
    #[error("record too large: {size} bytes (max {MAX_RECORD_SIZE})")]
    RecordTooLarge {
        /// Actual record size in bytes.
        size: usize,
    },

    /// A length field has an invalid value.
    #[error("invalid length: {length}")]
    InvalidLength {
        /// The invalid length value.
        length: u32,
    },

    /// The mutation type is not valid UTF-8.
    #[error("mutation type is not valid UTF-8")]
    InvalidMutationType,
}

/// Header written immediately before every mutation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationHeader {
    /// Handler name.
    pub mutation_type: String,
    /// Schema version the mutation was produced under.
    pub reign: u32,
    /// Client id for idempotent retries.
    pub mutation_id: Option<MutationId>,
    /// Wall-clock time of logging, in microseconds since the unix epoch.
    pub timestamp_micros: u64,
    /// Seed for deterministic randomness inside the handler.
    pub random_seed: u64,
    /// Seed of the previous record; chains records together.
    pub prev_random_seed: u64,
    /// Position of the record.
    pub version: Version,
    /// Global 1-based index of the record.
    pub sequence_number: u64,
    /// Epoch of the leader that logged the record.
    pub epoch: EpochId,
}

impl MutationHeader {
    fn encoded_len(&self) -> usize {
        FIXED_HEADER_SIZE
            + if self.mutation_id.is_some() { 16 } else { 0 }
            + self.mutation_type.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        let type_length = u16::try_from(self.mutation_type.len()).map_err(|_| {
            WireError::InvalidLength {
                length: self.mutation_type.len() as u32,
            }
        })?;
        buf.extend_from_slice(&self.reign.to_le_bytes());
        buf.extend_from_slice(&self.version.segment_id.to_le_bytes());
        buf.extend_from_slice(&self.version.record_id.to_le_bytes());
        buf.extend_from_slice(&self.sequence_number.to_le_bytes());
        buf.extend_from_slice(&self.epoch.0.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_micros.to_le_bytes());
        buf.extend_from_slice(&self.random_seed.to_le_bytes());
        buf.extend_from_slice(&self.prev_random_seed.to_le_bytes());
        match self.mutation_id {
            Some(id) => {
                buf.push(1);
                buf.extend_from_slice(&id.first.to_le_bytes());
                buf.extend_from_slice(&id.second.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&type_length.to_le_bytes());
        buf.extend_from_slice(self.mutation_type.as_bytes());
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(buf);
        let reign = reader.u32()?;
        let segment_id = reader.u32()?;
        let record_id = reader.u32()?;
        let sequence_number = reader.u64()?;
        let epoch = EpochId(reader.u64()?);
        let timestamp_micros = reader.u64()?;
        let random_seed = reader.u64()?;
        let prev_random_seed = reader.u64()?;
        let mutation_id = match reader.u8()? {
            0 => None,
            _ => Some(MutationId::new(reader.u64()?, reader.u64()?)),
        };
        let type_length = reader.u16()? as usize;
        let type_bytes = reader.bytes(type_length)?;
        let mutation_type =
            String::from_utf8(type_bytes.to_vec()).map_err(|_| WireError::InvalidMutationType)?;

        Ok(Self {
            mutation_type,
            reign,
            mutation_id,
            timestamp_micros,
            random_seed,
            prev_random_seed,
            version: Version::new(segment_id, record_id),
            sequence_number,
            epoch,
        })
    }
}

/// Little-endian cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.offset + len;
        if end > self.buf.len() {
            return Err(WireError::InsufficientData {
                needed: end,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// Serialize a header and payload into one record.
///
/// # Errors
///
/// Returns `RecordTooLarge` if the record exceeds [`MAX_RECORD_SIZE`].
pub fn serialize_mutation_record(
    header: &MutationHeader,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let header_length = header.encoded_len();
    let total_length = RECORD_PREFIX_SIZE + header_length + payload.len();
    if total_length > MAX_RECORD_SIZE {
        return Err(WireError::RecordTooLarge { size: total_length });
    }

    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&(header_length as u32).to_le_bytes());
    header.encode_into(&mut data)?;
    data.extend_from_slice(payload);

    let checksum = crc32c::crc32c(&data[8..]);
    data[4..8].copy_from_slice(&checksum.to_le_bytes());
    Ok(data)
}

/// Decode a record into its header and payload, validating the checksum.
///
/// # Errors
///
/// - `InsufficientData`: the record is truncated
/// - `ChecksumMismatch`: the record was corrupted
/// - `InvalidLength`: a length field is malformed
pub fn deserialize_mutation_record(data: &[u8]) -> Result<(MutationHeader, Vec<u8>), WireError> {
    let mut reader = Reader::new(data);
    let length = reader.u32()?;
    let checksum = reader.u32()?;
    let header_length = reader.u32()?;

    if (length as usize) < RECORD_PREFIX_SIZE || length as usize > MAX_RECORD_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    if data.len() < length as usize {
        return Err(WireError::InsufficientData {
            needed: length as usize,
            have: data.len(),
        });
    }
    let record = &data[..length as usize];
    let actual = crc32c::crc32c(&record[8..]);
    if actual != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual,
        });
    }

    let header_end = RECORD_PREFIX_SIZE + header_length as usize;
    if header_end > record.len() {
        return Err(WireError::InvalidLength {
            length: header_length,
        });
    }
    let header = MutationHeader::decode(&record[RECORD_PREFIX_SIZE..header_end])?;
    Ok((header, record[header_end..].to_vec()))
}
