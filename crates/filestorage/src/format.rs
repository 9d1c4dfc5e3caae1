// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Bit-exact encoding of the log's transaction and data record headers.
//!
//! A log is a 4-byte magic followed by transactions:
//!
//! ```text
//! txn:  tid u64 | length u64 | status u8 | user_len u16 | desc_len u16 | ext_len u16
//!       user | description | extension | data records... | length u64
//! data: oid u64 | tid u64 | prev u64 | txn_pos u64 | version_len u16 | payload_len u64
//!       payload (payload_len > 0) | backpointer u64 (payload_len == 0)
//! ```
//!
//! `length` counts every byte of the transaction except the trailing copy of itself.

use crate::error::{Result, StorageError};
use crate::types::{Oid, Tid};
use binary_layout::{Field, binary_layout};

pub const MAGIC: &[u8; 4] = b"FS21";
pub const MAGIC_LEN: u64 = 4;

pub const TXN_HEADER_LEN: usize = 23;
pub const DATA_HEADER_LEN: usize = 42;
pub const BACKPOINTER_LEN: usize = 8;
pub const TRAILER_LEN: usize = 8;

/// Offset of the status byte within a transaction header.
pub const STATUS_OFFSET: u64 = txn_header::status::OFFSET as u64;

binary_layout!(txn_header, BigEndian, {
    tid: u64,
    length: u64,
    status: u8,
    user_len: u16,
    desc_len: u16,
    ext_len: u16,
});

binary_layout!(data_header, BigEndian, {
    oid: u64,
    tid: u64,
    prev: u64,
    txn_pos: u64,
    // Left over from the long-gone "versions" feature; always zero.
    version_len: u16,
    payload_len: u64,
});

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxnStatus {
    Committed,
    Packed,
    Checkpoint,
    Undone,
}

impl TxnStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TxnStatus::Committed => b' ',
            TxnStatus::Packed => b'p',
            TxnStatus::Checkpoint => b'c',
            TxnStatus::Undone => b'u',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b' ' => Some(TxnStatus::Committed),
            b'p' => Some(TxnStatus::Packed),
            b'c' => Some(TxnStatus::Checkpoint),
            b'u' => Some(TxnStatus::Undone),
            _ => None,
        }
    }

    /// Committed and packed transactions are the ones readers may see.
    pub fn is_visible(self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Packed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnHeader {
    pub tid: Tid,
    /// Transaction length excluding the trailing length copy.
    pub length: u64,
    pub status: TxnStatus,
    pub user_len: u16,
    pub desc_len: u16,
    pub ext_len: u16,
}

impl TxnHeader {
    /// Header plus user, description and extension.
    pub fn meta_len(&self) -> u64 {
        TXN_HEADER_LEN as u64 + self.user_len as u64 + self.desc_len as u64 + self.ext_len as u64
    }

    /// Bytes the whole transaction occupies on disk, trailer included.
    pub fn total_len(&self) -> u64 {
        self.length + TRAILER_LEN as u64
    }

    pub fn encode(&self) -> [u8; TXN_HEADER_LEN] {
        let mut buf = [0u8; TXN_HEADER_LEN];
        let mut view = txn_header::View::new(&mut buf[..]);
        view.tid_mut().write(self.tid.0);
        view.length_mut().write(self.length);
        view.status_mut().write(self.status.as_byte());
        view.user_len_mut().write(self.user_len);
        view.desc_len_mut().write(self.desc_len);
        view.ext_len_mut().write(self.ext_len);
        buf
    }

    /// Decodes the header found at file offset `pos`.
    pub fn decode(buf: &[u8], pos: u64) -> Result<Self> {
        if buf.len() < TXN_HEADER_LEN {
            return Err(StorageError::Truncated { pos });
        }
        let view = txn_header::View::new(buf);
        let status_byte = view.status().read();
        let status = TxnStatus::from_byte(status_byte).ok_or_else(|| {
            StorageError::corrupted(pos, format!("invalid transaction status {status_byte:#04x}"))
        })?;
        let header = TxnHeader {
            tid: Tid(view.tid().read()),
            length: view.length().read(),
            status,
            user_len: view.user_len().read(),
            desc_len: view.desc_len().read(),
            ext_len: view.ext_len().read(),
        };
        if header.length < header.meta_len() {
            return Err(StorageError::corrupted(
                pos,
                format!(
                    "transaction length {} shorter than its header ({})",
                    header.length,
                    header.meta_len()
                ),
            ));
        }
        Ok(header)
    }
}

/// What follows a data header: the payload itself, or the offset of an earlier record holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Payload(Vec<u8>),
    /// Zero means the object does not exist in this revision (its creation was undone).
    Backpointer(u64),
}

impl RecordData {
    pub fn encoded_len(&self) -> u64 {
        match self {
            RecordData::Payload(p) => p.len() as u64,
            RecordData::Backpointer(_) => BACKPOINTER_LEN as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub oid: Oid,
    pub tid: Tid,
    pub prev: u64,
    pub txn_pos: u64,
    pub payload_len: u64,
}

impl DataHeader {
    pub fn has_backpointer(&self) -> bool {
        self.payload_len == 0
    }

    /// Bytes the record occupies on disk, header included.
    pub fn record_len(&self) -> u64 {
        DATA_HEADER_LEN as u64
            + if self.has_backpointer() {
                BACKPOINTER_LEN as u64
            } else {
                self.payload_len
            }
    }

    pub fn encode(&self) -> [u8; DATA_HEADER_LEN] {
        let mut buf = [0u8; DATA_HEADER_LEN];
        let mut view = data_header::View::new(&mut buf[..]);
        view.oid_mut().write(self.oid.0);
        view.tid_mut().write(self.tid.0);
        view.prev_mut().write(self.prev);
        view.txn_pos_mut().write(self.txn_pos);
        view.version_len_mut().write(0);
        view.payload_len_mut().write(self.payload_len);
        buf
    }

    /// Decodes the header found at file offset `pos`. When `txn_pos` is given, the record must
    /// claim that transaction as its own.
    pub fn decode(buf: &[u8], pos: u64, txn_pos: Option<u64>) -> Result<Self> {
        if buf.len() < DATA_HEADER_LEN {
            return Err(StorageError::Truncated { pos });
        }
        let view = data_header::View::new(buf);
        let version_len = view.version_len().read();
        if version_len != 0 {
            return Err(StorageError::corrupted(
                pos,
                format!("non-zero version length {version_len}"),
            ));
        }
        let header = DataHeader {
            oid: Oid(view.oid().read()),
            tid: Tid(view.tid().read()),
            prev: view.prev().read(),
            txn_pos: view.txn_pos().read(),
            payload_len: view.payload_len().read(),
        };
        if let Some(expected) = txn_pos
            && header.txn_pos != expected
        {
            return Err(StorageError::corrupted(
                pos,
                format!(
                    "record claims transaction at {}, enclosed by {expected}",
                    header.txn_pos
                ),
            ));
        }
        if header.prev >= pos {
            return Err(StorageError::corrupted(
                pos,
                format!("previous-record pointer {} is not before the record", header.prev),
            ));
        }
        Ok(header)
    }
}

/// Encodes a complete data record: header followed by payload or backpointer.
pub fn encode_data_record(
    oid: Oid,
    tid: Tid,
    prev: u64,
    txn_pos: u64,
    data: &RecordData,
) -> Vec<u8> {
    let payload_len = match data {
        RecordData::Payload(p) => p.len() as u64,
        RecordData::Backpointer(_) => 0,
    };
    let header = DataHeader {
        oid,
        tid,
        prev,
        txn_pos,
        payload_len,
    };
    let mut out = Vec::with_capacity(header.record_len() as usize);
    out.extend_from_slice(&header.encode());
    match data {
        RecordData::Payload(p) => out.extend_from_slice(p),
        RecordData::Backpointer(back) => out.extend_from_slice(&back.to_be_bytes()),
    }
    out
}

/// Validates a backpointer read from the record at `pos`.
pub fn check_backpointer(back: u64, pos: u64) -> Result<u64> {
    if back >= pos || (back != 0 && back < MAGIC_LEN) {
        return Err(StorageError::corrupted(
            pos,
            format!("backpointer {back} does not point at an earlier record"),
        ));
    }
    Ok(back)
}

/// Builds the metadata portion of a transaction header: user, description, extension.
pub fn encode_txn_meta(
    tid: Tid,
    length: u64,
    status: TxnStatus,
    user: &[u8],
    description: &[u8],
    extension: &[u8],
) -> Result<Vec<u8>> {
    let field_len = |name: &str, bytes: &[u8]| -> Result<u16> {
        u16::try_from(bytes.len()).map_err(|_| {
            StorageError::Metadata(format!("{name} is {} bytes; the limit is 65535", bytes.len()))
        })
    };
    let header = TxnHeader {
        tid,
        length,
        status,
        user_len: field_len("user", user)?,
        desc_len: field_len("description", description)?,
        ext_len: field_len("extension", extension)?,
    };
    let mut out = Vec::with_capacity(header.meta_len() as usize);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(user);
    out.extend_from_slice(description);
    out.extend_from_slice(extension);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(txn_header::SIZE, Some(TXN_HEADER_LEN));
        assert_eq!(data_header::SIZE, Some(DATA_HEADER_LEN));
        assert_eq!(STATUS_OFFSET, 16);
    }

    #[test]
    fn test_txn_header_is_big_endian() {
        let header = TxnHeader {
            tid: Tid(0x0102_0304_0506_0708),
            length: 23,
            status: TxnStatus::Checkpoint,
            user_len: 0,
            desc_len: 0,
            ext_len: 0,
        };
        let buf = header.encode();
        assert_eq!(&buf[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[8..16], &23u64.to_be_bytes());
        assert_eq!(buf[16], b'c');
        assert_eq!(TxnHeader::decode(&buf, 4).unwrap(), header);
    }

    #[test]
    fn test_txn_header_rejects_bad_status() {
        let mut buf = TxnHeader {
            tid: Tid(1),
            length: 100,
            status: TxnStatus::Committed,
            user_len: 0,
            desc_len: 0,
            ext_len: 0,
        }
        .encode();
        buf[16] = b'x';
        match TxnHeader::decode(&buf, 77) {
            Err(StorageError::Corrupted { pos, .. }) => assert_eq!(pos, 77),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_txn_header_rejects_short_length() {
        let buf = TxnHeader {
            tid: Tid(1),
            length: 24,
            status: TxnStatus::Committed,
            user_len: 5,
            desc_len: 0,
            ext_len: 0,
        }
        .encode();
        assert!(matches!(
            TxnHeader::decode(&buf, 4),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_data_record_with_backpointer() {
        let record = encode_data_record(Oid(7), Tid(9), 100, 90, &RecordData::Backpointer(120));
        assert_eq!(record.len(), DATA_HEADER_LEN + BACKPOINTER_LEN);
        let header = DataHeader::decode(&record, 200, Some(90)).unwrap();
        assert!(header.has_backpointer());
        assert_eq!(header.oid, Oid(7));
        assert_eq!(header.prev, 100);
        assert_eq!(header.record_len(), record.len() as u64);
        assert_eq!(
            u64::from_be_bytes(record[DATA_HEADER_LEN..].try_into().unwrap()),
            120
        );
    }

    #[test]
    fn test_data_header_validation() {
        let record = encode_data_record(Oid(1), Tid(2), 0, 50, &RecordData::Payload(b"abc".into()));
        // Wrong enclosing transaction.
        assert!(matches!(
            DataHeader::decode(&record, 80, Some(51)),
            Err(StorageError::Corrupted { pos: 80, .. })
        ));
        // Previous pointer must precede the record.
        let forward = encode_data_record(Oid(1), Tid(2), 500, 50, &RecordData::Payload(b"a".into()));
        assert!(DataHeader::decode(&forward, 80, Some(50)).is_err());
        // Vestigial version length must be zero.
        let mut versioned = record.clone();
        versioned[33] = 1;
        assert!(DataHeader::decode(&versioned, 80, Some(50)).is_err());
        assert!(check_backpointer(80, 80).is_err());
        assert_eq!(check_backpointer(0, 80).unwrap(), 0);
    }

    #[test]
    fn test_metadata_too_long() {
        let user = vec![b'u'; 70_000];
        assert!(matches!(
            encode_txn_meta(Tid(1), 0, TxnStatus::Checkpoint, &user, b"", b""),
            Err(StorageError::Metadata(_))
        ));
    }
}
