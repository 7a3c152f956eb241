use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Identifier of a ledger: 32 bits with an 8-char lowercase hex string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerId(pub u32);

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for LedgerId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(());
        }
        u32::from_str_radix(s, 16).map(LedgerId).map_err(|_| ())
    }
}

/// A 16-byte event identifier: 64-bit timestamp (epoch microseconds), 32-bit
/// checksum, 32-bit ledger id. Within a ledger, ids are totally ordered by
/// `(timestamp, checksum)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    pub timestamp: u64,
    pub checksum: u32,
    pub ledger: LedgerId,
}

impl EventId {
    pub fn new(timestamp: u64, checksum: u32, ledger: LedgerId) -> Self {
        EventId {
            timestamp,
            checksum,
            ledger,
        }
    }

    /// Pack big-endian: 8-byte timestamp, 4-byte checksum, 4-byte ledger id.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ledger.0.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let timestamp = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let checksum = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let ledger = LedgerId(u32::from_be_bytes(bytes[12..16].try_into().unwrap()));
        EventId {
            timestamp,
            checksum,
            ledger,
        }
    }

    /// 32-char lowercase hex form used in URLs, ETags and SSE ids.
    pub fn hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut buf = [0u8; 16];
        hex::decode_to_slice(s, &mut buf).ok()?;
        Some(Self::from_bytes(buf))
    }

    /// The database types event ids as UUIDs; the byte layouts are identical.
    pub fn to_uuid(self) -> Uuid {
        Uuid::from_bytes(self.to_bytes())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::from_bytes(*uuid.as_bytes())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp, self.checksum).cmp(&(other.timestamp, other.checksum))
    }
}
