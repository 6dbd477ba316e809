//! Binary format definitions for BarDB nodes
//!
//! The file is a 4096-byte header page followed by an append-only region of
//! immutable nodes. Every node starts with a 2-byte tag:
//!
//! ```text
//!   tag = kind << 12 | total_length        (total_length <= 4095)
//! ```
//!
//! Branch nodes (Index, Head, Bucket) use a 24-byte little-endian header:
//!
//! ```text
//!   [0..2]   tag:        u16
//!   [2..4]   bitmap:     u16  - one bit per occupied branch slot
//!   [4..8]   prefix:     u32  - key bits above prefix_len, rest zero
//!   [8]      prefix_len: u8   - multiple of STRIDE, <= 28
//!   [9..12]  reserved:   [u8;3]
//!   [12..16] count:      u32  - 1 + sum of children's counts
//!   [16..20] body_crc:   u32  - CRC32C of the child offsets
//!   [20..24] checksum:   u32  - CRC32C of bytes [0..20]
//!   [24..]   children:   u64 per set bitmap bit, ascending slot order
//! ```
//!
//! Leaf nodes (Data, Bigdata) use a 20-byte little-endian header:
//!
//! ```text
//!   [0..2]   tag:        u16
//!   [2..4]   reserved:   [u8;2]
//!   [4..8]   key:        u32
//!   [8..12]  count:      u32  - 1 for Data, 1 + fragments for Bigdata
//!   [12..16] body_crc:   u32  - CRC32C of the trailing bytes
//!   [16..20] checksum:   u32  - CRC32C of bytes [0..16]
//!   [20..]   value bytes (Data) or u64 fragment offsets (Bigdata)
//! ```
//!
//! The branch selector is the STRIDE key bits directly below the prefix, so
//! a 32-bit key is resolved in at most eight branch levels.

use crate::error::{BarError, BarResult};

/// Size of the mapped header page; the node region starts here
pub const PAGE_SIZE: u64 = 4096;

/// Identification string written last during creation
pub const FILE_IDENT: [u8; 8] = *b"bardbv01";

/// Low 12 bits of a tag hold the node length
pub const TAG_LENGTH_MASK: u16 = 0x0FFF;

/// Largest encodable node
pub const MAX_NODE_SIZE: usize = TAG_LENGTH_MASK as usize;

/// Header size of Index, Head and Bucket nodes
pub const INDEX_HEADER_SIZE: usize = 24;

/// Header size of Data and Bigdata nodes
pub const DATA_HEADER_SIZE: usize = 20;

/// Size of a child or fragment offset
pub const OFFSET_SIZE: usize = 8;

/// Largest value stored in a single Data node
pub const MAX_DATA_PAYLOAD: usize = MAX_NODE_SIZE - DATA_HEADER_SIZE;

/// Most fragments a Bigdata node can reference
pub const MAX_FRAGMENTS: usize = (MAX_NODE_SIZE - DATA_HEADER_SIZE) / OFFSET_SIZE;

/// Largest value a Set accepts
pub const MAX_VALUE_SIZE: usize = MAX_FRAGMENTS * MAX_DATA_PAYLOAD;

/// Key width in bits
pub const KEY_BITS: u8 = 32;

/// Key bits consumed per branch level
pub const STRIDE: u8 = 4;

/// Branch slots per Index node
pub const FANOUT: usize = 1 << STRIDE;

/// Deepest prefix an Index node can hold
pub const MAX_PREFIX_LEN: u8 = KEY_BITS - STRIDE;

/// Node kinds, stored in the high nibble of the tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    /// Internal branch
    Index = 0x1,
    /// Leaf holding the whole value
    Data = 0x2,
    /// Reserved for collision / secondary-index handling
    Bucket = 0x5,
    /// Leaf referencing Data fragments of an oversized value
    Bigdata = 0x6,
    /// Branch that roots a snapshot
    Head = 0x9,
}

impl NodeKind {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x1 => Some(NodeKind::Index),
            0x2 => Some(NodeKind::Data),
            0x5 => Some(NodeKind::Bucket),
            0x6 => Some(NodeKind::Bigdata),
            0x9 => Some(NodeKind::Head),
            _ => None,
        }
    }

    /// Index, Head and Bucket share the branch layout
    pub fn is_branch(self) -> bool {
        matches!(self, NodeKind::Index | NodeKind::Head | NodeKind::Bucket)
    }

    pub fn header_size(self) -> usize {
        if self.is_branch() { INDEX_HEADER_SIZE } else { DATA_HEADER_SIZE }
    }
}

/// Build a tag from a kind and a total node length
pub fn encode_tag(kind: NodeKind, len: usize) -> u16 {
    debug_assert!(len <= MAX_NODE_SIZE);
    ((kind as u16) << 12) | (len as u16 & TAG_LENGTH_MASK)
}

/// Parse the tag at the start of `bytes`, returning kind and total length
pub fn decode_tag(bytes: &[u8], offset: u64) -> BarResult<(NodeKind, usize)> {
    if bytes.len() < 2 {
        return Err(BarError::corrupted(offset, format!("{} bytes is too short for a tag", bytes.len())));
    }
    let tag = u16::from_le_bytes([bytes[0], bytes[1]]);
    let kind = NodeKind::from_nibble((tag >> 12) as u8)
        .ok_or_else(|| BarError::corrupted(offset, format!("unknown node kind in tag 0x{:04x}", tag)))?;
    let len = (tag & TAG_LENGTH_MASK) as usize;
    if len < kind.header_size() {
        return Err(BarError::corrupted(offset, format!(
            "{:?} node length {} is shorter than its {}-byte header", kind, len, kind.header_size())));
    }
    Ok((kind, len))
}

/// Mask selecting the top `len` bits of a key
pub fn prefix_mask(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (KEY_BITS - len) }
}

/// Branch slot of `key` below a prefix of `prefix_len` bits
pub fn branch_slot(key: u32, prefix_len: u8) -> u8 {
    debug_assert!(prefix_len <= MAX_PREFIX_LEN);
    ((key >> (KEY_BITS - STRIDE - prefix_len)) as u8) & (FANOUT as u8 - 1)
}

/// Position of `slot` in the packed child array
pub fn rank(bitmap: u16, slot: u8) -> usize {
    (bitmap & ((1u16 << slot) - 1)).count_ones() as usize
}

/// Prefix length of the Index node separating two different keys: the
/// diverging bit rounded down to a stride boundary.
pub fn split_depth(a: u32, b: u32) -> u8 {
    debug_assert_ne!(a, b);
    let diverge = (a ^ b).leading_zeros() as u8;
    diverge - diverge % STRIDE
}

/// Write body_crc and checksum into the last 8 bytes of the header
fn seal(buf: &mut [u8], header_size: usize) {
    let body_crc = crc32c::crc32c(&buf[header_size..]);
    buf[header_size - 8..header_size - 4].copy_from_slice(&body_crc.to_le_bytes());
    let checksum = crc32c::crc32c(&buf[..header_size - 4]);
    buf[header_size - 4..header_size].copy_from_slice(&checksum.to_le_bytes());
}

/// Verify the header checksum, then the body checksum it vouches for
fn verify(buf: &[u8], header_size: usize, offset: u64) -> BarResult<()> {
    let stored = read_u32(buf, header_size - 4);
    let computed = crc32c::crc32c(&buf[..header_size - 4]);
    if stored != computed {
        return Err(BarError::ChecksumMismatch { offset, region: "header", expected: stored, actual: computed });
    }
    let stored = read_u32(buf, header_size - 8);
    let computed = crc32c::crc32c(&buf[header_size..]);
    if stored != computed {
        return Err(BarError::ChecksumMismatch { offset, region: "body", expected: stored, actual: computed });
    }
    Ok(())
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_offsets(body: &[u8]) -> Vec<u64> {
    body.chunks_exact(OFFSET_SIZE)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

/// Branch node: Index, Head or Bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    pub kind: NodeKind,
    pub prefix: u32,
    pub prefix_len: u8,
    pub bitmap: u16,
    pub count: u32,
    pub children: Vec<u64>,
}

impl IndexNode {
    /// The root written when a file is created: no children, count 1
    pub fn empty_head() -> Self {
        Self { kind: NodeKind::Head, prefix: 0, prefix_len: 0, bitmap: 0, count: 1, children: Vec::new() }
    }

    /// Index node with exactly two children in different slots
    pub fn pair(prefix_len: u8, a: (u32, u64), b: (u32, u64), count: u32) -> Self {
        let slot_a = branch_slot(a.0, prefix_len);
        let slot_b = branch_slot(b.0, prefix_len);
        debug_assert_ne!(slot_a, slot_b);
        let children = if slot_a < slot_b { vec![a.1, b.1] } else { vec![b.1, a.1] };
        Self {
            kind: NodeKind::Index,
            prefix: a.0 & prefix_mask(prefix_len),
            prefix_len,
            bitmap: (1 << slot_a) | (1 << slot_b),
            count,
            children,
        }
    }

    /// True if `key` agrees with this node's prefix
    pub fn covers(&self, key: u32) -> bool {
        (key ^ self.prefix) & prefix_mask(self.prefix_len) == 0
    }

    pub fn slot_of(&self, key: u32) -> u8 {
        branch_slot(key, self.prefix_len)
    }

    /// Child offset in `slot`, if occupied
    pub fn child(&self, slot: u8) -> Option<u64> {
        if self.bitmap & (1 << slot) == 0 {
            return None;
        }
        self.children.get(rank(self.bitmap, slot)).copied()
    }

    /// Copy with `offset` added in the empty `slot`
    pub fn with_inserted(&self, slot: u8, offset: u64, count: u32) -> Self {
        let bitmap = self.bitmap | (1 << slot);
        let mut children = self.children.clone();
        children.insert(rank(bitmap, slot), offset);
        Self { bitmap, children, count, ..self.clone() }
    }

    /// Copy with the child in the occupied `slot` swapped for `offset`
    pub fn with_replaced(&self, slot: u8, offset: u64, count: u32) -> Self {
        let mut children = self.children.clone();
        children[rank(self.bitmap, slot)] = offset;
        Self { children, count, ..self.clone() }
    }

    pub fn encoded_len(&self) -> usize {
        INDEX_HEADER_SIZE + self.children.len() * OFFSET_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.kind.is_branch());
        debug_assert_eq!(self.children.len(), self.bitmap.count_ones() as usize);
        let len = self.encoded_len();
        let mut buf = vec![0u8; len];
        buf[0..2].copy_from_slice(&encode_tag(self.kind, len).to_le_bytes());
        buf[2..4].copy_from_slice(&self.bitmap.to_le_bytes());
        buf[4..8].copy_from_slice(&self.prefix.to_le_bytes());
        buf[8] = self.prefix_len;
        buf[12..16].copy_from_slice(&self.count.to_le_bytes());
        for (i, child) in self.children.iter().enumerate() {
            let at = INDEX_HEADER_SIZE + i * OFFSET_SIZE;
            buf[at..at + OFFSET_SIZE].copy_from_slice(&child.to_le_bytes());
        }
        seal(&mut buf, INDEX_HEADER_SIZE);
        buf
    }

    fn decode(kind: NodeKind, buf: &[u8], offset: u64) -> BarResult<Self> {
        let bitmap = u16::from_le_bytes([buf[2], buf[3]]);
        let prefix = read_u32(buf, 4);
        let prefix_len = buf[8];
        let count = read_u32(buf, 12);

        if prefix_len > MAX_PREFIX_LEN || prefix_len % STRIDE != 0 {
            return Err(BarError::corrupted(offset, format!("invalid prefix length {}", prefix_len)));
        }
        if prefix & !prefix_mask(prefix_len) != 0 {
            return Err(BarError::corrupted(offset, "prefix has bits below its length"));
        }
        let body = &buf[INDEX_HEADER_SIZE..];
        if body.len() != bitmap.count_ones() as usize * OFFSET_SIZE {
            return Err(BarError::corrupted(offset, format!(
                "{} child bytes for a bitmap with {} bits set", body.len(), bitmap.count_ones())));
        }

        Ok(Self { kind, prefix, prefix_len, bitmap, count, children: read_offsets(body) })
    }
}

/// Leaf holding a whole value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNode {
    pub key: u32,
    pub value: Vec<u8>,
}

impl DataNode {
    /// Encode a Data node straight from a borrowed value
    pub fn encode(key: u32, value: &[u8]) -> BarResult<Vec<u8>> {
        if value.len() > MAX_DATA_PAYLOAD {
            return Err(BarError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: MAX_DATA_PAYLOAD as u64,
            });
        }
        let len = DATA_HEADER_SIZE + value.len();
        let mut buf = vec![0u8; len];
        write_leaf_header(&mut buf, NodeKind::Data, key, 1);
        buf[DATA_HEADER_SIZE..].copy_from_slice(value);
        seal(&mut buf, DATA_HEADER_SIZE);
        Ok(buf)
    }
}

/// Leaf referencing the Data fragments of an oversized value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigdataNode {
    pub key: u32,
    pub count: u32,
    pub fragments: Vec<u64>,
}

impl BigdataNode {
    pub fn new(key: u32, fragments: Vec<u64>) -> Self {
        Self { key, count: 1 + fragments.len() as u32, fragments }
    }

    pub fn encode(&self) -> BarResult<Vec<u8>> {
        if self.fragments.len() > MAX_FRAGMENTS {
            return Err(BarError::OversizedEntry {
                entry_size: (self.fragments.len() * MAX_DATA_PAYLOAD) as u64,
                max_size: MAX_VALUE_SIZE as u64,
            });
        }
        let len = DATA_HEADER_SIZE + self.fragments.len() * OFFSET_SIZE;
        let mut buf = vec![0u8; len];
        write_leaf_header(&mut buf, NodeKind::Bigdata, self.key, self.count);
        for (i, fragment) in self.fragments.iter().enumerate() {
            let at = DATA_HEADER_SIZE + i * OFFSET_SIZE;
            buf[at..at + OFFSET_SIZE].copy_from_slice(&fragment.to_le_bytes());
        }
        seal(&mut buf, DATA_HEADER_SIZE);
        Ok(buf)
    }
}

fn write_leaf_header(buf: &mut [u8], kind: NodeKind, key: u32, count: u32) {
    let len = buf.len();
    buf[0..2].copy_from_slice(&encode_tag(kind, len).to_le_bytes());
    buf[4..8].copy_from_slice(&key.to_le_bytes());
    buf[8..12].copy_from_slice(&count.to_le_bytes());
}

/// A decoded, checksum-verified node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Branch(IndexNode),
    Data(DataNode),
    Bigdata(BigdataNode),
}

impl Node {
    /// Decode the node at the start of `buf`.
    ///
    /// `offset` is only used for error context. Trailing bytes past the
    /// tag's length are ignored.
    pub fn decode(buf: &[u8], offset: u64) -> BarResult<Node> {
        let (kind, len) = decode_tag(buf, offset)?;
        if buf.len() < len {
            return Err(BarError::corrupted(offset, format!(
                "tag declares {} bytes but only {} are available", len, buf.len())));
        }
        let buf = &buf[..len];
        verify(buf, kind.header_size(), offset)?;

        match kind {
            NodeKind::Index | NodeKind::Head | NodeKind::Bucket => {
                IndexNode::decode(kind, buf, offset).map(Node::Branch)
            }
            NodeKind::Data => Ok(Node::Data(DataNode {
                key: read_u32(buf, 4),
                value: buf[DATA_HEADER_SIZE..].to_vec(),
            })),
            NodeKind::Bigdata => {
                let body = &buf[DATA_HEADER_SIZE..];
                if body.len() % OFFSET_SIZE != 0 {
                    return Err(BarError::corrupted(offset, "fragment list is not a whole number of offsets"));
                }
                Ok(Node::Bigdata(BigdataNode {
                    key: read_u32(buf, 4),
                    count: read_u32(buf, 8),
                    fragments: read_offsets(body),
                }))
            }
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Branch(index) => index.kind,
            Node::Data(_) => NodeKind::Data,
            Node::Bigdata(_) => NodeKind::Bigdata,
        }
    }

    /// Leaf-count contribution of this node to its parent
    pub fn count(&self) -> u32 {
        match self {
            Node::Branch(index) => index.count,
            Node::Data(_) => 1,
            Node::Bigdata(big) => big.count,
        }
    }

    /// Bytes the node occupies on disk
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Branch(index) => index.encoded_len(),
            Node::Data(data) => DATA_HEADER_SIZE + data.value.len(),
            Node::Bigdata(big) => DATA_HEADER_SIZE + big.fragments.len() * OFFSET_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_layout() {
        assert_eq!(encode_tag(NodeKind::Head, 24), 0x9018);
        assert_eq!(encode_tag(NodeKind::Data, 4095), 0x2FFF);
        assert_eq!(decode_tag(&0x1020u16.to_le_bytes(), 0).unwrap(), (NodeKind::Index, 32));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = decode_tag(&0x3020u16.to_le_bytes(), 8192).unwrap_err();
        assert!(matches!(err, BarError::Corrupted { offset: 8192, .. }));
        // a punched hole reads back as zeros
        assert!(Node::decode(&[0u8; 32], 4096).is_err());
    }

    #[test]
    fn test_empty_head() {
        let bytes = IndexNode::empty_head().encode();
        assert_eq!(bytes.len(), INDEX_HEADER_SIZE);
        match Node::decode(&bytes, PAGE_SIZE).unwrap() {
            Node::Branch(head) => {
                assert_eq!(head.kind, NodeKind::Head);
                assert_eq!(head.count, 1);
                assert!(head.children.is_empty());
            }
            other => panic!("expected head, got {:?}", other),
        }
    }

    #[test]
    fn test_data_node() {
        let bytes = DataNode::encode(10, b"qtplatypus").unwrap();
        assert_eq!(bytes.len(), DATA_HEADER_SIZE + 10);
        let node = Node::decode(&bytes, PAGE_SIZE).unwrap();
        assert_eq!(node, Node::Data(DataNode { key: 10, value: b"qtplatypus".to_vec() }));
        assert_eq!(node.count(), 1);
        assert_eq!(node.encoded_len(), bytes.len());
    }

    #[test]
    fn test_oversized_data_rejected() {
        let value = vec![0u8; MAX_DATA_PAYLOAD + 1];
        assert!(matches!(DataNode::encode(1, &value), Err(BarError::OversizedEntry { .. })));
        assert!(DataNode::encode(1, &value[..MAX_DATA_PAYLOAD]).is_ok());
    }

    #[test]
    fn test_header_corruption_detected() {
        let mut bytes = DataNode::encode(7, b"value").unwrap();
        bytes[5] ^= 0x01; // key byte
        assert!(matches!(
            Node::decode(&bytes, 0),
            Err(BarError::ChecksumMismatch { region: "header", .. })
        ));
    }

    #[test]
    fn test_body_corruption_detected() {
        let mut bytes = DataNode::encode(7, b"value").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Node::decode(&bytes, 0),
            Err(BarError::ChecksumMismatch { region: "body", .. })
        ));
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let bytes = DataNode::encode(7, b"value").unwrap();
        assert!(matches!(Node::decode(&bytes[..bytes.len() - 1], 0), Err(BarError::Corrupted { .. })));
    }

    #[test]
    fn test_pair_orders_children_by_slot() {
        // 0x1000_0000 and 0x2000_0000 diverge in the first nibble
        let depth = split_depth(0x2000_0000, 0x1000_0000);
        assert_eq!(depth, 0);
        let node = IndexNode::pair(depth, (0x2000_0000, 9000), (0x1000_0000, 8000), 3);
        assert_eq!(node.bitmap, 0b0110);
        assert_eq!(node.children, vec![8000, 9000]);
        assert_eq!(node.child(2), Some(9000));
        assert_eq!(node.child(3), None);

        let decoded = Node::decode(&node.encode(), 0).unwrap();
        assert_eq!(decoded, Node::Branch(node));
    }

    #[test]
    fn test_split_depth_rounds_to_stride() {
        assert_eq!(split_depth(0x0000_0010, 0x0000_0011), 28);
        assert_eq!(split_depth(0x0000_0000, 0x0000_0100), 20);
        assert_eq!(split_depth(0x8000_0000, 0x0000_0000), 0);
        assert_eq!(split_depth(0x0400_0000, 0x0000_0000), 4);
    }

    #[test]
    fn test_insert_and_replace_keep_rank_order() {
        let head = IndexNode::empty_head();
        let a = head.with_inserted(5, 5000, 2);
        let b = a.with_inserted(1, 1000, 3);
        let c = b.with_inserted(9, 9000, 4);
        assert_eq!(c.children, vec![1000, 5000, 9000]);
        assert_eq!(rank(c.bitmap, 9), 2);

        let d = c.with_replaced(5, 5500, 4);
        assert_eq!(d.children, vec![1000, 5500, 9000]);
        assert_eq!(d.kind, NodeKind::Head);
    }

    #[test]
    fn test_prefix_validation() {
        let node = IndexNode {
            kind: NodeKind::Index,
            prefix: 0x1234_0000,
            prefix_len: 16,
            bitmap: 0b11,
            count: 3,
            children: vec![4096, 4200],
        };
        assert!(node.covers(0x1234_ffff));
        assert!(!node.covers(0x1235_0000));
        assert_eq!(node.slot_of(0x1234_1000), 1);

        let mut bytes = node.encode();
        bytes[8] = 6; // not a stride multiple
        seal(&mut bytes, INDEX_HEADER_SIZE);
        assert!(matches!(Node::decode(&bytes, 0), Err(BarError::Corrupted { .. })));
    }

    #[test]
    fn test_bigdata_node() {
        let node = BigdataNode::new(42, vec![4096, 8192, 12288]);
        assert_eq!(node.count, 4);
        let decoded = Node::decode(&node.encode().unwrap(), 0).unwrap();
        assert_eq!(decoded.kind(), NodeKind::Bigdata);
        assert_eq!(decoded.count(), 4);
        assert_eq!(decoded, Node::Bigdata(node));
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(MAX_DATA_PAYLOAD, 4075);
        assert_eq!(MAX_FRAGMENTS, 509);
        assert!(INDEX_HEADER_SIZE + FANOUT * OFFSET_SIZE <= MAX_NODE_SIZE);
    }
}
