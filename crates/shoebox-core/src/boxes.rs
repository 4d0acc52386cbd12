//! Reader for nested size-prefixed box trees (ISOBMFF/QTFF).
//!
//! Boxes the extent resolver cares about (`meta`, `pitm`, `iref`, `iloc`,
//! `idat`) get typed payloads; everything else is kept as an opaque node so
//! the tree stays navigable without modeling the whole standard.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Error, Result};

/// Four-character box type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: FourCc = FourCc(*b"ftyp");
    pub const META: FourCc = FourCc(*b"meta");
    pub const PITM: FourCc = FourCc(*b"pitm");
    pub const IREF: FourCc = FourCc(*b"iref");
    pub const ILOC: FourCc = FourCc(*b"iloc");
    pub const IDAT: FourCc = FourCc(*b"idat");
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

/// Parsed box header: position bookkeeping only, no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: FourCc,
    /// Offset of the first header byte.
    pub begin: u64,
    /// Offset of the first payload byte.
    pub data_start: u64,
    /// Offset one past the last payload byte. `None` means the box extends
    /// to the end of its enclosing container; the parent-aware caller fills
    /// this in, and only the outermost box may leave it unbounded.
    pub end: Option<u64>,
}

impl BoxHeader {
    pub fn data_len(&self) -> Option<u64> {
        self.end.map(|end| end - self.data_start)
    }
}

/// One item-location entry from an `iloc` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLocation {
    pub item_id: u32,
    /// 0 = file offsets, 1 = offsets into `idat`, 2 = offsets into `item`.
    pub construction_method: u8,
    /// 0 means "this file"; anything else is an external data reference.
    pub data_reference_index: u16,
    pub base_offset: u64,
    pub extents: Vec<ItemExtent>,
}

/// One raw extent from an `iloc` item, relative to its base offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemExtent {
    pub offset: u64,
    pub length: u64,
}

/// Typed payload for the box kinds the resolver consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxPayload {
    /// `pitm`: the primary item id.
    PrimaryItem { item_id: u32 },
    /// `iref`: from-item -> to-items edges, pooled across all reference
    /// types (the resolver follows every edge kind).
    ItemReferences { edges: Vec<(u32, Vec<u32>)> },
    /// `iloc`: one entry per item.
    ItemLocations { items: Vec<ItemLocation> },
    /// `idat`: payload bytes addressed by construction method 1. The byte
    /// range is already in the header; nothing to parse.
    ItemData,
    /// A container whose children were parsed.
    Container,
    /// Anything else: skipped without interpretation.
    Opaque,
}

/// Node in a parsed box tree. Built fresh per parse, never mutated after.
#[derive(Debug, Clone)]
pub struct BoxNode {
    pub header: BoxHeader,
    pub payload: BoxPayload,
    pub children: Vec<BoxNode>,
}

impl BoxNode {
    /// First child of the given kind, if any.
    pub fn child(&self, kind: FourCc) -> Option<&BoxNode> {
        self.children.iter().find(|c| c.header.kind == kind)
    }
}

/// Find the first box of `kind` in a top-level list.
pub fn find_box(boxes: &[BoxNode], kind: FourCc) -> Option<&BoxNode> {
    boxes.iter().find(|b| b.header.kind == kind)
}

/// Read one box header at `begin`. Returns `None` on clean end-of-stream
/// (zero bytes available at `begin`).
pub fn read_header<R: Read + Seek>(reader: &mut R, begin: u64) -> Result<Option<BoxHeader>> {
    reader.seek(SeekFrom::Start(begin))?;

    let mut head = [0u8; 8];
    match read_exact_or_eof(reader, &mut head)? {
        0 => return Ok(None),
        8 => {}
        n => {
            return Err(Error::MalformedBox(format!(
                "truncated box header at offset {begin}: {n} of 8 bytes"
            )))
        }
    }

    let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let kind = FourCc([head[4], head[5], head[6], head[7]]);

    let (size, header_len) = if size32 == 1 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext).map_err(|_| {
            Error::MalformedBox(format!("truncated extended size for '{kind}' at offset {begin}"))
        })?;
        (u64::from_be_bytes(ext), 16u64)
    } else {
        (size32 as u64, 8u64)
    };

    let data_start = begin + header_len;
    let end = if size32 == 0 {
        // Extends to the end of the enclosing container; the caller fills
        // this in from its own known end. Only the 32-bit size field can
        // signal this; an extended size of 0 is just an undersized box.
        None
    } else {
        if size < header_len {
            return Err(Error::MalformedBox(format!(
                "box '{kind}' at offset {begin} declares size {size}, smaller than its {header_len}-byte header"
            )));
        }
        Some(begin + size)
    };

    Ok(Some(BoxHeader { kind, begin, data_start, end }))
}

/// Parse the top-level box list of a file of `file_len` bytes.
pub fn parse_file<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Vec<BoxNode>> {
    parse_children(reader, 0, Some(file_len), None)
}

/// Parse sibling boxes from `start` up to `parent_end`.
///
/// Terminates when the parent's end is reached, `count` children have been
/// read, or (only with an unknown parent end) the stream ends. A child
/// overrunning a known parent end is malformed, as is an exact `count` that
/// cannot be satisfied.
pub fn parse_children<R: Read + Seek>(
    reader: &mut R,
    start: u64,
    parent_end: Option<u64>,
    count: Option<usize>,
) -> Result<Vec<BoxNode>> {
    let mut children = Vec::new();
    let mut pos = start;

    loop {
        if count.is_some_and(|n| children.len() == n) {
            return Ok(children);
        }
        if let Some(end) = parent_end {
            if pos == end {
                break;
            }
            if pos > end || end - pos < 8 {
                return Err(Error::MalformedBox(format!(
                    "{} stray bytes at offset {pos} inside container ending at {end}",
                    end.saturating_sub(pos)
                )));
            }
        }

        let Some(mut header) = read_header(reader, pos)? else {
            if parent_end.is_some() {
                return Err(Error::MalformedBox(format!(
                    "container ends at {} but stream ended at {pos}",
                    parent_end.unwrap()
                )));
            }
            break;
        };

        match (header.end, parent_end) {
            (Some(child_end), Some(end)) if child_end > end => {
                return Err(Error::MalformedBox(format!(
                    "box '{}' at offset {pos} ends at {child_end}, past its container's end {end}",
                    header.kind
                )));
            }
            // size 0: runs to the end of the parent.
            (None, Some(end)) => header.end = Some(end),
            _ => {}
        }

        let node = parse_payload(reader, header)?;
        children.push(node);

        match header.end {
            Some(end) => pos = end,
            // Unbounded box: legal only at the outermost level, and nothing
            // can follow it.
            None => break,
        }
    }

    if let Some(n) = count {
        if children.len() < n {
            return Err(Error::MalformedBox(format!(
                "expected {n} child boxes, found {}",
                children.len()
            )));
        }
    }
    Ok(children)
}

/// Format-specific field parser: dispatches on the box type.
fn parse_payload<R: Read + Seek>(reader: &mut R, header: BoxHeader) -> Result<BoxNode> {
    let node = match header.kind {
        FourCc::META => {
            let (_, _) = read_full_box(reader, &header)?;
            let end = known_end(&header)?;
            let children = parse_children(reader, header.data_start + 4, Some(end), None)?;
            BoxNode { header, payload: BoxPayload::Container, children }
        }
        FourCc::PITM => {
            let (version, _) = read_full_box(reader, &header)?;
            let item_id = match version {
                0 => read_be_uint(reader, 2)? as u32,
                _ => read_be_uint(reader, 4)? as u32,
            };
            BoxNode { header, payload: BoxPayload::PrimaryItem { item_id }, children: vec![] }
        }
        FourCc::IREF => parse_iref(reader, header)?,
        FourCc::ILOC => parse_iloc(reader, header)?,
        FourCc::IDAT => BoxNode { header, payload: BoxPayload::ItemData, children: vec![] },
        _ => BoxNode { header, payload: BoxPayload::Opaque, children: vec![] },
    };
    Ok(node)
}

fn parse_iref<R: Read + Seek>(reader: &mut R, header: BoxHeader) -> Result<BoxNode> {
    let (version, _) = read_full_box(reader, &header)?;
    let id_width = if version == 0 { 2 } else { 4 };
    let end = known_end(&header)?;

    // Each child is a reference box: header, from-id, count, to-ids. The
    // reference type tag is irrelevant here; all edges are followed.
    let mut edges = Vec::new();
    let mut pos = header.data_start + 4;
    while pos < end {
        let Some(child) = read_header(reader, pos)? else {
            return Err(Error::MalformedBox(format!(
                "iref at offset {} truncated at {pos}",
                header.begin
            )));
        };
        let child_end = match child.end {
            Some(e) if e <= end => e,
            _ => {
                return Err(Error::MalformedBox(format!(
                    "reference box '{}' at offset {pos} overruns iref end {end}",
                    child.kind
                )))
            }
        };

        let from_id = read_be_uint(reader, id_width)? as u32;
        let ref_count = read_be_uint(reader, 2)? as usize;
        let needed = child.data_start + (id_width as u64) * (1 + ref_count as u64) + 2;
        if needed > child_end {
            return Err(Error::MalformedBox(format!(
                "reference box '{}' at offset {pos} declares {ref_count} references but has too few bytes",
                child.kind
            )));
        }
        let mut to_ids = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            to_ids.push(read_be_uint(reader, id_width)? as u32);
        }
        edges.push((from_id, to_ids));
        pos = child_end;
    }

    Ok(BoxNode { header, payload: BoxPayload::ItemReferences { edges }, children: vec![] })
}

fn parse_iloc<R: Read + Seek>(reader: &mut R, header: BoxHeader) -> Result<BoxNode> {
    let (version, _) = read_full_box(reader, &header)?;
    if version > 2 {
        return Err(Error::UnsupportedFeature(format!("iloc version {version}")));
    }

    let sizes = read_be_uint(reader, 2)? as u16;
    let offset_size = ((sizes >> 12) & 0xf) as usize;
    let length_size = ((sizes >> 8) & 0xf) as usize;
    let base_offset_size = ((sizes >> 4) & 0xf) as usize;
    // Index size in v1/v2; reserved bits in v0.
    let index_size = if version >= 1 { (sizes & 0xf) as usize } else { 0 };
    for (name, s) in [
        ("offset_size", offset_size),
        ("length_size", length_size),
        ("base_offset_size", base_offset_size),
        ("index_size", index_size),
    ] {
        if s != 0 && s != 4 && s != 8 {
            return Err(Error::MalformedBox(format!("iloc {name} {s} (must be 0, 4 or 8)")));
        }
    }

    let item_count = if version < 2 {
        read_be_uint(reader, 2)? as usize
    } else {
        read_be_uint(reader, 4)? as usize
    };

    let mut items = Vec::with_capacity(item_count);
    for _ in 0..item_count {
        let item_id = if version < 2 {
            read_be_uint(reader, 2)? as u32
        } else {
            read_be_uint(reader, 4)? as u32
        };
        let construction_method = if version >= 1 {
            (read_be_uint(reader, 2)? & 0xf) as u8
        } else {
            0
        };
        let data_reference_index = read_be_uint(reader, 2)? as u16;
        let base_offset = read_be_uint(reader, base_offset_size)?;
        let extent_count = read_be_uint(reader, 2)? as usize;

        let mut extents = Vec::with_capacity(extent_count);
        for _ in 0..extent_count {
            if index_size > 0 {
                let _extent_index = read_be_uint(reader, index_size)?;
            }
            let offset = read_be_uint(reader, offset_size)?;
            let length = read_be_uint(reader, length_size)?;
            extents.push(ItemExtent { offset, length });
        }
        items.push(ItemLocation {
            item_id,
            construction_method,
            data_reference_index,
            base_offset,
            extents,
        });
    }

    Ok(BoxNode { header, payload: BoxPayload::ItemLocations { items }, children: vec![] })
}

/// Read the 4-byte version/flags prefix of a full box.
fn read_full_box<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> Result<(u8, u32)> {
    reader.seek(SeekFrom::Start(header.data_start))?;
    let mut vf = [0u8; 4];
    reader.read_exact(&mut vf).map_err(|_| {
        Error::MalformedBox(format!(
            "box '{}' at offset {} too small for its version/flags",
            header.kind, header.begin
        ))
    })?;
    Ok((vf[0], u32::from_be_bytes(vf) & 0x00ff_ffff))
}

fn known_end(header: &BoxHeader) -> Result<u64> {
    header.end.ok_or_else(|| {
        Error::MalformedBox(format!(
            "box '{}' at offset {} has no resolvable end",
            header.kind, header.begin
        ))
    })
}

/// Read an `n`-byte big-endian unsigned integer (n in {0, 2, 4, 8}).
/// A zero width reads nothing and yields 0.
fn read_be_uint<R: Read>(reader: &mut R, n: usize) -> Result<u64> {
    debug_assert!(matches!(n, 0 | 2 | 4 | 8));
    if n == 0 {
        return Ok(0);
    }
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf[8 - n..])
        .map_err(|_| Error::MalformedBox(format!("truncated {n}-byte field")))?;
    Ok(u64::from_be_bytes(buf))
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn plain_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_plain_header() {
        let buf = plain_box(b"free", &[0u8; 4]);
        let header = read_header(&mut Cursor::new(&buf), 0).unwrap().unwrap();
        assert_eq!(header.kind, FourCc(*b"free"));
        assert_eq!(header.begin, 0);
        assert_eq!(header.data_start, 8);
        assert_eq!(header.end, Some(12));
        assert_eq!(header.data_len(), Some(4));
    }

    #[test]
    fn test_extended_size_header() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(b"mdat");
        buf.extend_from_slice(&24u64.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        let header = read_header(&mut Cursor::new(&buf), 0).unwrap().unwrap();
        assert_eq!(header.data_start, 16);
        assert_eq!(header.end, Some(24));
    }

    #[test]
    fn test_size_zero_extends_to_parent_end() {
        let mut buf = plain_box(b"ftyp", b"heic");
        let tail_at = buf.len() as u64;
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(b"mdat");
        buf.extend_from_slice(&[0xAB; 20]);

        let file_len = buf.len() as u64;
        let boxes = parse_file(&mut Cursor::new(&buf), file_len).unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[1].header.begin, tail_at);
        assert_eq!(boxes[1].header.end, Some(file_len));
    }

    #[test]
    fn test_extended_size_zero_is_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(b"mdat");
        buf.extend_from_slice(&0u64.to_be_bytes());
        let err = read_header(&mut Cursor::new(&buf), 0).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_size_smaller_than_header_is_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"free");
        buf.extend_from_slice(&[0u8; 8]);
        let err = read_header(&mut Cursor::new(&buf), 0).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_child_overrunning_parent_is_malformed() {
        // Outer box claims 20 bytes but its child claims 32.
        let mut buf = Vec::new();
        buf.extend_from_slice(&20u32.to_be_bytes());
        buf.extend_from_slice(b"meta");
        buf.extend_from_slice(&[0u8; 4]); // version/flags
        buf.extend_from_slice(&32u32.to_be_bytes());
        buf.extend_from_slice(b"pitm");
        buf.extend_from_slice(&[0u8; 24]);
        let err = parse_file(&mut Cursor::new(&buf), 20).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_exact_count_shortfall_is_malformed() {
        let buf = plain_box(b"free", &[]);
        let err =
            parse_children(&mut Cursor::new(&buf), 0, Some(buf.len() as u64), Some(2)).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_pitm_versions() {
        let v0 = plain_box(b"pitm", &[0, 0, 0, 0, 0x12, 0x34]);
        let boxes = parse_file(&mut Cursor::new(&v0), v0.len() as u64).unwrap();
        assert_eq!(boxes[0].payload, BoxPayload::PrimaryItem { item_id: 0x1234 });

        let v1 = plain_box(b"pitm", &[1, 0, 0, 0, 0, 0x01, 0x00, 0x02]);
        let boxes = parse_file(&mut Cursor::new(&v1), v1.len() as u64).unwrap();
        assert_eq!(boxes[0].payload, BoxPayload::PrimaryItem { item_id: 0x0001_0002 });
    }

    #[test]
    fn test_iref_edges() {
        // iref v0 with one dimg reference: 1 -> [2, 3].
        let mut refbox = Vec::new();
        refbox.extend_from_slice(&0x0001u16.to_be_bytes()); // from
        refbox.extend_from_slice(&2u16.to_be_bytes()); // count
        refbox.extend_from_slice(&0x0002u16.to_be_bytes());
        refbox.extend_from_slice(&0x0003u16.to_be_bytes());
        let mut payload = vec![0, 0, 0, 0];
        payload.extend_from_slice(&plain_box(b"dimg", &refbox));
        let buf = plain_box(b"iref", &payload);

        let boxes = parse_file(&mut Cursor::new(&buf), buf.len() as u64).unwrap();
        assert_eq!(
            boxes[0].payload,
            BoxPayload::ItemReferences { edges: vec![(1, vec![2, 3])] }
        );
    }

    #[test]
    fn test_iloc_v0_roundtrip() {
        // v0, offset_size=4, length_size=4, base_offset_size=4, one item.
        let mut payload = vec![0, 0, 0, 0]; // version/flags
        payload.extend_from_slice(&0x4440u16.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes()); // item_count
        payload.extend_from_slice(&7u16.to_be_bytes()); // item_id
        payload.extend_from_slice(&0u16.to_be_bytes()); // data_reference_index
        payload.extend_from_slice(&100u32.to_be_bytes()); // base_offset
        payload.extend_from_slice(&1u16.to_be_bytes()); // extent_count
        payload.extend_from_slice(&0u32.to_be_bytes()); // extent_offset
        payload.extend_from_slice(&50u32.to_be_bytes()); // extent_length
        let buf = plain_box(b"iloc", &payload);

        let boxes = parse_file(&mut Cursor::new(&buf), buf.len() as u64).unwrap();
        let BoxPayload::ItemLocations { items } = &boxes[0].payload else {
            panic!("expected item locations");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, 7);
        assert_eq!(items[0].construction_method, 0);
        assert_eq!(items[0].base_offset, 100);
        assert_eq!(items[0].extents, vec![ItemExtent { offset: 0, length: 50 }]);
    }

    #[test]
    fn test_iloc_bad_size_nibble() {
        let mut payload = vec![0, 0, 0, 0];
        payload.extend_from_slice(&0x3440u16.to_be_bytes()); // offset_size=3
        payload.extend_from_slice(&0u16.to_be_bytes());
        let buf = plain_box(b"iloc", &payload);
        let err = parse_file(&mut Cursor::new(&buf), buf.len() as u64).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_meta_children_parsed() {
        let pitm = plain_box(b"pitm", &[0, 0, 0, 0, 0, 1]);
        let mut meta_payload = vec![0, 0, 0, 0];
        meta_payload.extend_from_slice(&pitm);
        let buf = plain_box(b"meta", &meta_payload);

        let boxes = parse_file(&mut Cursor::new(&buf), buf.len() as u64).unwrap();
        let meta = find_box(&boxes, FourCc::META).unwrap();
        let pitm = meta.child(FourCc::PITM).unwrap();
        assert_eq!(pitm.payload, BoxPayload::PrimaryItem { item_id: 1 });
    }
}
