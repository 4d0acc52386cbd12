//! Byte-extent model and primary-item extent resolution.
//!
//! For ISOBMFF-family files that carry item metadata (HEIC/AVIF and
//! friends), the content digest covers only the payload extents of the
//! primary item and everything it references, so rewriting EXIF or other
//! replaceable metadata leaves the digest unchanged.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::boxes::{find_box, BoxNode, BoxPayload, FourCc, ItemLocation};
use crate::error::{Error, Result};

/// A contiguous byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub pos: u64,
    pub len: u64,
}

impl Extent {
    pub fn new(pos: u64, len: u64) -> Self {
        Self { pos, len }
    }

    pub fn end(&self) -> u64 {
        self.pos + self.len
    }
}

/// Merge adjacent contiguous extents, preserving order.
///
/// Only a trailing extent whose end equals the next extent's start is
/// combined; nothing is sorted and overlapping ranges are left alone. The
/// output must be byte-for-byte what a sequential reader would extract.
pub fn merge_adjacent(extents: Vec<Extent>) -> Vec<Extent> {
    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents {
        match merged.last_mut() {
            Some(last) if last.end() == extent.pos => last.len += extent.len,
            _ => merged.push(extent),
        }
    }
    merged
}

/// Resolve the payload extents of the primary item from a parsed box tree.
///
/// Returns `Ok(None)` when the file has no usable item metadata (no `meta`,
/// `pitm` or `iloc`, or the resolved extent list is empty) — the plain-video
/// case where the content digest covers the whole file.
pub fn resolve_primary_extents(boxes: &[BoxNode]) -> Result<Option<Vec<Extent>>> {
    let Some(meta) = find_box(boxes, FourCc::META) else {
        return Ok(None);
    };
    let Some(primary_id) = primary_item_id(meta) else {
        return Ok(None);
    };
    let Some(locations) = item_locations(meta) else {
        return Ok(None);
    };

    let item_ids = reachable_items(meta, primary_id);
    let by_id: HashMap<u32, &ItemLocation> =
        locations.iter().map(|loc| (loc.item_id, loc)).collect();
    let idat = meta.child(FourCc::IDAT).map(|b| b.header);

    let mut extents = Vec::new();
    for id in item_ids {
        // Referenced ids without a location entry carry no payload bytes
        // (e.g. pure-metadata items); they contribute nothing.
        let Some(loc) = by_id.get(&id) else { continue };
        if loc.data_reference_index != 0 {
            return Err(Error::UnsupportedFeature(format!(
                "item {id} uses external data reference {}",
                loc.data_reference_index
            )));
        }

        match loc.construction_method {
            0 => {
                // Offsets are absolute file positions.
                for ex in &loc.extents {
                    let pos = checked_position(id, &[loc.base_offset, ex.offset])?;
                    extents.push(checked_extent(id, pos, ex.length)?);
                }
            }
            1 => {
                let Some(idat) = idat else {
                    return Err(Error::MalformedBox(format!(
                        "item {id} addresses idat but the meta box has none"
                    )));
                };
                let idat_end = idat.end.ok_or_else(|| {
                    Error::MalformedBox("idat box has no resolvable end".into())
                })?;
                for ex in &loc.extents {
                    let pos =
                        checked_position(id, &[idat.data_start, loc.base_offset, ex.offset])?;
                    let extent = checked_extent(id, pos, ex.length)?;
                    if extent.end() > idat_end {
                        return Err(Error::MalformedBox(format!(
                            "item {id} extent [{pos}, {}) overruns idat end {idat_end}",
                            extent.end()
                        )));
                    }
                    extents.push(extent);
                }
            }
            method => {
                return Err(Error::UnsupportedFeature(format!(
                    "item {id} uses construction method {method}"
                )));
            }
        }
    }

    let merged = merge_adjacent(extents);
    if merged.is_empty() {
        return Ok(None);
    }
    Ok(Some(merged))
}

/// Sum offset components with overflow detection. Offsets near `u64::MAX`
/// only occur in corrupt location tables; wrapping silently would hash the
/// wrong bytes.
fn checked_position(item_id: u32, parts: &[u64]) -> Result<u64> {
    parts
        .iter()
        .try_fold(0u64, |acc, &part| acc.checked_add(part))
        .ok_or_else(|| {
            Error::MalformedBox(format!("item {item_id} extent offset overflows u64"))
        })
}

fn checked_extent(item_id: u32, pos: u64, len: u64) -> Result<Extent> {
    if pos.checked_add(len).is_none() {
        return Err(Error::MalformedBox(format!(
            "item {item_id} extent [{pos}, +{len}) overflows u64"
        )));
    }
    Ok(Extent::new(pos, len))
}

fn primary_item_id(meta: &BoxNode) -> Option<u32> {
    match meta.child(FourCc::PITM)?.payload {
        BoxPayload::PrimaryItem { item_id } => Some(item_id),
        _ => None,
    }
}

fn item_locations(meta: &BoxNode) -> Option<&[ItemLocation]> {
    match &meta.child(FourCc::ILOC)?.payload {
        BoxPayload::ItemLocations { items } => Some(items),
        _ => None,
    }
}

/// Transitive closure of item ids reachable from the primary item over
/// `iref` from->to edges, in breadth-first order. Each id is enqueued at
/// most once, so reference cycles dedup silently instead of looping.
fn reachable_items(meta: &BoxNode, primary_id: u32) -> Vec<u32> {
    let edges: HashMap<u32, &Vec<u32>> = match meta.child(FourCc::IREF).map(|b| &b.payload) {
        Some(BoxPayload::ItemReferences { edges }) => {
            edges.iter().map(|(from, tos)| (*from, tos)).collect()
        }
        _ => HashMap::new(),
    };

    let mut seen: HashSet<u32> = HashSet::from([primary_id]);
    let mut queue: VecDeque<u32> = VecDeque::from([primary_id]);
    let mut order = Vec::new();
    while let Some(id) = queue.pop_front() {
        order.push(id);
        if let Some(tos) = edges.get(&id) {
            for &to in *tos {
                if seen.insert(to) {
                    queue.push_back(to);
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{BoxHeader, ItemExtent};

    fn ex(pos: u64, len: u64) -> Extent {
        Extent::new(pos, len)
    }

    #[test]
    fn test_merge_adjacent_contiguous() {
        let merged = merge_adjacent(vec![ex(0, 10), ex(10, 5), ex(20, 3)]);
        assert_eq!(merged, vec![ex(0, 15), ex(20, 3)]);
    }

    #[test]
    fn test_merge_preserves_order_and_overlap() {
        // Out-of-order and overlapping ranges are kept as-is.
        let input = vec![ex(50, 10), ex(0, 10), ex(5, 10)];
        assert_eq!(merge_adjacent(input.clone()), input);
    }

    #[test]
    fn test_merge_chains_runs() {
        let merged = merge_adjacent(vec![ex(0, 4), ex(4, 4), ex(8, 4), ex(16, 1)]);
        assert_eq!(merged, vec![ex(0, 12), ex(16, 1)]);
    }

    fn meta_node(children: Vec<BoxNode>) -> Vec<BoxNode> {
        vec![BoxNode {
            header: synthetic_header(FourCc::META, 0, 1024),
            payload: BoxPayload::Container,
            children,
        }]
    }

    fn synthetic_header(kind: FourCc, begin: u64, end: u64) -> BoxHeader {
        BoxHeader { kind, begin, data_start: begin + 8, end: Some(end) }
    }

    fn pitm(item_id: u32) -> BoxNode {
        BoxNode {
            header: synthetic_header(FourCc::PITM, 0, 0),
            payload: BoxPayload::PrimaryItem { item_id },
            children: vec![],
        }
    }

    fn iref(edges: Vec<(u32, Vec<u32>)>) -> BoxNode {
        BoxNode {
            header: synthetic_header(FourCc::IREF, 0, 0),
            payload: BoxPayload::ItemReferences { edges },
            children: vec![],
        }
    }

    fn iloc(items: Vec<ItemLocation>) -> BoxNode {
        BoxNode {
            header: synthetic_header(FourCc::ILOC, 0, 0),
            payload: BoxPayload::ItemLocations { items },
            children: vec![],
        }
    }

    fn file_item(item_id: u32, base_offset: u64, extents: Vec<ItemExtent>) -> ItemLocation {
        ItemLocation {
            item_id,
            construction_method: 0,
            data_reference_index: 0,
            base_offset,
            extents,
        }
    }

    #[test]
    fn test_no_meta_means_whole_file() {
        assert_eq!(resolve_primary_extents(&[]).unwrap(), None);
    }

    #[test]
    fn test_missing_pitm_means_whole_file() {
        let boxes = meta_node(vec![iloc(vec![])]);
        assert_eq!(resolve_primary_extents(&boxes).unwrap(), None);
    }

    #[test]
    fn test_single_item_file_offsets() {
        let boxes = meta_node(vec![
            pitm(1),
            iloc(vec![file_item(1, 100, vec![ItemExtent { offset: 0, length: 50 }])]),
        ]);
        assert_eq!(resolve_primary_extents(&boxes).unwrap(), Some(vec![ex(100, 50)]));
    }

    #[test]
    fn test_references_resolved_in_bfs_order() {
        let boxes = meta_node(vec![
            pitm(1),
            iref(vec![(1, vec![2, 3])]),
            iloc(vec![
                file_item(1, 0, vec![ItemExtent { offset: 0, length: 10 }]),
                file_item(2, 200, vec![ItemExtent { offset: 0, length: 5 }]),
                file_item(3, 10, vec![ItemExtent { offset: 0, length: 4 }]),
            ]),
        ]);
        // Order follows resolution (1, 2, 3), not file position.
        assert_eq!(
            resolve_primary_extents(&boxes).unwrap(),
            Some(vec![ex(0, 10), ex(200, 5), ex(10, 4)])
        );
    }

    #[test]
    fn test_reference_cycle_dedups() {
        let boxes = meta_node(vec![
            pitm(1),
            iref(vec![(1, vec![2]), (2, vec![1])]),
            iloc(vec![
                file_item(1, 0, vec![ItemExtent { offset: 0, length: 8 }]),
                file_item(2, 8, vec![ItemExtent { offset: 0, length: 8 }]),
            ]),
        ]);
        assert_eq!(resolve_primary_extents(&boxes).unwrap(), Some(vec![ex(0, 16)]));
    }

    #[test]
    fn test_referenced_item_without_location_is_skipped() {
        let boxes = meta_node(vec![
            pitm(1),
            iref(vec![(1, vec![9])]),
            iloc(vec![file_item(1, 0, vec![ItemExtent { offset: 0, length: 8 }])]),
        ]);
        assert_eq!(resolve_primary_extents(&boxes).unwrap(), Some(vec![ex(0, 8)]));
    }

    #[test]
    fn test_external_data_reference_unsupported() {
        let mut item = file_item(1, 0, vec![ItemExtent { offset: 0, length: 8 }]);
        item.data_reference_index = 1;
        let boxes = meta_node(vec![pitm(1), iloc(vec![item])]);
        let err = resolve_primary_extents(&boxes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));
    }

    #[test]
    fn test_idat_extent_inside_bounds() {
        let idat = BoxNode {
            header: synthetic_header(FourCc::IDAT, 300, 340),
            payload: BoxPayload::ItemData,
            children: vec![],
        };
        let mut item = file_item(1, 4, vec![ItemExtent { offset: 0, length: 20 }]);
        item.construction_method = 1;
        let boxes = meta_node(vec![pitm(1), iloc(vec![item]), idat]);
        // idat data starts at 308; 308 + 4 = 312, 20 bytes ends at 332 <= 340.
        assert_eq!(resolve_primary_extents(&boxes).unwrap(), Some(vec![ex(312, 20)]));
    }

    #[test]
    fn test_idat_extent_overrun_is_malformed() {
        let idat = BoxNode {
            header: synthetic_header(FourCc::IDAT, 300, 340),
            payload: BoxPayload::ItemData,
            children: vec![],
        };
        let mut item = file_item(1, 4, vec![ItemExtent { offset: 0, length: 64 }]);
        item.construction_method = 1;
        let boxes = meta_node(vec![pitm(1), iloc(vec![item]), idat]);
        let err = resolve_primary_extents(&boxes).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_offset_overflow_is_malformed() {
        // Corrupt iloc with 8-byte offsets near u64::MAX; the sum must
        // surface as MalformedBox, never wrap.
        let boxes = meta_node(vec![
            pitm(1),
            iloc(vec![file_item(
                1,
                u64::MAX - 4,
                vec![ItemExtent { offset: 8, length: 50 }],
            )]),
        ]);
        let err = resolve_primary_extents(&boxes).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_length_overflow_is_malformed() {
        let boxes = meta_node(vec![
            pitm(1),
            iloc(vec![file_item(
                1,
                100,
                vec![ItemExtent { offset: 0, length: u64::MAX }],
            )]),
        ]);
        let err = resolve_primary_extents(&boxes).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_idat_offset_overflow_is_malformed() {
        let idat = BoxNode {
            header: synthetic_header(FourCc::IDAT, 300, 340),
            payload: BoxPayload::ItemData,
            children: vec![],
        };
        let mut item = file_item(1, u64::MAX - 8, vec![ItemExtent { offset: 16, length: 4 }]);
        item.construction_method = 1;
        let boxes = meta_node(vec![pitm(1), iloc(vec![item]), idat]);
        let err = resolve_primary_extents(&boxes).unwrap_err();
        assert!(matches!(err, Error::MalformedBox(_)));
    }

    #[test]
    fn test_unknown_construction_method_unsupported() {
        let mut item = file_item(1, 0, vec![ItemExtent { offset: 0, length: 8 }]);
        item.construction_method = 2;
        let boxes = meta_node(vec![pitm(1), iloc(vec![item])]);
        let err = resolve_primary_extents(&boxes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));
    }
}
