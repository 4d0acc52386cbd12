//! Content-stable hashing and per-directory hash depots for a personal
//! photo/video library.
//!
//! The hash engine computes two digests per file: one over the whole file
//! and one over only the format-stable content bytes, so a metadata rewrite
//! (EXIF edits, container re-muxing) can be told apart from real pixel or
//! audio damage. For ISOBMFF-family files (HEIC/AVIF/MP4) the stable bytes
//! are located by parsing the box tree and resolving the primary item's
//! extents; every other format hashes the whole file for both digests.
//!
//! Records are persisted per directory in a reserved depot file
//! ([`record::DEPOT_FILENAME`]); [`depot::Depot`] keeps those files
//! consistent across recomputation, algorithm upgrades, moves and merges.

pub mod boxes;
pub mod depot;
pub mod engine;
pub mod error;
pub mod extent;
pub mod record;
pub mod strategy;

pub use depot::{ConflictResolver, Depot, FixedResolver, Resolution};
pub use engine::{ContentHashEngine, HashOutcome, ALGORITHM_VERSION};
pub use error::{Error, Result};
pub use extent::Extent;
pub use record::{is_reserved_name, HashRecord, HashRecordSet, DEPOT_FILENAME};
