//! Range planning and on-disk naming of parts

use partfetch_types::RangeSpec;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Suffix marking an artifact that is still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Split `size` bytes into parts of at most `ceiling` bytes
///
/// Files at or below the ceiling become a single part. An empty file has no
/// ranges at all.
pub fn partition(size: u64, ceiling: u64) -> Vec<RangeSpec> {
    if size == 0 {
        return Vec::new();
    }
    let ceiling = ceiling.max(1);
    let total_parts = size.div_ceil(ceiling);
    let total = u32::try_from(total_parts).unwrap_or(u32::MAX);

    (0..total_parts)
        .map(|i| {
            let start = i * ceiling;
            let end = (start + ceiling).min(size) - 1;
            RangeSpec::new(start, end, i as u32, total)
        })
        .collect()
}

/// Final path of the artifact holding `range`
///
/// Single-part files keep their destination name; multi-part files become
/// `<stem>.partNNN<.ext>` next to it.
pub fn part_path(dest: &Path, range: &RangeSpec) -> PathBuf {
    if range.is_single() {
        return dest.to_path_buf();
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name.as_str(), ""),
    };
    dest.with_file_name(format!("{}.part{:03}{}", stem, range.part_index + 1, ext))
}

/// In-progress path for a final artifact path
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name: OsString = final_path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}
