//! Splitting an index into read segments.

use tracing::debug;

use crate::index::IndexEntry;

/// A contiguous byte span of a data file fetched with one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u64,
    pub length: u64,
    /// Entries to hand out from this span; skipped entries inside the span
    /// are read but not listed.
    pub blocks: Vec<IndexEntry>,
}

impl DataSegment {
    fn starting_at(entry: &IndexEntry) -> Self {
        Self {
            offset: entry.offset,
            length: entry.length as u64,
            blocks: vec![*entry],
        }
    }

    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Group index entries into segments of at most `read_buffer_size` bytes.
///
/// A segment grows while the next accepted entry starts at or after its end
/// and the whole span stays within the limit. An entry larger than the
/// limit becomes a segment of its own. Entries rejected by `accept` do not
/// close the current segment. Entries reaching past `data_len` point at
/// bytes that never made it to the data file and are dropped.
pub fn split_segments<F>(
    entries: &[IndexEntry],
    data_len: u64,
    read_buffer_size: u64,
    mut accept: F,
) -> Vec<DataSegment>
where
    F: FnMut(&IndexEntry) -> bool,
{
    let mut segments = Vec::new();
    let mut current: Option<DataSegment> = None;

    for entry in entries {
        let end = match entry.end() {
            Some(end) if end <= data_len => end,
            end => {
                debug!(
                    block_id = %entry.block_id,
                    offset = entry.offset,
                    ?end,
                    data_len,
                    "index entry beyond data file, dropping"
                );
                continue;
            }
        };
        if !accept(entry) {
            continue;
        }

        match current.as_mut() {
            Some(segment)
                if entry.offset >= segment.end() && end - segment.offset <= read_buffer_size =>
            {
                segment.length = end - segment.offset;
                segment.blocks.push(*entry);
            }
            _ => {
                if let Some(done) = current.replace(DataSegment::starting_at(entry)) {
                    segments.push(done);
                }
            }
        }
    }
    segments.extend(current);
    segments
}
