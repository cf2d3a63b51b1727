//! Per-document segments inside a value index record
//!
//! A record is a concatenation of segments, at most one per document:
//!
//! ```text
//! [doc id u32 BE][node count u32 BE][byte length u32 BE][delta-encoded node ids]
//! ```
//!
//! The byte length lets readers skip documents outside the query's document
//! set without decoding their ids.

use crate::dom::NodeId;
use crate::errors::{StorageError, StorageResult};

const HEADER_LEN: usize = 12;

/// Append one segment. `ids` must be sorted and deduplicated.
pub fn encode_segment(doc_id: u32, ids: &[NodeId], out: &mut Vec<u8>) {
    let mut body = Vec::new();
    let mut previous: Option<&NodeId> = None;
    for id in ids {
        id.write_delta(previous, &mut body);
        previous = Some(id);
    }
    out.extend_from_slice(&doc_id.to_be_bytes());
    out.extend_from_slice(&(ids.len() as u32).to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
}

/// A segment whose ids have not been decoded yet
#[derive(Debug, Clone, Copy)]
pub struct RawSegment<'a> {
    pub doc_id: u32,
    pub count: u32,
    body: &'a [u8],
    whole: &'a [u8],
}

impl<'a> RawSegment<'a> {
    pub fn node_ids(&self) -> StorageResult<Vec<NodeId>> {
        let mut ids = Vec::with_capacity(self.count as usize);
        let mut pos = 0;
        let mut previous: Option<NodeId> = None;
        for _ in 0..self.count {
            let id = NodeId::read_delta(previous.as_ref(), self.body, &mut pos)?;
            ids.push(id.clone());
            previous = Some(id);
        }
        Ok(ids)
    }

    /// The encoded segment including its header
    pub fn as_bytes(&self) -> &'a [u8] {
        self.whole
    }
}

/// Iterate the segments of a record
pub struct Segments<'a> {
    data: &'a [u8],
    pos: usize,
}

pub fn segments(data: &[u8]) -> Segments<'_> {
    Segments { data, pos: 0 }
}

impl<'a> Iterator for Segments<'a> {
    type Item = StorageResult<RawSegment<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        let Some(header) = self.data.get(start..start + HEADER_LEN) else {
            self.pos = self.data.len();
            return Some(Err(StorageError::storage("truncated index segment header")));
        };
        let word = |i: usize| u32::from_be_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        let (doc_id, count, len) = (word(0), word(4), word(8) as usize);
        let body_start = start + HEADER_LEN;
        let Some(body) = self.data.get(body_start..body_start + len) else {
            self.pos = self.data.len();
            return Some(Err(StorageError::storage("truncated index segment body")));
        };
        self.pos = body_start + len;
        Some(Ok(RawSegment {
            doc_id,
            count,
            body,
            whole: &self.data[start..self.pos],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<NodeId> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_segments_split_by_document() {
        let mut record = Vec::new();
        encode_segment(1, &ids(&["1.1", "1.2.1"]), &mut record);
        encode_segment(5, &ids(&["1"]), &mut record);

        let parsed: Vec<_> = segments(&record).collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].doc_id, 1);
        assert_eq!(parsed[0].node_ids().unwrap(), ids(&["1.1", "1.2.1"]));
        assert_eq!(parsed[1].doc_id, 5);
        assert_eq!(parsed[1].count, 1);
    }

    #[test]
    fn test_raw_bytes_can_be_copied_forward() {
        let mut record = Vec::new();
        encode_segment(2, &ids(&["1.3"]), &mut record);
        encode_segment(3, &ids(&["1.4"]), &mut record);

        let mut kept = Vec::new();
        for seg in segments(&record) {
            let seg = seg.unwrap();
            if seg.doc_id != 2 {
                kept.extend_from_slice(seg.as_bytes());
            }
        }
        let parsed: Vec<_> = segments(&kept).collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].doc_id, 3);
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let mut record = Vec::new();
        encode_segment(1, &ids(&["1.1"]), &mut record);
        record.truncate(record.len() - 1);
        assert!(segments(&record).next().unwrap().is_err());
    }
}
