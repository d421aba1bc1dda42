use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// -------------------------------------------------------------------------------------------------
// LineTag
// -------------------------------------------------------------------------------------------------
/// The `(author, tick)` pair attributed to a run of lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineTag {
    pub author: i32,
    pub tick: u32,
}

impl LineTag {
    pub fn new(author: i32, tick: u32) -> LineTag {
        LineTag { author, tick }
    }
}

// -------------------------------------------------------------------------------------------------
// LineIndex
// -------------------------------------------------------------------------------------------------
/// The ordered interval map of one file: lines are 1-based, each key starts an
/// interval extending to the next key (the last one to end-of-file), and the
/// union of intervals is exactly `[1, line_count]`.
///
/// Adjacent intervals with equal tags are not fused automatically.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineIndex {
    map: BTreeMap<u32, LineTag>,
    len: u32,
}

impl LineIndex {
    /// A file of `len` lines wholly attributed to `tag`.
    pub fn new(len: u32, tag: LineTag) -> LineIndex {
        let mut map = BTreeMap::new();
        if len > 0 {
            map.insert(1, tag);
        }
        LineIndex { map, len }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `n` lines attributed to `tag` so that the first of them becomes
    /// line `line`; lines at and after `line` shift down by `n`.
    ///
    /// `line` must lie in `[1, len + 1]`.
    pub fn insert_at(&mut self, line: u32, n: u32, tag: LineTag) {
        assert!(n > 0, "insertion of zero lines");
        assert!(
            (1..=self.len + 1).contains(&line),
            "insert at line {line} outside [1, {}]",
            self.len + 1
        );

        let tail = self.map.split_off(&line);
        // A mid-interval split leaves the suffix of the containing interval
        // without a boundary; carry its tag to the shifted position.
        let carry = if line <= self.len && tail.keys().next() != Some(&line) {
            let (_, &t) = self
                .map
                .range(..line)
                .next_back()
                .expect("interval containing the split point");
            Some(t)
        } else {
            None
        };
        for (k, v) in tail {
            self.map.insert(k + n, v);
        }
        if let Some(t) = carry {
            self.map.insert(line + n, t);
        }
        self.map.insert(line, tag);
        self.len += n;
    }

    /// Remove lines `[start, end)`, reporting `(tag, count)` for every removed
    /// sub-interval in line order. Lines after `end` shift up.
    ///
    /// Requires `1 <= start < end <= len + 1`.
    pub fn delete_range<F: FnMut(LineTag, u32)>(&mut self, start: u32, end: u32, mut emit: F) {
        assert!(
            start >= 1 && start < end && end <= self.len + 1,
            "delete range [{start}, {end}) outside [1, {}]",
            self.len + 1
        );

        let tail = self.map.split_off(&start);

        // Segment starts covering [start, end), with their tags.
        let mut segments: Vec<(u32, LineTag)> = Vec::new();
        if tail.keys().next() != Some(&start) {
            let (_, &t) = self
                .map
                .range(..start)
                .next_back()
                .expect("interval containing the deletion start");
            segments.push((start, t));
        }
        for (&k, &v) in tail.range(..end) {
            segments.push((k, v));
        }
        for (i, &(seg_start, tag)) in segments.iter().enumerate() {
            let seg_end = segments.get(i + 1).map(|s| s.0).unwrap_or(end);
            emit(tag, seg_end - seg_start);
        }

        // The suffix of the interval containing `end` survives; it now starts
        // at `start`.
        let removed = end - start;
        let carry = if end <= self.len && !tail.contains_key(&end) {
            Some(segments.last().expect("non-empty deletion").1)
        } else {
            None
        };
        for (k, v) in tail {
            if k >= end {
                self.map.insert(k - removed, v);
            }
        }
        if let Some(t) = carry {
            self.map.insert(start, t);
        }
        self.len -= removed;
        if self.len == 0 {
            self.map.clear();
        }
    }

    /// In-order iteration over `(start, end, tag)` intervals; `end` is
    /// exclusive.
    pub fn scan(&self) -> impl Iterator<Item = (u32, u32, LineTag)> + '_ {
        let ends = self
            .map
            .keys()
            .skip(1)
            .copied()
            .chain(std::iter::once(self.len + 1));
        self.map
            .iter()
            .zip(ends)
            .map(|((&start, &tag), end)| (start, end, tag))
    }

    /// The tag of a single line. Panics outside `[1, len]`.
    pub fn tag_at(&self, line: u32) -> LineTag {
        assert!((1..=self.len).contains(&line));
        *self
            .map
            .range(..=line)
            .next_back()
            .expect("interval containing the line")
            .1
    }

    /// Expand into one tag per line. Used by merge reconciliation.
    pub fn to_lines(&self) -> Vec<LineTag> {
        let mut out = Vec::with_capacity(self.len as usize);
        for (start, end, tag) in self.scan() {
            for _ in start..end {
                out.push(tag);
            }
        }
        out
    }

    /// Rebuild from one tag per line, fusing equal neighbours.
    pub fn from_lines(lines: &[LineTag]) -> LineIndex {
        let mut map = BTreeMap::new();
        let mut prev: Option<LineTag> = None;
        for (i, &tag) in lines.iter().enumerate() {
            if prev != Some(tag) {
                map.insert(i as u32 + 1, tag);
                prev = Some(tag);
            }
        }
        LineIndex {
            map,
            len: lines.len() as u32,
        }
    }

    /// Check the structural invariant: contiguous intervals whose union is
    /// `[1, len]`. Used by tests and by the engine's consistency checks.
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.len == 0 {
            return if self.map.is_empty() {
                Ok(())
            } else {
                Err("empty file with intervals".to_string())
            };
        }
        match self.map.keys().next() {
            Some(&1) => {}
            other => return Err(format!("first interval starts at {other:?}, not 1")),
        }
        if let Some(&last) = self.map.keys().next_back() {
            if last > self.len {
                return Err(format!("interval start {last} beyond length {}", self.len));
            }
        }
        let mut covered = 0u32;
        for (start, end, _) in self.scan() {
            if end <= start {
                return Err(format!("empty interval at {start}"));
            }
            covered += end - start;
        }
        if covered != self.len {
            return Err(format!("intervals cover {covered} of {} lines", self.len));
        }
        Ok(())
    }
}
