use git2::{Oid, Repository};
use std::collections::HashMap;
use std::rc::Rc;

use crate::errors::{Error, Result};

/// How much of a blob's head is sniffed for NUL bytes, matching git's
/// binary-detection heuristic.
pub const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// Files with more lines than this are treated as binary: no line-level
/// analysis is meaningful at that size.
pub const MAX_TEXT_LINES: usize = 1_000_000;

// -------------------------------------------------------------------------------------------------
// BlobFacts
// -------------------------------------------------------------------------------------------------
/// A blob's raw bytes plus the derived facts every downstream stage needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobFacts {
    pub id: Oid,
    pub bytes: Vec<u8>,
    pub binary: bool,
    pub line_count: usize,
}

impl BlobFacts {
    pub fn derive(id: Oid, bytes: Vec<u8>) -> BlobFacts {
        let line_count = count_lines(&bytes);
        let binary = is_binary(&bytes, line_count);
        BlobFacts {
            id,
            bytes,
            binary,
            line_count,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Number of `\n` terminators, plus one for a non-empty unterminated tail.
pub fn count_lines(bytes: &[u8]) -> usize {
    let terminated = bytes.iter().filter(|&&b| b == b'\n').count();
    match bytes.last() {
        Some(&b'\n') | None => terminated,
        Some(_) => terminated + 1,
    }
}

/// NUL in the first 8 KiB, or a line count beyond the text threshold.
pub fn is_binary(bytes: &[u8], line_count: usize) -> bool {
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    sniff.contains(&0) || line_count > MAX_TEXT_LINES
}

/// Split into lines without terminators; the token unit of line diffing.
pub fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::with_capacity(count_lines(bytes));
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            out.push(&bytes[start..i]);
            start = i + 1;
        }
    }
    if start < bytes.len() {
        out.push(&bytes[start..]);
    }
    out
}

/// Hash one line into the diff token. With `ignore_whitespace`, blanks, tabs
/// and carriage returns do not participate.
pub fn hash_line(line: &[u8], ignore_whitespace: bool) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if ignore_whitespace {
        for &b in line {
            if !matches!(b, b' ' | b'\t' | b'\r') {
                b.hash(&mut hasher);
            }
        }
    } else {
        line.hash(&mut hasher);
    }
    hasher.finish()
}

/// Hash every line of a blob.
pub fn hash_lines(bytes: &[u8], ignore_whitespace: bool) -> Vec<u64> {
    split_lines(bytes)
        .into_iter()
        .map(|l| hash_line(l, ignore_whitespace))
        .collect()
}

// -------------------------------------------------------------------------------------------------
// BlobCache
// -------------------------------------------------------------------------------------------------
/// Per-commit memoisation of blob id → facts. The tree-diff stage populates
/// it; later stages of the same commit read it through the shared handles; it
/// is cleared when the commit has been consumed.
#[derive(Default)]
pub struct BlobCache {
    map: HashMap<Oid, Rc<BlobFacts>>,
}

impl BlobCache {
    pub fn get_or_load(
        &mut self,
        repo: &Repository,
        id: Oid,
        path: &str,
    ) -> Result<Rc<BlobFacts>> {
        if let Some(facts) = self.map.get(&id) {
            return Ok(Rc::clone(facts));
        }
        let blob = repo.find_blob(id).map_err(|e| Error::Blob {
            blob: id.to_string(),
            path: path.to_string(),
            reason: e.message().to_string(),
        })?;
        let facts = Rc::new(BlobFacts::derive(id, blob.content().to_vec()));
        self.map.insert(id, Rc::clone(&facts));
        Ok(facts)
    }

    pub fn insert(&mut self, facts: BlobFacts) -> Rc<BlobFacts> {
        let rc = Rc::new(facts);
        self.map.insert(rc.id, Rc::clone(&rc));
        rc
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn line_counting() {
        assert_eq!(count_lines(b""), 0);
        assert_eq!(count_lines(b"one\n"), 1);
        assert_eq!(count_lines(b"one\ntwo\n"), 2);
        assert_eq!(count_lines(b"one\ntwo"), 2, "unterminated tail counts");
        assert_eq!(count_lines(b"x"), 1);
    }

    #[test]
    fn text_is_not_binary() {
        assert!(!is_binary(b"hello world\nthis is text\n", 2));
    }

    #[test]
    fn null_byte_is_binary() {
        assert!(is_binary(b"hello\x00world", 1));
    }

    #[test]
    fn null_at_sniff_boundary() {
        let mut data = vec![b'a'; BINARY_SNIFF_LEN];
        assert!(!is_binary(&data, 1));
        data[BINARY_SNIFF_LEN - 1] = 0;
        assert!(is_binary(&data, 1));
    }

    #[test]
    fn null_beyond_sniff_not_detected() {
        let mut data = vec![b'a'; BINARY_SNIFF_LEN + 1000];
        data[BINARY_SNIFF_LEN + 500] = 0;
        assert!(!is_binary(&data, 1));
    }

    #[test]
    fn absurd_line_counts_are_binary() {
        assert!(is_binary(b"ok", MAX_TEXT_LINES + 1));
    }

    #[test]
    fn derive_ties_it_together() {
        let facts = BlobFacts::derive(Oid::zero(), b"a\nb\n".to_vec());
        assert_eq!(facts.line_count, 2);
        assert!(!facts.binary);
        assert_eq!(facts.len(), 4);
    }

    #[test]
    fn split_lines_matches_count() {
        let data = b"a\nbb\nccc";
        let lines = split_lines(data);
        assert_eq!(lines, vec![b"a" as &[u8], b"bb", b"ccc"]);
        assert_eq!(lines.len(), count_lines(data));
        assert!(split_lines(b"").is_empty());
    }

    #[test]
    fn whitespace_insensitive_hashing() {
        assert_ne!(
            hash_line(b"let x = 1;", false),
            hash_line(b"let x=1;", false)
        );
        assert_eq!(
            hash_line(b"let x = 1;", true),
            hash_line(b"let\tx=1;\r", true)
        );
    }
}
