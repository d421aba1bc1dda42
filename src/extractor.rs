//! The syntax-extractor contract.
//!
//! Structural analyses (and the diff-boundary refinement of the
//! line-attribution engine) only need line spans of syntactic regions; the
//! heavyweight parsers that produce them are external collaborators plugged in
//! through this interface. Files no registered extractor handles yield an
//! empty node list, never an error.

/// What to extract from a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selector {
    /// Functions, methods, classes: the structural units.
    Structures,
    Identifiers,
    Comments,
}

/// One syntactic region of a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntaxNode {
    /// Extractor-defined node kind, e.g. `function`.
    pub kind: String,
    /// Declared name, when the node has one.
    pub name: String,
    /// 1-based, inclusive line span.
    pub start_line: u32,
    pub end_line: u32,
    pub start_col: u32,
    pub end_col: u32,
    pub text: String,
}

impl SyntaxNode {
    /// Whether the node's line span lies entirely inside `[start, end)`.
    pub fn within_lines(&self, start: u32, end: u32) -> bool {
        self.start_line >= start && self.end_line < end
    }
}

pub trait SyntaxExtractor {
    /// Whether this extractor understands the file at `path`.
    fn handles(&self, path: &str) -> bool;

    fn extract(&self, path: &str, bytes: &[u8], selector: Selector) -> Vec<SyntaxNode>;
}

// -------------------------------------------------------------------------------------------------
// ExtractorRegistry
// -------------------------------------------------------------------------------------------------
/// Extractors in registration order; the first one claiming a path wins.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn SyntaxExtractor>>,
}

impl ExtractorRegistry {
    pub fn register(&mut self, extractor: Box<dyn SyntaxExtractor>) {
        self.extractors.push(extractor);
    }

    pub fn supports(&self, path: &str) -> bool {
        self.extractors.iter().any(|e| e.handles(path))
    }

    /// Extract nodes for `path`; unsupported paths return an empty list.
    pub fn extract(&self, path: &str, bytes: &[u8], selector: Selector) -> Vec<SyntaxNode> {
        for extractor in &self.extractors {
            if extractor.handles(path) {
                return extractor.extract(path, bytes, selector);
            }
        }
        Vec::new()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}
