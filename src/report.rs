use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::{self, Read, Write};

use crate::errors::{Error, Result};

pub const MAGIC: &[u8; 4] = b"STRA";
pub const FORMAT_VERSION: u16 = 2;

// -------------------------------------------------------------------------------------------------
// RunHeader
// -------------------------------------------------------------------------------------------------
/// Common metadata preceding every report, in both output forms.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    pub repository: String,
    pub version: u16,
    pub vcs_hash: String,
    pub begin_tick: u32,
    pub end_tick: u32,
    pub commit_count: u64,
    pub runtime_ms: u64,
    pub tick_size_secs: i64,
}

// -------------------------------------------------------------------------------------------------
// Report
// -------------------------------------------------------------------------------------------------
/// A finalised item result: it renders itself as a text tree and serialises
/// itself into the item-owned binary payload.
pub trait Report {
    fn write_text(&self, out: &mut TextWriter<'_>) -> io::Result<()>;

    fn to_bytes(&self) -> Result<Vec<u8>>;
}

// -------------------------------------------------------------------------------------------------
// TextWriter
// -------------------------------------------------------------------------------------------------
/// YAML-compatible `key: value` tree writer: two-space indentation, arrays as
/// `[a, b, c]`. Equal inputs produce byte-identical output.
pub struct TextWriter<'a> {
    out: &'a mut dyn Write,
    indent: usize,
}

impl<'a> TextWriter<'a> {
    pub fn new(out: &'a mut dyn Write) -> TextWriter<'a> {
        TextWriter { out, indent: 0 }
    }

    fn pad(&mut self) -> io::Result<()> {
        for _ in 0..self.indent {
            self.out.write_all(b"  ")?;
        }
        Ok(())
    }

    pub fn field(&mut self, key: impl Display, value: impl Display) -> io::Result<()> {
        self.pad()?;
        writeln!(self.out, "{key}: {value}")
    }

    /// Quote a string value so arbitrary author/path text stays parseable.
    pub fn text_field(&mut self, key: impl Display, value: &str) -> io::Result<()> {
        self.pad()?;
        writeln!(self.out, "{key}: {:?}", value)
    }

    pub fn array<T: Display>(
        &mut self,
        key: impl Display,
        items: impl IntoIterator<Item = T>,
    ) -> io::Result<()> {
        self.pad()?;
        write!(self.out, "{key}: [")?;
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                write!(self.out, ", ")?;
            }
            write!(self.out, "{item}")?;
        }
        writeln!(self.out, "]")
    }

    /// Open a nested block: `key:` followed by indented children.
    pub fn open(&mut self, key: impl Display) -> io::Result<()> {
        self.pad()?;
        writeln!(self.out, "{key}:")?;
        self.indent += 1;
        Ok(())
    }

    pub fn close(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }
}

// -------------------------------------------------------------------------------------------------
// whole-run serialisation
// -------------------------------------------------------------------------------------------------
pub fn write_text_report(
    out: &mut dyn Write,
    header: &RunHeader,
    results: &BTreeMap<String, Box<dyn Report>>,
) -> io::Result<()> {
    let mut w = TextWriter::new(out);
    w.open("header")?;
    w.text_field("repository", &header.repository)?;
    w.field("version", header.version)?;
    w.field("vcs_hash", &header.vcs_hash)?;
    w.field("begin_tick", header.begin_tick)?;
    w.field("end_tick", header.end_tick)?;
    w.field("commit_count", header.commit_count)?;
    w.field("runtime_ms", header.runtime_ms)?;
    w.field("tick_size_secs", header.tick_size_secs)?;
    w.close();
    for (name, report) in results {
        w.open(name)?;
        report.write_text(&mut w)?;
        w.close();
    }
    Ok(())
}

/// The decoded form of a binary record stream.
#[derive(Debug, PartialEq, Eq)]
pub struct BinaryRecord {
    pub header: RunHeader,
    pub payloads: Vec<(String, Vec<u8>)>,
}

/// `MAGIC`, format version, length-prefixed bincode header, then one
/// length-prefixed `(name, payload)` per item. Payload schemas are owned by
/// the items.
pub fn write_binary_report(
    out: &mut dyn Write,
    header: &RunHeader,
    results: &BTreeMap<String, Box<dyn Report>>,
) -> Result<()> {
    out.write_all(MAGIC)?;
    out.write_u16::<LittleEndian>(FORMAT_VERSION)?;

    let header_bytes =
        bincode::serialize(header).map_err(|e| Error::config(format!("header encode: {e}")))?;
    out.write_u32::<LittleEndian>(header_bytes.len() as u32)?;
    out.write_all(&header_bytes)?;

    out.write_u32::<LittleEndian>(results.len() as u32)?;
    for (name, report) in results {
        out.write_u16::<LittleEndian>(name.len() as u16)?;
        out.write_all(name.as_bytes())?;
        let payload = report.to_bytes()?;
        out.write_u32::<LittleEndian>(payload.len() as u32)?;
        out.write_all(&payload)?;
    }
    Ok(())
}

pub fn read_binary_report(input: &mut dyn Read) -> Result<BinaryRecord> {
    let bad = |what: &str| Error::Io(io::Error::new(io::ErrorKind::InvalidData, what.to_string()));

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(bad("not a strata record stream"));
    }
    let version = input.read_u16::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(bad("unsupported record format version"));
    }

    let header_len = input.read_u32::<LittleEndian>()? as usize;
    let mut header_bytes = vec![0u8; header_len];
    input.read_exact(&mut header_bytes)?;
    let header: RunHeader = bincode::deserialize(&header_bytes)
        .map_err(|_| bad("malformed record header"))?;

    let count = input.read_u32::<LittleEndian>()? as usize;
    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = input.read_u16::<LittleEndian>()? as usize;
        let mut name = vec![0u8; name_len];
        input.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|_| bad("malformed payload name"))?;
        let payload_len = input.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; payload_len];
        input.read_exact(&mut payload)?;
        payloads.push((name, payload));
    }
    Ok(BinaryRecord { header, payloads })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        total: u64,
        names: Vec<String>,
    }

    impl Report for Sample {
        fn write_text(&self, out: &mut TextWriter<'_>) -> io::Result<()> {
            out.field("total", self.total)?;
            out.array("names", self.names.iter())?;
            Ok(())
        }

        fn to_bytes(&self) -> Result<Vec<u8>> {
            bincode::serialize(self).map_err(|e| Error::config(e.to_string()))
        }
    }

    fn header() -> RunHeader {
        RunHeader {
            repository: "/tmp/repo".into(),
            version: 4,
            vcs_hash: "deadbeef".into(),
            begin_tick: 0,
            end_tick: 12,
            commit_count: 34,
            runtime_ms: 56,
            tick_size_secs: 86400,
        }
    }

    fn sample_results() -> BTreeMap<String, Box<dyn Report>> {
        let mut results: BTreeMap<String, Box<dyn Report>> = BTreeMap::new();
        results.insert(
            "sample".into(),
            Box::new(Sample {
                total: 9,
                names: vec!["a".into(), "b".into()],
            }),
        );
        results
    }

    #[test]
    fn text_output_shape() {
        let mut buffer = Vec::new();
        write_text_report(&mut buffer, &header(), &sample_results()).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let expected = "\
header:
  repository: \"/tmp/repo\"
  version: 4
  vcs_hash: deadbeef
  begin_tick: 0
  end_tick: 12
  commit_count: 34
  runtime_ms: 56
  tick_size_secs: 86400
sample:
  total: 9
  names: [a, b]
";
        assert_eq!(text, expected);
    }

    #[test]
    fn equal_results_serialise_byte_identically() {
        let mut first = Vec::new();
        let mut second = Vec::new();
        write_text_report(&mut first, &header(), &sample_results()).unwrap();
        write_text_report(&mut second, &header(), &sample_results()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn binary_roundtrip() {
        let mut buffer = Vec::new();
        write_binary_report(&mut buffer, &header(), &sample_results()).unwrap();
        let record = read_binary_report(&mut buffer.as_slice()).unwrap();
        assert_eq!(record.header, header());
        assert_eq!(record.payloads.len(), 1);
        assert_eq!(record.payloads[0].0, "sample");
        let decoded: Sample = bincode::deserialize(&record.payloads[0].1).unwrap();
        assert_eq!(
            decoded,
            Sample {
                total: 9,
                names: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buffer = Vec::new();
        write_binary_report(&mut buffer, &header(), &BTreeMap::new()).unwrap();
        buffer[0] = b'X';
        assert!(read_binary_report(&mut buffer.as_slice()).is_err());
    }
}
