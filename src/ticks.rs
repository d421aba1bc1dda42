use crate::commits::CommitMeta;
use crate::errors::{Error, Result};

/// One day, the default tick size.
pub const DEFAULT_TICK_SECS: i64 = 24 * 60 * 60;

// -------------------------------------------------------------------------------------------------
// TickClock
// -------------------------------------------------------------------------------------------------
/// Maps commit timestamps to integer tick indices of configurable duration,
/// anchored at the earliest commit. Ticks are the shared time axis of every
/// analysis: storing per-tick data instead of per-commit data bounds memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickClock {
    anchor: i64,
    size_secs: i64,
}

impl TickClock {
    pub fn new(anchor: i64, size_secs: i64) -> Result<TickClock> {
        if size_secs <= 0 {
            return Err(Error::config(format!(
                "tick size must be positive, got {size_secs}s"
            )));
        }
        Ok(TickClock { anchor, size_secs })
    }

    /// Anchor at the earliest commit of the set. `None` when the set is empty.
    pub fn from_commits(commits: &[CommitMeta], size_secs: i64) -> Result<Option<TickClock>> {
        match commits.iter().map(|c| c.when).min() {
            Some(anchor) => Ok(Some(TickClock::new(anchor, size_secs)?)),
            None => Ok(None),
        }
    }

    /// The tick index of a timestamp. Timestamps before the anchor (clock
    /// skew in the history) clamp to tick 0.
    pub fn tick_of(&self, when: i64) -> u32 {
        ((when - self.anchor).max(0) / self.size_secs) as u32
    }

    /// Floor a timestamp to its tick boundary, for cohort labelling.
    pub fn floor_to_tick(&self, when: i64) -> i64 {
        self.anchor + i64::from(self.tick_of(when)) * self.size_secs
    }

    pub fn anchor(&self) -> i64 {
        self.anchor
    }

    pub fn size_secs(&self) -> i64 {
        self.size_secs
    }
}

// -------------------------------------------------------------------------------------------------
// duration parsing
// -------------------------------------------------------------------------------------------------
/// Parse a tick-size argument: an integer with an `s`/`m`/`h`/`d`/`w` suffix,
/// or a bare integer meaning seconds.
pub fn parse_duration(text: &str) -> Result<i64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::config("empty duration"));
    }
    let (digits, unit) = match text.chars().last() {
        Some(c) if c.is_ascii_digit() => (text, 1),
        Some('s') => (&text[..text.len() - 1], 1),
        Some('m') => (&text[..text.len() - 1], 60),
        Some('h') => (&text[..text.len() - 1], 60 * 60),
        Some('d') => (&text[..text.len() - 1], 24 * 60 * 60),
        Some('w') => (&text[..text.len() - 1], 7 * 24 * 60 * 60),
        Some(c) => {
            return Err(Error::config(format!(
                "unknown duration unit `{c}` in `{text}`"
            )))
        }
        None => unreachable!(),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| Error::config(format!("cannot parse duration `{text}`")))?;
    if value <= 0 {
        return Err(Error::config(format!("duration must be positive: `{text}`")));
    }
    Ok(value * unit)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ticks_floor() {
        let clock = TickClock::new(1000, 100).unwrap();
        assert_eq!(clock.tick_of(1000), 0);
        assert_eq!(clock.tick_of(1099), 0);
        assert_eq!(clock.tick_of(1100), 1);
        assert_eq!(clock.tick_of(950), 0, "pre-anchor clamps to zero");
        assert_eq!(clock.floor_to_tick(1150), 1100);
    }

    #[test]
    fn zero_size_rejected() {
        assert!(TickClock::new(0, 0).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30m").unwrap(), 1800);
        assert_eq!(parse_duration("12h").unwrap(), 43200);
        assert_eq!(parse_duration("1d").unwrap(), 86400);
        assert_eq!(parse_duration("2w").unwrap(), 1_209_600);
        assert_eq!(parse_duration("90").unwrap(), 90);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1y").is_err());
        assert!(parse_duration("-3h").is_err());
        assert!(parse_duration("0d").is_err());
    }
}
