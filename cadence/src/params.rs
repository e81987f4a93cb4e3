//! Activity parameters.
//!
//! An activity is described by a flat `key=value;key=value` string. The
//! [`ParameterMap`] keeps the raw pairs in declaration order and
//! [`ActivityDef`] gives typed access to the keys the engine understands.
//! Definitions are values: updating a running activity installs a new
//! snapshot built with [`ActivityDef::with_param`].

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    rate::RateSpec,
    sequence::SequencerType,
};

/// Ordered `key → value` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMap {
    entries: Vec<(String, String)>,
    #[serde(skip)]
    changes: u64,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `key=value` pairs separated by `;` or whitespace. A value may be
    /// wrapped in single or double quotes to carry separators.
    pub fn parse(text: &str) -> Result<Self> {
        let mut map = Self::new();
        for token in tokenize(text)? {
            let Some((key, value)) = token.split_once('=') else {
                return Err(Error::ParseParams(text.to_string()));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::ParseParams(text.to_string()));
            }
            map.set(key, unquote(value.trim()));
        }
        Ok(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First present value among `keys`.
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| Error::invalid(key, raw, e.to_string())),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Some(true)),
                "false" | "no" | "off" | "0" => Ok(Some(false)),
                _ => Err(Error::invalid(key, raw, "expected a boolean")),
            },
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self.changes += 1;
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        self.changes += 1;
        Some(self.entries.remove(idx).1)
    }

    /// Number of `set`/`remove` calls applied to this map.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromStr for ParameterMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ParameterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            if v.contains([';', ' ', '\t', '\n']) {
                write!(f, "{k}='{v}'")?;
            } else {
                write!(f, "{k}={v}")?;
            }
        }
        Ok(())
    }
}

pub(crate) fn tokenize(text: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, c) if c == ';' || c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(Error::ParseParams(text.to_string()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

pub(crate) fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'\'' || first == b'"') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// Half-open cycle interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CyclesSpec {
    pub start: u64,
    pub end: u64,
}

impl CyclesSpec {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::invalid(
                "cycles",
                &format!("{start}..{end}"),
                "the first cycle must not be past the end",
            ));
        }
        Ok(Self { start, end })
    }

    pub fn count(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, cycle: u64) -> bool {
        (self.start..self.end).contains(&cycle)
    }
}

impl FromStr for CyclesSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once("..") {
            Some((a, b)) => Self::new(parse_count("cycles", a)?, parse_count("cycles", b)?),
            None => Self::new(0, parse_count("cycles", s)?),
        }
    }
}

impl fmt::Display for CyclesSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Parses an unsigned count with an optional `K`, `M` or `B` suffix.
fn parse_count(key: &str, raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let (digits, scale) = match raw.chars().last() {
        Some('k' | 'K') => (&raw[..raw.len() - 1], 1_000),
        Some('m' | 'M') => (&raw[..raw.len() - 1], 1_000_000),
        Some('b' | 'B') => (&raw[..raw.len() - 1], 1_000_000_000),
        _ => (raw, 1),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| Error::invalid(key, raw, "expected a non-negative count"))?;
    base.checked_mul(scale)
        .ok_or_else(|| Error::invalid(key, raw, "count overflows"))
}

/// How many motors an activity runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadSpec {
    Count(usize),
    /// Ten per available CPU, never more than there are cycles.
    Auto,
    /// `<N>x`: N per available CPU.
    PerCpu(usize),
}

impl ThreadSpec {
    pub fn resolve(&self, cycle_count: u64) -> usize {
        let cpus = num_cpus::get();
        match *self {
            ThreadSpec::Count(n) => n,
            ThreadSpec::Auto => {
                let limit = usize::try_from(cycle_count).unwrap_or(usize::MAX);
                (cpus * 10).min(limit).max(1)
            }
            ThreadSpec::PerCpu(n) => (cpus * n).max(1),
        }
    }
}

impl Default for ThreadSpec {
    fn default() -> Self {
        ThreadSpec::Count(1)
    }
}

impl FromStr for ThreadSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "auto" {
            return Ok(ThreadSpec::Auto);
        }
        let bad = || Error::invalid("threads", s, "expected an integer, 'auto' or '<N>x'");
        if let Some(n) = lower.strip_suffix('x') {
            let n: usize = n.parse().map_err(|_| bad())?;
            if n == 0 {
                return Err(bad());
            }
            return Ok(ThreadSpec::PerCpu(n));
        }
        lower.parse().map(ThreadSpec::Count).map_err(|_| bad())
    }
}

impl fmt::Display for ThreadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadSpec::Count(n) => write!(f, "{n}"),
            ThreadSpec::Auto => f.write_str("auto"),
            ThreadSpec::PerCpu(n) => write!(f, "{n}x"),
        }
    }
}

static ALIAS_SEQ: AtomicU64 = AtomicU64::new(1);

pub const DEFAULT_DRIVER: &str = "stdout";
pub const DEFAULT_MAX_TRIES: u32 = 10;

/// Typed view over an activity's parameters.
///
/// The alias is fixed at construction: definitions without one get
/// `activity_<n>`, numbered in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDef {
    params: ParameterMap,
}

impl ActivityDef {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self::from_params(ParameterMap::parse(text)?))
    }

    pub fn from_params(mut params: ParameterMap) -> Self {
        if !params.contains("alias") {
            let n = ALIAS_SEQ.fetch_add(1, Ordering::Relaxed);
            params.set("alias", format!("activity_{n}"));
        }
        Self { params }
    }

    pub fn params(&self) -> &ParameterMap {
        &self.params
    }

    /// Copy of this definition with one parameter replaced.
    pub fn with_param(&self, key: &str, value: &str) -> Self {
        let mut params = self.params.clone();
        params.set(key, value);
        Self { params }
    }

    /// Copy of this definition with `key` removed.
    pub fn without_param(&self, key: &str) -> Self {
        let mut params = self.params.clone();
        params.remove(key);
        Self { params }
    }

    pub fn alias(&self) -> &str {
        self.params.get_str("alias", "")
    }

    pub fn driver(&self) -> &str {
        self.params
            .get_any(&["driver", "type"])
            .unwrap_or(DEFAULT_DRIVER)
    }

    /// `None` when unset; the activity then runs one pass over its op sequence.
    pub fn cycles(&self) -> Result<Option<CyclesSpec>> {
        self.params.get_parsed("cycles")
    }

    pub fn recycles(&self) -> Result<CyclesSpec> {
        Ok(self
            .params
            .get_parsed("recycles")?
            .unwrap_or(CyclesSpec { start: 0, end: 1 }))
    }

    pub fn threads(&self) -> Result<ThreadSpec> {
        Ok(self.params.get_parsed("threads")?.unwrap_or_default())
    }

    /// `None` when unset; the stride then defaults to the op sequence length.
    pub fn stride(&self) -> Result<Option<u64>> {
        match self.params.get("stride") {
            None => Ok(None),
            Some(raw) => match parse_count("stride", raw)? {
                0 => Err(Error::invalid("stride", raw, "stride must be at least 1")),
                n => Ok(Some(n)),
            },
        }
    }

    pub fn cycle_rate(&self) -> Result<Option<RateSpec>> {
        match self.params.get("cyclerate") {
            Some(_) => self.params.get_parsed("cyclerate"),
            None => self.params.get_parsed("rate"),
        }
    }

    pub fn stride_rate(&self) -> Result<Option<RateSpec>> {
        self.params.get_parsed("striderate")
    }

    pub fn sequencer(&self) -> Result<SequencerType> {
        self.params
            .get("seq")
            .map_or(Ok(SequencerType::default()), str::parse)
    }

    pub fn errors_spec(&self) -> &str {
        self.params.get_str("errors", "stop")
    }

    pub fn max_tries(&self) -> Result<u32> {
        match self.params.get_parsed::<u32>("maxtries")? {
            Some(0) => Err(Error::invalid("maxtries", "0", "at least one try is required")),
            Some(n) => Ok(n),
            None => Ok(DEFAULT_MAX_TRIES),
        }
    }

    pub fn tags(&self) -> Option<&str> {
        self.params.get("tags")
    }

    /// Parses every engine-level key so bad values fail before anything starts.
    pub fn validate(&self) -> Result<()> {
        self.cycles()?;
        self.recycles()?;
        self.threads()?;
        self.stride()?;
        self.cycle_rate()?;
        self.stride_rate()?;
        self.sequencer()?;
        self.max_tries()?;
        Ok(())
    }
}

impl FromStr for ActivityDef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ActivityDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.params.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_semicolons_spaces_and_quotes() {
        let map = ParameterMap::parse("alias=a;driver=stdout cycles=10 stmt='select 1; x'")
            .unwrap();
        assert_eq!(map.get("alias"), Some("a"));
        assert_eq!(map.get("driver"), Some("stdout"));
        assert_eq!(map.get("cycles"), Some("10"));
        assert_eq!(map.get("stmt"), Some("select 1; x"));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn rejects_tokens_without_equals_and_open_quotes() {
        assert!(matches!(
            ParameterMap::parse("alias=a;oops"),
            Err(Error::ParseParams(_))
        ));
        assert!(ParameterMap::parse("stmt='never closed").is_err());
    }

    #[test]
    fn set_replaces_in_place_and_counts_changes() {
        let mut map = ParameterMap::parse("a=1;b=2").unwrap();
        let before = map.changes();
        map.set("a", "3");
        assert_eq!(map.to_string(), "a=3;b=2");
        assert_eq!(map.changes(), before + 1);
    }

    #[test]
    fn typed_getters_report_the_offending_key() {
        let map = ParameterMap::parse("n=abc;flag=yes").unwrap();
        assert_eq!(map.get_bool("flag").unwrap(), Some(true));
        match map.get_parsed::<u64>("n") {
            Err(Error::InvalidParam { key, value, .. }) => {
                assert_eq!(key, "n");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cycles_forms() {
        assert_eq!("100".parse::<CyclesSpec>().unwrap(), CyclesSpec { start: 0, end: 100 });
        assert_eq!("5..15".parse::<CyclesSpec>().unwrap().count(), 10);
        assert_eq!("2K".parse::<CyclesSpec>().unwrap().end, 2_000);
        assert_eq!("1M..3M".parse::<CyclesSpec>().unwrap().count(), 2_000_000);
        assert!("10..5".parse::<CyclesSpec>().is_err());
        assert!("ten".parse::<CyclesSpec>().is_err());
    }

    #[test]
    fn thread_specs() {
        assert_eq!("4".parse::<ThreadSpec>().unwrap(), ThreadSpec::Count(4));
        assert_eq!("AUTO".parse::<ThreadSpec>().unwrap(), ThreadSpec::Auto);
        assert_eq!("2x".parse::<ThreadSpec>().unwrap(), ThreadSpec::PerCpu(2));
        assert!("0x".parse::<ThreadSpec>().is_err());
        assert!("many".parse::<ThreadSpec>().is_err());

        assert_eq!(ThreadSpec::Auto.resolve(3), 3usize.min(num_cpus::get() * 10));
        assert_eq!(ThreadSpec::Auto.resolve(0), 1);
        assert_eq!(ThreadSpec::PerCpu(2).resolve(1), num_cpus::get() * 2);
    }

    #[test]
    fn activity_def_defaults() {
        let def = ActivityDef::parse("op=hello").unwrap();
        assert!(def.alias().starts_with("activity_"));
        assert_eq!(def.driver(), "stdout");
        assert_eq!(def.cycles().unwrap(), None);
        assert_eq!(def.recycles().unwrap().count(), 1);
        assert_eq!(def.threads().unwrap(), ThreadSpec::Count(1));
        assert_eq!(def.stride().unwrap(), None);
        assert_eq!(def.sequencer().unwrap(), SequencerType::Bucket);
        assert_eq!(def.errors_spec(), "stop");
        assert_eq!(def.max_tries().unwrap(), 10);
        assert!(def.cycle_rate().unwrap().is_none());
    }

    #[test]
    fn generated_aliases_are_distinct() {
        let a = ActivityDef::parse("op=x").unwrap();
        let b = ActivityDef::parse("op=x").unwrap();
        assert_ne!(a.alias(), b.alias());
    }

    #[test]
    fn legacy_type_key_names_the_driver() {
        let def = ActivityDef::parse("alias=a;type=diag").unwrap();
        assert_eq!(def.driver(), "diag");
        let def = ActivityDef::parse("alias=a;type=diag;driver=stdout").unwrap();
        assert_eq!(def.driver(), "stdout");
    }

    #[test]
    fn rate_falls_back_from_cyclerate_to_rate() {
        let def = ActivityDef::parse("alias=a;rate=50").unwrap();
        assert_eq!(def.cycle_rate().unwrap().unwrap().rate, 50.0);
        let def = ActivityDef::parse("alias=a;rate=50;cyclerate=20").unwrap();
        assert_eq!(def.cycle_rate().unwrap().unwrap().rate, 20.0);
    }

    #[test]
    fn validate_catches_bad_values_up_front() {
        assert!(ActivityDef::parse("alias=a;maxtries=0").unwrap().validate().is_err());
        assert!(ActivityDef::parse("alias=a;stride=0").unwrap().validate().is_err());
        assert!(matches!(
            ActivityDef::parse("alias=a;seq=random").unwrap().validate(),
            Err(Error::UnknownSequencer(_))
        ));
        assert!(ActivityDef::parse("alias=a;cycles=9..3").unwrap().validate().is_err());
        assert!(ActivityDef::parse("alias=a;cycles=10;threads=2x").unwrap().validate().is_ok());
    }

    #[test]
    fn with_param_leaves_the_original_untouched() {
        let def = ActivityDef::parse("alias=a;threads=1").unwrap();
        let next = def.with_param("threads", "4");
        assert_eq!(def.threads().unwrap(), ThreadSpec::Count(1));
        assert_eq!(next.threads().unwrap(), ThreadSpec::Count(4));
        assert_eq!(next.alias(), "a");
    }
}
