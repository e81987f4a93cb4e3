//! Op templates, dispensers and the ops they bind.
//!
//! A driver turns each [`OpTemplate`] into an [`OpDispenser`] once, when the
//! activity is loaded. Motors then ask the dispenser for a [`CycleOp`] per
//! cycle. Binding must be a pure function of the cycle number: the same cycle
//! always yields an op with the same static fields.

use std::{collections::BTreeMap, fs, path::Path};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, OpError, Result},
    params::ActivityDef,
};

fn one() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpTemplate {
    pub name: String,
    #[serde(default = "one")]
    pub ratio: u64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl OpTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ratio: 1,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_ratio(mut self, ratio: u64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Field as text; strings are returned bare, other JSON values rendered.
    pub fn field_str(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Tags including the implicit `name` tag.
    fn tag(&self, key: &str) -> Option<&str> {
        match self.tags.get(key) {
            Some(v) => Some(v.as_str()),
            None if key == "name" => Some(self.name.as_str()),
            None => None,
        }
    }
}

/// What an op produced. `code` 0 means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpOutput {
    pub code: i32,
    pub bytes: u64,
    pub body: Option<String>,
}

/// One cycle's bound operation.
///
/// The motor calls `execute` then `result` for every attempt; a retry re-runs
/// both on the same bound op.
#[async_trait]
pub trait CycleOp: Send + Sync {
    async fn execute(&self) -> Result<OpOutput, OpError>;

    /// Interprets the raw output of `execute`.
    async fn result(&self, output: OpOutput) -> Result<OpOutput, OpError> {
        Ok(output)
    }
}

/// Stateless factory of per-cycle ops for one template.
pub trait OpDispenser: Send + Sync {
    fn name(&self) -> &str;

    fn bind(&self, cycle: u64) -> Result<Box<dyn CycleOp>, OpError>;

    /// Checks a successful output. Failing here is an attempt failure like
    /// any other.
    fn verify(&self, _cycle: u64, _output: &OpOutput) -> Result<(), OpError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Conjugate {
    Any,
    #[default]
    All,
    None,
}

/// Selects templates by tag: `key:regex,key:regex`, optionally wrapped as
/// `any(...)`, `all(...)` (the default) or `none(...)`. A bare `key` only
/// requires the tag to be present. Patterns must match the whole value.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    conjugate: Conjugate,
    conditions: Vec<(String, Option<Regex>)>,
}

impl TagFilter {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut spec = spec.trim().trim_matches(['\'', '"']);
        let mut conjugate = Conjugate::All;
        let word_prefix = spec
            .find('(')
            .filter(|&open| open > 0 && spec[..open].chars().all(|c| c.is_ascii_alphabetic()));
        if let (Some(open), true) = (word_prefix, spec.ends_with(')')) {
            conjugate = match spec[..open].to_ascii_lowercase().as_str() {
                "any" => Conjugate::Any,
                "all" => Conjugate::All,
                "none" => Conjugate::None,
                other => {
                    return Err(Error::invalid(
                        "tags",
                        spec,
                        format!("unknown conjugate '{other}', expected any, all or none"),
                    ));
                }
            };
            spec = &spec[open + 1..spec.len() - 1];
        }
        let mut conditions = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, pattern) = match part.split_once([':', '=']) {
                Some((k, v)) => (k.trim(), Some(v.trim().trim_matches(['\'', '"']))),
                None => (part, None),
            };
            let pattern = pattern
                .map(|p| Regex::new(&format!("^(?:{p})$")))
                .transpose()?;
            conditions.push((key.to_string(), pattern));
        }
        Ok(Self {
            conjugate,
            conditions,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, template: &OpTemplate) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let hits = self
            .conditions
            .iter()
            .filter(|(key, pattern)| match (template.tag(key), pattern) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(value), Some(re)) => re.is_match(value),
            })
            .count();
        match self.conjugate {
            Conjugate::Any => hits > 0,
            Conjugate::All => hits == self.conditions.len(),
            Conjugate::None => hits == 0,
        }
    }

    pub fn filter(&self, templates: Vec<OpTemplate>) -> Vec<OpTemplate> {
        templates.into_iter().filter(|t| self.matches(t)).collect()
    }
}

/// Where an activity's op templates come from.
pub trait OpSource: Send + Sync {
    fn load(&self, def: &ActivityDef) -> Result<Vec<OpTemplate>>;
}

/// Reads templates from the activity's own parameters.
///
/// - `workload=<path>`: a JSON array of templates.
/// - `op=<text>` or `stmt=<text>`: one template named `op1`/`stmt1` whose
///   `stmt` field holds the text, weighted by `ratio=` if given.
///
/// Every other activity parameter is copied into the inline template's fields
/// so drivers can read their knobs from one place.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamOpSource;

const ENGINE_KEYS: &[&str] = &[
    "alias",
    "driver",
    "type",
    "threads",
    "cycles",
    "recycles",
    "stride",
    "cyclerate",
    "rate",
    "striderate",
    "seq",
    "errors",
    "maxtries",
    "tags",
    "workload",
    "op",
    "stmt",
    "ratio",
];

impl ParamOpSource {
    fn read_workload(path: &Path) -> Result<Vec<OpTemplate>> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl OpSource for ParamOpSource {
    fn load(&self, def: &ActivityDef) -> Result<Vec<OpTemplate>> {
        let params = def.params();
        if let Some(path) = params.get("workload") {
            tracing::debug!("Loading workload {path} for {}", def.alias());
            return Self::read_workload(Path::new(path));
        }
        let (key, text) = match (params.get("op"), params.get("stmt")) {
            (Some(op), _) => ("op", op),
            (None, Some(stmt)) => ("stmt", stmt),
            (None, None) => return Err(Error::MissingParam("op, stmt or workload".into())),
        };
        let ratio = params.get_parsed::<u64>("ratio")?.unwrap_or(1);
        let mut template = OpTemplate::new(format!("{key}1"))
            .with_ratio(ratio)
            .with_field("stmt", text);
        for (k, v) in params.iter().filter(|(k, _)| !ENGINE_KEYS.contains(k)) {
            template = template.with_field(k, v);
        }
        Ok(vec![template])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tagged(name: &str, tags: &[(&str, &str)]) -> OpTemplate {
        tags.iter()
            .fold(OpTemplate::new(name), |t, (k, v)| t.with_tag(*k, *v))
    }

    #[test]
    fn tag_filter_requires_all_conditions_by_default() {
        let filter = TagFilter::parse("phase:main,kind:read.*").unwrap();
        assert!(filter.matches(&tagged("a", &[("phase", "main"), ("kind", "read-one")])));
        assert!(!filter.matches(&tagged("b", &[("phase", "main"), ("kind", "write")])));
        assert!(!filter.matches(&tagged("c", &[("phase", "main")])));
    }

    #[test]
    fn tag_patterns_match_whole_values() {
        let filter = TagFilter::parse("phase:main").unwrap();
        assert!(!filter.matches(&tagged("a", &[("phase", "mainline")])));
    }

    #[test]
    fn name_is_an_implicit_tag() {
        let filter = TagFilter::parse("name:insert_.*").unwrap();
        assert!(filter.matches(&OpTemplate::new("insert_user")));
        assert!(!filter.matches(&OpTemplate::new("select_user")));
    }

    #[test]
    fn conjugates_and_presence() {
        let any = TagFilter::parse("any(phase:rampup,phase:main)").unwrap();
        assert!(any.matches(&tagged("a", &[("phase", "main")])));
        let none = TagFilter::parse("none(phase:schema)").unwrap();
        assert!(none.matches(&tagged("a", &[("phase", "main")])));
        assert!(!none.matches(&tagged("b", &[("phase", "schema")])));
        let present = TagFilter::parse("block").unwrap();
        assert!(present.matches(&tagged("a", &[("block", "x")])));
        assert!(!present.matches(&tagged("a", &[])));
        let grouped = TagFilter::parse("kind:(read|write)").unwrap();
        assert!(grouped.matches(&tagged("a", &[("kind", "write")])));
        assert!(TagFilter::parse("maybe(x:y)").is_err());
        assert!(TagFilter::parse("x:(").is_err());
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let filter = TagFilter::parse("").unwrap();
        assert!(filter.is_empty());
        assert_eq!(filter.filter(vec![OpTemplate::new("a")]).len(), 1);
    }

    #[test]
    fn inline_statement_becomes_one_template() {
        let def = ActivityDef::parse("alias=a;stmt='select {cycle}';ratio=3;filename=out.txt")
            .unwrap();
        let templates = ParamOpSource.load(&def).unwrap();
        assert_eq!(templates.len(), 1);
        let t = &templates[0];
        assert_eq!(t.name, "stmt1");
        assert_eq!(t.ratio, 3);
        assert_eq!(t.field_str("stmt").as_deref(), Some("select {cycle}"));
        assert_eq!(t.field_str("filename").as_deref(), Some("out.txt"));
        assert!(t.field_str("alias").is_none());
    }

    #[test]
    fn workload_file_is_read_as_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"name": "write", "ratio": 3, "tags": {{"phase": "main"}}, "fields": {{"stmt": "w {{cycle}}"}}}},
                {{"name": "read", "fields": {{"stmt": "r {{cycle}}"}}}}
            ]"#
        )
        .unwrap();
        let def = ActivityDef::parse(&format!("alias=a;workload={}", file.path().display()))
            .unwrap();
        let templates = ParamOpSource.load(&def).unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].ratio, 3);
        assert_eq!(templates[1].ratio, 1);
        assert_eq!(templates[0].tags.get("phase").map(String::as_str), Some("main"));
    }

    #[test]
    fn missing_source_is_a_configuration_error() {
        let def = ActivityDef::parse("alias=a;driver=stdout").unwrap();
        assert!(matches!(ParamOpSource.load(&def), Err(Error::MissingParam(_))));
        let def = ActivityDef::parse("alias=a;workload=/does/not/exist.json").unwrap();
        assert!(matches!(ParamOpSource.load(&def), Err(Error::Io(_))));
    }
}
