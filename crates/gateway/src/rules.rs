//! Rule based routing group selection
//!
//! Rules are a restricted, typed predicate language over a fixed set of request
//! facts, loaded from YAML:
//!
//! ```yaml
//! rules:
//!   - name: airflow
//!     priority: 0
//!     all:
//!       - fact: source
//!         equals: airflow
//!     any:
//!       - fact: header
//!         name: X-Trino-Client-Tags
//!         contains: etl
//!     routing_group: etl
//! ```
//!
//! Rules run by ascending priority (ties keep file order); the first match wins.
//! The active set is swapped atomically on reload, so evaluation never waits for a
//! reload and never sees a partially parsed file.

use crate::extract;
use crate::selector::RequestFacts;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use sqlgate_common::error::{GatewayError, Result};
use sqlgate_common::METRICS;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info};

/// Request facts a matcher can inspect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fact {
    Path,
    Method,
    User,
    Source,
    Header,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDef {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    all: Vec<MatcherDef>,
    #[serde(default)]
    any: Vec<MatcherDef>,
    routing_group: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatcherDef {
    fact: Fact,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    equals: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    contains: Option<String>,
    #[serde(default)]
    regex: Option<String>,
}

#[derive(Debug)]
enum Operator {
    Equals(String),
    Prefix(String),
    Contains(String),
    Regex(Regex),
}

impl Operator {
    fn test(&self, value: &str) -> bool {
        match self {
            Operator::Equals(expected) => value == expected,
            Operator::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Operator::Contains(needle) => value.contains(needle.as_str()),
            Operator::Regex(regex) => regex.is_match(value),
        }
    }
}

/// One compiled predicate over a request fact
#[derive(Debug)]
pub struct Matcher {
    fact: Fact,
    header: Option<String>,
    operator: Operator,
}

impl Matcher {
    fn compile(rule: &str, def: MatcherDef) -> Result<Self> {
        let mut operators = Vec::new();
        if let Some(value) = def.equals {
            operators.push(Operator::Equals(value));
        }
        if let Some(value) = def.prefix {
            operators.push(Operator::Prefix(value));
        }
        if let Some(value) = def.contains {
            operators.push(Operator::Contains(value));
        }
        if let Some(pattern) = def.regex {
            let regex = Regex::new(&pattern).map_err(|e| {
                GatewayError::rules(format!("rule {}: invalid regex {}: {}", rule, pattern, e))
            })?;
            operators.push(Operator::Regex(regex));
        }
        if operators.len() != 1 {
            return Err(GatewayError::rules(format!(
                "rule {}: a matcher needs exactly one of equals, prefix, contains, regex",
                rule
            )));
        }

        if def.fact == Fact::Header && def.name.as_deref().map_or(true, str::is_empty) {
            return Err(GatewayError::rules(format!(
                "rule {}: header matchers need a name",
                rule
            )));
        }

        Ok(Self {
            fact: def.fact,
            header: def.name,
            operator: operators.remove(0),
        })
    }

    fn matches(&self, facts: &RequestFacts<'_>) -> bool {
        let value = match self.fact {
            Fact::Path => Some(facts.path),
            Fact::Method => Some(facts.method),
            Fact::User => facts.user.as_deref(),
            Fact::Source => facts.source.as_deref(),
            Fact::Header => self.header.as_deref().and_then(|name| facts.header(name)),
        };
        value.map_or(false, |value| self.operator.test(value))
    }
}

/// A named rule mapping matching requests to a routing group
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub routing_group: String,
    all: Vec<Matcher>,
    any: Vec<Matcher>,
}

impl Rule {
    fn compile(def: RuleDef) -> Result<Self> {
        if def.routing_group.trim().is_empty() {
            return Err(GatewayError::rules(format!(
                "rule {}: routing_group must not be empty",
                def.name
            )));
        }
        let all = def
            .all
            .into_iter()
            .map(|m| Matcher::compile(&def.name, m))
            .collect::<Result<Vec<_>>>()?;
        let any = def
            .any
            .into_iter()
            .map(|m| Matcher::compile(&def.name, m))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: def.name,
            description: def.description,
            priority: def.priority,
            routing_group: def.routing_group,
            all,
            any,
        })
    }

    fn matches(&self, facts: &RequestFacts<'_>) -> bool {
        self.all.iter().all(|m| m.matches(facts))
            && (self.any.is_empty() || self.any.iter().any(|m| m.matches(facts)))
    }
}

/// An ordered, fully compiled rule set
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Parse and compile a YAML rules document
    pub fn parse(content: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::rules(format!("invalid rules document: {}", e)))?;
        let mut rules = file
            .rules
            .into_iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>>>()?;
        // Stable sort keeps file order among equal priorities
        rules.sort_by_key(|rule| rule.priority);
        Ok(Self { rules })
    }

    /// Read and compile a rules file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Routing group of the first matching rule
    pub fn evaluate(&self, facts: &RequestFacts<'_>) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(facts))
            .map(|rule| {
                debug!("Rule {} matched {}", rule.name, facts.path);
                rule.routing_group.as_str()
            })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Default)]
struct ReloadState {
    /// Modification time of the active rule set's source
    loaded: Option<SystemTime>,
    /// Modification time of the last source that failed to load
    failed: Option<SystemTime>,
}

/// Rule set bound to a file, reloaded whenever the file's modification time advances
pub struct RuleReloadingSelector {
    path: PathBuf,
    active: ArcSwapOption<RuleSet>,
    state: Mutex<ReloadState>,
}

impl RuleReloadingSelector {
    /// Load the rules file. A failure is logged; the header strategy applies until
    /// a version loads successfully.
    pub fn new(path: PathBuf) -> Self {
        let selector = Self {
            path,
            active: ArcSwapOption::empty(),
            state: Mutex::new(ReloadState::default()),
        };
        selector.refresh_if_stale();
        selector
    }

    /// Currently active rule set, if one ever loaded
    pub fn current(&self) -> Option<Arc<RuleSet>> {
        self.active.load_full()
    }

    /// Routing group for the request per the freshest loaded rules
    pub fn find_routing_group(&self, facts: &RequestFacts<'_>) -> Option<String> {
        self.refresh_if_stale();
        match self.active.load_full() {
            Some(rules) => rules.evaluate(facts).map(str::to_string),
            None => extract::routing_group_header(facts.headers),
        }
    }

    /// Reload the rules when the source is newer than the active version.
    ///
    /// Only one caller reloads at a time; concurrent callers keep evaluating the
    /// current set instead of waiting.
    fn refresh_if_stale(&self) {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!("Cannot stat rules file {}: {}", self.path.display(), e);
                return;
            }
        };

        let mut state = match self.state.try_lock() {
            Some(state) => state,
            None => return,
        };
        if state.loaded.map_or(false, |loaded| modified <= loaded)
            || state.failed == Some(modified)
        {
            return;
        }

        match RuleSet::load(&self.path) {
            Ok(rules) => {
                info!(
                    "Loaded {} routing rules from {} (modified {:?})",
                    rules.len(),
                    self.path.display(),
                    modified
                );
                self.active.store(Some(Arc::new(rules)));
                state.loaded = Some(modified);
                state.failed = None;
                METRICS.routing.rule_reloads.inc();
            }
            Err(e) => {
                error!(
                    "Error loading routing rules from {}, keeping previous rules: {}",
                    self.path.display(),
                    e
                );
                state.failed = Some(modified);
                METRICS.routing.rule_reload_failures.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    const RULES_V1: &str = r#"
rules:
  - name: airflow
    all:
      - fact: source
        equals: airflow
    routing_group: etl
  - name: tagged
    priority: -1
    any:
      - fact: header
        name: X-Trino-Client-Tags
        contains: adhoc-heavy
      - fact: user
        regex: "^svc-"
    routing_group: heavy
"#;

    const RULES_V2: &str = r#"
rules:
  - name: airflow
    all:
      - fact: source
        equals: airflow
    routing_group: scheduled
"#;

    fn write_rules(path: &Path, content: &str, modified: SystemTime) {
        let mut file = File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.set_modified(modified).unwrap();
    }

    fn airflow_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(extract::SOURCE_HEADER, HeaderValue::from_static("airflow"));
        headers
    }

    #[test]
    fn test_rule_priority_and_matchers() {
        let rules = RuleSet::parse(RULES_V1).unwrap();
        assert_eq!(rules.len(), 2);

        let headers = airflow_headers();
        let facts = RequestFacts::new("POST", "/v1/statement", &headers);
        assert_eq!(rules.evaluate(&facts), Some("etl"));

        let mut headers = airflow_headers();
        headers.insert(extract::USER_HEADER, HeaderValue::from_static("svc-report"));
        let facts = RequestFacts::new("POST", "/v1/statement", &headers);
        assert_eq!(rules.evaluate(&facts), Some("heavy"));

        let empty = HeaderMap::new();
        let facts = RequestFacts::new("POST", "/v1/statement", &empty);
        assert_eq!(rules.evaluate(&facts), None);
    }

    #[test]
    fn test_invalid_matchers_reject_the_document() {
        let two_operators = r#"
rules:
  - name: bad
    all:
      - fact: path
        equals: /v1/statement
        prefix: /v1
    routing_group: etl
"#;
        assert!(RuleSet::parse(two_operators).is_err());

        let bad_regex = r#"
rules:
  - name: bad
    all:
      - fact: user
        regex: "("
    routing_group: etl
"#;
        assert!(RuleSet::parse(bad_regex).is_err());

        let nameless_header = r#"
rules:
  - name: bad
    all:
      - fact: header
        equals: x
    routing_group: etl
"#;
        assert!(RuleSet::parse(nameless_header).is_err());
    }

    #[test]
    fn test_reload_on_newer_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        let start = SystemTime::now();
        write_rules(&path, RULES_V1, start);

        let selector = RuleReloadingSelector::new(path.clone());
        let headers = airflow_headers();
        let facts = RequestFacts::new("POST", "/v1/statement", &headers);
        assert_eq!(selector.find_routing_group(&facts).as_deref(), Some("etl"));

        write_rules(&path, RULES_V2, start + Duration::from_secs(10));
        assert_eq!(
            selector.find_routing_group(&facts).as_deref(),
            Some("scheduled")
        );

        // A broken update keeps the last good rules, not the header fallback
        write_rules(&path, "rules: [ {", start + Duration::from_secs(20));
        let mut headers = airflow_headers();
        headers.insert(
            extract::ROUTING_GROUP_HEADER,
            HeaderValue::from_static("from-header"),
        );
        let facts = RequestFacts::new("POST", "/v1/statement", &headers);
        assert_eq!(
            selector.find_routing_group(&facts).as_deref(),
            Some("scheduled")
        );
        assert_eq!(selector.current().unwrap().len(), 1);
    }

    #[test]
    fn test_header_fallback_until_rules_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");

        let selector = RuleReloadingSelector::new(path.clone());
        let mut headers = airflow_headers();
        headers.insert(
            extract::ALTERNATE_ROUTING_GROUP_HEADER,
            HeaderValue::from_static("from-header"),
        );
        let facts = RequestFacts::new("POST", "/v1/statement", &headers);
        assert_eq!(
            selector.find_routing_group(&facts).as_deref(),
            Some("from-header")
        );

        write_rules(&path, RULES_V1, SystemTime::now());
        assert_eq!(selector.find_routing_group(&facts).as_deref(), Some("etl"));
    }
}
