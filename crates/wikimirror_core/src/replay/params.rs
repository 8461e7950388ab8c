use std::collections::{BTreeMap, BTreeSet};

use super::QueryError;
use crate::timestamp::normalize_timestamp;

/// Top-level options that never belong to a module.
const GLOBAL_KEYS: &[&str] = &["list", "prop", "titles", "pageids", "generator"];

/// Raw `key=value` options of one query, as sent to the remote API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    values: BTreeMap<String, String>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `key=value` arguments. Multi-valued options use `|`.
    pub fn parse_pairs<I, S>(pairs: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let Some((key, value)) = pair.split_once('=') else {
                return Err(QueryError::Validation(format!(
                    "expected key=value, got '{pair}'"
                )));
            };
            params.values.insert(key.trim().to_string(), value.to_string());
        }
        Ok(params)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key).map(split_multi).unwrap_or_default()
    }

    /// Options belonging to one module, with the module prefix removed.
    pub fn module(&self, prefix: &str, generator: bool) -> ModuleParams {
        let prefix = if generator {
            format!("g{prefix}")
        } else {
            prefix.to_string()
        };
        let values = self
            .values
            .iter()
            .filter(|(key, _)| !GLOBAL_KEYS.contains(&key.as_str()))
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix.as_str())
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_string(), value.clone()))
            })
            .collect();
        ModuleParams { prefix, values }
    }
}

fn split_multi(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split('|').map(str::to_string).collect()
}

/// Timestamp bounds of a list ordered by `dir=newer|older`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub newer: bool,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

impl TimeRange {
    pub fn order(&self) -> &'static str {
        if self.newer { "ASC" } else { "DESC" }
    }
}

/// Title bounds of a list ordered by `dir=ascending|descending`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameRange {
    pub ascending: bool,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl NameRange {
    pub fn order(&self) -> &'static str {
        if self.ascending { "ASC" } else { "DESC" }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleParams {
    prefix: String,
    values: BTreeMap<String, String>,
}

impl ModuleParams {
    pub fn set_default(&mut self, key: &str, value: &str) {
        self.values
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .map(|value| split_multi(value))
            .unwrap_or_default()
    }

    pub fn set(&self, key: &str) -> BTreeSet<String> {
        self.list(key).into_iter().collect()
    }

    fn name(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Rejects options outside the module's closed allow-list.
    pub fn allow(&self, allowed: &[&str]) -> Result<(), QueryError> {
        match self.values.keys().find(|key| !allowed.contains(&key.as_str())) {
            Some(key) => Err(QueryError::Validation(format!(
                "unrecognized parameter '{}'",
                self.name(key)
            ))),
            None => Ok(()),
        }
    }

    /// Rejects options that are recognized but not replayable.
    pub fn unsupported(&self, keys: &[&str]) -> Result<(), QueryError> {
        if let Some(key) = keys.iter().find(|key| self.has(key)) {
            return Err(QueryError::Unsupported(format!(
                "parameter '{}' is not supported",
                self.name(key)
            )));
        }
        if let Some(limit) = self.values.get("limit")
            && limit != "max"
        {
            return Err(QueryError::Unsupported(format!(
                "'{}' other than 'max' is not supported",
                self.name("limit")
            )));
        }
        Ok(())
    }

    pub fn exclusive(&self, first: &str, second: &str) -> Result<(), QueryError> {
        if self.has(first) && self.has(second) {
            return Err(QueryError::Validation(format!(
                "parameters '{}' and '{}' cannot be used together",
                self.name(first),
                self.name(second)
            )));
        }
        Ok(())
    }

    pub fn requires(&self, key: &str, companion: &str) -> Result<(), QueryError> {
        if self.has(key) && !self.has(companion) {
            return Err(QueryError::Validation(format!(
                "parameter '{}' requires '{}'",
                self.name(key),
                self.name(companion)
            )));
        }
        Ok(())
    }

    pub fn subset(&self, key: &str, allowed: &[&str]) -> Result<BTreeSet<String>, QueryError> {
        let values = self.set(key);
        if let Some(value) = values.iter().find(|value| !allowed.contains(&value.as_str())) {
            return Err(QueryError::Validation(format!(
                "unrecognized value '{value}' for parameter '{}'",
                self.name(key)
            )));
        }
        Ok(values)
    }

    pub fn one_of(&self, key: &str, allowed: &[&str]) -> Result<String, QueryError> {
        let value = self.values.get(key).cloned().unwrap_or_default();
        if allowed.contains(&value.as_str()) {
            Ok(value)
        } else {
            Err(QueryError::Validation(format!(
                "unrecognized value '{value}' for parameter '{}'",
                self.name(key)
            )))
        }
    }

    pub fn int(&self, key: &str) -> Result<Option<i64>, QueryError> {
        self.get(key)
            .map(|value| {
                value.trim().parse::<i64>().map_err(|_| {
                    QueryError::Validation(format!(
                        "parameter '{}' must be an integer",
                        self.name(key)
                    ))
                })
            })
            .transpose()
    }

    pub fn ints(&self, key: &str) -> Result<Vec<i64>, QueryError> {
        self.list(key)
            .iter()
            .map(|value| {
                value.trim().parse::<i64>().map_err(|_| {
                    QueryError::Validation(format!(
                        "parameter '{}' must be a list of integers",
                        self.name(key)
                    ))
                })
            })
            .collect()
    }

    fn timestamp(&self, key: &str) -> Result<Option<String>, QueryError> {
        self.get(key)
            .map(|value| {
                normalize_timestamp(value).map_err(|_| {
                    QueryError::Validation(format!(
                        "parameter '{}' is not a valid timestamp",
                        self.name(key)
                    ))
                })
            })
            .transpose()
    }

    /// Resolves `start`/`end` against `dir` and checks their ordering.
    pub fn time_range(&self) -> Result<TimeRange, QueryError> {
        let newer = self.one_of("dir", &["newer", "older"])? == "newer";
        let start = self.timestamp("start")?;
        let end = self.timestamp("end")?;
        let (oldest, newest) = if newer { (start, end) } else { (end, start) };
        if let (Some(oldest), Some(newest)) = (&oldest, &newest)
            && oldest > newest
        {
            return Err(QueryError::Validation(format!(
                "'{}' and '{}' are out of order for the requested direction",
                self.name("start"),
                self.name("end")
            )));
        }
        Ok(TimeRange {
            newer,
            oldest,
            newest,
        })
    }

    /// Resolves `from`/`to` against `dir` and checks their ordering.
    pub fn name_range(&self) -> Result<NameRange, QueryError> {
        let ascending = self.one_of("dir", &["ascending", "descending"])? == "ascending";
        let from = self.get("from").map(str::to_string);
        let to = self.get("to").map(str::to_string);
        let (low, high) = if ascending { (&from, &to) } else { (&to, &from) };
        if let (Some(low), Some(high)) = (low, high)
            && low > high
        {
            return Err(QueryError::Validation(format!(
                "'{}' and '{}' are out of order for the requested direction",
                self.name("from"),
                self.name("to")
            )));
        }
        Ok(NameRange {
            ascending,
            from: if ascending { from.clone() } else { to.clone() },
            to: if ascending { to } else { from },
        })
    }

    /// Validates a `show` option of `flag` / `!flag` entries.
    pub fn show_flags(&self, allowed: &[&str]) -> Result<BTreeMap<String, bool>, QueryError> {
        let mut out = BTreeMap::new();
        for value in self.list("show") {
            let (flag, wanted) = match value.strip_prefix('!') {
                Some(flag) => (flag.to_string(), false),
                None => (value.clone(), true),
            };
            if !allowed.contains(&flag.as_str()) {
                return Err(QueryError::Validation(format!(
                    "unrecognized value '{value}' for parameter '{}'",
                    self.name("show")
                )));
            }
            if out.insert(flag, wanted).is_some() {
                return Err(QueryError::Validation(format!(
                    "contradictory values for parameter '{}'",
                    self.name("show")
                )));
            }
        }
        Ok(out)
    }
}
