// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Parameter definition records built from PARA files.
//!
//! A [`ParamDef`] aggregates every definition line seen for one
//! parameter name. Definitions carrying a `CASE` condition go into an
//! ordered condition table; the conditionless definition becomes the
//! default. [`ParamDef::resolve`] picks the first condition whose pairs
//! are all present in the queried parameter map.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;

/// A `CASE` condition: an ordered list of `(param, value)` equality
/// tests that must all hold.
pub type Condition = Vec<(String, String)>;

/// One parsed right-hand side in a parameter definition.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ParamValue {
    Str(String),
    List(Vec<String>),
    /// printf-style format, e.g. `%-8.3f`
    Format(String),
    /// `@name` register reference (sigil stripped)
    RegRef(String),
    /// `!name` status alias (sigil stripped)
    AliasRef(String),
    /// `&name[...]` function reference
    FuncRef(String),
    /// `(A=B, C=D)` condition, only meaningful under the `CASE` key
    Cond(Condition),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "{s}"),
            ParamValue::List(items) => write!(f, "{}", items.join(",")),
            ParamValue::Format(s) => write!(f, "{s}"),
            ParamValue::RegRef(s) => write!(f, "@{s}"),
            ParamValue::AliasRef(s) => write!(f, "!{s}"),
            ParamValue::FuncRef(s) => write!(f, "{s}"),
            ParamValue::Cond(pairs) => {
                let body = pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "({body})")
            }
        }
    }
}

/// One definition line: recognized keys are `TYPE`, `DEFAULT`, `SET`,
/// `MIN`, `MAX`, `STATUS`, `FORMAT`, `NOP` and `CASE`; keys are stored
/// upper-cased in insertion order.
pub type ParamSpec = IndexMap<String, ParamValue>;

/// Raised when no condition matches and no default definition exists.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("there is no default parameter definition for {0}")]
pub struct NoDefault(pub String);

#[derive(Debug, Clone, Default)]
pub struct ParamDef {
    pub name: String,
    pub cond_list: Vec<Condition>,
    pub def_map: IndexMap<Condition, ParamSpec>,
    pub default_def: Option<ParamSpec>,
    /// Status aliases any of this parameter's definitions binds.
    pub aliases: BTreeSet<String>,
}

impl ParamDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_conditional(&self) -> bool {
        !self.cond_list.is_empty()
    }

    /// Files one definition line under this parameter.
    pub fn add_spec(&mut self, spec: ParamSpec) {
        if let Some(ParamValue::AliasRef(alias)) = spec.get("STATUS") {
            self.aliases.insert(alias.clone());
        }

        match spec.get("CASE") {
            Some(ParamValue::Cond(cond)) => {
                let cond = cond.clone();
                self.cond_list.push(cond.clone());
                self.def_map.insert(cond, spec);
            }
            _ => {
                self.default_def = Some(spec);
            }
        }
    }

    /// Returns the spec of the first condition fully contained in
    /// `params` (keys compared case-insensitively), the default
    /// otherwise, or [`NoDefault`].
    pub fn resolve(&self, params: &IndexMap<String, String>) -> Result<&ParamSpec, NoDefault> {
        let upper: IndexMap<String, &String> = params
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();

        for cond in &self.cond_list {
            let matches = cond
                .iter()
                .all(|(k, v)| upper.get(&k.to_uppercase()).is_some_and(|have| *have == v));
            if matches {
                return Ok(&self.def_map[cond]);
            }
        }

        self.default_def
            .as_ref()
            .ok_or_else(|| NoDefault(self.name.clone()))
    }

    /// Union of every value this parameter can legally take, across all
    /// of its conditional and default definitions.
    pub fn all_param_values(&self) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        for cond in &self.cond_list {
            result.extend(spec_values(&self.def_map[cond]));
        }
        if let Some(spec) = &self.default_def {
            result.extend(spec_values(spec));
        }
        result
    }
}

fn spec_values(spec: &ParamSpec) -> BTreeSet<String> {
    let mut result = BTreeSet::new();

    match spec.get("TYPE").and_then(ParamValue::as_str) {
        Some("NUMBER") => {
            let mut bounded = false;
            for key in ["MIN", "MAX"] {
                if let Some(v) = spec.get(key) {
                    result.insert(v.to_string());
                    bounded = true;
                }
            }
            if !bounded {
                result.insert("0".to_owned());
            }
        }
        Some("CHAR") => match spec.get("SET") {
            Some(ParamValue::List(items)) => result.extend(items.iter().cloned()),
            Some(other) => {
                result.insert(other.to_string());
            }
            None => {
                if let Some(v) = spec.get("DEFAULT") {
                    result.insert(v.to_string());
                }
            }
        },
        _ => {}
    }

    if spec.get("NOP").and_then(ParamValue::as_str) == Some("NOP") {
        result.insert("NOP".to_owned());
    }
    result
}

/// A fully parsed PARA file.
#[derive(Debug, Default)]
pub struct ParaFile {
    pub name: String,
    /// Parameter names in first-seen order.
    pub order: Vec<String>,
    /// Definitions keyed by upper-cased parameter name.
    pub defs: IndexMap<String, ParamDef>,
    /// Union of status aliases over all parameters.
    pub aliases: BTreeSet<String>,
    pub errors: Vec<crate::error::ErrorRecord>,
}

impl ParaFile {
    /// Case-insensitive definition lookup.
    pub fn get(&self, name: &str) -> Option<&ParamDef> {
        self.defs.get(&name.to_uppercase())
    }

    pub(crate) fn add_spec(&mut self, name: &str, spec: ParamSpec) {
        let key = name.to_uppercase();
        if !self.defs.contains_key(&key) {
            self.order.push(name.to_owned());
        }
        let def = self.defs.entry(key).or_insert_with(|| ParamDef::new(name));
        def.add_spec(spec);
        self.aliases.extend(def.aliases.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(pairs: &[(&str, ParamValue)]) -> ParamSpec {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_default_resolution() {
        let mut def = ParamDef::new("EXPTIME");
        def.add_spec(spec(&[
            ("TYPE", ParamValue::Str("NUMBER".into())),
            ("DEFAULT", ParamValue::Str("10".into())),
        ]));

        let resolved = def.resolve(&IndexMap::new()).unwrap();
        assert_eq!(resolved.get("TYPE").unwrap().to_string(), "NUMBER");
    }

    #[test]
    fn test_first_matching_condition_wins() {
        let mut def = ParamDef::new("FILTER");
        def.add_spec(spec(&[
            ("CASE", ParamValue::Cond(vec![("MODE".into(), "IMG".into())])),
            ("DEFAULT", ParamValue::Str("R".into())),
        ]));
        def.add_spec(spec(&[
            ("CASE", ParamValue::Cond(vec![("MODE".into(), "SPEC".into())])),
            ("DEFAULT", ParamValue::Str("GRISM".into())),
        ]));
        def.add_spec(spec(&[("DEFAULT", ParamValue::Str("NONE".into()))]));

        let mut params = IndexMap::new();
        params.insert("mode".to_owned(), "IMG".to_owned());
        let resolved = def.resolve(&params).unwrap();
        assert_eq!(resolved.get("DEFAULT").unwrap().to_string(), "R");

        params.insert("mode".to_owned(), "SPEC".to_owned());
        let resolved = def.resolve(&params).unwrap();
        assert_eq!(resolved.get("DEFAULT").unwrap().to_string(), "GRISM");

        params.insert("mode".to_owned(), "OTHER".to_owned());
        let resolved = def.resolve(&params).unwrap();
        assert_eq!(resolved.get("DEFAULT").unwrap().to_string(), "NONE");
    }

    #[test]
    fn test_no_default_fails() {
        let mut def = ParamDef::new("SLIT");
        def.add_spec(spec(&[
            ("CASE", ParamValue::Cond(vec![("MODE".into(), "SPEC".into())])),
            ("DEFAULT", ParamValue::Str("0.5".into())),
        ]));

        let err = def.resolve(&IndexMap::new()).unwrap_err();
        assert_eq!(err, NoDefault("SLIT".into()));
    }

    #[test]
    fn test_cond_table_invariant() {
        let mut def = ParamDef::new("X");
        def.add_spec(spec(&[
            ("CASE", ParamValue::Cond(vec![("A".into(), "1".into())])),
            ("DEFAULT", ParamValue::Str("ONE".into())),
        ]));
        def.add_spec(spec(&[
            ("CASE", ParamValue::Cond(vec![("A".into(), "2".into())])),
            ("DEFAULT", ParamValue::Str("TWO".into())),
        ]));

        // every condition has exactly one table entry
        assert_eq!(def.cond_list.len(), def.def_map.len());
        for cond in &def.cond_list {
            assert!(def.def_map.contains_key(cond));
        }
    }

    #[test]
    fn test_all_param_values_number_and_char() {
        let mut exptime = ParamDef::new("EXPTIME");
        exptime.add_spec(spec(&[
            ("TYPE", ParamValue::Str("NUMBER".into())),
            ("MIN", ParamValue::Str("0".into())),
            ("MAX", ParamValue::Str("3600".into())),
        ]));
        let values = exptime.all_param_values();
        assert!(values.contains("0"));
        assert!(values.contains("3600"));

        let mut filter = ParamDef::new("FILTER");
        filter.add_spec(spec(&[
            ("TYPE", ParamValue::Str("CHAR".into())),
            (
                "SET",
                ParamValue::List(vec!["R".into(), "V".into(), "B".into()]),
            ),
            ("NOP", ParamValue::Str("NOP".into())),
        ]));
        let values = filter.all_param_values();
        for v in ["R", "V", "B", "NOP"] {
            assert!(values.contains(v), "missing {v}");
        }
    }

    #[test]
    fn test_status_alias_collection() {
        let mut def = ParamDef::new("RA");
        def.add_spec(spec(&[
            ("TYPE", ParamValue::Str("CHAR".into())),
            ("STATUS", ParamValue::AliasRef("TSCS.ALPHA".into())),
        ]));
        assert!(def.aliases.contains("TSCS.ALPHA"));
    }
}
