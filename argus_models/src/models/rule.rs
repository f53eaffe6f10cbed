// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use super::Method;

/// A behavior rule: two target APIs which, when reached from a common caller
/// with overlapping data flow, indicate the described behavior.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Rule {
    pub crime: String,
    #[serde(default)]
    pub permission: Vec<String>,
    pub api: Vec<Method>,
    pub score: f64,
    #[serde(default)]
    pub label: Vec<String>,
    /// Optional per-API keyword constraint. When present this must hold one
    /// entry per API, each either `null` or a list of keywords which have to
    /// appear among the arguments of that call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<Option<Vec<String>>>>,
    /// Interpret keywords as regular expressions instead of literal
    /// substrings.
    #[serde(default)]
    pub regex: bool,
}

impl Rule {
    pub fn from_json(content: &str) -> Result<Self, RuleError> {
        let rule: Rule = serde_json::from_str(content)?;
        rule.validate()?;
        Ok(rule)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RuleError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.api.len() != 2 {
            return Err(RuleError::BadApiCount(self.api.len()));
        }
        for api in &self.api {
            if !api.class_name.starts_with('L')
                || !api.class_name.ends_with(';')
                || api.name.is_empty()
                || !api.descriptor.starts_with('(')
                || !api.descriptor.contains(')')
            {
                return Err(RuleError::IncompleteSignature(api.pattern()));
            }
        }
        if !(self.score > 0.0) {
            return Err(RuleError::NonPositiveScore(self.score));
        }
        if let Some(keywords) = &self.keywords {
            if keywords.len() != 2 {
                return Err(RuleError::BadKeywords(keywords.len()));
            }
        }
        Ok(())
    }

    pub fn first_api(&self) -> &Method {
        &self.api[0]
    }

    pub fn second_api(&self) -> &Method {
        &self.api[1]
    }
}

#[derive(Debug)]
pub enum RuleError {
    Io(std::io::Error),
    Json(serde_json::Error),
    BadApiCount(usize),
    IncompleteSignature(String),
    NonPositiveScore(f64),
    BadKeywords(usize),
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::Io(e) => write!(f, "could not read rule file: {}", e),
            RuleError::Json(e) => write!(f, "rule is not valid JSON: {}", e),
            RuleError::BadApiCount(n) => {
                write!(f, "rule must name exactly 2 apis, found {}", n)
            }
            RuleError::IncompleteSignature(sig) => {
                write!(f, "api entry is not a complete signature: {}", sig)
            }
            RuleError::NonPositiveScore(score) => {
                write!(f, "score must be positive, found {}", score)
            }
            RuleError::BadKeywords(n) => {
                write!(f, "keywords must hold one entry per api, found {}", n)
            }
        }
    }
}

impl std::error::Error for RuleError {}

impl From<std::io::Error> for RuleError {
    fn from(e: std::io::Error) -> Self {
        RuleError::Io(e)
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(e: serde_json::Error) -> Self {
        RuleError::Json(e)
    }
}

/// A loaded collection of rules. Files are read in lexicographic order so a
/// registry directory always produces the same rule order.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Load every `*.json` document in `dir`. Malformed rules are logged and
    /// skipped; a single bad document never aborts the run.
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self, RuleError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut rules = Vec::with_capacity(paths.len());
        for path in paths {
            match Rule::from_file(&path) {
                Ok(rule) => rules.push(rule),
                Err(e) => log::warn!("skipping rule {}: {}", path.display(), e),
            }
        }
        Ok(Self { rules })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Group rules by their tags. Rules without tags are grouped under the
    /// empty string.
    pub fn group_by_label(&self) -> BTreeMap<String, Vec<&Rule>> {
        let mut groups: BTreeMap<String, Vec<&Rule>> = BTreeMap::new();
        for rule in &self.rules {
            if rule.label.is_empty() {
                groups.entry(String::new()).or_default().push(rule);
            }
            for label in &rule.label {
                groups.entry(label.clone()).or_default().push(rule);
            }
        }
        groups
    }
}
