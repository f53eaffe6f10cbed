// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Analysis primitives and the per-run accumulator. The matcher in
//! [`behavior`] drives the stages, queries the call graph through
//! [`callgraph`] and evaluates candidate callers with [`register_flow`];
//! everything it finds ends up in a [`BehaviorAnalysis`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use argus_models::models::{Method, Rule, WrapperSnippet};

pub mod behavior;
pub mod callgraph;
pub mod register_flow;

/// The five monotone stages a rule can reach, plus the zero stage for rules
/// whose APIs do not resolve at all.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum ConfidenceLevel {
    /// Neither API (or only one) resolves in the application.
    None,
    /// Both APIs resolve, exactly or through a subclass shim.
    ApisFound,
    /// At least one resolved API is invoked somewhere.
    ApisInvoked,
    /// The two APIs share a caller at some distance.
    SharedCaller,
    /// A common ancestor exists within the search bound.
    CommonAncestor,
    /// The two calls share a register-derived argument lineage.
    SharedRegister,
}

impl ConfidenceLevel {
    pub fn percent(&self) -> u8 {
        match self {
            ConfidenceLevel::None => 0,
            ConfidenceLevel::ApisFound => 20,
            ConfidenceLevel::ApisInvoked => 40,
            ConfidenceLevel::SharedCaller => 60,
            ConfidenceLevel::CommonAncestor => 80,
            ConfidenceLevel::SharedRegister => 100,
        }
    }
}

/// One concrete call-site finding: inside `parent` the call to `first_call`
/// and the call to `second_call` share a data lineage. The wrapper methods
/// can differ from the rule APIs when the parent reaches an API through an
/// intermediate method.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallEvidence {
    pub parent: Arc<Method>,
    pub first_call: Arc<Method>,
    pub second_call: Arc<Method>,
    pub first_api: Arc<Method>,
    pub second_api: Arc<Method>,
    pub crime: String,
}

/// Final confidence of a single rule.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RuleResult {
    pub rule: Rule,
    pub confidence: ConfidenceLevel,
}

/// Accumulator for one (application, ruleset) run. Mutated by the matcher,
/// consumed by reporters. Passed explicitly into every rule evaluation; there
/// is no process-wide instance.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct BehaviorAnalysis {
    /// Call-site evidence, append-only, in rule evaluation order.
    pub evidence: Vec<CallEvidence>,
    /// Ancestor full name to its invoke snippet; last writer wins, which is
    /// deterministic under the fixed rule order.
    pub parent_wrapper_mapping: HashMap<String, WrapperSnippet>,
    /// Per-rule outcomes in ruleset order.
    pub rule_results: Vec<RuleResult>,
    /// Sum over rules of `score * confidence / 100`.
    pub weighted_sum: f64,
    /// Permissions of fully matched rules.
    pub permissions: BTreeSet<String>,
}

impl BehaviorAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_rule(&mut self, rule: &Rule, confidence: ConfidenceLevel) {
        self.weighted_sum += rule.score * f64::from(confidence.percent()) / 100.0;
        if confidence == ConfidenceLevel::SharedRegister {
            self.permissions.extend(rule.permission.iter().cloned());
        }
        self.rule_results.push(RuleResult {
            rule: rule.clone(),
            confidence,
        });
    }

    /// Rules at or above the given confidence threshold (one of 20, 40, 60,
    /// 80, 100). Everything below is suppressed from reports.
    pub fn passed_rules(&self, threshold: u8) -> Vec<&RuleResult> {
        self.rule_results
            .iter()
            .filter(|r| r.confidence.percent() >= threshold)
            .collect()
    }

    /// Evidence belonging to a rule, by its crime description.
    pub fn evidence_for_crime(&self, crime: &str) -> Vec<&CallEvidence> {
        self.evidence.iter().filter(|e| e.crime == crime).collect()
    }
}
