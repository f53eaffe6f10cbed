// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The five-stage matcher. Per rule it decides whether the two target APIs
//! exist, are invoked, share a caller, share a common ancestor within the
//! search bound, and finally whether the two calls received an overlapping
//! argument expression inside such an ancestor.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
use rayon::iter::ParallelIterator;

use argus_macros::iterator;
use argus_models::models::{ApkInfo, Method, Rule, RuleSet};
use regex::Regex;

use super::callgraph::{find_intersection, find_previous_method, shares_ancestor, MAX_SEARCH_LAYER};
use super::register_flow::RegisterFlow;
use super::{BehaviorAnalysis, CallEvidence, ConfidenceLevel};

/// Per-scan tunables.
#[derive(Clone, Copy, Debug)]
pub struct ScanOptions {
    /// Maximum upward expansion depth for the common-ancestor search. Zero
    /// degrades the ancestor stage to direct-caller matching.
    pub max_search_layer: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_search_layer: MAX_SEARCH_LAYER,
        }
    }
}

/// Drives the stages for every rule of a ruleset against one application.
/// The matcher holds only borrowed, read-only state; all findings go into
/// the [`BehaviorAnalysis`] passed through the rule evaluations.
pub struct BehaviorMatcher<'a, A: ApkInfo> {
    apk: &'a A,
    options: ScanOptions,
}

impl<'a, A: ApkInfo> BehaviorMatcher<'a, A> {
    pub fn new(apk: &'a A) -> Self {
        Self {
            apk,
            options: ScanOptions::default(),
        }
    }

    pub fn with_options(apk: &'a A, options: ScanOptions) -> Self {
        Self { apk, options }
    }

    /// Evaluate every rule and collect the results into a fresh analysis.
    pub fn run(&self, rules: &RuleSet) -> BehaviorAnalysis {
        let mut analysis = BehaviorAnalysis::new();
        self.run_into(rules, &mut analysis);
        analysis
    }

    pub fn run_into(&self, rules: &RuleSet, analysis: &mut BehaviorAnalysis) {
        for rule in rules.iter() {
            if let Err(e) = rule.validate() {
                log::warn!("skipping malformed rule {:?}: {}", rule.crime, e);
                continue;
            }
            let confidence = self.run_rule(rule, analysis);
            log::debug!("rule {:?} reached {}%", rule.crime, confidence.percent());
            analysis.record_rule(rule, confidence);
        }
    }

    /// Run the five stages for a single rule. The returned level is the
    /// highest stage satisfied.
    pub fn run_rule(&self, rule: &Rule, analysis: &mut BehaviorAnalysis) -> ConfidenceLevel {
        let first_candidates = self.find_api_usage(rule.first_api());
        let second_candidates = self.find_api_usage(rule.second_api());
        if first_candidates.is_empty() || second_candidates.is_empty() {
            return ConfidenceLevel::None;
        }

        let first_called = self.invoked_only(first_candidates);
        let second_called = self.invoked_only(second_candidates);
        if first_called.is_empty() && second_called.is_empty() {
            return ConfidenceLevel::ApisFound;
        }
        if first_called.is_empty() || second_called.is_empty() {
            return ConfidenceLevel::ApisInvoked;
        }

        let mut coexists = false;
        'pairs: for first in &first_called {
            for second in &second_called {
                let first_callers = caller_set(self.apk, first);
                let second_callers = caller_set(self.apk, second);
                if shares_ancestor(self.apk, &first_callers, &second_callers) {
                    coexists = true;
                    break 'pairs;
                }
            }
        }
        if !coexists {
            return ConfidenceLevel::ApisInvoked;
        }

        let mut ancestor_pairs = vec![];
        for first in &first_called {
            for second in &second_called {
                let first_callers = caller_set(self.apk, first);
                let second_callers = caller_set(self.apk, second);
                let ancestors = match find_intersection(
                    self.apk,
                    &first_callers,
                    &second_callers,
                    1,
                    self.options.max_search_layer,
                ) {
                    Ok(ancestors) => ancestors,
                    Err(e) => {
                        log::debug!("no ancestor search for {}: {}", rule.crime, e);
                        continue;
                    }
                };
                if !ancestors.is_empty() {
                    ancestor_pairs.push((first.clone(), second.clone(), ancestors));
                }
            }
        }
        if ancestor_pairs.is_empty() {
            return ConfidenceLevel::SharedCaller;
        }

        let mut matched = false;
        for (first, second, ancestors) in &ancestor_pairs {
            for parent in ancestors {
                if self.check_parameter(rule, parent, first, second, analysis) {
                    matched = true;
                }
            }
        }
        if matched {
            ConfidenceLevel::SharedRegister
        } else {
            ConfidenceLevel::CommonAncestor
        }
    }

    /// Resolve a rule API: the exact method if present, otherwise every
    /// bodyless method with the same name and descriptor declared on a
    /// subclass of the requested class. Applications commonly invoke
    /// framework APIs through a subclass whose name the rule does not spell
    /// out.
    pub fn find_api_usage(&self, api: &Method) -> Vec<Arc<Method>> {
        if let Some(exact) = self
            .apk
            .find_method(&api.class_name, &api.name, &api.descriptor)
        {
            return vec![exact];
        }
        let candidates = self.apk.find_methods_by_name(&api.name, &api.descriptor);
        let mut hits: Vec<Arc<Method>> = iterator!(candidates)
            .filter(|m| {
                self.apk.get_method_bytecode(m).is_empty()
                    && self.is_subclass_of(&m.class_name, &api.class_name)
            })
            .map(|m| m.clone())
            .collect();
        hits.sort();
        hits
    }

    fn invoked_only(&self, methods: Vec<Arc<Method>>) -> Vec<Arc<Method>> {
        methods
            .into_iter()
            .filter(|m| !self.apk.upperfunc(m).is_empty())
            .collect()
    }

    /// Transitive superclass climb, stopping at `Ljava/lang/Object;`.
    fn is_subclass_of(&self, class_name: &str, ancestor: &str) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![class_name.to_string()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for superclass in self.apk.superclass_relationships(&current) {
                if superclass == ancestor {
                    return true;
                }
                if superclass != "Ljava/lang/Object;" {
                    stack.push(superclass);
                }
            }
        }
        false
    }

    /// Stage 5 for one `(ancestor, api, api)` triple: evaluate the ancestor,
    /// scan the call traces for both wrapper patterns and apply the keyword
    /// constraint. Successful traces append evidence and the wrapper snippet.
    fn check_parameter(
        &self,
        rule: &Rule,
        parent: &Arc<Method>,
        first_api: &Arc<Method>,
        second_api: &Arc<Method>,
        analysis: &mut BehaviorAnalysis,
    ) -> bool {
        let mut first_wrappers = vec![];
        let mut visited = HashSet::new();
        find_previous_method(self.apk, first_api, parent, &mut first_wrappers, &mut visited);
        let mut second_wrappers = vec![];
        let mut visited = HashSet::new();
        find_previous_method(self.apk, second_api, parent, &mut second_wrappers, &mut visited);
        if first_wrappers.is_empty() || second_wrappers.is_empty() {
            panic!(
                "{} was selected as common ancestor of {} and {} but reaches no call site",
                parent, first_api, second_api
            );
        }

        let bytecode = self.apk.get_method_bytecode(parent);
        if bytecode.is_empty() {
            return false;
        }
        let table = RegisterFlow::evaluate(&bytecode);
        let traces = table.traces();

        let mut matched = false;
        for first_wrapper in &first_wrappers {
            for second_wrapper in &second_wrappers {
                let first_pattern = first_wrapper.pattern();
                let second_pattern = second_wrapper.pattern();
                for trace in &traces {
                    if !contains_both(trace, &first_pattern, &second_pattern) {
                        continue;
                    }
                    if !self.keywords_match(rule, trace, &first_pattern, &second_pattern) {
                        continue;
                    }
                    analysis.evidence.push(CallEvidence {
                        parent: parent.clone(),
                        first_call: first_wrapper.clone(),
                        second_call: second_wrapper.clone(),
                        first_api: first_api.clone(),
                        second_api: second_api.clone(),
                        crime: rule.crime.clone(),
                    });
                    analysis.parent_wrapper_mapping.insert(
                        parent.pattern(),
                        self.apk.get_wrapper_smali(parent, first_wrapper, second_wrapper),
                    );
                    matched = true;
                    break;
                }
            }
        }
        matched
    }

    fn keywords_match(
        &self,
        rule: &Rule,
        trace: &str,
        first_pattern: &str,
        second_pattern: &str,
    ) -> bool {
        let Some(keywords) = &rule.keywords else {
            return true;
        };
        if keywords.len() != 2 || keywords.iter().all(|k| k.is_none()) {
            return true;
        }
        let mut hits = matched_keywords(trace, first_pattern, keywords[0].as_deref(), rule.regex);
        hits.extend(matched_keywords(
            trace,
            second_pattern,
            keywords[1].as_deref(),
            rule.regex,
        ));
        !hits.is_empty()
    }
}

/// Whether a trace contains both patterns; an identical pattern pair has to
/// occur at least twice, so a rule naming the same API twice only matches a
/// caller which feeds one invocation into another.
fn contains_both(trace: &str, first_pattern: &str, second_pattern: &str) -> bool {
    if first_pattern == second_pattern {
        trace.matches(first_pattern).count() >= 2
    } else {
        trace.contains(first_pattern) && trace.contains(second_pattern)
    }
}

/// Keywords found in the argument block following `pattern` inside `trace`.
/// Regex keywords contribute their capture groups when they have any, the
/// whole match otherwise.
fn matched_keywords(
    trace: &str,
    pattern: &str,
    keywords: Option<&[String]>,
    use_regex: bool,
) -> BTreeSet<String> {
    let mut hits = BTreeSet::new();
    let Some(keywords) = keywords else {
        return hits;
    };
    let Some(position) = trace.find(pattern) else {
        return hits;
    };
    let Some(block) = extract_paren_block(trace, position + pattern.len()) else {
        return hits;
    };
    for keyword in keywords {
        if use_regex {
            match Regex::new(keyword) {
                Ok(re) => {
                    for captures in re.captures_iter(block) {
                        if captures.len() > 1 {
                            for group in captures.iter().skip(1).flatten() {
                                hits.insert(group.as_str().to_string());
                            }
                        } else if let Some(whole) = captures.get(0) {
                            hits.insert(whole.as_str().to_string());
                        }
                    }
                }
                Err(e) => log::warn!("ignoring invalid keyword regex {:?}: {}", keyword, e),
            }
        } else if block.contains(keyword.as_str()) {
            hits.insert(keyword.clone());
        }
    }
    hits
}

/// The substring enclosed by the parenthesis at `open` and its balanced
/// closing counterpart.
pub fn extract_paren_block(source: &str, open: usize) -> Option<&str> {
    if !source.is_char_boundary(open) || !source[open..].starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    for (offset, c) in source[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&source[open + 1..open + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn caller_set<A: ApkInfo + ?Sized>(apk: &A, method: &Arc<Method>) -> BTreeSet<Arc<Method>> {
    apk.upperfunc(method).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paren_block_respects_nesting() {
        let source = "La/A;->send(Ljava/lang/String;)V(outer(inner(x),y),z)";
        let open = source.find(")V").unwrap() + 2;
        assert_eq!(
            extract_paren_block(source, open),
            Some("outer(inner(x),y),z")
        );
        assert_eq!(extract_paren_block("nothing here", 0), None);
        assert_eq!(extract_paren_block("(unclosed", 0), None);
    }

    #[test]
    fn identical_patterns_need_two_occurrences() {
        let pattern = "La/A;->enc([B)[B";
        let nested = "La/A;->enc([B)[B(La/A;->enc([B)[B(p0))";
        let single = "La/A;->enc([B)[B(p0)";
        assert!(contains_both(nested, pattern, pattern));
        assert!(!contains_both(single, pattern, pattern));
    }

    #[test]
    fn literal_keywords_search_the_argument_block() {
        let trace = "La/A;->send(Ljava/lang/String;)V(http://evil,p1)";
        let pattern = "La/A;->send(Ljava/lang/String;)V";
        let keywords = vec!["http://".to_string(), "ftp://".to_string()];
        let hits = matched_keywords(trace, pattern, Some(&keywords), false);
        assert_eq!(hits.len(), 1);
        assert!(hits.contains("http://"));
    }

    #[test]
    fn regex_keywords_flatten_capture_groups() {
        let trace = "La/A;->send(Ljava/lang/String;)V(http://evil.example/x,p1)";
        let pattern = "La/A;->send(Ljava/lang/String;)V";
        let keywords = vec!["http://([a-z.]+)/".to_string()];
        let hits = matched_keywords(trace, pattern, Some(&keywords), true);
        assert!(hits.contains("evil.example"));
    }

    #[test]
    fn keywords_outside_the_block_do_not_match() {
        let trace = "La/A;->send(Ljava/lang/String;)V(p0)http://elsewhere";
        let pattern = "La/A;->send(Ljava/lang/String;)V";
        let keywords = vec!["http://".to_string()];
        let hits = matched_keywords(trace, pattern, Some(&keywords), false);
        assert!(hits.is_empty());
    }
}
