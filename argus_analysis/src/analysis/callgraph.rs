// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Upward searches over the call graph: finding the wrapper methods through
//! which a common caller reaches a target, and finding common ancestors of
//! two method sets by layered expansion.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use argus_models::models::{ApkInfo, Method};

/// Maximum upward expansion depth used by [`find_intersection`].
pub const MAX_SEARCH_LAYER: usize = 3;

#[derive(Debug, PartialEq, Eq)]
pub enum SearchError {
    EmptyInput,
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::EmptyInput => f.write_str("intersection of an empty method set"),
        }
    }
}

impl std::error::Error for SearchError {}

/// Walk upward from `base` along caller edges and collect the methods whose
/// direct callers contain `parent`: the entry points from `parent` into the
/// subtree containing `base`. These are the "wrapper methods" reported as
/// evidence. The traversal uses an explicit stack, so pathological call
/// graphs cannot exhaust the native stack.
pub fn find_previous_method<A: ApkInfo + ?Sized>(
    apk: &A,
    base: &Arc<Method>,
    parent: &Method,
    wrappers: &mut Vec<Arc<Method>>,
    visited: &mut HashSet<Arc<Method>>,
) {
    let mut stack = vec![base.clone()];
    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        let callers = apk.upperfunc(&current);
        if callers.iter().any(|c| c.as_ref() == parent) {
            if !wrappers.contains(&current) {
                wrappers.push(current);
            }
        } else {
            for caller in callers {
                if !visited.contains(&caller) {
                    stack.push(caller);
                }
            }
        }
    }
}

/// Find any overlap of two method sets, widening both layer by layer along
/// caller edges. Every ancestor found at the first non-empty layer is
/// returned, in deterministic order.
///
/// The expansion keeps the previous layer as a seed, so growth is monotone
/// and a common ancestor at any distance within `max_layer` is found; beyond
/// that the search reports absence.
pub fn find_intersection<A: ApkInfo + ?Sized>(
    apk: &A,
    first: &BTreeSet<Arc<Method>>,
    second: &BTreeSet<Arc<Method>>,
    depth: usize,
    max_layer: usize,
) -> Result<BTreeSet<Arc<Method>>, SearchError> {
    if first.is_empty() || second.is_empty() {
        return Err(SearchError::EmptyInput);
    }
    let common: BTreeSet<Arc<Method>> = first.intersection(second).cloned().collect();
    if !common.is_empty() {
        return Ok(common);
    }
    if depth > max_layer {
        return Ok(BTreeSet::new());
    }
    let mut expanded_first = first.clone();
    for method in first {
        expanded_first.extend(apk.upperfunc(method));
    }
    let mut expanded_second = second.clone();
    for method in second {
        expanded_second.extend(apk.upperfunc(method));
    }
    find_intersection(apk, &expanded_first, &expanded_second, depth + 1, max_layer)
}

/// Whether the transitive caller closures of the two seed sets overlap at
/// any distance. This is the unbounded variant backing the co-existence
/// stage; [`find_intersection`] is the bounded one.
pub fn shares_ancestor<A: ApkInfo + ?Sized>(
    apk: &A,
    first: &BTreeSet<Arc<Method>>,
    second: &BTreeSet<Arc<Method>>,
) -> bool {
    let first_closure = caller_closure(apk, first);
    let second_closure = caller_closure(apk, second);
    first_closure.intersection(&second_closure).next().is_some()
}

fn caller_closure<A: ApkInfo + ?Sized>(
    apk: &A,
    seeds: &BTreeSet<Arc<Method>>,
) -> BTreeSet<Arc<Method>> {
    let mut closure: BTreeSet<Arc<Method>> = seeds.clone();
    let mut stack: Vec<Arc<Method>> = seeds.iter().cloned().collect();
    while let Some(current) = stack.pop() {
        for caller in apk.upperfunc(&current) {
            if closure.insert(caller.clone()) {
                stack.push(caller);
            }
        }
    }
    closure
}
