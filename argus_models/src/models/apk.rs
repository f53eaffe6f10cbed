// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
use rayon::iter::ParallelIterator;

use argus_macros::iterator;
use petgraph::graph::{DiGraph, NodeIndex};

use super::{Instruction, Method};

/// The invoke lines for the two calls inside a common caller, extracted for
/// reporting. `first`/`second` hold `[mnemonic, callee signature]`; the hex
/// fields carry the raw instruction bytes where the backing parser provides
/// them.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WrapperSnippet {
    pub first: Vec<String>,
    pub first_hex: String,
    pub second: Vec<String>,
    pub second_hex: String,
}

/// Uniform query surface over a parsed application. Implementations wrap an
/// external bytecode parser; [`ApkModel`] is the in-memory implementation used
/// by hosts which already extracted the data (and by the test suite).
///
/// Implementations must be deterministic: the same query must yield the same
/// iteration order on every call, since matcher tie-breaking depends on stable
/// ordering. All data is immutable after construction.
pub trait ApkInfo: Sync {
    /// Exact lookup by the identity triple.
    fn find_method(&self, class_name: &str, name: &str, descriptor: &str) -> Option<Arc<Method>>;

    /// Every method referenced by the application, declared or external.
    fn all_methods(&self) -> Vec<Arc<Method>>;

    /// All methods sharing a name and descriptor, regardless of class.
    fn find_methods_by_name(&self, name: &str, descriptor: &str) -> Vec<Arc<Method>>;

    /// The instruction stream of a method in program order. Empty for
    /// native, abstract and external methods.
    fn get_method_bytecode(&self, method: &Method) -> Vec<Instruction>;

    /// Direct callers of `method` (reverse call edges).
    fn upperfunc(&self, method: &Method) -> Vec<Arc<Method>>;

    /// Direct callees of `method` with their per-caller call order.
    fn lowerfunc(&self, method: &Method) -> Vec<(Arc<Method>, usize)>;

    /// Direct superclasses and implemented interfaces of a class.
    fn superclass_relationships(&self, class_name: &str) -> Vec<String>;

    /// Permissions declared by the application manifest.
    fn permissions(&self) -> Vec<String>;

    /// The invoke lines for `first` and `second` inside `parent`.
    fn get_wrapper_smali(
        &self,
        parent: &Method,
        first: &Method,
        second: &Method,
    ) -> WrapperSnippet;
}

/// In-memory application model backed by a petgraph call graph. Methods are
/// interned on first sight; call edges are derived from the `invoke-*`
/// instructions of inserted bytecode, so the graph always agrees with the
/// instruction streams.
#[derive(Debug, Default)]
pub struct ApkModel {
    methods: Vec<Arc<Method>>,
    node_mapping: HashMap<Arc<Method>, NodeIndex>,
    call_graph: DiGraph<Arc<Method>, i32>,
    bytecode: HashMap<Arc<Method>, Vec<Instruction>>,
    calls: HashMap<Arc<Method>, Vec<Arc<Method>>>,
    superclasses: HashMap<String, Vec<String>>,
    permissions: Vec<String>,
}

impl ApkModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a method without a body (external API, abstract or native).
    pub fn add_method(&mut self, class_name: &str, name: &str, descriptor: &str) -> Arc<Method> {
        self.intern(&Method::new(class_name, name, descriptor))
    }

    /// Intern a method together with its instruction stream. Every `invoke-*`
    /// in the stream adds a call edge and interns the callee.
    pub fn add_method_with_bytecode(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
        instructions: Vec<Instruction>,
    ) -> Arc<Method> {
        let caller = self.intern(&Method::new(class_name, name, descriptor));
        let caller_node = self.node_mapping[&caller];
        for ins in &instructions {
            if let Some(callee) = ins.invoked_method() {
                let callee = self.intern(callee);
                let callee_node = self.node_mapping[&callee];
                if !self.call_graph.contains_edge(caller_node, callee_node) {
                    self.call_graph.add_edge(caller_node, callee_node, 1);
                }
                self.calls
                    .entry(caller.clone())
                    .or_default()
                    .push(callee);
            }
        }
        self.bytecode.insert(caller.clone(), instructions);
        caller
    }

    pub fn add_superclass(&mut self, class_name: &str, superclass: &str) {
        let supers = self.superclasses.entry(class_name.to_string()).or_default();
        if !supers.iter().any(|s| s == superclass) {
            supers.push(superclass.to_string());
        }
    }

    pub fn add_permission(&mut self, permission: &str) {
        self.permissions.push(permission.to_string());
    }

    fn intern(&mut self, method: &Method) -> Arc<Method> {
        if let Some((existing, _)) = self.node_mapping.get_key_value(method) {
            return existing.clone();
        }
        let method = Arc::new(method.clone());
        let node = self.call_graph.add_node(method.clone());
        self.node_mapping.insert(method.clone(), node);
        self.methods.push(method.clone());
        method
    }
}

impl ApkInfo for ApkModel {
    fn find_method(&self, class_name: &str, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        self.node_mapping
            .get_key_value(&Method::new(class_name, name, descriptor))
            .map(|(method, _)| method.clone())
    }

    fn all_methods(&self) -> Vec<Arc<Method>> {
        let mut methods = self.methods.clone();
        methods.sort();
        methods
    }

    fn find_methods_by_name(&self, name: &str, descriptor: &str) -> Vec<Arc<Method>> {
        let mut hits: Vec<Arc<Method>> = iterator!(self.methods)
            .filter(|m| m.name == name && m.descriptor == descriptor)
            .map(|m| m.clone())
            .collect();
        hits.sort();
        hits
    }

    fn get_method_bytecode(&self, method: &Method) -> Vec<Instruction> {
        self.bytecode.get(method).cloned().unwrap_or_default()
    }

    fn upperfunc(&self, method: &Method) -> Vec<Arc<Method>> {
        let Some(&node) = self.node_mapping.get(method) else {
            return vec![];
        };
        let mut callers: Vec<Arc<Method>> = self
            .call_graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|n| self.call_graph[n].clone())
            .collect();
        callers.sort();
        callers.dedup();
        callers
    }

    fn lowerfunc(&self, method: &Method) -> Vec<(Arc<Method>, usize)> {
        self.calls
            .get(method)
            .map(|callees| {
                callees
                    .iter()
                    .enumerate()
                    .map(|(order, callee)| (callee.clone(), order))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn superclass_relationships(&self, class_name: &str) -> Vec<String> {
        let mut supers = self
            .superclasses
            .get(class_name)
            .cloned()
            .unwrap_or_default();
        supers.sort();
        supers
    }

    fn permissions(&self) -> Vec<String> {
        self.permissions.clone()
    }

    fn get_wrapper_smali(
        &self,
        parent: &Method,
        first: &Method,
        second: &Method,
    ) -> WrapperSnippet {
        let mut snippet = WrapperSnippet {
            first: vec!["invoke".to_string(), first.pattern()],
            second: vec!["invoke".to_string(), second.pattern()],
            ..WrapperSnippet::default()
        };
        for ins in self.get_method_bytecode(parent) {
            let Some(callee) = ins.invoked_method() else {
                continue;
            };
            if callee == first || callee == second {
                let line = vec![ins.mnemonic.clone(), callee.pattern()];
                if callee == first {
                    snippet.first = line.clone();
                }
                if callee == second {
                    snippet.second = line;
                }
            }
        }
        snippet
    }
}
