// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Linear symbolic evaluation of a single method. The instruction stream is
//! interpreted in program order with no branching: every handled opcode
//! updates a register table of value expressions, every `invoke-*` forms a
//! call node over the current register contents. Opcodes outside the handled
//! set leave their destination untouched. This trades fidelity for a
//! linear-time pass; values killed on one side of a conditional are not
//! modelled.

use std::collections::HashMap;
use std::sync::Arc;

use argus_models::models::{Instruction, Operand};
use lazy_static::lazy_static;

/// A symbolic value held by a register: a constant, a stand-in for a value
/// which predates the evaluated method, a call composition or a bytecode
/// operation over other values. Children are references to already-built
/// nodes, so a tree can never contain a cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueNode {
    Literal { value: String },
    Placeholder { name: String },
    Call { method: String, args: Vec<Arc<ValueNode>> },
    Operation { op: &'static str, operands: Vec<Arc<ValueNode>> },
}

impl ValueNode {
    pub fn literal(value: &str) -> Arc<Self> {
        Arc::new(ValueNode::Literal {
            value: value.to_string(),
        })
    }

    /// Render the textual trace of this value. Calls render as
    /// `pattern(arg1,arg2)`, so the trace of every call contains the traces
    /// of all values which fed into it as substrings.
    pub fn resolve(&self) -> String {
        match self {
            ValueNode::Literal { value } => value.clone(),
            ValueNode::Placeholder { name } => name.clone(),
            ValueNode::Call { method, args } => {
                let args: Vec<String> = args.iter().map(|a| a.resolve()).collect();
                format!("{}({})", method, args.join(","))
            }
            ValueNode::Operation { op, operands } => {
                let operands: Vec<String> = operands.iter().map(|a| a.resolve()).collect();
                format!("{}({})", op, operands.join(", "))
            }
        }
    }

    /// All call nodes contributing to `node`, including itself.
    pub fn prior_calls(node: &Arc<ValueNode>) -> Vec<Arc<ValueNode>> {
        let mut calls = vec![];
        let mut stack = vec![node.clone()];
        while let Some(current) = stack.pop() {
            match current.as_ref() {
                ValueNode::Call { args, .. } => {
                    stack.extend(args.iter().cloned());
                    calls.push(current);
                }
                ValueNode::Operation { operands, .. } => stack.extend(operands.iter().cloned()),
                _ => {}
            }
        }
        calls
    }
}

/// State of a single register: the expression written last plus every call
/// which consumed this register as an argument.
#[derive(Clone, Debug)]
pub struct RegisterState {
    pub value: Arc<ValueNode>,
    pub called_by: Vec<Arc<ValueNode>>,
}

impl RegisterState {
    fn new(value: Arc<ValueNode>) -> Self {
        Self {
            value,
            called_by: vec![],
        }
    }

    /// All calls this register was involved in, walking the nested argument
    /// trees of its consumers.
    pub fn involved_calls(&self) -> Vec<Arc<ValueNode>> {
        self.called_by
            .iter()
            .flat_map(ValueNode::prior_calls)
            .collect()
    }
}

/// The evaluation result: register name to state, plus the ordered log of
/// every call node formed while walking the method.
#[derive(Clone, Debug, Default)]
pub struct RegisterTable {
    registers: HashMap<String, RegisterState>,
    call_log: Vec<Arc<ValueNode>>,
}

impl RegisterTable {
    pub fn get(&self, register: &str) -> Option<&RegisterState> {
        self.registers.get(register)
    }

    pub fn register_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.registers.keys().map(|k| k.as_str()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.call_log.is_empty()
    }

    pub fn call_log(&self) -> &[Arc<ValueNode>] {
        &self.call_log
    }

    /// The textual traces of every call formed in the method, in formation
    /// order. This is the substrate the matcher scans for co-occurring
    /// invocation patterns.
    pub fn traces(&self) -> Vec<String> {
        self.call_log.iter().map(|c| c.resolve()).collect()
    }
}

type Handler = fn(&mut RegisterFlow, &Instruction);

lazy_static! {
    static ref HANDLERS: HashMap<String, Handler> = dispatch_table();
}

const BINOPS: [&str; 11] = [
    "add", "sub", "mul", "div", "rem", "and", "or", "xor", "shl", "shr", "ushr",
];
const NUMERIC_TYPES: [&str; 4] = ["int", "long", "float", "double"];

fn dispatch_table() -> HashMap<String, Handler> {
    let mut table: HashMap<String, Handler> = HashMap::new();
    let mut put = |mnemonic: &str, handler: Handler| {
        table.insert(mnemonic.to_string(), handler);
    };

    put("new-instance", op_new_instance);

    for mnemonic in [
        "const",
        "const/4",
        "const/16",
        "const/high16",
        "const-string",
        "const-string/jumbo",
        "const-class",
    ] {
        put(mnemonic, op_const);
    }
    for mnemonic in [
        "const-wide",
        "const-wide/16",
        "const-wide/32",
        "const-wide/high16",
    ] {
        put(mnemonic, op_const_wide);
    }

    for mnemonic in [
        "move",
        "move/from16",
        "move/16",
        "move-object",
        "move-object/from16",
        "move-object/16",
        "array-length",
    ] {
        put(mnemonic, op_move);
    }
    for mnemonic in ["move-wide", "move-wide/from16", "move-wide/16"] {
        put(mnemonic, op_move_wide);
    }
    put("move-result", op_move_result);
    put("move-result-object", op_move_result);
    put("move-result-wide", op_move_result_wide);
    put("move-exception", op_move_exception);

    for base in [
        "invoke-virtual",
        "invoke-direct",
        "invoke-static",
        "invoke-interface",
        "invoke-super",
        "invoke-polymorphic",
        "invoke-custom",
    ] {
        put(base, op_invoke);
        put(&format!("{}/range", base), op_invoke);
    }

    // No field model; the stores and loads are tolerated so the evaluator
    // stays total on real-world streams.
    for base in ["iput", "iget", "sput", "sget"] {
        for suffix in ["", "-wide", "-object", "-boolean", "-byte", "-char", "-short"] {
            put(&format!("{}{}", base, suffix), op_field);
        }
    }

    for suffix in ["", "-wide", "-object", "-boolean", "-byte", "-char", "-short"] {
        put(&format!("aget{}", suffix), op_aget);
        put(&format!("aput{}", suffix), op_aput);
    }
    put("new-array", op_new_array);
    put("filled-new-array", op_filled_new_array);
    put("filled-new-array/range", op_filled_new_array);
    put("fill-array-data", op_fill_array_data);

    for prefix in ["neg", "not"] {
        for ty in NUMERIC_TYPES {
            put(&format!("{}-{}", prefix, ty), op_unary);
        }
    }
    for from in NUMERIC_TYPES {
        for to in NUMERIC_TYPES {
            if from != to {
                put(&format!("{}-to-{}", from, to), op_cast);
            }
        }
    }
    for op in BINOPS {
        for ty in NUMERIC_TYPES {
            put(&format!("{}-{}", op, ty), op_binop);
            put(&format!("{}-{}/2addr", op, ty), op_binop_2addr);
            put(&format!("{}-{}/lit8", op, ty), op_binop_lit);
            put(&format!("{}-{}/lit16", op, ty), op_binop_lit);
        }
    }

    table
}

/// The evaluator itself. Feed instructions in program order through
/// [`RegisterFlow::execute`], or evaluate a whole stream with
/// [`RegisterFlow::evaluate`]. The evaluator is total: unknown mnemonics and
/// missing operands are skipped, reads of registers never written fabricate a
/// `p<idx>` placeholder.
#[derive(Debug, Default)]
pub struct RegisterFlow {
    registers: HashMap<String, RegisterState>,
    result_slot: Vec<Arc<ValueNode>>,
    call_log: Vec<Arc<ValueNode>>,
}

impl RegisterFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(instructions: &[Instruction]) -> RegisterTable {
        let mut flow = Self::new();
        for ins in instructions {
            flow.execute(ins);
        }
        flow.into_table()
    }

    pub fn execute(&mut self, ins: &Instruction) {
        if let Some(handler) = HANDLERS.get(ins.mnemonic.as_str()) {
            handler(self, ins);
        } else {
            log::trace!("skipping unhandled mnemonic {}", ins.mnemonic);
        }
    }

    pub fn into_table(self) -> RegisterTable {
        RegisterTable {
            registers: self.registers,
            call_log: self.call_log,
        }
    }

    fn read(&mut self, register: &str) -> Arc<ValueNode> {
        if let Some(state) = self.registers.get(register) {
            return state.value.clone();
        }
        let index: String = register.chars().filter(|c| c.is_ascii_digit()).collect();
        let placeholder = Arc::new(ValueNode::Placeholder {
            name: format!("p{}", index),
        });
        self.registers
            .insert(register.to_string(), RegisterState::new(placeholder.clone()));
        placeholder
    }

    fn write(&mut self, register: &str, value: Arc<ValueNode>) {
        self.registers
            .insert(register.to_string(), RegisterState::new(value));
    }

    fn literal_parameter(ins: &Instruction) -> Option<Arc<ValueNode>> {
        match &ins.parameter {
            Some(Operand::Literal(value)) => Some(ValueNode::literal(value)),
            Some(Operand::Type(name)) => Some(ValueNode::literal(name)),
            _ => None,
        }
    }
}

/// The upper half of a register pair: `v4` -> `v5`.
fn wide_pair(register: &str) -> Option<String> {
    let first_digit = register.find(|c: char| c.is_ascii_digit())?;
    let (prefix, digits) = register.split_at(first_digit);
    let index: u32 = digits.parse().ok()?;
    Some(format!("{}{}", prefix, index + 1))
}

fn op_new_instance(flow: &mut RegisterFlow, ins: &Instruction) {
    let (Some(register), Some(Operand::Type(type_name))) =
        (ins.registers.first(), &ins.parameter)
    else {
        return;
    };
    // an uninitialized instance: a call node without arguments, filled in by
    // the constructor invoke which follows
    let node = Arc::new(ValueNode::Call {
        method: type_name.clone(),
        args: vec![],
    });
    flow.write(register, node);
}

fn op_const(flow: &mut RegisterFlow, ins: &Instruction) {
    let (Some(register), Some(value)) =
        (ins.registers.first(), RegisterFlow::literal_parameter(ins))
    else {
        return;
    };
    flow.write(register, value);
}

fn op_const_wide(flow: &mut RegisterFlow, ins: &Instruction) {
    let (Some(register), Some(value)) =
        (ins.registers.first(), RegisterFlow::literal_parameter(ins))
    else {
        return;
    };
    flow.write(register, value.clone());
    if let Some(pair) = wide_pair(register) {
        flow.write(&pair, value);
    }
}

fn op_move(flow: &mut RegisterFlow, ins: &Instruction) {
    let [destination, source] = ins.registers.as_slice() else {
        return;
    };
    let value = flow.read(source);
    flow.write(destination, value);
}

fn op_move_wide(flow: &mut RegisterFlow, ins: &Instruction) {
    let [destination, source] = ins.registers.as_slice() else {
        return;
    };
    let value = flow.read(source);
    flow.write(destination, value);
    if let (Some(destination_pair), Some(source_pair)) = (wide_pair(destination), wide_pair(source))
    {
        let value = flow.read(&source_pair);
        flow.write(&destination_pair, value);
    }
}

fn op_move_result(flow: &mut RegisterFlow, ins: &Instruction) {
    let (Some(register), Some(result)) = (ins.registers.first(), flow.result_slot.pop()) else {
        return;
    };
    flow.write(register, result);
}

fn op_move_result_wide(flow: &mut RegisterFlow, ins: &Instruction) {
    let (Some(register), Some(result)) = (ins.registers.first(), flow.result_slot.pop()) else {
        return;
    };
    flow.write(register, result.clone());
    if let Some(pair) = wide_pair(register) {
        flow.write(&pair, result);
    }
}

fn op_move_exception(flow: &mut RegisterFlow, ins: &Instruction) {
    let Some(register) = ins.registers.first() else {
        return;
    };
    flow.write(register, ValueNode::literal("Exception"));
}

fn op_invoke(flow: &mut RegisterFlow, ins: &Instruction) {
    let Some(callee) = ins.invoked_method() else {
        return;
    };
    let mut args = Vec::with_capacity(ins.registers.len());
    for register in &ins.registers {
        args.push(flow.read(register));
    }
    let node = Arc::new(ValueNode::Call {
        method: callee.pattern(),
        args,
    });
    for register in &ins.registers {
        if let Some(state) = flow.registers.get_mut(register) {
            state.called_by.push(node.clone());
        }
    }
    flow.call_log.push(node.clone());
    // invoke-direct on <init> mutates its receiver
    if ins.mnemonic.starts_with("invoke-direct") && callee.is_constructor() {
        if let Some(receiver) = ins.registers.first() {
            if let Some(state) = flow.registers.get_mut(receiver) {
                state.value = node.clone();
            }
        }
    }
    if callee.return_type() != "V" {
        flow.result_slot.push(node);
    }
}

fn op_field(_flow: &mut RegisterFlow, _ins: &Instruction) {}

fn op_aget(flow: &mut RegisterFlow, ins: &Instruction) {
    if ins.registers.len() < 2 {
        return;
    }
    let value = flow.read(&ins.registers[1]);
    flow.write(&ins.registers[0], value);
}

fn op_aput(flow: &mut RegisterFlow, ins: &Instruction) {
    if ins.registers.len() < 2 {
        return;
    }
    let value = flow.read(&ins.registers[0]);
    flow.write(&ins.registers[1], value);
}

fn op_new_array(flow: &mut RegisterFlow, ins: &Instruction) {
    if ins.registers.len() < 2 {
        return;
    }
    let size = flow.read(&ins.registers[1]);
    flow.write(
        &ins.registers[0],
        Arc::new(ValueNode::Operation {
            op: "new-array",
            operands: vec![size],
        }),
    );
}

fn op_filled_new_array(flow: &mut RegisterFlow, ins: &Instruction) {
    let mut operands = Vec::with_capacity(ins.registers.len());
    for register in &ins.registers {
        operands.push(flow.read(register));
    }
    flow.result_slot.push(Arc::new(ValueNode::Operation {
        op: "new-array",
        operands,
    }));
}

fn op_fill_array_data(flow: &mut RegisterFlow, ins: &Instruction) {
    let Some(register) = ins.registers.first() else {
        return;
    };
    flow.write(
        register,
        Arc::new(ValueNode::Operation {
            op: "array-data",
            operands: vec![],
        }),
    );
}

fn op_unary(flow: &mut RegisterFlow, ins: &Instruction) {
    op_move(flow, ins);
}

fn op_cast(flow: &mut RegisterFlow, ins: &Instruction) {
    let [destination, source] = ins.registers.as_slice() else {
        return;
    };
    let value = flow.read(source);
    flow.write(
        destination,
        Arc::new(ValueNode::Operation {
            op: "casting",
            operands: vec![value],
        }),
    );
}

fn op_binop(flow: &mut RegisterFlow, ins: &Instruction) {
    if ins.registers.len() < 3 {
        return;
    }
    let left = flow.read(&ins.registers[1]);
    let right = flow.read(&ins.registers[2]);
    flow.write(
        &ins.registers[0],
        Arc::new(ValueNode::Operation {
            op: "binop",
            operands: vec![left, right],
        }),
    );
}

fn op_binop_2addr(flow: &mut RegisterFlow, ins: &Instruction) {
    let [destination, source] = ins.registers.as_slice() else {
        return;
    };
    let left = flow.read(destination);
    let right = flow.read(source);
    flow.write(
        destination,
        Arc::new(ValueNode::Operation {
            op: "binop",
            operands: vec![left, right],
        }),
    );
}

fn op_binop_lit(flow: &mut RegisterFlow, ins: &Instruction) {
    if ins.registers.len() < 2 {
        return;
    }
    let Some(literal) = RegisterFlow::literal_parameter(ins) else {
        return;
    };
    let left = flow.read(&ins.registers[1]);
    flow.write(
        &ins.registers[0],
        Arc::new(ValueNode::Operation {
            op: "binop",
            operands: vec![left, literal],
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_models::models::Instruction;

    #[test]
    fn invoke_and_move_compose_the_trace() {
        let instructions = vec![
            Instruction::const_string("v6", "some_string"),
            Instruction::invoke(
                "invoke-virtual",
                &["v6"],
                "Lcom/google/progress/ContactsCollector;->getContactList()Ljava/lang/String;",
            ),
            Instruction::new("move-result-object", &["v1"], None),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        assert_eq!(
            table.get("v1").unwrap().value.resolve(),
            "Lcom/google/progress/ContactsCollector;->getContactList()Ljava/lang/String;(some_string)"
        );
    }

    #[test]
    fn invoke_records_the_call_on_every_argument_register() {
        let instructions = vec![
            Instruction::const_string("v4", "first"),
            Instruction::const_string("v9", "second"),
            Instruction::invoke("invoke-static", &["v4", "v9"], "La/A;->mix(Ljava/lang/String;Ljava/lang/String;)Lb/B;"),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        let expected = "La/A;->mix(Ljava/lang/String;Ljava/lang/String;)Lb/B;(first,second)";
        assert_eq!(table.get("v4").unwrap().called_by.len(), 1);
        assert_eq!(table.get("v4").unwrap().called_by[0].resolve(), expected);
        assert_eq!(table.get("v9").unwrap().called_by[0].resolve(), expected);
        assert_eq!(table.traces(), vec![expected.to_string()]);
    }

    #[test]
    fn void_invoke_pushes_no_result() {
        let instructions = vec![
            Instruction::invoke("invoke-static", &[], "La/A;->fire()V"),
            Instruction::new("move-result-object", &["v1"], None),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        assert!(table.get("v1").is_none());
    }

    #[test]
    fn uninitialized_reads_fabricate_placeholders() {
        let instructions = vec![Instruction::invoke(
            "invoke-virtual",
            &["v3", "p1"],
            "La/A;->use(Ljava/lang/String;)V",
        )];
        let table = RegisterFlow::evaluate(&instructions);
        assert_eq!(
            table.traces(),
            vec!["La/A;->use(Ljava/lang/String;)V(p3,p1)".to_string()]
        );
    }

    #[test]
    fn unknown_mnemonics_are_skipped() {
        let instructions = vec![
            Instruction::const_string("v0", "keep"),
            Instruction::new("goto/16", &[], Some(Operand::Literal(":label".to_string()))),
            Instruction::new("nop", &[], None),
            Instruction::new("check-cast", &["v0"], Some(Operand::Type("La/A;".to_string()))),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        assert_eq!(table.get("v0").unwrap().value.resolve(), "keep");
    }

    #[test]
    fn constructor_invoke_mutates_its_receiver() {
        let instructions = vec![
            Instruction::new(
                "new-instance",
                &["v0"],
                Some(Operand::Type("Ljava/lang/StringBuilder;".to_string())),
            ),
            Instruction::const_string("v1", "seed"),
            Instruction::invoke(
                "invoke-direct",
                &["v0", "v1"],
                "Ljava/lang/StringBuilder;-><init>(Ljava/lang/String;)V",
            ),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        assert_eq!(
            table.get("v0").unwrap().value.resolve(),
            "Ljava/lang/StringBuilder;-><init>(Ljava/lang/String;)V(Ljava/lang/StringBuilder;(),seed)"
        );
    }

    #[test]
    fn wide_moves_copy_the_register_pair() {
        let instructions = vec![
            Instruction::new("const-wide/16", &["v4"], Some(Operand::Literal("7".to_string()))),
            Instruction::new("move-wide", &["v1", "v4"], None),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        assert_eq!(table.get("v1").unwrap().value.resolve(), "7");
        assert_eq!(table.get("v2").unwrap().value.resolve(), "7");
    }

    #[test]
    fn array_accesses_flatten_to_the_source_expression() {
        let instructions = vec![
            Instruction::const_string("v2", "payload"),
            Instruction::new("aput-object", &["v2", "v6", "v5"], None),
            Instruction::new("aget-object", &["v1", "v6", "v5"], None),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        assert_eq!(table.get("v6").unwrap().value.resolve(), "payload");
        assert_eq!(table.get("v1").unwrap().value.resolve(), "payload");
    }

    #[test]
    fn binops_and_casts_form_operation_nodes() {
        let instructions = vec![
            Instruction::new("const/4", &["v5"], Some(Operand::Literal("1".to_string()))),
            Instruction::new("const/4", &["v6"], Some(Operand::Literal("2".to_string()))),
            Instruction::new("add-int", &["v1", "v5", "v6"], None),
            Instruction::new("int-to-float", &["v2", "v1"], None),
            Instruction::new(
                "mul-int/lit8",
                &["v3", "v5"],
                Some(Operand::Literal("3".to_string())),
            ),
            Instruction::new("xor-int/2addr", &["v5", "v6"], None),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        assert_eq!(table.get("v1").unwrap().value.resolve(), "binop(1, 2)");
        assert_eq!(
            table.get("v2").unwrap().value.resolve(),
            "casting(binop(1, 2))"
        );
        assert_eq!(table.get("v3").unwrap().value.resolve(), "binop(1, 3)");
        assert_eq!(table.get("v5").unwrap().value.resolve(), "binop(1, 2)");
    }

    #[test]
    fn nested_call_traces_contain_their_argument_traces() {
        let instructions = vec![
            Instruction::const_string("v0", "gps"),
            Instruction::invoke(
                "invoke-virtual",
                &["v0"],
                "La/Locator;->fetch(Ljava/lang/String;)Landroid/location/Location;",
            ),
            Instruction::new("move-result-object", &["v1"], None),
            Instruction::invoke(
                "invoke-virtual",
                &["v1"],
                "Lb/Sender;->send(Landroid/location/Location;)V",
            ),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        let traces = table.traces();
        assert_eq!(traces.len(), 2);
        let inner = &traces[0];
        let outer = &traces[1];
        assert!(outer.contains(inner.as_str()));
        assert!(outer.contains("La/Locator;->fetch(Ljava/lang/String;)Landroid/location/Location;"));
        assert!(outer.contains("Lb/Sender;->send(Landroid/location/Location;)V"));
    }

    #[test]
    fn empty_bytecode_yields_an_empty_table() {
        let table = RegisterFlow::evaluate(&[]);
        assert!(table.is_empty());
        assert!(table.traces().is_empty());
    }

    #[test]
    fn involved_calls_walk_the_consumer_trees() {
        let instructions = vec![
            Instruction::const_string("v0", "seed"),
            Instruction::invoke("invoke-static", &["v0"], "La/A;->inner(Ljava/lang/String;)Lx/X;"),
            Instruction::new("move-result-object", &["v1"], None),
            Instruction::invoke("invoke-static", &["v1"], "Lb/B;->outer(Lx/X;)V"),
        ];
        let table = RegisterFlow::evaluate(&instructions);
        let calls = table.get("v1").unwrap().involved_calls();
        let resolved: Vec<String> = calls.iter().map(|c| c.resolve()).collect();
        assert!(resolved.iter().any(|t| t.starts_with("Lb/B;->outer")));
        assert!(resolved.iter().any(|t| t.starts_with("La/A;->inner")));
    }
}
