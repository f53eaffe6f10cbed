// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::Method;

/// The operand of an instruction, if any. Invokes carry the callee
/// reference, `const*` carry a literal and `new-instance`/`const-class`
/// carry a type name.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Operand {
    Method(Method),
    Literal(String),
    Type(String),
}

/// One Dalvik instruction in the shape the adapter hands it to the core:
/// a mnemonic, the register names in instruction order and an optional
/// opaque operand.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Instruction {
    pub mnemonic: String,
    pub registers: Vec<String>,
    pub parameter: Option<Operand>,
}

impl Instruction {
    pub fn new(mnemonic: &str, registers: &[&str], parameter: Option<Operand>) -> Self {
        Self {
            mnemonic: mnemonic.to_string(),
            registers: registers.iter().map(|r| r.to_string()).collect(),
            parameter,
        }
    }

    /// Convenience constructor for `invoke-*` instructions. The signature is
    /// parsed into a [`Method`]; invalid signatures yield an instruction
    /// without operand which the evaluator then skips.
    pub fn invoke(mnemonic: &str, registers: &[&str], signature: &str) -> Self {
        Self::new(
            mnemonic,
            registers,
            Method::from_signature(signature).map(Operand::Method),
        )
    }

    pub fn const_string(register: &str, value: &str) -> Self {
        Self::new(
            "const-string",
            &[register],
            Some(Operand::Literal(value.to_string())),
        )
    }

    /// The callee of an `invoke-*` instruction, if this is one.
    pub fn invoked_method(&self) -> Option<&Method> {
        if !self.mnemonic.starts_with("invoke") {
            return None;
        }
        match &self.parameter {
            Some(Operand::Method(method)) => Some(method),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_parses_callee() {
        let ins = Instruction::invoke(
            "invoke-virtual",
            &["v0", "v1"],
            "Landroid/telephony/SmsManager;->sendTextMessage(Ljava/lang/String;)V",
        );
        let callee = ins.invoked_method().expect("callee");
        assert_eq!(callee.class_name, "Landroid/telephony/SmsManager;");
        assert_eq!(callee.name, "sendTextMessage");
        assert_eq!(ins.registers, vec!["v0", "v1"]);
    }

    #[test]
    fn non_invoke_has_no_callee() {
        let ins = Instruction::const_string("v0", "hello");
        assert!(ins.invoked_method().is_none());
    }
}
