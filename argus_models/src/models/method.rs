// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::cmp::Ordering;
use std::fmt;

/// A method identity as seen in Dalvik bytecode. Equality, hashing and
/// ordering are on the `(class_name, name, descriptor)` triple, so two
/// instances with the same triple denote the same method.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
pub struct Method {
    /// The declaring class in Dalvik form, e.g. `Landroid/telephony/SmsManager;`
    #[serde(rename = "class")]
    pub class_name: String,
    /// The plain method name
    #[serde(rename = "method")]
    pub name: String,
    /// The full prototype including the return type, e.g. `(Ljava/lang/String;)V`
    pub descriptor: String,
}

impl Method {
    pub fn new(class_name: &str, name: &str, descriptor: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    /// The canonical textual form `Lpkg/Class;->name(args)ret`. This string is
    /// the key used both when building call traces and when querying them, so
    /// it must be exact including the full descriptor.
    pub fn pattern(&self) -> String {
        format!("{}->{}{}", self.class_name, self.name, self.descriptor)
    }

    /// Parse a canonical signature back into its triple. Returns `None` for
    /// anything which does not look like `Lcls;->name(args)ret`.
    pub fn from_signature(signature: &str) -> Option<Self> {
        let (class_name, rest) = signature.split_once("->")?;
        if !class_name.starts_with('L') || !class_name.ends_with(';') {
            return None;
        }
        let paren = rest.find('(')?;
        let (name, descriptor) = rest.split_at(paren);
        if name.is_empty() || !descriptor.contains(')') {
            return None;
        }
        Some(Self::new(class_name, name, descriptor))
    }

    /// The return type portion of the descriptor.
    pub fn return_type(&self) -> &str {
        match self.descriptor.rfind(')') {
            Some(index) => &self.descriptor[index + 1..],
            None => "",
        }
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern())
    }
}

impl PartialOrd for Method {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Method {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class_name
            .cmp(&other.class_name)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.descriptor.cmp(&other.descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_round_trip() {
        let method = Method::new(
            "Lcom/google/progress/ContactsCollector;",
            "getContactList",
            "()Ljava/lang/String;",
        );
        let pattern = method.pattern();
        assert_eq!(
            pattern,
            "Lcom/google/progress/ContactsCollector;->getContactList()Ljava/lang/String;"
        );
        assert_eq!(Method::from_signature(&pattern), Some(method));
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert!(Method::from_signature("garbage").is_none());
        assert!(Method::from_signature("com/no/Prefix->run()V").is_none());
        assert!(Method::from_signature("Lcls;->noparens").is_none());
    }

    #[test]
    fn return_type_is_suffix_after_proto() {
        let method = Method::new("La/B;", "run", "(Ljava/lang/String;I)Landroid/location/Location;");
        assert_eq!(method.return_type(), "Landroid/location/Location;");
        assert!(!method.is_constructor());
        assert!(Method::new("La/B;", "<init>", "()V").is_constructor());
    }
}
