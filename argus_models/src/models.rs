// Copyright (c) 2022 Ubique Innovation AG <https://www.ubique.ch>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! This module contains all models used during an analysis run: method
//! identities, bytecode instructions, behavior rules and the query surface
//! over a parsed application.

mod apk;
pub use apk::*;

mod instruction;
pub use instruction::*;

mod method;
pub use method::*;

mod rule;
pub use rule::*;
