// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Path tree of files and directories carrying revision/checksum/size/flags,
//! read from and written to the line-oriented info-map text format.

pub mod path;
mod tree;

pub use tree::{Entry, Error, Flags, InfoMap, Kind, Scope};
