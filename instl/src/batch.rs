// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Batch accumulator (component F): an ordered map of sections to
//! tree-structured operations, with own/total progress accounting.

use std::fmt;

/// Fixed section order a batch executes in.
pub const SECTIONS: &[Section] = &[
    Section::Pre,
    Section::Assign,
    Section::Begin,
    Section::Links,
    Section::Upload,
    Section::Sync,
    Section::PostSync,
    Section::Copy,
    Section::PostCopy,
    Section::Remove,
    Section::Admin,
    Section::End,
    Section::Post,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Section {
    Pre,
    Assign,
    Begin,
    Links,
    Upload,
    Sync,
    PostSync,
    Copy,
    PostCopy,
    Remove,
    Admin,
    End,
    Post,
}

/// Tagged variant replacing the source's dynamic op-class hierarchy. Each
/// variant carries just its own parameters; shared bookkeeping lives in [`Op`].
#[derive(Debug, Clone)]
pub enum Kind {
    Sync { url: String, dest: String },
    Copy { source: String, dest: String },
    Link { target: String, link_path: String },
    Remove { path: String },
    Action { command: String },
    /// A transparent grouping container: `is_anonymous` ops of this kind
    /// have their children absorbed into the parent on render.
    Group { label: String },
}

/// A single batch operation: metadata plus a subtree of children.
#[derive(Debug, Clone)]
pub struct Op {
    pub kind: Kind,
    pub own_progress_count: u64,
    /// Non-essential ops are elided from rendering when they have no
    /// essential descendant.
    pub essential: bool,
    /// Whether the op's body (`call`) actually runs, vs. existing purely to
    /// bracket its children.
    pub call_call: bool,
    /// Whether the op brackets its children with enter/exit (vs. a leaf call).
    pub is_context_manager: bool,
    /// A transparent container: its children are rendered as if they were
    /// direct children of its own parent.
    pub is_anonymous: bool,
    pub children: Vec<Op>,
}

impl Op {
    pub fn new(kind: Kind) -> Self {
        let is_context_manager = matches!(kind, Kind::Group { .. });
        Self {
            kind,
            own_progress_count: 1,
            essential: true,
            call_call: true,
            is_context_manager,
            is_anonymous: false,
            children: Vec::new(),
        }
    }

    pub fn anonymous_group(label: impl Into<String>) -> Self {
        let mut op = Self::new(Kind::Group { label: label.into() });
        op.is_anonymous = true;
        op.call_call = false;
        op
    }

    pub fn non_essential(mut self) -> Self {
        self.essential = false;
        self
    }

    pub fn with_progress(mut self, count: u64) -> Self {
        self.own_progress_count = count;
        self
    }

    pub fn push(&mut self, child: Op) {
        self.children.push(child);
    }

    /// Sum of `own_progress_count` across this op and its whole subtree.
    pub fn total_progress(&self) -> u64 {
        self.own_progress_count + self.children.iter().map(Op::total_progress).sum::<u64>()
    }

    fn has_essential_descendant(&self) -> bool {
        self.essential || self.children.iter().any(Op::has_essential_descendant)
    }

    fn label(&self) -> &str {
        match &self.kind {
            Kind::Sync { .. } => "Sync",
            Kind::Copy { .. } => "Copy",
            Kind::Link { .. } => "Link",
            Kind::Remove { .. } => "Remove",
            Kind::Action { .. } => "Action",
            Kind::Group { label } => label,
        }
    }
}

/// A named sequence of operations under one section.
#[derive(Debug, Default, Clone)]
struct SectionOps {
    ops: Vec<Op>,
}

/// An ordered map of sections to operation trees, built incrementally.
///
/// The source enforces "only one writer while a sub-accumulator is open"
/// with a runtime assertion; here the borrow checker makes the same
/// invariant a compile error instead — [`BatchAccumulator::sub_accumulator`]
/// holds the only `&mut` to the accumulator for as long as it lives, so no
/// other write can happen until its guard drops.
pub struct BatchAccumulator {
    sections: Vec<(Section, SectionOps)>,
    names: NameAllocator,
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self {
            sections: SECTIONS.iter().map(|&s| (s, SectionOps::default())).collect(),
            names: NameAllocator::default(),
        }
    }

    /// Append a top-level op to `section`.
    pub fn push(&mut self, section: Section, op: Op) {
        let entry = self.sections.iter_mut().find(|(s, _)| *s == section).expect("section exists");
        entry.1.ops.push(op);
    }

    /// Borrow a scoped sub-accumulator for `section`, flushed into the
    /// parent when the guard drops.
    pub fn sub_accumulator(&mut self, section: Section) -> SubAccumulator<'_> {
        SubAccumulator {
            parent: self,
            section,
            ops: Vec::new(),
        }
    }

    /// Total progress across every section, in execution order.
    pub fn total_progress(&self) -> u64 {
        self.sections.iter().flat_map(|(_, ops)| &ops.ops).map(Op::total_progress).sum()
    }

    /// All operations, in fixed section order, essential-only filtering applied.
    pub fn iter_essential(&self) -> impl Iterator<Item = (Section, &Op)> {
        self.sections
            .iter()
            .flat_map(|(s, ops)| ops.ops.iter().filter(|op| op.has_essential_descendant()).map(move |op| (*s, op)))
    }

    /// Render the tree as a flat listing of unique instance names, in
    /// execution order, suitable for log cross-reference.
    pub fn render(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        for (section, ops) in &self.sections {
            for op in &ops.ops {
                render_op(*section, op, &mut self.names, &mut out, 0);
            }
        }
        out
    }
}

pub struct SubAccumulator<'a> {
    parent: &'a mut BatchAccumulator,
    section: Section,
    ops: Vec<Op>,
}

impl SubAccumulator<'_> {
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }
}

impl Drop for SubAccumulator<'_> {
    fn drop(&mut self) {
        let entry = self.parent.sections.iter_mut().find(|(s, _)| *s == self.section).expect("section exists");
        entry.1.ops.append(&mut self.ops);
    }
}

#[derive(Default)]
struct NameAllocator {
    counters: std::collections::HashMap<String, u32>,
}

impl NameAllocator {
    fn next(&mut self, label: &str) -> String {
        let snake = to_snake_case(label);
        let counter = self.counters.entry(snake.clone()).or_insert(0);
        *counter += 1;
        format!("{snake}_{:05}", *counter)
    }
}

fn to_snake_case(label: &str) -> String {
    let mut out = String::new();
    for (i, ch) in label.chars().enumerate() {
        if ch.is_uppercase() && i > 0 {
            out.push('_');
        }
        out.extend(ch.to_lowercase());
    }
    out
}

fn render_op(section: Section, op: &Op, names: &mut NameAllocator, out: &mut Vec<String>, depth: usize) {
    if op.is_anonymous {
        for child in &op.children {
            render_op(section, child, names, out, depth);
        }
        return;
    }
    if !op.has_essential_descendant() {
        return;
    }

    let name = names.next(op.label());
    let indent = "  ".repeat(depth);
    if op.is_context_manager {
        out.push(format!("{indent}{name} {{"));
        for child in &op.children {
            render_op(section, child, names, out, depth + 1);
        }
        out.push(format!("{indent}}}"));
    } else {
        out.push(format!("{indent}{name}()"));
    }
}

impl fmt::Display for BatchAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (section, ops) in &self.sections {
            if ops.ops.is_empty() {
                continue;
            }
            writeln!(f, "[{section}]")?;
            for op in &ops.ops {
                writeln!(f, "  {:?}", op.kind)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_render_in_fixed_order() {
        let mut batch = BatchAccumulator::new();
        batch.push(Section::Copy, Op::new(Kind::Copy { source: "a".into(), dest: "b".into() }));
        batch.push(Section::Sync, Op::new(Kind::Sync { url: "u".into(), dest: "d".into() }));
        let rendered = batch.render();
        assert!(rendered[0].starts_with("sync_"));
        assert!(rendered[1].starts_with("copy_"));
    }

    #[test]
    fn total_progress_sums_whole_tree() {
        let mut parent = Op::new(Kind::Group { label: "Section".into() });
        parent.push(Op::new(Kind::Copy { source: "a".into(), dest: "b".into() }).with_progress(3));
        parent.push(Op::new(Kind::Remove { path: "c".into() }).with_progress(2));
        let mut batch = BatchAccumulator::new();
        batch.push(Section::Copy, parent);
        assert_eq!(batch.total_progress(), 1 + 3 + 2);
    }

    #[test]
    fn non_essential_op_without_essential_descendant_is_elided() {
        let mut batch = BatchAccumulator::new();
        batch.push(Section::Copy, Op::new(Kind::Copy { source: "a".into(), dest: "b".into() }).non_essential());
        assert!(batch.render().is_empty());
    }

    #[test]
    fn sub_accumulator_ops_land_in_their_section_on_drop() {
        let mut batch = BatchAccumulator::new();
        {
            let mut sub = batch.sub_accumulator(Section::Remove);
            sub.push(Op::new(Kind::Remove { path: "x".into() }));
        }
        let rendered = batch.render();
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].starts_with("remove_"));
    }
}
