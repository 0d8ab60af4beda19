// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Scoped, lazily-resolving key → list-of-strings environment with `$(VAR)`
//! expansion, freeze-on-first-resolve, and scope stacking.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown variable: {0}")]
    KeyError(String),
    #[error("self-referential expansion of {0}")]
    ResolveCycle(String),
    #[error("{0} already defined with a different value")]
    ConstRedefined(String),
}

#[derive(Clone, Debug, Default)]
struct Variable {
    fragments: Vec<String>,
    description: Option<String>,
}

/// A scoped variable environment.
///
/// Scopes form a stack; lookup walks the stack top-down, writes go to the
/// top frame. `freeze_on_first_resolve` is a store-wide switch: once set,
/// the first successful resolution of any variable snapshots its resolved
/// string, and later writes to that variable are buffered until [`VarStore::thaw`]
/// instead of silently invalidating callers who already resolved it.
pub struct VarStore {
    scopes: Vec<HashMap<String, Variable>>,
    const_names: HashSet<String>,
    normpath_suffixes: Vec<String>,
    freeze: bool,
    frozen: HashMap<String, String>,
    pending: HashMap<String, Variable>,
    resolve_count: usize,
    resolve_count_before_freeze: usize,
}

impl Default for VarStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VarStore {
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            const_names: HashSet::new(),
            normpath_suffixes: Vec::new(),
            freeze: false,
            frozen: HashMap::new(),
            pending: HashMap::new(),
            resolve_count: 0,
            resolve_count_before_freeze: 0,
        }
    }

    /// Names ending with one of these suffixes are path-normalised before
    /// `add_const` compares or stores them (e.g. `_DIR`, `_PATH`).
    pub fn set_normpath_suffixes(&mut self, suffixes: impl IntoIterator<Item = String>) {
        self.normpath_suffixes = suffixes.into_iter().collect();
    }

    fn normalize_if_needed(&self, name: &str, values: &[String]) -> Vec<String> {
        if self.normpath_suffixes.iter().any(|suf| name.ends_with(suf.as_str())) {
            values.iter().map(|v| normpath(v)).collect()
        } else {
            values.to_vec()
        }
    }

    /// Push a new, empty scope frame. Prefer [`VarStore::scoped`] for guaranteed pop.
    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Pop the top scope frame. A no-op (other than a debug assertion) if
    /// only the root frame remains, mirroring the source's defensive stance.
    pub fn pop_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "popped the root scope");
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Run `f` with a fresh scope pushed, guaranteeing it is popped on every
    /// exit path including panics and early returns.
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut VarStore) -> T) -> T {
        self.push_scope();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(self)));
        self.pop_scope();
        match result {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    fn top_mut(&mut self) -> &mut HashMap<String, Variable> {
        self.scopes.last_mut().expect("root scope always present")
    }

    fn find(&self, name: &str) -> Option<&Variable> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Every variable name visible in any scope, most-recently-pushed first removed.
    pub fn keys(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for scope in self.scopes.iter().rev() {
            for name in scope.keys() {
                if seen.insert(name.clone()) {
                    out.push(name.clone());
                }
            }
        }
        out
    }

    fn write(&mut self, name: &str, fragments: Vec<String>, description: Option<String>) {
        let variable = Variable { fragments, description };
        if self.freeze && self.frozen.contains_key(name) {
            self.pending.insert(name.to_string(), variable);
        } else {
            self.top_mut().insert(name.to_string(), variable);
        }
    }

    /// Replace `name`'s value list.
    pub fn set(&mut self, name: &str, fragments: impl IntoIterator<Item = impl Into<String>>, description: Option<&str>) {
        self.write(
            name,
            fragments.into_iter().map(Into::into).collect(),
            description.map(str::to_string),
        );
    }

    /// Append to `name`'s existing value list (creating it if absent).
    pub fn append(&mut self, name: &str, fragments: impl IntoIterator<Item = impl Into<String>>) {
        let mut current = self.get(name).unwrap_or_default();
        current.extend(fragments.into_iter().map(Into::into));
        let description = self.find(name).and_then(|v| v.description.clone());
        self.write(name, current, description);
    }

    /// Create `name` only if it does not already exist in any scope.
    pub fn set_if_absent(&mut self, name: &str, value: impl Into<String>, description: Option<&str>) {
        if !self.contains(name) {
            self.set(name, [value.into()], description);
        }
    }

    /// Set `name` once; a later call with a different value list fails.
    /// Idempotent calls with the same (normalised) values succeed silently.
    pub fn add_const(
        &mut self,
        name: &str,
        description: Option<&str>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), Error> {
        let incoming: Vec<String> = values.into_iter().map(Into::into).collect();
        let incoming = self.normalize_if_needed(name, &incoming);

        if self.const_names.contains(name) {
            let existing = self.get(name).unwrap_or_default();
            let existing = self.normalize_if_needed(name, &existing);
            if existing == incoming {
                return Ok(());
            }
            return Err(Error::ConstRedefined(name.to_string()));
        }

        self.const_names.insert(name.to_string());
        self.write(name, incoming, description.map(str::to_string));
        Ok(())
    }

    /// Raw fragment list for `name`.
    pub fn get(&self, name: &str) -> Result<Vec<String>, Error> {
        self.find(name)
            .map(|v| v.fragments.clone())
            .ok_or_else(|| Error::KeyError(name.to_string()))
    }

    pub fn bool(&self, name: &str) -> bool {
        self.get(name)
            .ok()
            .and_then(|frags| frags.first().cloned())
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "1"))
            .unwrap_or(false)
    }

    /// `sep.join(get(name))`, freezing the result on first resolve if
    /// [`VarStore::freeze_on_first_resolve`] is active.
    pub fn resolve(&mut self, name: &str, sep: &str) -> Result<String, Error> {
        if self.freeze {
            if let Some(snapshot) = self.frozen.get(name) {
                return Ok(snapshot.clone());
            }
        }

        let fragments = self.get(name)?;
        let joined = fragments.join(sep);
        self.resolve_count += 1;

        if self.freeze {
            self.frozen.insert(name.to_string(), joined.clone());
        }
        Ok(joined)
    }

    /// Expand every `$(NAME)` / `$(NAME<sep>)` reference in `s`. Self-reference
    /// (a variable whose expansion depends on itself) is a [`Error::ResolveCycle`].
    pub fn resolve_str(&mut self, s: &str) -> Result<String, Error> {
        let mut visiting = HashSet::new();
        self.resolve_str_inner(s, &mut visiting)
    }

    fn resolve_str_inner(&mut self, s: &str, visiting: &mut HashSet<String>) -> Result<String, Error> {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;

        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find(')') else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let inner = &after[..end];
            let (name, sep) = match inner.split_once('<') {
                Some((name, sep_and_tail)) => (name, sep_and_tail.trim_end_matches('>')),
                None => (inner, " "),
            };

            if !visiting.insert(name.to_string()) {
                return Err(Error::ResolveCycle(name.to_string()));
            }
            let fragments = self.get(name)?;
            let mut resolved_fragments = Vec::with_capacity(fragments.len());
            for frag in fragments {
                resolved_fragments.push(self.resolve_str_inner(&frag, visiting)?);
            }
            visiting.remove(name);

            let joined = resolved_fragments.join(sep);
            self.resolve_count += 1;
            if self.freeze {
                self.frozen.entry(name.to_string()).or_insert_with(|| joined.clone());
            }
            out.push_str(&joined);

            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Resolve `s` to a list rather than a single string: a template that is
    /// exactly one bare `$(NAME)` reference yields `NAME`'s full fragment list
    /// (preserving cardinality); anything else resolves to a single-line list.
    pub fn resolve_str_to_list(&mut self, s: &str) -> Result<Vec<String>, Error> {
        let trimmed = s.trim();
        if let Some(inner) = trimmed.strip_prefix("$(").and_then(|t| t.strip_suffix(')')) {
            if !inner.contains("$(") && !inner.contains('<') {
                return self.get(inner);
            }
        }
        let resolved = self.resolve_str(s)?;
        Ok(resolved.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    /// Replace any `$(NAME)` left unresolved in `s` with the OS-native
    /// variable-reference pattern instead of expanding it.
    pub fn replace_unresolved_with_native_var_pattern(&self, s: &str, os: &str) -> String {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find(')') else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let name = after[..end].split('<').next().unwrap_or(&after[..end]);
            if os.eq_ignore_ascii_case("windows") || os.eq_ignore_ascii_case("win") {
                out.push('%');
                out.push_str(name);
                out.push('%');
            } else {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Switch on freeze-on-first-resolve. Idempotent.
    pub fn freeze_on_first_resolve(&mut self) {
        if !self.freeze {
            self.freeze = true;
            self.resolve_count_before_freeze = self.resolve_count;
        }
    }

    /// Apply every buffered write made while frozen and disable freezing.
    pub fn thaw(&mut self) {
        let pending: Vec<_> = self.pending.drain().collect();
        for (name, variable) in pending {
            self.top_mut().insert(name, variable);
        }
        self.frozen.clear();
        self.freeze = false;
    }

    pub fn resolve_statistics(&self) -> (usize, usize) {
        (self.resolve_count_before_freeze, self.resolve_count - self.resolve_count_before_freeze)
    }
}

fn normpath(value: &str) -> String {
    let is_absolute = value.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in value.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if matches!(parts.last(), Some(p) if *p != "..") {
                    parts.pop();
                } else if !is_absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if is_absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let mut store = VarStore::new();
        store.set("NAME", ["a", "b"], None);
        assert_eq!(store.get("NAME").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn missing_key_errors() {
        let store = VarStore::new();
        assert!(matches!(store.get("NOPE"), Err(Error::KeyError(_))));
    }

    #[test]
    fn scope_stack_shadows_and_unwinds() {
        let mut store = VarStore::new();
        store.set("X", ["outer"], None);
        store.scoped(|s| {
            s.set("X", ["inner"], None);
            assert_eq!(s.get("X").unwrap(), vec!["inner"]);
        });
        assert_eq!(store.get("X").unwrap(), vec!["outer"]);
    }

    #[test]
    fn add_const_is_idempotent_but_rejects_redefinition() {
        let mut store = VarStore::new();
        store.add_const("C", None, ["v"]).unwrap();
        store.add_const("C", None, ["v"]).unwrap();
        assert!(matches!(store.add_const("C", None, ["other"]), Err(Error::ConstRedefined(_))));
    }

    #[test]
    fn add_const_normalizes_paths_before_compare() {
        let mut store = VarStore::new();
        store.set_normpath_suffixes(["_DIR".to_string()]);
        store.add_const("INSTALL_DIR", None, ["/a/b/../c"]).unwrap();
        store.add_const("INSTALL_DIR", None, ["/a/c"]).unwrap();
    }

    #[test]
    fn resolve_str_expands_nested_references() {
        let mut store = VarStore::new();
        store.set("A", ["1"], None);
        store.set("B", ["$(A)", "2"], None);
        assert_eq!(store.resolve_str("$(B)").unwrap(), "1 2");
    }

    #[test]
    fn resolve_str_custom_separator() {
        let mut store = VarStore::new();
        store.set("A", ["x", "y"], None);
        assert_eq!(store.resolve_str("$(A<,>)").unwrap(), "x,y");
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut store = VarStore::new();
        store.set("A", ["$(A)"], None);
        assert!(matches!(store.resolve_str("$(A)"), Err(Error::ResolveCycle(_))));
    }

    #[test]
    fn freeze_on_first_resolve_snapshots_and_buffers_writes() {
        let mut store = VarStore::new();
        store.set("A", ["first"], None);
        store.freeze_on_first_resolve();
        assert_eq!(store.resolve("A", " ").unwrap(), "first");

        store.set("A", ["second"], None);
        // still frozen: resolve keeps returning the snapshot
        assert_eq!(store.resolve("A", " ").unwrap(), "first");

        store.thaw();
        assert_eq!(store.get("A").unwrap(), vec!["second"]);
    }

    #[test]
    fn resolve_str_to_list_preserves_bare_reference_cardinality() {
        let mut store = VarStore::new();
        store.set("LIST", ["a", "b", "c"], None);
        assert_eq!(store.resolve_str_to_list("$(LIST)").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn replace_unresolved_uses_os_native_pattern() {
        let store = VarStore::new();
        assert_eq!(store.replace_unresolved_with_native_var_pattern("$(X)", "Windows"), "%X%");
        assert_eq!(store.replace_unresolved_with_native_var_pattern("$(X)", "Linux"), "${X}");
    }
}
