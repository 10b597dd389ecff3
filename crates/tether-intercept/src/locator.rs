//! Anchor-based search for function declarations inside minified host code.
//!
//! Nothing here knows the host's symbol names. Each [`Anchor`] is a snippet
//! that appears next to exactly one declaration; the locator walks backward
//! from it to recover the declared identifier and its byte offset. A missing
//! anchor is an expected outcome (the host changed) and yields `None`.

use std::collections::BTreeMap;

use serde::Serialize;

/// Thrown inside the host's store accessor.
pub const STORE_ACCESSOR_ANCHOR: &str = r#"Error("No global store set")"#;
/// Spread inside the host's action preparer.
pub const PREPARE_ACTION_ANCHOR: &str = r#".payload,..."meta"in "#;

pub const STORE_ACCESSOR_LABEL: &str = "store-accessor";
pub const PREPARE_ACTION_LABEL: &str = "prepare-action";

const ENCLOSING_FUNCTION_MARKER: &str = "{function";

/// How the declaration sits relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeclarationShape {
    /// `name(){ ... anchor`: nearest `()` before the anchor follows the name.
    EmptyParams,
    /// `name(a,b){function inner(...){ ... anchor`: the declaration owning the
    /// last `{function` before the anchor.
    EnclosingFunction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub label: String,
    pub needle: String,
    pub shape: DeclarationShape,
}

impl Anchor {
    pub fn new(label: impl Into<String>, needle: impl Into<String>, shape: DeclarationShape) -> Self {
        Self {
            label: label.into(),
            needle: needle.into(),
            shape,
        }
    }

    pub fn store_accessor() -> Self {
        Self::new(
            STORE_ACCESSOR_LABEL,
            STORE_ACCESSOR_ANCHOR,
            DeclarationShape::EmptyParams,
        )
    }

    pub fn prepare_action() -> Self {
        Self::new(
            PREPARE_ACTION_LABEL,
            PREPARE_ACTION_ANCHOR,
            DeclarationShape::EnclosingFunction,
        )
    }
}

/// Declared identifier and the byte offset where it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedFunction {
    pub name: String,
    pub offset: usize,
}

pub fn locate(code: &str, anchor: &Anchor) -> Option<LocatedFunction> {
    if anchor.needle.is_empty() {
        return None;
    }
    let anchor_idx = code.find(&anchor.needle)?;
    match anchor.shape {
        DeclarationShape::EmptyParams => locate_empty_params(code, anchor_idx),
        DeclarationShape::EnclosingFunction => locate_enclosing_function(code, anchor_idx),
    }
}

fn locate_empty_params(code: &str, anchor_idx: usize) -> Option<LocatedFunction> {
    let bytes = code.as_bytes();
    for idx in (1..anchor_idx).rev() {
        if bytes[idx] != b'(' || bytes.get(idx + 1) != Some(&b')') {
            continue;
        }
        match declared_name_ending_at(code, idx) {
            NameScan::Found(located) => return Some(located),
            NameScan::Empty => return None,
            NameScan::Unbounded => continue,
        }
    }
    None
}

fn locate_enclosing_function(code: &str, anchor_idx: usize) -> Option<LocatedFunction> {
    let function_idx = code[..anchor_idx].rfind(ENCLOSING_FUNCTION_MARKER)?;
    let paren_idx = code[..function_idx].rfind('(')?;
    match declared_name_ending_at(code, paren_idx) {
        NameScan::Found(located) => Some(located),
        NameScan::Empty | NameScan::Unbounded => None,
    }
}

enum NameScan {
    Found(LocatedFunction),
    Empty,
    Unbounded,
}

/// Collects the identifier that ends right before `end`, bounded on the left
/// by whitespace. Index 0 is never treated as a boundary.
fn declared_name_ending_at(code: &str, end: usize) -> NameScan {
    let bytes = code.as_bytes();
    for idx in (1..end).rev() {
        if bytes[idx].is_ascii_whitespace() {
            let start = idx + 1;
            if start == end {
                return NameScan::Empty;
            }
            return NameScan::Found(LocatedFunction {
                name: code[start..end].to_string(),
                offset: start,
            });
        }
    }
    NameScan::Unbounded
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocateReport {
    pub found: BTreeMap<String, LocatedFunction>,
    pub missing: Vec<String>,
}

impl LocateReport {
    pub fn get(&self, label: &str) -> Option<&LocatedFunction> {
        self.found.get(label)
    }
}

/// Independent anchors searched over one payload.
#[derive(Debug, Clone)]
pub struct ActionLocator {
    anchors: Vec<Anchor>,
}

impl Default for ActionLocator {
    fn default() -> Self {
        Self {
            anchors: vec![Anchor::store_accessor(), Anchor::prepare_action()],
        }
    }
}

impl ActionLocator {
    pub fn empty() -> Self {
        Self {
            anchors: Vec::new(),
        }
    }

    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchors.retain(|existing| existing.label != anchor.label);
        self.anchors.push(anchor);
        self
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn locate_all(&self, code: &str) -> LocateReport {
        let mut report = LocateReport::default();
        for anchor in &self.anchors {
            match locate(code, anchor) {
                Some(located) => {
                    report.found.insert(anchor.label.clone(), located);
                }
                None => {
                    tracing::debug!(anchor = %anchor.label, "anchor not found; feature unavailable");
                    report.missing.push(anchor.label.clone());
                }
            }
        }
        report
    }
}
