/// Validator - language-aware static screening
///
/// **Core Responsibility:**
/// Approve or reject a source snippet before any subprocess is spawned.
/// Every language parses to a tree-sitter syntax tree; the tree is walked
/// against a per-language denylist of constructs.
///
/// **Critical Properties:**
/// - Pure function of (language, source): no I/O, deterministic.
/// - Never panics to the caller; malformed source becomes a rejection.
///
/// **Security posture:**
/// Matching is syntactic, not semantic - rebinding a blocked name to a
/// local defeats the check by design. This is a first-line filter that
/// keeps casual misuse out of the hot path and surfaces obvious disallowed
/// intent early. The sandbox wrapper is the enforcement boundary; never
/// treat this module as the sole defense.
mod c_cpp;
mod denylist;
mod javascript;
mod python;
mod rust;

use std::fmt;

use tree_sitter::{Node, Parser, Tree};

use crucible_common::types::Language;

/// Why a snippet was refused. The reason is one short sentence naming the
/// offending construct, suitable for sending to the client verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// Dispatch to the analyzer for `language`.
pub fn validate(language: Language, code: &str) -> Result<(), Rejection> {
    if code.trim().is_empty() {
        return Err(Rejection::new("code must not be empty"));
    }
    match language {
        Language::Python => python::check(code),
        Language::Javascript => javascript::check(code),
        Language::C => c_cpp::check(code, c_cpp::Dialect::C),
        Language::Cpp => c_cpp::check(code, c_cpp::Dialect::Cpp),
        Language::Rust => rust::check(code),
    }
}

/// Parse `code` with the given grammar, turning parser trouble into a
/// rejection that names the first offending line.
fn parse(grammar: &tree_sitter::Language, code: &str) -> Result<Tree, Rejection> {
    let mut parser = Parser::new();
    parser
        .set_language(grammar)
        .map_err(|_| Rejection::new("validator grammar unavailable"))?;
    let tree = parser
        .parse(code, None)
        .ok_or_else(|| Rejection::new("syntax error at line 1"))?;
    if tree.root_node().has_error() {
        let line = first_error_line(tree.root_node()).unwrap_or(1);
        return Err(Rejection::new(format!("syntax error at line {}", line)));
    }
    Ok(tree)
}

fn first_error_line(node: Node) -> Option<usize> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position().row + 1);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(line) = first_error_line(child) {
            return Some(line);
        }
    }
    None
}

/// Depth-first walk, stopping at the first rejection.
fn check_tree(
    node: Node,
    check: &mut dyn FnMut(Node) -> Result<(), Rejection>,
) -> Result<(), Rejection> {
    check(node)?;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        check_tree(child, check)?;
    }
    Ok(())
}

fn node_text<'a>(node: Node, code: &'a str) -> &'a str {
    node.utf8_text(code.as_bytes()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_is_deterministic() {
        let code = "import os\nos.system('ls')";
        let first = validate(Language::Python, code);
        let second = validate(Language::Python, code);
        assert_eq!(first, second);
        assert!(first.is_err());
    }

    #[test]
    fn test_empty_source_rejected_with_reason() {
        let rejection = validate(Language::Python, "   \n").unwrap_err();
        assert!(rejection.reason.contains("empty"));
    }

    #[test]
    fn test_syntax_error_names_a_line() {
        let rejection = validate(Language::Python, "def broken(:\n").unwrap_err();
        assert!(rejection.reason.starts_with("syntax error at line"));

        let rejection = validate(Language::C, "int main(){").unwrap_err();
        assert!(rejection.reason.starts_with("syntax error at line"));
    }

    #[test]
    fn test_plain_programs_pass_everywhere() {
        let cases = [
            (Language::Python, "print('hello')"),
            (Language::Javascript, "console.log('hello');"),
            (
                Language::C,
                "#include <stdio.h>\nint main(void){printf(\"hi\\n\");return 0;}",
            ),
            (
                Language::Cpp,
                "#include <iostream>\nint main(){std::cout<<\"hi\\n\";return 0;}",
            ),
            (Language::Rust, "fn main(){println!(\"hi\");}"),
        ];
        for (language, code) in cases {
            assert!(
                validate(language, code).is_ok(),
                "expected {language} snippet to pass"
            );
        }
    }
}
