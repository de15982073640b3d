//! Python analyzer: blocked builtins, blocked module imports, attribute
//! chains rooted at a blocked module, and dunder access outside a small
//! safe set.

use tree_sitter::Node;

use super::denylist::{PYTHON_BLOCKED_CALLS, PYTHON_BLOCKED_MODULES, PYTHON_SAFE_DUNDERS};
use super::{check_tree, node_text, parse, Rejection};

pub(super) fn check(code: &str) -> Result<(), Rejection> {
    let tree = parse(&tree_sitter_python::LANGUAGE.into(), code)?;
    check_tree(tree.root_node(), &mut |node| match node.kind() {
        "identifier" => check_identifier(node, code),
        "import_statement" => check_import(node, code),
        "import_from_statement" => check_import_from(node, code),
        "call" => check_call(node, code),
        "attribute" => check_attribute(node, code),
        _ => Ok(()),
    })
}

fn check_identifier(node: Node, code: &str) -> Result<(), Rejection> {
    let name = node_text(node, code);
    if !PYTHON_BLOCKED_CALLS.contains(&name) {
        return Ok(());
    }
    // `re.compile(...)` is fine; only a bare reference to the builtin counts.
    if let Some(parent) = node.parent() {
        if parent.kind() == "attribute"
            && parent.child_by_field_name("attribute").map(|a| a.id()) == Some(node.id())
        {
            return Ok(());
        }
    }
    Err(Rejection::new(format!("blocked operation: {}", name)))
}

fn check_import(node: Node, code: &str) -> Result<(), Rejection> {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        let module = match child.kind() {
            "dotted_name" => node_text(child, code),
            "aliased_import" => child
                .child_by_field_name("name")
                .map(|name| node_text(name, code))
                .unwrap_or(""),
            _ => continue,
        };
        reject_blocked_module(module)?;
    }
    Ok(())
}

fn check_import_from(node: Node, code: &str) -> Result<(), Rejection> {
    if let Some(module) = node.child_by_field_name("module_name") {
        reject_blocked_module(node_text(module, code))?;
    }
    Ok(())
}

fn reject_blocked_module(module: &str) -> Result<(), Rejection> {
    let root = module
        .trim_start_matches('.')
        .split('.')
        .next()
        .unwrap_or("");
    if PYTHON_BLOCKED_MODULES.contains(&root) {
        return Err(Rejection::new(format!("blocked module: {}", root)));
    }
    Ok(())
}

fn check_call(node: Node, code: &str) -> Result<(), Rejection> {
    let Some(function) = node.child_by_field_name("function") else {
        return Ok(());
    };
    if function.kind() == "identifier" && node_text(function, code) == "open" {
        if let Some(mode) = open_mode_argument(node, code) {
            if mode.chars().any(|c| matches!(c, 'w' | 'a' | 'x' | '+')) {
                return Err(Rejection::new("open() with a write mode is not allowed"));
            }
        }
    }
    Ok(())
}

/// The mode of an `open(...)` call: second positional argument or the
/// `mode=` keyword, whichever appears.
fn open_mode_argument<'a>(call: Node, code: &'a str) -> Option<&'a str> {
    let args = call.child_by_field_name("arguments")?;
    let mut cursor = args.walk();
    let mut positional = 0usize;
    for child in args.named_children(&mut cursor) {
        match child.kind() {
            "keyword_argument" => {
                if let (Some(name), Some(value)) = (
                    child.child_by_field_name("name"),
                    child.child_by_field_name("value"),
                ) {
                    if node_text(name, code) == "mode" {
                        return Some(node_text(value, code));
                    }
                }
            }
            "comment" => {}
            _ => {
                positional += 1;
                if positional == 2 {
                    return Some(node_text(child, code));
                }
            }
        }
    }
    None
}

fn check_attribute(node: Node, code: &str) -> Result<(), Rejection> {
    if let Some(root) = chain_root(node) {
        if root.kind() == "identifier" {
            let name = node_text(root, code);
            if PYTHON_BLOCKED_MODULES.contains(&name) {
                return Err(Rejection::new(format!("access to blocked module: {}", name)));
            }
            if is_dunder(name) {
                return Err(Rejection::new(format!(
                    "access to dunder variable: {}",
                    name
                )));
            }
        }
    }
    if let Some(attr) = node.child_by_field_name("attribute") {
        let name = node_text(attr, code);
        if is_dunder(name) && !PYTHON_SAFE_DUNDERS.contains(&name) {
            return Err(Rejection::new(format!(
                "access to restricted attribute: {}",
                name
            )));
        }
    }
    Ok(())
}

/// Leftmost object of an attribute chain: `a.b.c` → `a`.
fn chain_root(node: Node) -> Option<Node> {
    let mut current = node.child_by_field_name("object")?;
    while current.kind() == "attribute" {
        current = current.child_by_field_name("object")?;
    }
    Some(current)
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

#[cfg(test)]
mod tests {
    use super::super::validate;
    use crucible_common::types::Language;

    fn reject(code: &str) -> String {
        validate(Language::Python, code)
            .expect_err("snippet should be rejected")
            .reason
    }

    #[test]
    fn test_eval_and_friends_rejected() {
        assert!(reject("eval('1+1')").contains("eval"));
        assert!(reject("exec('print(1)')").contains("exec"));
        assert!(reject("compile('x', '<s>', 'eval')").contains("compile"));
        assert!(reject("__import__('os')").contains("__import__"));
    }

    #[test]
    fn test_blocked_module_import_rejected() {
        assert!(reject("import os").contains("os"));
        assert!(reject("import os.path").contains("os"));
        assert!(reject("from subprocess import run").contains("subprocess"));
        assert!(reject("import socket as s").contains("socket"));
    }

    #[test]
    fn test_blocked_module_attribute_rejected() {
        // The scenario from the protocol tests: reason must mention `os`.
        assert!(reject("import os; os.system(\"ls\")").contains("os"));
    }

    #[test]
    fn test_open_write_modes_rejected() {
        assert!(reject("open('f', 'w')").contains("write mode"));
        assert!(reject("open('f', mode='a')").contains("write mode"));
        assert!(reject("open('f', 'r+')").contains("write mode"));
        assert!(validate(Language::Python, "open('f')").is_ok());
        assert!(validate(Language::Python, "open('f', 'r')").is_ok());
    }

    #[test]
    fn test_dunder_access_rejected() {
        assert!(reject("x.__globals__").contains("__globals__"));
        assert!(reject("__builtins__.print('x')").contains("__builtins__"));
        assert!(validate(Language::Python, "x.__len__()").is_ok());
    }

    #[test]
    fn test_harmless_programs_pass() {
        assert!(validate(Language::Python, "print('hi')").is_ok());
        assert!(validate(Language::Python, "name=input(\"n:\")\nprint(\"hello\",name)").is_ok());
        assert!(validate(Language::Python, "import math\nprint(math.pi)").is_ok());
        assert!(validate(Language::Python, "import re\nre.compile('a+')").is_ok());
    }
}
