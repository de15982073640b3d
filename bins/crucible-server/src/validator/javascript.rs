//! JavaScript analyzer: code-materializing calls, blocked module loads via
//! `require` and ESM import, node-internal member chains, and constructor
//! access bypasses.

use tree_sitter::Node;

use super::denylist::{JS_BLOCKED_CALLS, JS_BLOCKED_MEMBERS, JS_BLOCKED_MODULES};
use super::{check_tree, node_text, parse, Rejection};

pub(super) fn check(code: &str) -> Result<(), Rejection> {
    let tree = parse(&tree_sitter_javascript::LANGUAGE.into(), code)?;
    check_tree(tree.root_node(), &mut |node| match node.kind() {
        "call_expression" => check_call(node, code),
        "new_expression" => check_new(node, code),
        "member_expression" => check_member(node, code),
        "subscript_expression" => check_subscript(node, code),
        "import_statement" => check_import(node, code),
        _ => Ok(()),
    })
}

fn check_call(node: Node, code: &str) -> Result<(), Rejection> {
    let Some(function) = node.child_by_field_name("function") else {
        return Ok(());
    };
    match function.kind() {
        "identifier" => {
            let name = node_text(function, code);
            if JS_BLOCKED_CALLS.contains(&name) {
                return Err(Rejection::new(format!("blocked operation: {}()", name)));
            }
            if name == "require" {
                if let Some(module) = first_string_argument(node, code) {
                    if JS_BLOCKED_MODULES.contains(&module) {
                        return Err(Rejection::new(format!("blocked module: {}", module)));
                    }
                }
            }
        }
        "member_expression" => {
            if node_text(function, code) == "Reflect.construct" {
                if let Some(target) = first_named_argument(node) {
                    if target.kind() == "identifier" && node_text(target, code) == "Function" {
                        return Err(Rejection::new(
                            "Reflect.construct of Function is not allowed",
                        ));
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_new(node: Node, code: &str) -> Result<(), Rejection> {
    if let Some(constructor) = node.child_by_field_name("constructor") {
        if constructor.kind() == "identifier" && node_text(constructor, code) == "Function" {
            return Err(Rejection::new("the Function constructor is not allowed"));
        }
    }
    Ok(())
}

fn check_member(node: Node, code: &str) -> Result<(), Rejection> {
    let text = node_text(node, code);
    for pattern in JS_BLOCKED_MEMBERS {
        if text.contains(pattern) {
            return Err(Rejection::new(format!(
                "dangerous property access: {}",
                pattern
            )));
        }
    }
    if let Some(property) = node.child_by_field_name("property") {
        if node_text(property, code) == "constructor" {
            return Err(Rejection::new("constructor access is not allowed"));
        }
    }
    Ok(())
}

fn check_subscript(node: Node, code: &str) -> Result<(), Rejection> {
    if let Some(index) = node.child_by_field_name("index") {
        if node_text(index, code).contains("constructor") {
            return Err(Rejection::new("constructor access is not allowed"));
        }
    }
    Ok(())
}

fn check_import(node: Node, code: &str) -> Result<(), Rejection> {
    if let Some(source) = node.child_by_field_name("source") {
        let module = strip_quotes(node_text(source, code));
        if JS_BLOCKED_MODULES.contains(&module)
            || JS_BLOCKED_MODULES.contains(&module.trim_start_matches("node:"))
        {
            return Err(Rejection::new(format!("blocked module: {}", module)));
        }
    }
    Ok(())
}

fn first_string_argument<'a>(call: Node, code: &'a str) -> Option<&'a str> {
    let args = call.child_by_field_name("arguments")?;
    let mut cursor = args.walk();
    for child in args.named_children(&mut cursor) {
        if child.kind() == "string" {
            let module = strip_quotes(node_text(child, code));
            return Some(module.trim_start_matches("node:"));
        }
    }
    None
}

fn first_named_argument(call: Node) -> Option<Node> {
    let args = call.child_by_field_name("arguments")?;
    args.named_child(0)
}

fn strip_quotes(text: &str) -> &str {
    text.trim_matches(|c| c == '"' || c == '\'' || c == '`')
}

#[cfg(test)]
mod tests {
    use super::super::validate;
    use crucible_common::types::Language;

    fn reject(code: &str) -> String {
        validate(Language::Javascript, code)
            .expect_err("snippet should be rejected")
            .reason
    }

    #[test]
    fn test_eval_and_function_rejected() {
        assert!(reject("eval('1+1')").contains("eval"));
        assert!(reject("Function('return 1')()").contains("Function"));
        assert!(reject("new Function('return 1')").contains("Function"));
    }

    #[test]
    fn test_blocked_requires_rejected() {
        assert!(reject("const fs = require('fs');").contains("fs"));
        assert!(reject("require('child_process').execSync('ls')").contains("child_process"));
        assert!(reject("require('node:net')").contains("net"));
        assert!(validate(Language::Javascript, "const u = require('util');").is_ok());
    }

    #[test]
    fn test_esm_imports_rejected() {
        assert!(reject("import fs from 'fs';").contains("fs"));
        assert!(reject("import { Worker } from 'worker_threads';").contains("worker_threads"));
    }

    #[test]
    fn test_process_internals_rejected() {
        assert!(reject("process.binding('spawn_sync')").contains("process.binding"));
        assert!(reject("globalThis.process.exit(1)").contains("globalThis.process"));
    }

    #[test]
    fn test_constructor_escape_rejected() {
        assert!(reject("({}).constructor").contains("constructor"));
        assert!(reject("x['constructor']('code')()").contains("constructor"));
        assert!(reject("Reflect.construct(Function, ['return 1'])").contains("Reflect.construct"));
    }

    #[test]
    fn test_harmless_programs_pass() {
        assert!(validate(Language::Javascript, "console.log('hi');").is_ok());
        assert!(validate(
            Language::Javascript,
            "const xs=[1,2,3]; console.log(xs.map(x=>x*2));"
        )
        .is_ok());
    }
}
