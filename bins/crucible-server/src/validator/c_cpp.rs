//! C and C++ analyzer: blocked header includes, blocked library calls,
//! executable memory mappings, and inline assembly. The two dialects share
//! every rule and differ only in grammar.

use tree_sitter::Node;

use super::denylist::{C_CPP_BLOCKED_FUNCTIONS, C_CPP_BLOCKED_HEADERS};
use super::{check_tree, node_text, parse, Rejection};

#[derive(Clone, Copy)]
pub(super) enum Dialect {
    C,
    Cpp,
}

pub(super) fn check(code: &str, dialect: Dialect) -> Result<(), Rejection> {
    let grammar = match dialect {
        Dialect::C => tree_sitter_c::LANGUAGE.into(),
        Dialect::Cpp => tree_sitter_cpp::LANGUAGE.into(),
    };
    let tree = parse(&grammar, code)?;
    check_tree(tree.root_node(), &mut |node| match node.kind() {
        "preproc_include" => check_include(node, code),
        "call_expression" => check_call(node, code),
        "gnu_asm_expression" | "asm_statement" => {
            Err(Rejection::new("inline assembly is not allowed"))
        }
        _ => Ok(()),
    })
}

fn check_include(node: Node, code: &str) -> Result<(), Rejection> {
    let Some(path) = node.child_by_field_name("path") else {
        return Ok(());
    };
    let header = node_text(path, code).trim_matches(|c| c == '<' || c == '>' || c == '"');
    for blocked in C_CPP_BLOCKED_HEADERS {
        let matched = if blocked.ends_with('/') {
            header.starts_with(blocked)
        } else {
            header == *blocked
        };
        if matched {
            return Err(Rejection::new(format!("blocked header: {}", header)));
        }
    }
    Ok(())
}

fn check_call(node: Node, code: &str) -> Result<(), Rejection> {
    let Some(function) = node.child_by_field_name("function") else {
        return Ok(());
    };
    if function.kind() != "identifier" {
        return Ok(());
    }
    let name = node_text(function, code);

    if C_CPP_BLOCKED_FUNCTIONS.contains(&name) {
        return Err(Rejection::new(format!("blocked function: {}()", name)));
    }
    // The whole exec* family, including _exec variants.
    if name.starts_with("exec") || name.starts_with("_exec") {
        return Err(Rejection::new(format!("blocked function: {}()", name)));
    }
    if name == "mmap" {
        if let Some(args) = node.child_by_field_name("arguments") {
            if node_text(args, code).contains("PROT_EXEC") {
                return Err(Rejection::new(
                    "mmap with an executable mapping is not allowed",
                ));
            }
        }
    }
    Ok(())
}
