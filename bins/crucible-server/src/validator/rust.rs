//! Rust analyzer: unsafe code in any position, extern declarations, paths
//! into process/network/filesystem-write APIs, inline assembly macros, and
//! FFI attributes.

use tree_sitter::Node;

use super::denylist::{RUST_BLOCKED_PATH_PREFIXES, RUST_FS_WRITE_APIS};
use super::{check_tree, node_text, parse, Rejection};

pub(super) fn check(code: &str) -> Result<(), Rejection> {
    let tree = parse(&tree_sitter_rust::LANGUAGE.into(), code)?;
    check_tree(tree.root_node(), &mut |node| match node.kind() {
        // The bare keyword token covers blocks, functions, impls, traits.
        "unsafe" => Err(Rejection::new("unsafe code is not allowed")),
        "foreign_mod_item" => Err(Rejection::new("extern blocks are not allowed")),
        "extern_modifier" | "extern_crate_declaration" => {
            Err(Rejection::new("extern declarations are not allowed"))
        }
        "use_declaration" => check_use(node, code),
        "scoped_identifier" => check_path(node_text(node, code)),
        "macro_invocation" => check_macro(node, code),
        "attribute_item" | "inner_attribute_item" => check_attribute(node, code),
        _ => Ok(()),
    })
}

fn check_use(node: Node, code: &str) -> Result<(), Rejection> {
    match node.child_by_field_name("argument") {
        Some(argument) => check_path(node_text(argument, code)),
        None => Ok(()),
    }
}

fn check_path(path: &str) -> Result<(), Rejection> {
    let path = path.trim_start_matches("::");
    for prefix in RUST_BLOCKED_PATH_PREFIXES {
        if path == *prefix || path.starts_with(&format!("{}::", prefix)) {
            return Err(Rejection::new(format!("use of {} is not allowed", prefix)));
        }
    }
    for api in RUST_FS_WRITE_APIS {
        if path == *api || path.starts_with(&format!("{}::", api)) {
            return Err(Rejection::new(
                "filesystem write APIs are not allowed",
            ));
        }
    }
    Ok(())
}

fn check_macro(node: Node, code: &str) -> Result<(), Rejection> {
    if let Some(name) = node.child_by_field_name("macro") {
        let name = node_text(name, code);
        if name == "asm" || name == "global_asm" {
            return Err(Rejection::new("inline assembly is not allowed"));
        }
    }
    Ok(())
}

fn check_attribute(node: Node, code: &str) -> Result<(), Rejection> {
    let text = node_text(node, code);
    if text.contains("no_mangle") || text.contains("link") {
        return Err(Rejection::new("FFI attributes are not allowed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::validate;
    use crucible_common::types::Language;

    fn reject(code: &str) -> String {
        validate(Language::Rust, code)
            .expect_err("snippet should be rejected")
            .reason
    }

    #[test]
    fn test_unsafe_rejected_everywhere() {
        assert!(reject("fn main(){ unsafe { std::ptr::null::<u8>(); } }").contains("unsafe"));
        assert!(reject("unsafe fn f(){}\nfn main(){}").contains("unsafe"));
        assert!(reject("struct S;\nunsafe impl Send for S {}\nfn main(){}").contains("unsafe"));
    }

    #[test]
    fn test_extern_rejected() {
        assert!(reject("extern \"C\" { fn getpid() -> i32; }\nfn main(){}").contains("extern"));
        assert!(reject("extern \"C\" fn f(){}\nfn main(){}").contains("extern"));
    }

    #[test]
    fn test_process_and_net_paths_rejected() {
        assert!(reject("use std::process::Command;\nfn main(){}").contains("std::process"));
        assert!(
            reject("fn main(){ std::process::Command::new(\"ls\"); }").contains("std::process")
        );
        assert!(reject("use std::net::TcpStream;\nfn main(){}").contains("std::net"));
    }

    #[test]
    fn test_fs_write_apis_rejected() {
        assert!(reject("fn main(){ std::fs::write(\"f\", \"x\").unwrap(); }").contains("write"));
        assert!(reject("use std::fs::File;\nfn main(){}").contains("write"));
    }

    #[test]
    fn test_asm_and_ffi_attributes_rejected() {
        assert!(reject("fn main(){ asm!(\"nop\"); }").contains("assembly"));
        assert!(reject("#[no_mangle]\npub fn f(){}\nfn main(){}").contains("FFI"));
        assert!(reject("#[link(name = \"c\")]\nfn main(){}").contains("FFI"));
    }

    #[test]
    fn test_harmless_programs_pass() {
        assert!(validate(Language::Rust, "fn main(){println!(\"hi\");}").is_ok());
        assert!(validate(
            Language::Rust,
            "use std::collections::HashMap;\nfn main(){let mut m=HashMap::new();m.insert(1,2);println!(\"{:?}\",m);}"
        )
        .is_ok());
        assert!(validate(
            Language::Rust,
            "use std::io::BufRead;\nfn main(){let line=std::io::stdin().lock().lines().next();println!(\"{:?}\",line);}"
        )
        .is_ok());
    }
}
