// Blocked constructs per language. Consumed by the language analyzers;
// kept in one place so the lists stay reviewable.

// --- Python ---------------------------------------------------------------

/// Builtins that execute or materialize code.
pub const PYTHON_BLOCKED_CALLS: &[&str] = &["eval", "exec", "compile", "__import__"];

/// Modules that reach the filesystem, processes, or the network.
pub const PYTHON_BLOCKED_MODULES: &[&str] = &[
    // filesystem and interpreter state
    "os", "sys", "io", "pathlib", "glob", "shutil", "tempfile",
    // processes
    "subprocess", "multiprocessing", "threading",
    // network
    "socket", "urllib", "http", "ftplib", "smtplib", "ssl",
    // code loading
    "importlib", "runpy",
    // low-level system access
    "ctypes", "pty", "signal", "resource",
    // serializers that can execute code
    "pickle", "shelve", "marshal",
];

/// Dunder attributes that ordinary programs legitimately touch.
pub const PYTHON_SAFE_DUNDERS: &[&str] = &["__init__", "__str__", "__repr__", "__len__"];

// --- JavaScript -----------------------------------------------------------

pub const JS_BLOCKED_CALLS: &[&str] = &["eval", "Function"];

pub const JS_BLOCKED_MODULES: &[&str] = &[
    "fs", "path", "os", "child_process", "cluster", "worker_threads", "net", "http", "https",
    "http2", "dgram", "dns", "tls", "v8", "vm", "repl",
];

/// Member chains that reach node internals or the process object.
pub const JS_BLOCKED_MEMBERS: &[&str] = &[
    "process.binding",
    "process.mainModule",
    "global.process",
    "globalThis.process",
];

// --- C / C++ --------------------------------------------------------------

/// Entries ending in `/` match any header under that directory.
pub const C_CPP_BLOCKED_HEADERS: &[&str] = &[
    "unistd.h", "fcntl.h", "dlfcn.h", "sys/", "netinet/", "arpa/", "net/", "linux/",
];

pub const C_CPP_BLOCKED_FUNCTIONS: &[&str] = &[
    "system", "popen", "fork", "vfork", "socket", "connect", "bind", "listen", "accept",
    "ptrace", "dlopen", "dlsym",
];

// --- Rust -----------------------------------------------------------------

pub const RUST_BLOCKED_PATH_PREFIXES: &[&str] = &["std::process", "std::net"];

/// `File` and `OpenOptions` are listed wholesale: both can open for write.
pub const RUST_FS_WRITE_APIS: &[&str] = &[
    "std::fs::write",
    "std::fs::remove_file",
    "std::fs::remove_dir",
    "std::fs::remove_dir_all",
    "std::fs::create_dir",
    "std::fs::create_dir_all",
    "std::fs::rename",
    "std::fs::copy",
    "std::fs::hard_link",
    "std::fs::set_permissions",
    "std::fs::File",
    "std::fs::OpenOptions",
    "fs::write",
    "fs::remove_file",
    "fs::remove_dir",
    "fs::remove_dir_all",
    "fs::create_dir",
    "fs::create_dir_all",
    "fs::rename",
    "fs::copy",
    "fs::File",
    "fs::OpenOptions",
    "File::create",
    "OpenOptions::new",
];
