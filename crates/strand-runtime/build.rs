//! Build script for strand-runtime
//!
//! Produces `OUT_DIR/strand_defaults.rs`:
//! 1. Start from the library defaults below
//! 2. If `STRAND_CONFIG_RS` names a file, read `pub const NAME: TYPE = VALUE;`
//!    lines from it and let them win
//! 3. Emit one `pub const` per parameter
//!
//! Only the values that differ need to appear in the user file.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

const USER_CONFIG_VAR: &str = "STRAND_CONFIG_RS";

struct Param {
    name: &'static str,
    ty: &'static str,
    default: &'static str,
}

const PARAMS: &[Param] = &[
    Param { name: "WORKER_THREADS", ty: "usize", default: "1" },
    Param { name: "USE_CALLER", ty: "bool", default: "true" },
    Param { name: "STACK_SIZE", ty: "usize", default: "1024 * 1024" },
    Param { name: "HOOK_ENABLE", ty: "bool", default: "true" },
    Param { name: "IDLE_PARK_MS", ty: "u64", default: "100" },
    Param { name: "REACTOR_MAX_WAIT_MS", ty: "u64", default: "5000" },
    Param { name: "REACTOR_MAX_EVENTS", ty: "usize", default: "256" },
    Param { name: "EVENT_TABLE_CAPACITY", ty: "usize", default: "32" },
    Param { name: "FD_TABLE_CAPACITY", ty: "usize", default: "64" },
    // u64::MAX means "no connect timeout"
    Param { name: "CONNECT_TIMEOUT_MS", ty: "u64", default: "u64::MAX" },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest = Path::new(&out_dir).join("strand_defaults.rs");

    let mut values: HashMap<&'static str, String> = PARAMS
        .iter()
        .map(|p| (p.name, p.default.to_string()))
        .collect();

    println!("cargo:rerun-if-env-changed={}", USER_CONFIG_VAR);
    let user_file = env::var(USER_CONFIG_VAR).ok();
    if let Some(path) = &user_file {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                merge(&content, &mut values);
                println!("cargo:warning=strand: using config overrides from {}", path);
            }
            Err(e) => println!("cargo:warning=strand: cannot read {} ({}): {}", USER_CONFIG_VAR, path, e),
        }
    }

    fs::write(&dest, render(&values, user_file.as_deref())).expect("failed to write strand_defaults.rs");
}

/// Overlay every known `pub const` found in `content`.
fn merge(content: &str, values: &mut HashMap<&'static str, String>) {
    for line in content.lines().map(str::trim) {
        if line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = parse_const(line) else {
            continue;
        };
        match PARAMS.iter().find(|p| p.name == name) {
            Some(p) => {
                values.insert(p.name, value);
            }
            None => println!("cargo:warning=strand: unknown config parameter {}", name),
        }
    }
}

/// `pub const NAME: TYPE = VALUE;` -> (NAME, VALUE)
fn parse_const(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?;
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    if value.is_empty() {
        return None;
    }
    Some((name.trim().to_string(), value.to_string()))
}

fn render(values: &HashMap<&'static str, String>, user_file: Option<&str>) -> String {
    let mut out = String::from("// Generated by strand-runtime/build.rs - do not edit\n");
    if let Some(path) = user_file {
        out.push_str(&format!("// Overrides merged from {}\n", path));
    }
    out.push('\n');
    for p in PARAMS {
        out.push_str(&format!("pub const {}: {} = {};\n", p.name, p.ty, values[p.name]));
    }
    out
}
