use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const EXPECTED_MODULE: &str = "rnaseq_utils";

fn main() {
    let manifest_dir =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let repo_root = manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("repo root")
        .to_path_buf();
    let kidl_path = repo_root.join("contracts/rnaseq_utils.spec");
    let schemas_dir = repo_root.join("contracts/v1");

    println!("cargo:rerun-if-changed={}", kidl_path.display());
    println!("cargo:rerun-if-changed={}", schemas_dir.display());

    let kidl = fs::read_to_string(&kidl_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", kidl_path.display()));
    let module = KidlModule::parse(&kidl);
    if module.name != EXPECTED_MODULE {
        panic!(
            "{} declares module {:?}, expected {EXPECTED_MODULE:?}",
            kidl_path.display(),
            module.name
        );
    }
    if module.funcdefs.is_empty() {
        panic!("{} declares no funcdef", kidl_path.display());
    }

    let schemas = embedded_schemas(&repo_root, &schemas_dir);
    let mut set_hasher = Sha256::new();
    for (path, sha, _) in &schemas {
        set_hasher.update(path.as_bytes());
        set_hasher.update([0]);
        set_hasher.update(sha.as_bytes());
        set_hasher.update([0]);
    }

    let mut out = String::new();
    push_const(&mut out, "GENERATED_MODULE_NAME", &module.name);
    push_const(&mut out, "GENERATED_MODULE_SPEC", &kidl);
    push_const(
        &mut out,
        "GENERATED_MODULE_SPEC_SHA256",
        &hex(&Sha256::digest(kidl.as_bytes())),
    );
    push_const(&mut out, "GENERATED_SCHEMA_SET_SHA256", &hex(&set_hasher.finalize()));
    push_const(
        &mut out,
        "GENERATED_AT_RFC3339",
        &Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    );

    out.push_str("pub const GENERATED_FUNCDEFS: &[(&str, &str)] = &[\n");
    for (name, auth) in &module.funcdefs {
        out.push_str(&format!("    ({name:?}, {auth:?}),\n"));
    }
    out.push_str("];\n");

    out.push_str("pub const GENERATED_SCHEMAS: &[(&str, &str, &str)] = &[\n");
    for (path, sha, body) in schemas {
        out.push_str(&format!("    ({path:?}, {sha:?}, {body:?}),\n"));
    }
    out.push_str("];\n");

    let out_path = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));
    fs::write(out_path.join("generated_contracts.rs"), out).expect("write generated_contracts.rs");
}

/// The parts of a KIDL module definition the server needs: its name and
/// each funcdef with its authentication mode.
struct KidlModule {
    name: String,
    funcdefs: Vec<(String, String)>,
}

impl KidlModule {
    fn parse(text: &str) -> Self {
        let text = strip_block_comments(text);
        let name = text
            .split_whitespace()
            .skip_while(|word| *word != "module")
            .nth(1)
            .map(|word| word.trim_end_matches('{').to_string())
            .unwrap_or_default();

        // Module-level `authentication <mode>;` sets the default; KIDL's own
        // default is `none`.
        let mut default_auth = "none".to_string();
        let mut funcdefs = Vec::new();
        for statement in text.split(';').map(str::trim) {
            let statement = statement.rsplit('{').next().unwrap_or(statement).trim();
            if let Some(mode) = statement.strip_prefix("authentication ") {
                default_auth = mode.trim().to_string();
                continue;
            }
            let Some(rest) = statement.strip_prefix("funcdef ") else {
                continue;
            };
            let fname = rest.split('(').next().unwrap_or_default().trim().to_string();
            let auth = statement
                .split_once("authentication ")
                .map(|(_, mode)| mode.trim().to_string())
                .unwrap_or_else(|| default_auth.clone());
            funcdefs.push((fname, auth));
        }
        Self { name, funcdefs }
    }
}

fn strip_block_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        rest = match rest[start..].find("*/") {
            Some(end) => &rest[start + end + 2..],
            None => "",
        };
    }
    out.push_str(rest);
    out
}

fn embedded_schemas(repo_root: &Path, dir: &Path) -> Vec<(String, String, String)> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read contracts/v1")
        .filter_map(|entry| entry.ok().map(|v| v.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(".schema.json"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            println!("cargo:rerun-if-changed={}", path.display());
            let body = fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
            let rel = path
                .strip_prefix(repo_root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| path.display().to_string());
            let sha = hex(&Sha256::digest(body.as_bytes()));
            (rel, sha, body)
        })
        .collect()
}

fn push_const(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!("pub const {name}: &str = {value:?};\n"));
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
