//! Best-effort repair of port mismatches in project manifests
//!
//! After a failed health check the project's `package.json` scripts are
//! patched to reference the port the runner actually expects.

use regex::{Captures, Regex};
use std::path::Path;
use std::sync::LazyLock;

/// Script names considered when rewriting ports.
const SCRIPT_KEYS: [&str; 4] = ["dev", "start", "serve", "preview"];

static LONG_FLAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)--port[=\s]+\d+").unwrap());

static SHORT_FLAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(^|\s)-p[=\s]+\d+").unwrap());

static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bPORT=\d+").unwrap());

/// Rewrite the port referenced by a project's start-up scripts.
///
/// Reads `package.json` under `working_directory` and, for each of the
/// `dev`/`start`/`serve`/`preview` scripts, rewrites `--port <n>`,
/// `-p <n>`, and inline `PORT=<n>` assignments (case-insensitive) to
/// `target_port`. The file is rewritten with stable two-space indentation
/// only when a script actually changed.
///
/// This is a textual heuristic, not command parsing: a numeric substring
/// that happens to look like a port flag inside some other flag's value
/// will be rewritten too. Returns whether the manifest was modified.
pub fn fix_port_in_project_config(working_directory: &Path, target_port: u16) -> bool {
    let manifest_path = working_directory.join("package.json");

    let raw = match std::fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(_) => return false,
    };
    let mut manifest: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(path = %manifest_path.display(), error = %e, "Unparseable manifest, skipping port fix");
            return false;
        }
    };

    let Some(scripts) = manifest
        .get_mut("scripts")
        .and_then(|s| s.as_object_mut())
    else {
        return false;
    };

    let mut changed = false;
    for key in SCRIPT_KEYS {
        let Some(script) = scripts.get(key).and_then(|v| v.as_str()) else {
            continue;
        };
        let fixed = rewrite_ports(script, target_port);
        if fixed != script {
            tracing::info!(
                script = key,
                port = target_port,
                "Rewrote port in project script"
            );
            scripts.insert(key.to_string(), serde_json::Value::String(fixed));
            changed = true;
        }
    }

    if !changed {
        return false;
    }

    let Ok(pretty) = serde_json::to_string_pretty(&manifest) else {
        return false;
    };
    match std::fs::write(&manifest_path, pretty + "\n") {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %manifest_path.display(), error = %e, "Failed to write patched manifest");
            false
        }
    }
}

fn rewrite_ports(script: &str, target_port: u16) -> String {
    let script = LONG_FLAG_REGEX.replace_all(script, format!("--port {target_port}"));
    let script = SHORT_FLAG_REGEX.replace_all(&script, |caps: &Captures| {
        format!("{}-p {}", &caps[1], target_port)
    });
    ENV_VAR_REGEX
        .replace_all(&script, format!("PORT={target_port}"))
        .into_owned()
}
