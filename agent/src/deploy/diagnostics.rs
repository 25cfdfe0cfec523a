//! Start-failure diagnostics synthesis
//!
//! When an agent fails to start, the supervisor hands the operator a
//! structured report instead of a bare stack trace. The report combines
//! runtime environment facts, definition-file checks, and root-cause
//! hints pattern-matched out of the captured stderr. This is pure
//! string synthesis; nothing downstream branches on it.

use std::path::Path;

use regex::Regex;

use crate::config::AgentDefinition;

/// Newest Python minor version the agent runtime stack is validated on.
/// LangChain pins break on newer interpreters.
const TESTED_PYTHON_MINOR: u32 = 12;

/// Everything known about a failed start, gathered by the supervisor
pub struct FailureContext<'a> {
    pub agent_name: &'a str,
    pub definition_path: &'a Path,
    pub working_dir: &'a Path,
    pub port: Option<u16>,
    pub stderr: &'a str,
    pub exit_code: Option<i32>,
    /// Set when the spawn itself errored before a process existed
    pub spawn_error: Option<&'a str>,
}

/// Build the full human-readable report
pub fn synthesize(ctx: &FailureContext<'_>) -> String {
    let mut report = String::new();

    report.push_str(&format!(
        "Agent '{}' failed to start\n{}\n",
        ctx.agent_name,
        "=".repeat(40)
    ));

    if let Some(err) = ctx.spawn_error {
        report.push_str(&format!("\nSpawn error: {}\n", err));
    }
    if let Some(code) = ctx.exit_code {
        report.push_str(&format!("\nProcess exited with code {}\n", code));
    }

    report.push_str(&runtime_section());
    report.push_str(&definition_section(ctx.definition_path));
    report.push_str(&workdir_section(ctx.working_dir));

    let hints = stderr_hints(ctx);
    if !hints.is_empty() {
        report.push_str("\nLikely causes (from captured stderr):\n");
        for hint in hints {
            report.push_str(&format!("  * {}\n", hint));
        }
    }

    report.push_str(&checklist());
    report
}

fn runtime_section() -> String {
    let mut out = String::from("\nRuntime:\n");

    match python_version() {
        Some(version) => {
            out.push_str(&format!("  {}\n", version));
            if let Some((major, minor)) = parse_python_minor(&version) {
                if major == 3 && minor > TESTED_PYTHON_MINOR {
                    out.push_str(&format!(
                        "  WARNING: Python 3.{} is newer than the tested ceiling (3.{}). \
                         LangChain releases pinned by agent packages are known to break \
                         on newer interpreters; prefer Python 3.{}.\n",
                        minor, TESTED_PYTHON_MINOR, TESTED_PYTHON_MINOR
                    ));
                }
            }
        }
        None => {
            out.push_str("  python3 not found on PATH\n");
        }
    }

    out
}

fn python_version() -> Option<String> {
    let output = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .ok()?;
    // Older interpreters print the version on stderr
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    let line = text.lines().next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

fn parse_python_minor(version_line: &str) -> Option<(u32, u32)> {
    // "Python 3.12.4"
    let token = version_line.split_whitespace().nth(1)?;
    let mut parts = token.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn definition_section(definition_path: &Path) -> String {
    let mut out = String::from("\nDefinition:\n");

    if !definition_path.exists() {
        out.push_str(&format!(
            "  MISSING: {} does not exist\n",
            definition_path.display()
        ));
        return out;
    }

    out.push_str(&format!("  {} (present)\n", definition_path.display()));

    match AgentDefinition::load_from_path(definition_path) {
        Ok(def) => {
            if let Some(deps) = def.dependencies {
                if let Some(python) = deps.python {
                    out.push_str(&format!("  declared runtime: python {}\n", python));
                }
                if !deps.packages.is_empty() {
                    out.push_str(&format!(
                        "  declared packages: {}\n",
                        deps.packages.join(", ")
                    ));
                }
            }
        }
        Err(e) => {
            out.push_str(&format!("  parse error: {}\n", e));
        }
    }

    out
}

fn workdir_section(working_dir: &Path) -> String {
    let mut out = String::from("\nWorking directory:\n");

    for (file, label) in [
        ("main.py", "entry point"),
        ("requirements.txt", "dependency manifest"),
        (".venv", "isolated environment"),
    ] {
        let status = if working_dir.join(file).exists() {
            "present"
        } else {
            "MISSING"
        };
        out.push_str(&format!("  {} ({}): {}\n", file, label, status));
    }

    out
}

/// Pattern-matched root-cause hints. Every recognized pattern and its
/// suggested remedy is part of the observable contract.
fn stderr_hints(ctx: &FailureContext<'_>) -> Vec<String> {
    let mut hints = Vec::new();
    let stderr = ctx.stderr;

    let module_re = Regex::new(r"(ModuleNotFoundError|ImportError)").unwrap();
    if module_re.is_match(stderr) {
        let pip = if ctx.working_dir.join(".venv").exists() {
            ".venv/bin/pip"
        } else {
            "pip"
        };
        hints.push(format!(
            "Missing Python dependencies. Run: {} install -r {}",
            pip,
            ctx.working_dir.join("requirements.txt").display()
        ));
    }

    if stderr.contains("langchain")
        && (stderr.contains("pydantic") || module_re.is_match(stderr))
    {
        hints.push(format!(
            "LangChain major-version incompatibility with this Python runtime. \
             Pin langchain to the major version your agent was built against \
             and use Python 3.{} or older.",
            TESTED_PYTHON_MINOR
        ));
    }

    if stderr.contains("Address already in use") || stderr.contains("EADDRINUSE") {
        match ctx.port {
            Some(port) => hints.push(format!(
                "Port {} is already in use by another process. Change base_port \
                 in harbor.toml or stop the conflicting process.",
                port
            )),
            None => hints.push(
                "A listen port is already in use by another process. Change base_port \
                 in harbor.toml."
                    .to_string(),
            ),
        }
    }

    if stderr.contains("Permission denied") || stderr.contains("PermissionError") {
        hints.push(
            "Permission error. Check that the agent directory and its entry point \
             are readable and executable by the supervisor's user."
                .to_string(),
        );
    }

    if stderr.contains("Connection refused") || stderr.contains("ConnectionRefusedError") {
        hints.push(
            "Connection refused while contacting a companion service. Make sure the \
             LLM backend (and any declared sub-agents) are running before starting \
             this agent."
                .to_string(),
        );
    }

    hints
}

fn checklist() -> String {
    "\nTroubleshooting checklist:\n\
     1. Check the captured stderr above for the first error line.\n\
     2. Verify the agent definition file parses and declares the right name.\n\
     3. Recreate the isolated environment and reinstall dependencies.\n\
     4. Confirm the allocated port range is free on this host.\n\
     5. Start the agent's entry point by hand from its directory to reproduce.\n"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(stderr: &'a str, dir: &'a Path, def: &'a Path) -> FailureContext<'a> {
        FailureContext {
            agent_name: "research",
            definition_path: def,
            working_dir: dir,
            port: Some(8101),
            stderr,
            exit_code: Some(1),
            spawn_error: None,
        }
    }

    #[test]
    fn test_missing_module_suggests_install_command() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join("agent.toml");
        let report = synthesize(&ctx(
            "Traceback (most recent call last):\nModuleNotFoundError: No module named 'langchain'",
            dir.path(),
            &def,
        ));
        assert!(report.contains("install -r"));
        assert!(report.contains("requirements.txt"));
    }

    #[test]
    fn test_venv_pip_preferred_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".venv")).unwrap();
        let def = dir.path().join("agent.toml");
        let report = synthesize(&ctx(
            "ImportError: cannot import name 'x'",
            dir.path(),
            &def,
        ));
        assert!(report.contains(".venv/bin/pip install -r"));
    }

    #[test]
    fn test_address_in_use_names_port() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join("agent.toml");
        let report = synthesize(&ctx(
            "OSError: [Errno 98] Address already in use",
            dir.path(),
            &def,
        ));
        assert!(report.contains("Port 8101"));
        assert!(report.contains("base_port"));
    }

    #[test]
    fn test_connection_refused_points_at_companion_service() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join("agent.toml");
        let report = synthesize(&ctx(
            "ConnectionRefusedError: [Errno 111] Connection refused",
            dir.path(),
            &def,
        ));
        assert!(report.contains("LLM backend"));
    }

    #[test]
    fn test_permission_denied_hint() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join("agent.toml");
        let report = synthesize(&ctx("PermissionError: [Errno 13]", dir.path(), &def));
        assert!(report.contains("Permission error"));
    }

    #[test]
    fn test_report_always_has_checklist_and_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join("agent.toml");
        std::fs::write(&def, "[agent]\nname = \"research\"\n").unwrap();
        let report = synthesize(&ctx("", dir.path(), &def));
        assert!(report.contains("Troubleshooting checklist"));
        assert!(report.contains("entry point"));
        assert!(report.contains("dependency manifest"));
        assert!(report.contains("isolated environment"));
    }

    #[test]
    fn test_parse_python_minor() {
        assert_eq!(parse_python_minor("Python 3.12.4"), Some((3, 12)));
        assert_eq!(parse_python_minor("Python 3.13.0"), Some((3, 13)));
        assert_eq!(parse_python_minor("garbage"), None);
    }
}
