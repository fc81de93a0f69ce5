//! Maps an entry's command string to an executable and argument vector.
//!
//! Resolution depends only on the command, the extra arguments, the working directory
//! and the environment it is given, so the same inputs always produce the same result.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{constants::PYTHON_OVERRIDE_VARS, error::LaunchError};

/// Program and arguments ready to hand to the spawner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Python,
    Shell,
    PowerShell,
    Batch,
    Executable,
}

impl ScriptKind {
    fn detect(command: &str) -> Option<Self> {
        let ext = Path::new(command).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "py" => Some(ScriptKind::Python),
            "sh" => Some(ScriptKind::Shell),
            "ps1" => Some(ScriptKind::PowerShell),
            "bat" | "cmd" => Some(ScriptKind::Batch),
            "exe" => Some(ScriptKind::Executable),
            _ => None,
        }
    }
}

/// Resolves `cmd` plus `extra_args` against `env`.
pub fn resolve_program(
    cmd: &str,
    extra_args: &str,
    cwd: &str,
    env: &BTreeMap<String, String>,
) -> Result<LaunchSpec, LaunchError> {
    let trimmed = cmd.trim();
    let command = strip_quotes(trimmed);
    if command.is_empty() {
        return Err(LaunchError::EmptyCommand);
    }

    // "python3 job.py" is a command line, not a script path.
    let single_path = command.len() != trimmed.len()
        || script_path(command, cwd).exists()
        || shlex::split(command).is_some_and(|words| words.len() == 1);
    let kind = ScriptKind::detect(command).filter(|_| single_path);

    let mut spec = match kind {
        Some(ScriptKind::Python) => LaunchSpec {
            program: python_for(command, cwd, env)?,
            args: vec!["-u".to_string(), command.to_string()],
        },
        Some(ScriptKind::Shell) => LaunchSpec {
            program: "sh".to_string(),
            args: vec![command.to_string()],
        },
        Some(ScriptKind::PowerShell) => {
            let program = ["pwsh", "powershell"]
                .into_iter()
                .find_map(|name| lookup(name, cwd, env))
                .ok_or_else(|| LaunchError::InterpreterNotFound(command.to_string()))?;
            LaunchSpec {
                program,
                args: vec![
                    "-NoLogo".to_string(),
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-File".to_string(),
                    command.to_string(),
                ],
            }
        }
        Some(ScriptKind::Batch) => LaunchSpec {
            program: env
                .get("ComSpec")
                .or_else(|| env.get("COMSPEC"))
                .filter(|value| !value.is_empty())
                .cloned()
                .unwrap_or_else(|| "cmd.exe".to_string()),
            args: vec!["/c".to_string(), command.to_string()],
        },
        Some(ScriptKind::Executable) => LaunchSpec {
            program: command.to_string(),
            args: Vec::new(),
        },
        None => {
            let mut words = shlex::split(command)
                .ok_or_else(|| LaunchError::Unparsable(command.to_string()))?
                .into_iter();
            let program = words.next().ok_or(LaunchError::EmptyCommand)?;
            LaunchSpec {
                program,
                args: words.collect(),
            }
        }
    };

    spec.args.extend(split_args(extra_args));
    Ok(spec)
}

/// Shell-word split, degrading to whitespace split when quoting is unbalanced.
pub fn split_args(args: &str) -> Vec<String> {
    let args = args.trim();
    if args.is_empty() {
        return Vec::new();
    }
    shlex::split(args)
        .unwrap_or_else(|| args.split_whitespace().map(str::to_string).collect())
}

fn strip_quotes(command: &str) -> &str {
    for quote in ['"', '\''] {
        if command.len() >= 2 && command.starts_with(quote) && command.ends_with(quote) {
            return &command[1..command.len() - 1];
        }
    }
    command
}

fn script_path(command: &str, cwd: &str) -> PathBuf {
    let path = PathBuf::from(command);
    if path.is_absolute() || cwd.is_empty() {
        path
    } else {
        Path::new(cwd).join(path)
    }
}

/// Project virtualenv next to the script, then an explicit override, then PATH.
fn python_for(
    command: &str,
    cwd: &str,
    env: &BTreeMap<String, String>,
) -> Result<String, LaunchError> {
    let script = script_path(command, cwd);
    if let Some(dir) = script.parent() {
        for candidate in [".venv/bin/python3", ".venv/bin/python"] {
            let interpreter = dir.join(candidate);
            if interpreter.is_file() {
                return Ok(interpreter.to_string_lossy().into_owned());
            }
        }
    }

    if let Some(explicit) = PYTHON_OVERRIDE_VARS
        .iter()
        .filter_map(|var| env.get(*var))
        .find(|value| !value.trim().is_empty())
    {
        return Ok(explicit.trim().to_string());
    }

    ["python3", "python"]
        .into_iter()
        .find_map(|name| lookup(name, cwd, env))
        .ok_or_else(|| LaunchError::InterpreterNotFound(command.to_string()))
}

fn lookup(name: &str, cwd: &str, env: &BTreeMap<String, String>) -> Option<String> {
    let path = env.get("PATH")?;
    let cwd = if cwd.is_empty() { "." } else { cwd };
    which::which_in(name, Some(path), cwd)
        .ok()
        .map(|found| found.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn env_with(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = resolve_program("   ", "", "", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, LaunchError::EmptyCommand));
    }

    #[test]
    fn plain_command_is_word_split() {
        let spec = resolve_program("sleep 30", "", "", &BTreeMap::new()).unwrap();
        assert_eq!(spec.program, "sleep");
        assert_eq!(spec.args, vec!["30"]);
    }

    #[test]
    fn command_line_naming_a_script_is_not_a_script() {
        let spec = resolve_program("python3 job.py", "", "", &BTreeMap::new()).unwrap();
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.args, vec!["job.py"]);
    }

    #[test]
    fn unbalanced_command_is_unparsable() {
        let err = resolve_program("echo \"oops", "", "", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, LaunchError::Unparsable(_)));
    }

    #[test]
    fn extra_args_are_appended() {
        let spec =
            resolve_program("run.sh", "--port 8080 'two words'", "", &BTreeMap::new()).unwrap();
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["run.sh", "--port", "8080", "two words"]);
    }

    #[test]
    fn unbalanced_args_fall_back_to_whitespace() {
        assert_eq!(split_args("a \"b c"), vec!["a", "\"b", "c"]);
        assert!(split_args("  ").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn python_prefers_project_virtualenv() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join(".venv/bin");
        fs::create_dir_all(&bin).unwrap();
        make_executable(&bin.join("python3"));

        let env = env_with(&[("COMBINER_PYTHON", "/opt/python")]);
        let spec =
            resolve_program("script.py", "", dir.path().to_str().unwrap(), &env).unwrap();

        assert_eq!(spec.program, bin.join("python3").to_string_lossy());
        assert_eq!(spec.args, vec!["-u", "script.py"]);
    }

    #[test]
    fn python_override_beats_path() {
        let dir = tempdir().unwrap();
        let env = env_with(&[("PYTHON_EXE", "/opt/py/bin/python"), ("PATH", "/usr/bin")]);
        let spec =
            resolve_program("job.py", "", dir.path().to_str().unwrap(), &env).unwrap();
        assert_eq!(spec.program, "/opt/py/bin/python");
    }

    #[cfg(unix)]
    #[test]
    fn python_is_found_on_snapshot_path() {
        let dir = tempdir().unwrap();
        let tools = dir.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        make_executable(&tools.join("python3"));

        let env = env_with(&[("PATH", tools.to_str().unwrap())]);
        let spec =
            resolve_program("job.py", "", dir.path().to_str().unwrap(), &env).unwrap();
        assert_eq!(spec.program, tools.join("python3").to_string_lossy());
    }

    #[test]
    fn python_without_interpreter_fails() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        let env = env_with(&[("PATH", empty.to_str().unwrap())]);

        let err = resolve_program("job.py", "", dir.path().to_str().unwrap(), &env).unwrap_err();
        assert!(matches!(err, LaunchError::InterpreterNotFound(_)));
    }

    #[test]
    fn batch_uses_comspec() {
        let env = env_with(&[("ComSpec", "C:\\Windows\\system32\\cmd.exe")]);
        let spec = resolve_program("build.bat", "", "", &env).unwrap();
        assert_eq!(spec.program, "C:\\Windows\\system32\\cmd.exe");
        assert_eq!(spec.args, vec!["/c", "build.bat"]);
    }

    #[test]
    fn quoted_executable_runs_directly() {
        let spec =
            resolve_program("\"/opt/My Tools/agent.exe\"", "-v", "", &BTreeMap::new()).unwrap();
        assert_eq!(spec.program, "/opt/My Tools/agent.exe");
        assert_eq!(spec.args, vec!["-v"]);
    }
}
