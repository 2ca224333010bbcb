//! Emits shell-specific activation and deactivation fragments.
//!
//! The shell is the system of record for the ordered activation sequence: the
//! fragment stores the marshalled op list in `HERMIT_ENV_OPS`, and
//! deactivation replays its inverse from that variable. This is explicit
//! message passing across processes, not shared state.

use std::io::Write;
use std::str::FromStr;

use camino::Utf8PathBuf;

use crate::envars::{self, Envars, Op};
use crate::errors::{HermitError, HermitResult};

/// The shells hermit can activate in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// GNU bash
    Bash,
    /// zsh
    Zsh,
    /// fish
    Fish,
}

impl Shell {
    /// Detect the user's shell from `$SHELL`
    pub fn detect() -> HermitResult<Shell> {
        let shell = std::env::var("SHELL")
            .map_err(|_| HermitError::msg("SHELL is not set; pass --shell explicitly"))?;
        let name = shell.rsplit('/').next().unwrap_or(&shell);
        name.parse()
    }
}

impl FromStr for Shell {
    type Err = HermitError;

    fn from_str(s: &str) -> HermitResult<Shell> {
        match s {
            "bash" | "sh" => Ok(Shell::Bash),
            "zsh" => Ok(Shell::Zsh),
            "fish" => Ok(Shell::Fish),
            other => Err(HermitError::msg(format!("unsupported shell {other:?}"))),
        }
    }
}

/// Inputs to the activation fragment
#[derive(Debug, Clone)]
pub struct ActivationConfig {
    /// the environment root
    pub root: Utf8PathBuf,
    /// name shown in the prompt; empty disables prompt mangling
    pub prompt: String,
    /// the variables activation must export, revert markers included
    pub env: Envars,
}

/// Quote a value for POSIX shells
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn export_stmt(shell: Shell, key: &str, value: &str) -> String {
    match shell {
        Shell::Bash | Shell::Zsh => format!("export {key}={}\n", sh_quote(value)),
        Shell::Fish => format!("set -gx {key} {}\n", sh_quote(value)),
    }
}

fn unset_stmt(shell: Shell, key: &str) -> String {
    match shell {
        Shell::Bash | Shell::Zsh => format!("unset {key}\n"),
        Shell::Fish => format!("set -e {key}\n"),
    }
}

/// Write the fragment that activates an environment: exports, the
/// deactivation function, prompt mangling, and the per-prompt refresh hook.
pub fn activation(
    w: &mut dyn Write,
    shell: Shell,
    config: &ActivationConfig,
    ops: &[Op],
) -> HermitResult<()> {
    for (key, value) in &config.env {
        w.write_all(export_stmt(shell, key, value).as_bytes())?;
    }
    let blob = envars::marshal_ops(ops)?;
    w.write_all(export_stmt(shell, "HERMIT_ENV_OPS", &blob).as_bytes())?;

    match shell {
        Shell::Bash | Shell::Zsh => {
            writeln!(
                w,
                r#"deactivate-hermit() {{
    eval "$("${{HERMIT_ENV}}/bin/hermit" deactivate --shell={shell})"
    if [ -n "${{_HERMIT_OLD_PS1+x}}" ]; then
        PS1="${{_HERMIT_OLD_PS1}}"
        unset _HERMIT_OLD_PS1
    fi
    unset -f deactivate-hermit update_hermit_env 2>/dev/null
}}
update_hermit_env() {{
    local mtime
    mtime="$(stat -c %Y "${{HERMIT_BIN}}" 2>/dev/null || stat -f %m "${{HERMIT_BIN}}" 2>/dev/null)"
    if [ "${{mtime}}" != "${{_HERMIT_BIN_MTIME:-}}" ]; then
        _HERMIT_BIN_MTIME="${{mtime}}"
        eval "$("${{HERMIT_BIN}}/hermit" activate --shell={shell} "${{HERMIT_ENV}}")"
    fi
}}"#,
                shell = shell_name(shell),
            )?;
            if !config.prompt.is_empty() {
                writeln!(w, r#"_HERMIT_OLD_PS1="${{PS1-}}""#)?;
                writeln!(w, r#"PS1="{}⬢ ${{PS1-}}""#, config.prompt)?;
            }
            match shell {
                Shell::Bash => writeln!(
                    w,
                    r#"case ";${{PROMPT_COMMAND:-}};" in *";update_hermit_env;"*) ;; *) PROMPT_COMMAND="update_hermit_env${{PROMPT_COMMAND:+;$PROMPT_COMMAND}}" ;; esac"#
                )?,
                Shell::Zsh => writeln!(
                    w,
                    "typeset -ag precmd_functions\nif [[ -z ${{precmd_functions[(r)update_hermit_env]:-}} ]]; then\n    precmd_functions+=(update_hermit_env)\nfi"
                )?,
                Shell::Fish => unreachable!(),
            }
        }
        Shell::Fish => {
            writeln!(
                w,
                r#"function deactivate-hermit
    eval ("$HERMIT_ENV/bin/hermit" deactivate --shell=fish)
    functions -e deactivate-hermit update_hermit_env
end
function update_hermit_env --on-event fish_prompt
    set -l mtime (stat -c %Y "$HERMIT_BIN" 2>/dev/null; or stat -f %m "$HERMIT_BIN" 2>/dev/null)
    if test "$mtime" != "$_HERMIT_BIN_MTIME"
        set -g _HERMIT_BIN_MTIME $mtime
        eval ("$HERMIT_BIN/hermit" activate --shell=fish "$HERMIT_ENV")
    end
end"#
            )?;
            if !config.prompt.is_empty() {
                writeln!(
                    w,
                    r#"functions -q fish_prompt; and functions -c fish_prompt _hermit_old_fish_prompt
function fish_prompt
    printf '{}⬢ '
    _hermit_old_fish_prompt
end"#,
                    config.prompt
                )?;
            }
        }
    }
    Ok(())
}

fn shell_name(shell: Shell) -> &'static str {
    match shell {
        Shell::Bash => "bash",
        Shell::Zsh => "zsh",
        Shell::Fish => "fish",
    }
}

/// Write the fragment that deactivates an environment, given the concrete
/// variable changes reverting the op sequence produced.
pub fn deactivation(
    w: &mut dyn Write,
    shell: Shell,
    changes: &[(String, Option<String>)],
) -> HermitResult<()> {
    for (key, value) in changes {
        match value {
            Some(value) => w.write_all(export_stmt(shell, key, value).as_bytes())?,
            None => w.write_all(unset_stmt(shell, key).as_bytes())?,
        }
    }
    w.write_all(unset_stmt(shell, "HERMIT_ENV_OPS").as_bytes())?;
    Ok(())
}

/// Compute the concrete changes that deactivation must emit: revert `ops`
/// against `current`, then diff the changed names.
pub fn deactivation_changes(
    current: &Envars,
    ops: &[Op],
    root: &str,
) -> Vec<(String, Option<String>)> {
    let mut transform = crate::envars::Transform::new(root, current.clone());
    transform.revert_all(ops);
    let reverted = transform.combined();
    let mut changes = Vec::new();
    for name in transform.changed_names() {
        let old = current.get(name);
        let new = reverted.get(name);
        if old != new {
            changes.push((name.to_string(), new.cloned()));
        }
    }
    // the bookkeeping vars themselves
    for name in ["HERMIT_ENV", "HERMIT_BIN", "ACTIVE_HERMIT"] {
        if current.contains_key(name) && !reverted.contains_key(name) {
            continue; // already emitted via changed_names
        }
        if !changes.iter().any(|(n, _)| n == name) && current.contains_key(name) {
            changes.push((name.to_string(), None));
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ActivationConfig {
        let mut env = Envars::new();
        env.insert("HERMIT_ENV".to_string(), "/project".to_string());
        env.insert("PATH".to_string(), "/project/bin:/usr/bin".to_string());
        ActivationConfig {
            root: Utf8PathBuf::from("/project"),
            prompt: "project".to_string(),
            env,
        }
    }

    fn ops() -> Vec<Op> {
        vec![Op::Prepend { name: "PATH".to_string(), value: "/project/bin".to_string() }]
    }

    #[test]
    fn bash_fragment_exports_and_hooks() {
        let mut out = Vec::new();
        activation(&mut out, Shell::Bash, &config(), &ops()).unwrap();
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("export HERMIT_ENV='/project'"));
        assert!(script.contains("export PATH='/project/bin:/usr/bin'"));
        assert!(script.contains("export HERMIT_ENV_OPS="));
        assert!(script.contains("deactivate-hermit()"));
        assert!(script.contains("PROMPT_COMMAND"));
        assert!(script.contains("PS1="));
    }

    #[test]
    fn fish_fragment_uses_fish_syntax() {
        let mut out = Vec::new();
        activation(&mut out, Shell::Fish, &config(), &ops()).unwrap();
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("set -gx HERMIT_ENV '/project'"));
        assert!(script.contains("function deactivate-hermit"));
        assert!(script.contains("--on-event fish_prompt"));
        assert!(!script.contains("export "));
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(sh_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn deactivation_reverts_the_op_sequence() {
        let ops = vec![
            Op::Set { name: "HERMIT_ENV".to_string(), value: "/project".to_string() },
            Op::Prepend { name: "PATH".to_string(), value: "/project/bin".to_string() },
        ];
        let mut current = Envars::new();
        current.insert("PATH".to_string(), "/usr/bin".to_string());
        let mut transform = crate::envars::Transform::new("/project", current);
        transform.apply_all(&ops);
        let activated = transform.combined();

        let changes = deactivation_changes(&activated, &ops, "/project");
        assert!(changes.contains(&("HERMIT_ENV".to_string(), None)));
        assert!(changes.contains(&("PATH".to_string(), Some("/usr/bin".to_string()))));

        let mut out = Vec::new();
        deactivation(&mut out, Shell::Bash, &changes).unwrap();
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("unset HERMIT_ENV\n"));
        assert!(script.contains("export PATH='/usr/bin'"));
        assert!(script.contains("unset HERMIT_ENV_OPS"));
    }
}
