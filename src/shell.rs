use std::fs;
use std::path::Path;

/// Syntax family of the shell a session runs, used to build commands we type into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFlavor {
    Posix,
    Cmd,
    PowerShell,
}

impl ShellFlavor {
    pub fn detect(shell_path: &str) -> Self {
        let name = shell_name(shell_path);
        let stem = name.strip_suffix(".exe").unwrap_or(&name);
        match stem {
            "cmd" => ShellFlavor::Cmd,
            "powershell" | "pwsh" => ShellFlavor::PowerShell,
            _ => ShellFlavor::Posix,
        }
    }
}

/// Lowercased file name of a shell path, accepting both separator styles.
pub fn shell_name(shell_path: &str) -> String {
    shell_path
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

#[cfg(target_family = "unix")]
fn shell_from_passwd() -> Option<String> {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()?;
    let prefix = format!("{user}:");
    let contents = fs::read_to_string("/etc/passwd").ok()?;
    let line = contents.lines().find(|line| line.starts_with(&prefix))?;
    let shell = line.split(':').last()?.trim();
    if !shell.is_empty() && Path::new(shell).is_file() {
        return Some(shell.to_string());
    }
    None
}

pub fn default_user_shell() -> String {
    #[cfg(target_family = "unix")]
    {
        if let Ok(shell) = std::env::var("SHELL") {
            let trimmed = shell.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }

        if let Some(shell) = shell_from_passwd() {
            return shell;
        }

        if cfg!(target_os = "macos") {
            return "/bin/zsh".to_string();
        }
        if Path::new("/bin/bash").is_file() {
            return "/bin/bash".to_string();
        }
        "/bin/sh".to_string()
    }

    #[cfg(not(target_family = "unix"))]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
}

pub fn sh_single_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn powershell_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn cmd_double_quote(s: &str) -> String {
    // `"` cannot appear in a Windows path; `%` would expand as a variable.
    format!("\"{}\"", s.replace('"', "").replace('%', "%%"))
}

/// The line typed into an interactive shell to move it to `path`.
pub fn change_directory_command(flavor: ShellFlavor, path: &str) -> String {
    match flavor {
        ShellFlavor::Posix => format!("cd -- {}\r", sh_single_quote(path)),
        ShellFlavor::Cmd => format!("cd /d {}\r", cmd_double_quote(path)),
        ShellFlavor::PowerShell => {
            format!("Set-Location -LiteralPath {}\r", powershell_single_quote(path))
        }
    }
}

/// Arguments for starting the shell, either interactive or running `command`.
///
/// POSIX commands use `-c` instead of `-lc` when the caller supplied env vars,
/// so login profiles cannot overwrite them.
pub fn startup_args(flavor: ShellFlavor, command: Option<&str>, has_custom_env: bool) -> Vec<String> {
    match (flavor, command) {
        (ShellFlavor::Posix, None) => vec!["-l".to_string()],
        (ShellFlavor::Posix, Some(cmd)) => {
            let flag = if has_custom_env { "-c" } else { "-lc" };
            vec![flag.to_string(), cmd.to_string()]
        }
        (ShellFlavor::Cmd, None) => Vec::new(),
        (ShellFlavor::Cmd, Some(cmd)) => vec!["/C".to_string(), cmd.to_string()],
        (ShellFlavor::PowerShell, None) => vec!["-NoLogo".to_string()],
        (ShellFlavor::PowerShell, Some(cmd)) => {
            vec!["-NoLogo".to_string(), "-Command".to_string(), cmd.to_string()]
        }
    }
}

/// Hook installed through `PROMPT_COMMAND` so bash reports its cwd as OSC 7.
pub const BASH_CWD_PROMPT_COMMAND: &str = "printf '\\033]7;file://%s%s\\007' \"${HOSTNAME:-localhost}\" \"$PWD\"; if [ -n \"$AGENTS_GRID_ORIG_PROMPT_COMMAND\" ]; then eval \"$AGENTS_GRID_ORIG_PROMPT_COMMAND\"; fi";

/// PATH for spawned shells: the inherited PATH plus common tool directories
/// that GUI-launched processes tend to miss.
#[cfg(target_family = "unix")]
pub fn fallback_path() -> String {
    let mut entries: Vec<String> = std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .collect();

    if let Some(home) = dirs::home_dir() {
        for candidate in [home.join(".cargo/bin"), home.join(".local/bin"), home.join("bin")] {
            let candidate = candidate.to_string_lossy().to_string();
            if Path::new(&candidate).is_dir() && !entries.contains(&candidate) {
                entries.insert(0, candidate);
            }
        }
    }

    for candidate in ["/opt/homebrew/bin", "/opt/homebrew/sbin", "/usr/local/bin", "/usr/local/sbin"] {
        if Path::new(candidate).is_dir() && !entries.iter().any(|p| p == candidate) {
            entries.insert(0, candidate.to_string());
        }
    }

    for candidate in ["/usr/bin", "/bin", "/usr/sbin", "/sbin"] {
        if Path::new(candidate).is_dir() && !entries.iter().any(|p| p == candidate) {
            entries.push(candidate.to_string());
        }
    }

    entries.join(":")
}

#[cfg(not(target_family = "unix"))]
pub fn fallback_path() -> String {
    std::env::var("PATH").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_flavors_from_paths() {
        assert_eq!(ShellFlavor::detect("/bin/zsh"), ShellFlavor::Posix);
        assert_eq!(ShellFlavor::detect("/usr/local/bin/fish"), ShellFlavor::Posix);
        assert_eq!(ShellFlavor::detect("C:\\Windows\\System32\\cmd.exe"), ShellFlavor::Cmd);
        assert_eq!(ShellFlavor::detect("pwsh"), ShellFlavor::PowerShell);
        assert_eq!(
            ShellFlavor::detect("C:\\Program Files\\PowerShell\\7\\PowerShell.exe"),
            ShellFlavor::PowerShell
        );
    }

    #[test]
    fn posix_cd_quotes_single_quotes() {
        assert_eq!(
            change_directory_command(ShellFlavor::Posix, "/tmp/it's here"),
            "cd -- '/tmp/it'\\''s here'\r"
        );
    }

    #[test]
    fn windows_cd_commands() {
        assert_eq!(
            change_directory_command(ShellFlavor::Cmd, "C:\\Users\\me\\100%"),
            "cd /d \"C:\\Users\\me\\100%%\"\r"
        );
        assert_eq!(
            change_directory_command(ShellFlavor::PowerShell, "C:\\o'brien"),
            "Set-Location -LiteralPath 'C:\\o''brien'\r"
        );
    }

    #[test]
    fn startup_args_follow_env_rule() {
        assert_eq!(startup_args(ShellFlavor::Posix, None, true), vec!["-l"]);
        assert_eq!(startup_args(ShellFlavor::Posix, Some("claude"), false), vec!["-lc", "claude"]);
        assert_eq!(startup_args(ShellFlavor::Posix, Some("claude"), true), vec!["-c", "claude"]);
        assert_eq!(startup_args(ShellFlavor::Cmd, Some("dir"), false), vec!["/C", "dir"]);
    }

    #[test]
    fn default_shell_is_not_empty() {
        assert!(!default_user_shell().is_empty());
    }
}
