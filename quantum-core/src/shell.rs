use portable_pty::CommandBuilder;
use std::path::Path;

/// Get the user's login shell from /etc/passwd.
#[cfg(unix)]
pub fn get_user_login_shell() -> Option<String> {
    let username = std::env::var("USER").ok()?;
    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    passwd.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 7 && fields[0] == username && Path::new(fields[6]).exists() {
            Some(fields[6].to_string())
        } else {
            None
        }
    })
}

#[cfg(not(unix))]
pub fn get_user_login_shell() -> Option<String> {
    None
}

/// Get the default shell path, preferring /etc/passwd over $SHELL.
#[cfg(unix)]
pub fn get_default_shell_path() -> String {
    get_user_login_shell()
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

#[cfg(not(unix))]
pub fn get_default_shell_path() -> String {
    "powershell.exe".to_string()
}

/// Return the name of the shell binary (e.g. "fish", "zsh", "bash").
pub fn shell_name(shell_path: &str) -> String {
    Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("shell")
        .to_string()
}

/// Build the command that starts an interactive shell in `cwd`.
pub fn build_shell_command(cwd: Option<&Path>) -> CommandBuilder {
    let shell_path = get_default_shell_path();
    log::debug!("Spawning {} for terminal session", shell_name(&shell_path));

    let mut cmd = CommandBuilder::new(&shell_path);
    if let Some(cwd) = cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd.env("TERM_PROGRAM", "Quantum");
    cmd
}
