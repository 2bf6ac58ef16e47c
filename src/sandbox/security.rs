//! Command blocklist and dev-server pattern detection for sandbox exec.
//!
//! Commands are tokenized (quote-aware, split on shell connectors) and each
//! segment is matched against a typed ruleset instead of substring checks.
//! Rejections carry a recognizable prefix so agents can tell a policy
//! rejection from a command failure.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{YokeError, YokeResult};

/// Prefix on every tool_result produced by a blocklist rejection.
pub const BLOCKED_PREFIX: &str = "COMMAND BLOCKED:";

/// Root directories a sandboxed command must never target destructively.
const PROTECTED_ROOTS: &[&str] = &[
    "/", "/etc", "/usr", "/var", "/boot", "/bin", "/sbin", "/lib", "/lib64", "/root", "/home",
    "/opt", "/dev", "/sys", "/proc",
];

/// Process names an agent may legitimately kill: its own dev servers.
const DEV_PROCESS_ALLOWLIST: &[&str] = &[
    "node", "npm", "npx", "yarn", "pnpm", "vite", "next", "next-server", "webpack", "nodemon",
    "python", "python3", "flask", "uvicorn", "gunicorn", "rails", "puma", "php", "deno", "bun",
];

static SERVER_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bnpm\s+(run\s+dev|start)\b", "npm dev server"),
        (r"\b(yarn|pnpm)\s+(dev|start)\b", "yarn/pnpm dev server"),
        (r"\bvite\b", "vite"),
        (r"\bnext\s+dev\b", "next dev"),
        (r"\bwebpack\s+serve\b", "webpack serve"),
        (r"\bng\s+serve\b", "ng serve"),
        (r"\bflask\s+run\b", "flask"),
        (r"\buvicorn\b", "uvicorn"),
        (r"\bgunicorn\b", "gunicorn"),
        (r"\brails\s+s(erver)?\b", "rails server"),
        (r"\bphp\s+-S\b", "php built-in server"),
        (r"\bpython3?\s+-m\s+http\.server\b", "python http.server"),
        (r"\bpostgres\b", "postgres"),
        (r"\bpg_ctl\s+start\b", "postgres"),
        (r"\bmysqld\b", "mysql"),
        (r"\bredis-server\b", "redis"),
        (r"\bmongod\b", "mongodb"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).unwrap(), label))
    .collect()
});

/// Detect a command that starts a long-running server. Servers belong in the
/// workspace init script, not the agent loop; matches produce a
/// `background_server_warning` on the session stream.
pub fn detect_server_command(command: &str) -> Option<&'static str> {
    SERVER_PATTERNS
        .iter()
        .find(|(regex, _)| regex.is_match(command))
        .map(|(_, label)| *label)
}

/// Token-ruleset command blocklist; extended with configured program names.
#[derive(Debug, Clone)]
pub struct CommandBlocklist {
    additional: Vec<String>,
}

impl CommandBlocklist {
    pub fn new(additional_blocked_commands: &[String]) -> Self {
        Self {
            additional: additional_blocked_commands.to_vec(),
        }
    }

    /// Validate a command line; every connector-separated segment must pass.
    pub fn check(&self, command: &str) -> YokeResult<()> {
        for segment in split_segments(command) {
            if let Some(rule) = self.check_segment(&segment) {
                return Err(YokeError::BlockedCommand {
                    command: command.to_string(),
                    rule: rule.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_segment(&self, tokens: &[String]) -> Option<&'static str> {
        // Skip leading VAR=value assignments.
        let tokens: Vec<&str> = tokens
            .iter()
            .map(String::as_str)
            .skip_while(|t| is_env_assignment(t))
            .collect();
        let program = basename(tokens.first()?);

        if self.additional.iter().any(|name| name == program) {
            return Some("configured_block");
        }

        match program {
            // Agents must never escalate; the privileged path is reserved
            // for the intervention engine.
            "sudo" | "su" | "doas" | "pkexec" => Some("privilege_escalation"),
            "insmod" | "rmmod" | "modprobe" => Some("kernel_module"),
            "useradd" | "userdel" | "usermod" | "adduser" | "deluser" | "groupadd"
            | "groupdel" | "passwd" | "chpasswd" => Some("user_management"),
            "shutdown" | "reboot" | "halt" | "poweroff" => Some("power_management"),
            "apt" | "apt-get" | "dpkg" | "yum" | "dnf" | "pacman" | "apk" | "brew" => {
                host_package_mutation(&tokens).then_some("host_package_manager")
            }
            "rm" | "rmdir" | "shred" | "chown" | "chmod" => {
                targets_protected_root(&tokens).then_some("destructive_root_fs")
            }
            "dd" => dd_writes_device(&tokens).then_some("destructive_root_fs"),
            p if p.starts_with("mkfs") => Some("destructive_root_fs"),
            "fdisk" | "parted" => Some("destructive_root_fs"),
            // kill by pid is the agent managing its own children; named
            // kills must target known dev processes.
            "pkill" | "killall" => {
                kills_non_dev_process(&tokens).then_some("non_dev_process_kill")
            }
            _ => None,
        }
    }
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

fn host_package_mutation(tokens: &[&str]) -> bool {
    tokens.iter().skip(1).any(|t| {
        matches!(
            *t,
            "install" | "remove" | "purge" | "upgrade" | "dist-upgrade" | "add" | "del" | "-i"
                | "-S" | "-R"
        )
    })
}

fn targets_protected_root(tokens: &[&str]) -> bool {
    tokens.iter().skip(1).any(|t| {
        if !t.starts_with('/') {
            return false;
        }
        let path = t.trim_end_matches('/');
        if path.is_empty() {
            return true; // bare "/"
        }
        if path == "/workspace" || path.starts_with("/workspace/") || path.starts_with("/tmp") {
            return false;
        }
        PROTECTED_ROOTS
            .iter()
            .filter(|root| **root != "/")
            .any(|root| path == *root || path.starts_with(&format!("{}/", root)))
    })
}

fn dd_writes_device(tokens: &[&str]) -> bool {
    tokens
        .iter()
        .any(|t| t.strip_prefix("of=").is_some_and(|target| target.starts_with("/dev/")))
}

fn kills_non_dev_process(tokens: &[&str]) -> bool {
    for token in tokens.iter().skip(1) {
        if token.starts_with('-') {
            continue;
        }
        let name = basename(token);
        if !DEV_PROCESS_ALLOWLIST.contains(&name) {
            return true;
        }
    }
    // No target does nothing; let the shell report it.
    false
}

/// Split a command line into connector-separated segments of quote-aware
/// tokens.
fn split_segments(command: &str) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    let flush_token = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.is_empty() {
            tokens.push(std::mem::take(current));
        }
    };

    while let Some(c) = chars.next() {
        match (c, quote) {
            (q @ ('"' | '\''), None) => quote = Some(q),
            (q, Some(active)) if q == active => quote = None,
            (c, Some(_)) => current.push(c),
            (';' | '\n', None) => {
                flush_token(&mut current, &mut tokens);
                if !tokens.is_empty() {
                    segments.push(std::mem::take(&mut tokens));
                }
            }
            ('&' | '|', None) => {
                // Consume a doubled connector; a single one splits too.
                if chars.peek() == Some(&c) {
                    chars.next();
                }
                flush_token(&mut current, &mut tokens);
                if !tokens.is_empty() {
                    segments.push(std::mem::take(&mut tokens));
                }
            }
            (c, None) if c.is_whitespace() => flush_token(&mut current, &mut tokens),
            (c, None) => current.push(c),
        }
    }
    flush_token(&mut current, &mut tokens);
    if !tokens.is_empty() {
        segments.push(tokens);
    }
    segments
}
