//! Pure validation of requested shell commands. No I/O here: the sandbox
//! gateway calls [`validate_command`] before anything is executed, and a
//! rejection is always reported back to the caller verbatim.

use serde::Serialize;

/// Binaries a run is allowed to invoke: package-manager/runtime tooling plus
/// a handful of filesystem utilities. Everything else is rejected.
pub const COMMAND_ALLOW_LIST: &[&str] = &[
    "bun", "bunx", "npm", "npx", "pnpm", "node", "rm", "mkdir", "cp", "mv", "ls", "cat", "touch",
];

/// Shell metacharacters are banned unconditionally. Composition must go
/// through structured options (cwd, env map), never shell syntax.
const BANNED_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '>', '<', '(', ')', '{', '}', '\n', '\r',
];

const DELETION_BINARIES: &[&str] = &["rm"];

const REPO_METADATA_DIR: &str = ".git";

/// The project build command, as a token prefix. Classification only drives
/// pre/post build cleanup in the gateway, never the allow/deny decision.
const BUILD_COMMAND: &[&str] = &["bun", "run", "build"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovedCommand {
    pub program: String,
    pub argv: Vec<String>,
    pub raw: String,
    pub is_build: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyViolation {
    EmptyCommand,
    ShellMetacharacter { found: char },
    BinaryNotAllowed { program: String },
    ProtectedRepositoryMetadata { command: String },
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::EmptyCommand => write!(f, "empty command"),
            PolicyViolation::ShellMetacharacter { found } => {
                write!(f, "shell metacharacter {found:?} is not permitted")
            }
            PolicyViolation::BinaryNotAllowed { program } => {
                write!(f, "binary {program:?} is not on the command allow-list")
            }
            PolicyViolation::ProtectedRepositoryMetadata { command } => {
                write!(f, "refusing to delete repository metadata: {command:?}")
            }
        }
    }
}

impl std::error::Error for PolicyViolation {}

/// Validates and classifies a raw command line.
pub fn validate_command(raw: &str) -> Result<ApprovedCommand, PolicyViolation> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PolicyViolation::EmptyCommand);
    }
    if let Some(found) = trimmed.chars().find(|c| BANNED_METACHARACTERS.contains(c)) {
        return Err(PolicyViolation::ShellMetacharacter { found });
    }

    let argv: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    let program = argv[0].clone();
    if !COMMAND_ALLOW_LIST.contains(&program.as_str()) {
        return Err(PolicyViolation::BinaryNotAllowed { program });
    }

    if DELETION_BINARIES.contains(&program.as_str()) {
        let args = trimmed[program.len()..].trim_start();
        if targets_repo_metadata(args) {
            return Err(PolicyViolation::ProtectedRepositoryMetadata {
                command: trimmed.to_string(),
            });
        }
    }

    let is_build = argv.len() >= BUILD_COMMAND.len()
        && argv
            .iter()
            .zip(BUILD_COMMAND)
            .all(|(token, expected)| token == expected);

    Ok(ApprovedCommand {
        program,
        argv,
        raw: trimmed.to_string(),
        is_build,
    })
}

/// Boundary-aware match of the literal `.git` directory name anywhere in the
/// argument string. A match requires `.git` to be preceded by start-of-string,
/// whitespace, a quote, or a path separator, and followed by end-of-string,
/// whitespace, a quote, a path separator, or any non-identifier character.
/// `.gitignore` therefore passes while `.git`, `./.git` and `"src/.git"` match.
fn targets_repo_metadata(args: &str) -> bool {
    let bytes = args.as_bytes();
    let needle = REPO_METADATA_DIR.as_bytes();
    let mut start = 0;
    while let Some(offset) = find_from(bytes, needle, start) {
        let before_ok = offset == 0 || is_left_boundary(bytes[offset - 1]);
        let after = offset + needle.len();
        let after_ok = after == bytes.len() || !is_identifier_byte(bytes[after]);
        if before_ok && after_ok {
            return true;
        }
        start = offset + 1;
    }
    false
}

fn find_from(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if start >= haystack.len() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| start + pos)
}

fn is_left_boundary(byte: u8) -> bool {
    byte.is_ascii_whitespace() || matches!(byte, b'"' | b'\'' | b'/')
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_command() {
        assert_eq!(validate_command("   "), Err(PolicyViolation::EmptyCommand));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        let denied = validate_command("bun run build && curl evil");
        assert_eq!(
            denied,
            Err(PolicyViolation::ShellMetacharacter { found: '&' })
        );
        for raw in [
            "ls; rm -rf /",
            "cat foo | grep bar",
            "node `whoami`.js",
            "ls $(pwd)",
            "cat a > b",
            "ls {a,b}",
            "ls\nrm -rf /",
        ] {
            assert!(matches!(
                validate_command(raw),
                Err(PolicyViolation::ShellMetacharacter { .. })
            ));
        }
    }

    #[test]
    fn rejects_binaries_outside_allow_list() {
        assert_eq!(
            validate_command("curl https://example.com"),
            Err(PolicyViolation::BinaryNotAllowed {
                program: "curl".to_string()
            })
        );
        assert!(matches!(
            validate_command("bash -c true"),
            Err(PolicyViolation::BinaryNotAllowed { .. })
        ));
    }

    #[test]
    fn allows_package_manager_commands() {
        let approved = validate_command("bun install").unwrap();
        assert_eq!(approved.program, "bun");
        assert!(!approved.is_build);
    }

    #[test]
    fn classifies_build_command() {
        assert!(validate_command("bun run build").unwrap().is_build);
        assert!(!validate_command("bun run dev").unwrap().is_build);
        assert!(!validate_command("npm run build").unwrap().is_build);
    }

    #[test]
    fn blocks_repo_metadata_deletion() {
        assert!(matches!(
            validate_command("rm -rf .git"),
            Err(PolicyViolation::ProtectedRepositoryMetadata { .. })
        ));
        assert!(matches!(
            validate_command("rm -rf ./.git"),
            Err(PolicyViolation::ProtectedRepositoryMetadata { .. })
        ));
        assert!(matches!(
            validate_command("rm -rf src/.git"),
            Err(PolicyViolation::ProtectedRepositoryMetadata { .. })
        ));
        assert!(matches!(
            validate_command("rm -rf \".git\""),
            Err(PolicyViolation::ProtectedRepositoryMetadata { .. })
        ));
        assert!(matches!(
            validate_command("rm -rf .git/hooks"),
            Err(PolicyViolation::ProtectedRepositoryMetadata { .. })
        ));
    }

    #[test]
    fn allows_deleting_similarly_named_files() {
        assert!(validate_command("rm -rf .gitignore").is_ok());
        assert!(validate_command("rm .github").is_ok());
        assert!(validate_command("rm notes.gitlike").is_ok());
        assert!(validate_command("rm a.git").is_ok());
    }

    #[test]
    fn rejection_reason_is_verbatim() {
        let err = validate_command("rm -rf .git").unwrap_err();
        assert!(err.to_string().contains("rm -rf .git"));
    }
}
