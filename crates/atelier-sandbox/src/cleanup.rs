//! Recovery from timed-out builds. A killed `bun run build` can leave child
//! processes alive and holding the build lock, which deadlocks every later
//! build in the same workspace. Cleanup terminates matching processes and
//! removes the stale lock. All of it is best-effort: a clean workspace makes
//! this a no-op.

use crate::{ExecOptions, ExecResult, Workspace};

/// Lock file a wedged build leaves behind.
pub const BUILD_LOCK_FILE: &str = "node_modules/.atelier-build.lock";

const BUILD_PROCESS_NAMES: &[&str] = &["bun run build", "vite build", "esbuild"];

/// `pkill -f` patterns for orphaned build processes. The first character is
/// wrapped in a bracket class so the pattern never matches the pkill
/// invocation carrying it.
pub fn build_process_patterns() -> Vec<String> {
    BUILD_PROCESS_NAMES
        .iter()
        .map(|name| self_excluding(name))
        .collect()
}

fn self_excluding(pattern: &str) -> String {
    let mut chars = pattern.chars();
    match chars.next() {
        Some(first) => format!("[{first}]{}", chars.as_str()),
        None => String::new(),
    }
}

/// Terminates orphaned build processes and removes the stale lock file.
/// `pkill` exits 1 when nothing matched; that is success here.
pub async fn recover_stale_build(workspace: &dyn Workspace, opts: &ExecOptions) {
    for pattern in build_process_patterns() {
        let result = workspace
            .exec("pkill", &["-f".to_string(), pattern.clone()], opts, crate::null_sink())
            .await;
        log_best_effort("pkill", &pattern, &result);
    }
    let result = workspace
        .exec(
            "rm",
            &["-f".to_string(), BUILD_LOCK_FILE.to_string()],
            opts,
            crate::null_sink(),
        )
        .await;
    log_best_effort("rm", BUILD_LOCK_FILE, &result);
}

fn log_best_effort(program: &str, subject: &str, result: &ExecResult) {
    // pkill(1): 0 matched, 1 matched nothing. Anything else is worth a note.
    let benign = result.ok || (program == "pkill" && result.exit_code == Some(1));
    if !benign {
        tracing::debug!(
            target: "atelier.obs",
            component = "sandbox.cleanup",
            program,
            subject,
            error = result.error.as_deref().unwrap_or(""),
            "stale-build cleanup step failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostWorkspace;

    #[test]
    fn patterns_exclude_their_own_invocation() {
        let patterns = build_process_patterns();
        assert_eq!(patterns[0], "[b]un run build");
        for (pattern, name) in patterns.iter().zip(BUILD_PROCESS_NAMES) {
            // The pattern string itself must not match the pattern regex; a
            // literal check on the tail is enough given the bracket prefix.
            assert!(!pattern.contains(name));
            assert!(pattern.ends_with(&name[1..]));
        }
    }

    #[tokio::test]
    async fn cleanup_on_clean_workspace_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = HostWorkspace::new(dir.path());
        // Nothing to kill, no lock file present. Must complete without error.
        recover_stale_build(&workspace, &ExecOptions::default()).await;
        recover_stale_build(&workspace, &ExecOptions::default()).await;
    }

    #[tokio::test]
    async fn cleanup_removes_stale_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("node_modules"))
            .await
            .unwrap();
        let lock = dir.path().join(BUILD_LOCK_FILE);
        tokio::fs::write(&lock, "pid 12345").await.unwrap();
        let workspace = HostWorkspace::new(dir.path());
        recover_stale_build(&workspace, &ExecOptions::default()).await;
        assert!(!lock.exists());
    }
}
