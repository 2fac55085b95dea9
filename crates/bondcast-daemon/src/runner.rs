//! Child process supervision.
//!
//! Each streaming child (bonder, encoder) gets its own supervision
//! loop: while the streaming flag is set the child is (re)spawned with
//! stdio inherited, and respawned after a per-child cooldown when it
//! exits. Stopping kills by executable name as well as through the
//! child handle, so orphans from a previous daemon run are reaped too.

use std::time::Duration;

use tokio::sync::watch;

/// Supervise one child program while the streaming flag is true.
///
/// Exits when the flag transitions to false; the in-flight child is
/// killed through its handle (the name-based kill in `stop()` covers
/// anything this task no longer owns).
pub async fn supervise(
    mut flag: watch::Receiver<bool>,
    program: String,
    args: Vec<String>,
    cooldown: Duration,
) {
    let name = basename(&program).to_string();
    while *flag.borrow() {
        match tokio::process::Command::new(&program).args(&args).spawn() {
            Ok(mut child) => {
                tracing::info!(child = %name, pid = ?child.id(), "child started");
                loop {
                    let exited = tokio::select! {
                        status = child.wait() => {
                            tracing::warn!(child = %name, status = ?status.ok(), "child exited");
                            true
                        }
                        _ = flag.changed() => false,
                    };
                    if exited {
                        break;
                    }
                    if !*flag.borrow() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::error!(child = %name, error = %e, "failed to spawn child");
            }
        }

        if !*flag.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(cooldown) => {}
            _ = flag.changed() => {
                if !*flag.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!(child = %name, "supervision ended");
}

/// Send `signal` to every live process whose executable basename is
/// `name`. Returns the number of processes signalled.
///
/// Used with SIGHUP to prompt a child to re-read its runtime files and
/// with SIGTERM to stop children (including orphans) by name.
pub fn signal_by_name(name: &str, signal: i32) -> usize {
    // The kernel truncates /proc/<pid>/comm to 15 bytes.
    let comm_name: String = name.chars().take(15).collect();
    let own_pid = std::process::id() as i32;
    let mut signalled = 0;

    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return 0;
    };
    for entry in proc_dir.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim_end() == comm_name {
            unsafe {
                if libc::kill(pid, signal) == 0 {
                    signalled += 1;
                }
            }
        }
    }
    signalled
}

/// Executable basename of a path, for name-based signalling.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/usr/local/bin/bonder"), "bonder");
        assert_eq!(basename("encoder"), "encoder");
        assert_eq!(basename("/opt/bondcast/encoder"), "encoder");
    }

    #[test]
    fn signalling_an_unknown_name_hits_nothing() {
        assert_eq!(signal_by_name("no-such-program-xyzzy", libc::SIGHUP), 0);
    }

    #[tokio::test]
    async fn supervise_exits_when_flag_is_low() {
        let (tx, rx) = watch::channel(false);
        // Flag already false: the loop body must not run.
        supervise(
            rx,
            "/bin/false".into(),
            vec![],
            Duration::from_millis(10),
        )
        .await;
        drop(tx);
    }
}
