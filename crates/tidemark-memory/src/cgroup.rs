//! Best-effort probing of the cgroup memory controller (Linux only).

use std::sync::OnceLock;

/// Values at or above this are how cgroup v1 spells "no limit".
const UNLIMITED_BYTES: u64 = 1 << 60;

/// The memory controller's location for this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MemoryController {
    /// `0::/path` in the unified hierarchy.
    V2(String),
    /// `N:...,memory,...:/path` in a legacy hierarchy.
    V1(String),
}

impl MemoryController {
    fn mount(&self) -> &'static str {
        match self {
            MemoryController::V2(_) => "/sys/fs/cgroup",
            MemoryController::V1(_) => "/sys/fs/cgroup/memory",
        }
    }

    fn path(&self) -> &str {
        match self {
            MemoryController::V2(path) | MemoryController::V1(path) => path,
        }
    }

    fn limit_file(&self) -> &'static str {
        match self {
            MemoryController::V2(_) => "memory.max",
            MemoryController::V1(_) => "memory.limit_in_bytes",
        }
    }

    fn usage_file(&self) -> &'static str {
        match self {
            MemoryController::V2(_) => "memory.current",
            MemoryController::V1(_) => "memory.usage_in_bytes",
        }
    }
}

/// Memory controllers named in `/proc/self/cgroup`, v2 first.
pub(crate) fn parse_proc_self_cgroup(contents: &str) -> Vec<MemoryController> {
    let mut v2 = None;
    let mut v1 = None;

    for line in contents.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut fields = line.splitn(3, ':');
        let (Some(id), Some(controllers), Some(path)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let path = path.trim();
        if path.is_empty() {
            continue;
        }

        if v2.is_none() && id == "0" && controllers.is_empty() {
            v2 = Some(MemoryController::V2(path.to_string()));
        } else if v1.is_none() && controllers.split(',').any(|c| c.trim() == "memory") {
            v1 = Some(MemoryController::V1(path.to_string()));
        }
    }

    v2.into_iter().chain(v1).collect()
}

/// `None` for `max`, empty, unparsable, or effectively unlimited values.
pub(crate) fn parse_limit(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "max" {
        return None;
    }
    match raw.parse::<u64>() {
        Ok(value) if value < UNLIMITED_BYTES => Some(value),
        Ok(_) => None,
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target: "tidemark.memory",
                    raw,
                    error = %err,
                    "unparsable cgroup memory value"
                );
            }
            None
        }
    }
}

#[cfg(target_os = "linux")]
fn controllers() -> Vec<MemoryController> {
    match std::fs::read_to_string("/proc/self/cgroup") {
        Ok(contents) => parse_proc_self_cgroup(&contents),
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    target: "tidemark.memory",
                    error = %err,
                    "failed to read /proc/self/cgroup"
                );
            }
            Vec::new()
        }
    }
}

#[cfg(target_os = "linux")]
fn read_value(path: &std::path::Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if err.kind() != std::io::ErrorKind::NotFound && REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target: "tidemark.memory",
                    path = %path.display(),
                    error = %err,
                    "failed to read cgroup file"
                );
            }
            None
        }
    }
}

/// Tightest limit on the controller path or any of its ancestors.
#[cfg(target_os = "linux")]
pub(crate) fn memory_limit_bytes() -> Option<u64> {
    use std::path::{Path, PathBuf};

    controllers().into_iter().find_map(|controller| {
        let mut rel = PathBuf::from(controller.path().trim_start_matches('/'));
        let mut tightest: Option<u64> = None;
        loop {
            let file = Path::new(controller.mount())
                .join(&rel)
                .join(controller.limit_file());
            if let Some(limit) = read_value(&file).as_deref().and_then(parse_limit) {
                tightest = Some(tightest.map_or(limit, |t| t.min(limit)));
            }
            if !rel.pop() {
                break;
            }
        }
        tightest
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn memory_current_bytes() -> Option<u64> {
    use std::path::Path;

    controllers().into_iter().find_map(|controller| {
        let file = Path::new(controller.mount())
            .join(controller.path().trim_start_matches('/'))
            .join(controller.usage_file());
        read_value(&file).as_deref().and_then(parse_limit)
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn memory_limit_bytes() -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn memory_current_bytes() -> Option<u64> {
    None
}
