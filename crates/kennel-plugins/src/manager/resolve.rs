//! Executable lookup under the plugins directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginError, PluginResult};

/// Locations probed for a plugin's executable, in order.
///
/// For plugin `id` under `dir`:
///
/// 1. the descriptor's `executable_path`, taken relative to `dir` unless absolute
/// 2. `dir/id/id`
/// 3. `dir/id/bin/id`
/// 4. `dir/id/cmd/id/id`
/// 5. `dir/bin/id`
///
/// On Windows every candidate is also tried with an `.exe` suffix.
#[must_use]
pub fn candidate_paths(plugins_dir: &Path, descriptor: &PluginDescriptor) -> Vec<PathBuf> {
    let id = descriptor.id.as_str();
    let mut base = Vec::with_capacity(5);
    if let Some(path) = &descriptor.executable_path {
        base.push(if path.is_absolute() {
            path.clone()
        } else {
            plugins_dir.join(path)
        });
    }
    base.push(plugins_dir.join(id).join(id));
    base.push(plugins_dir.join(id).join("bin").join(id));
    base.push(plugins_dir.join(id).join("cmd").join(id).join(id));
    base.push(plugins_dir.join("bin").join(id));

    if cfg!(windows) {
        base.into_iter()
            .flat_map(|path| {
                let exe = with_exe_suffix(&path);
                [path, exe]
            })
            .collect()
    } else {
        base
    }
}

/// `path` with `.exe` appended to its file name. IDs may contain dots, so
/// the existing extension is kept.
fn with_exe_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".exe");
    PathBuf::from(name)
}

/// Find the executable for `descriptor`.
///
/// When `search_path` is set and nothing under `plugins_dir` matches, the
/// plugin ID is looked up on `PATH`.
///
/// # Errors
///
/// Returns [`PluginError::ExecutableNotFound`] listing every probed path.
pub fn resolve_executable(
    plugins_dir: &Path,
    descriptor: &PluginDescriptor,
    search_path: bool,
) -> PluginResult<PathBuf> {
    let candidates = candidate_paths(plugins_dir, descriptor);
    if let Some(found) = candidates.iter().find(|path| is_executable(path)) {
        debug!(plugin_id = %descriptor.id, path = %found.display(), "Resolved plugin executable");
        return Ok(found.clone());
    }

    if search_path {
        match which::which(descriptor.id.as_str()) {
            Ok(found) => {
                debug!(plugin_id = %descriptor.id, path = %found.display(), "Resolved plugin executable on PATH");
                return Ok(found);
            },
            Err(e) => debug!(plugin_id = %descriptor.id, error = %e, "PATH lookup failed"),
        }
    }

    Err(PluginError::ExecutableNotFound {
        id: descriptor.id.clone(),
        searched: candidates,
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
