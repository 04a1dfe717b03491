//! Output discovery - find the run directory the generator produced last

use popgen_core::{Error, Result, RunId};
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the newest immediate subdirectory of `format_root`.
///
/// Newest means greatest modification time; equal times are broken by the
/// lexicographically greatest name so the choice is deterministic.
pub fn latest_run_directory(format_root: &Path) -> Result<RunId> {
    if !format_root.is_dir() {
        return Err(Error::not_found(format!(
            "output directory {} does not exist",
            format_root.display()
        )));
    }

    let mut newest: Option<(SystemTime, String)> = None;
    for entry in WalkDir::new(format_root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let modified = entry
            .metadata()
            .map_err(|e| Error::Io(e.into()))?
            .modified()?;
        debug!("Candidate run directory {} ({:?})", name, modified);

        let candidate = (modified, name);
        if newest.as_ref().map_or(true, |current| candidate > *current) {
            newest = Some(candidate);
        }
    }

    let (_, name) = newest.ok_or_else(|| {
        Error::not_found(format!(
            "no run directory found in {}",
            format_root.display()
        ))
    })?;

    RunId::parse(name).map_err(|e| {
        warn!("Newest output directory is not a usable run id: {}", e);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File, FileTimes};
    use std::time::Duration;

    fn set_mtime(path: &Path, time: SystemTime) {
        // Directories must be opened read-only to set their times.
        let dir = File::open(path).unwrap();
        dir.set_times(FileTimes::new().set_modified(time)).unwrap();
    }

    #[test]
    fn missing_root_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = latest_run_directory(&tmp.path().join("csv")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn empty_root_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("stray.zip"), b"x").unwrap();
        let err = latest_run_directory(tmp.path()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn picks_newest_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for (name, offset) in [("zzz_old", 0), ("aaa_new", 60), ("mmm_mid", 30)] {
            let dir = tmp.path().join(name);
            fs::create_dir(&dir).unwrap();
            set_mtime(&dir, base + Duration::from_secs(offset));
        }
        assert_eq!(latest_run_directory(tmp.path()).unwrap().as_str(), "aaa_new");
    }

    #[test]
    fn equal_times_break_ties_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for name in ["run_b", "run_c", "run_a"] {
            let dir = tmp.path().join(name);
            fs::create_dir(&dir).unwrap();
            set_mtime(&dir, when);
        }
        assert_eq!(latest_run_directory(tmp.path()).unwrap().as_str(), "run_c");
    }
}
