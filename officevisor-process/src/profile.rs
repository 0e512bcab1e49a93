//! Instance profile directories

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use url::Url;
use walkdir::WalkDir;

/// Replace `instance_dir` with a fresh profile.
///
/// A stale directory from an earlier run is removed first. When a template
/// is given, its contents are copied in; otherwise the converter creates
/// the profile on first launch.
pub fn prepare_profile_dir(instance_dir: &Path, template: Option<&Path>) -> io::Result<()> {
    if instance_dir.exists() {
        warn!(dir = %instance_dir.display(), "Deleting stale instance profile");
        delete_profile_dir(instance_dir);
    }

    if let Some(template) = template {
        debug!(
            template = %template.display(),
            dir = %instance_dir.display(),
            "Copying template profile"
        );
        copy_dir_all(template, instance_dir)?;
    }

    Ok(())
}

/// Remove a profile directory, best effort.
///
/// If it cannot be removed it is renamed with a timestamp suffix so the
/// next instance still gets a clean directory. Failures are logged only.
pub fn delete_profile_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }

    match fs::remove_dir_all(dir) {
        Ok(()) => debug!(dir = %dir.display(), "Deleted instance profile"),
        Err(e) => {
            let renamed = renamed_path(dir);
            match fs::rename(dir, &renamed) {
                Ok(()) => warn!(
                    dir = %dir.display(),
                    renamed = %renamed.display(),
                    "Could not delete instance profile ({}); renamed it instead",
                    e
                ),
                Err(rename_error) => error!(
                    dir = %dir.display(),
                    "Could not delete ({}) or rename ({}) instance profile",
                    e,
                    rename_error
                ),
            }
        }
    }
}

fn renamed_path(dir: &Path) -> PathBuf {
    let suffix = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".old.{}", suffix));
    dir.with_file_name(name)
}

fn copy_dir_all(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// `file://` URI of `path`, as expected by `-env:UserInstallation`.
///
/// Relative paths are resolved against the current directory.
pub fn file_uri(path: &Path) -> io::Result<String> {
    let absolute = std::path::absolute(path)?;
    Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|()| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no file URI", absolute.display()),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_copies_template() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        fs::create_dir_all(template.join("user").join("config")).unwrap();
        fs::write(template.join("user").join("registrymodifications.xcu"), b"<xml/>").unwrap();

        let instance = dir.path().join(".officevisor_instance");
        prepare_profile_dir(&instance, Some(&template)).unwrap();

        assert!(instance.join("user").join("config").is_dir());
        assert_eq!(
            fs::read(instance.join("user").join("registrymodifications.xcu")).unwrap(),
            b"<xml/>"
        );
    }

    #[test]
    fn test_prepare_removes_stale_profile() {
        let dir = tempfile::tempdir().unwrap();
        let instance = dir.path().join(".officevisor_instance");
        fs::create_dir_all(instance.join("user")).unwrap();
        fs::write(instance.join("user").join("stale.lock"), b"").unwrap();

        prepare_profile_dir(&instance, None).unwrap();

        assert!(!instance.exists());
    }

    #[test]
    fn test_delete_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        delete_profile_dir(&dir.path().join("never-created"));
        assert!(dir.path().exists());
    }

    #[test]
    fn test_renamed_path_keeps_parent() {
        let renamed = renamed_path(Path::new("/work/.officevisor_socket"));
        assert_eq!(renamed.parent(), Some(Path::new("/work")));
        assert!(renamed
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".officevisor_socket.old."));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_uri() {
        assert_eq!(
            file_uri(Path::new("/tmp/.officevisor_socket,host=x")).unwrap(),
            "file:///tmp/.officevisor_socket,host=x"
        );
        assert_eq!(file_uri(Path::new("/tmp/my dir")).unwrap(), "file:///tmp/my%20dir");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_uri_of_relative_path_is_absolute() {
        let uri = file_uri(Path::new("profiles/instance")).unwrap();
        let cwd = std::env::current_dir().unwrap();

        assert!(uri.starts_with("file:///"));
        assert_eq!(
            Url::parse(&uri).unwrap().to_file_path().unwrap(),
            cwd.join("profiles/instance")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_undeletable_profile_is_renamed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let instance = dir.path().join(".officevisor_instance");
        let locked = instance.join("user");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("registrymodifications.xcu"), b"<xml/>").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        // Permission bits do not stop root
        if fs::write(locked.join("root-check"), b"").is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        delete_profile_dir(&instance);

        assert!(!instance.exists());
        let renamed: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with(".officevisor_instance.old.")
            })
            .collect();
        assert_eq!(renamed.len(), 1);
        assert!(renamed[0].join("user").join("registrymodifications.xcu").exists());

        fs::set_permissions(renamed[0].join("user"), fs::Permissions::from_mode(0o755)).unwrap();
    }
}
