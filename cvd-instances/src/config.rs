//! Well-known paths under the per-user runtime directory.

use std::path::{Path, PathBuf};

/// Overrides the runtime directory outright.
pub const RUNTIME_DIR_ENV: &str = "CVD_RUNTIME_DIR";

const DATABASE_FILE_NAME: &str = "instance_database.json";
const LOCKS_DIR_NAME: &str = "locks";
const GROUPS_DIR_NAME: &str = "groups";

/// Every path `cvd` keeps state under, derived from one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    /// Use `root` as the runtime directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the runtime directory from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve the runtime directory through `lookup`.
    ///
    /// Order: `CVD_RUNTIME_DIR`, `$XDG_RUNTIME_DIR/cvd`, `/tmp/cvd-$USER`,
    /// `/tmp/cvd`. Empty values are ignored.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let root = if let Some(dir) = get(RUNTIME_DIR_ENV) {
            PathBuf::from(dir)
        } else if let Some(xdg) = get("XDG_RUNTIME_DIR") {
            Path::new(&xdg).join("cvd")
        } else if let Some(user) = get("USER") {
            PathBuf::from(format!("/tmp/cvd-{user}"))
        } else {
            PathBuf::from("/tmp/cvd")
        };
        Self { root }
    }

    /// The runtime directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// JSON file holding every group.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE_NAME)
    }

    /// Directory of the per-instance lock files.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR_NAME)
    }

    /// Home directory given to a new group when the user names none.
    #[must_use]
    pub fn default_group_home(&self, group: &str) -> PathBuf {
        self.root.join(GROUPS_DIR_NAME).join(group).join("home")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn resolve(vars: &[(&str, &str)]) -> RuntimeLayout {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        RuntimeLayout::resolve(|key| vars.get(key).cloned())
    }

    #[test]
    fn explicit_runtime_dir_wins() {
        let layout = resolve(&[
            ("CVD_RUNTIME_DIR", "/srv/cvd"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
            ("USER", "alice"),
        ]);
        assert_eq!(layout.root(), Path::new("/srv/cvd"));
        assert_eq!(layout.database_path(), PathBuf::from("/srv/cvd/instance_database.json"));
        assert_eq!(layout.lock_dir(), PathBuf::from("/srv/cvd/locks"));
    }

    #[test]
    fn falls_back_through_xdg_user_and_tmp() {
        assert_eq!(
            resolve(&[("XDG_RUNTIME_DIR", "/run/user/1000"), ("USER", "alice")]).root(),
            Path::new("/run/user/1000/cvd")
        );
        assert_eq!(resolve(&[("XDG_RUNTIME_DIR", ""), ("USER", "alice")]).root(), Path::new("/tmp/cvd-alice"));
        assert_eq!(resolve(&[]).root(), Path::new("/tmp/cvd"));
    }

    #[test]
    fn default_group_home_is_per_group() {
        let layout = RuntimeLayout::new("/r");
        assert_eq!(layout.default_group_home("meow"), PathBuf::from("/r/groups/meow/home"));
    }
}
