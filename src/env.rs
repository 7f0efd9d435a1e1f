use std::env;
use std::path::PathBuf;

/// Returns the root directory used for mirrored data when the job config
/// does not name one.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                env::var_os("HOME")
                    .map(PathBuf::from)
                    .map(|home| home.join(".local").join("share"))
            }),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("molmirror")
}

pub fn cache_dir() -> PathBuf {
    default_app_dir().join("cache")
}

pub fn checkpoint_dir() -> PathBuf {
    default_app_dir().join("checkpoints")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_under_app_dir() {
        let root = default_app_dir();
        assert!(root.ends_with("molmirror"));
        assert_eq!(cache_dir(), root.join("cache"));
        assert_eq!(checkpoint_dir(), root.join("checkpoints"));
    }
}
