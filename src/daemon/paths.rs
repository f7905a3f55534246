//! Ambient process state (§9): socket path, log path and this executable's
//! own path, resolved once from environment and OS facilities and passed
//! around as plain values rather than mutable singletons.

use std::path::PathBuf;

pub fn socket_path() -> PathBuf {
    if let Ok(explicit) = std::env::var("BORING_SOCK") {
        return PathBuf::from(explicit);
    }
    std::env::temp_dir().join("boringd.sock")
}

pub fn log_path() -> PathBuf {
    if let Ok(explicit) = std::env::var("BORING_LOG_FILE") {
        return PathBuf::from(explicit);
    }
    std::env::temp_dir().join("boringd.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_honors_env_override() {
        unsafe { std::env::set_var("BORING_SOCK", "/tmp/custom-boring-test.sock") };
        assert_eq!(socket_path(), PathBuf::from("/tmp/custom-boring-test.sock"));
        unsafe { std::env::remove_var("BORING_SOCK") };
    }

    #[test]
    fn socket_path_defaults_under_tmp() {
        unsafe { std::env::remove_var("BORING_SOCK") };
        assert_eq!(socket_path(), std::env::temp_dir().join("boringd.sock"));
    }
}
