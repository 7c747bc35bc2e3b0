pub mod client;
pub mod protocol;
pub mod server;
mod wire;

pub use client::IpcClient;
pub use protocol::{ClientMessage, PROTOCOL_VERSION, ServerMessage, TurnOutput};
pub use server::{IpcConnection, IpcServer};

use std::path::PathBuf;

pub fn socket_path(daemon_id: &str) -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").ok();
    socket_path_with_runtime_dir(daemon_id, runtime_dir.as_deref())
}

fn socket_path_with_runtime_dir(daemon_id: &str, runtime_dir: Option<&str>) -> PathBuf {
    let safe_id: String = daemon_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();

    if let Some(runtime_dir) = runtime_dir
        && !runtime_dir.is_empty()
    {
        return PathBuf::from(runtime_dir)
            .join("parked")
            .join(format!("{safe_id}.sock"));
    }

    PathBuf::from(format!("/tmp/parked-{safe_id}.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_tmp_without_runtime_dir() {
        let path = socket_path_with_runtime_dir("main", None);
        assert_eq!(path, PathBuf::from("/tmp/parked-main.sock"));
    }

    #[test]
    fn empty_runtime_dir_is_ignored() {
        let path = socket_path_with_runtime_dir("main", Some(""));
        assert_eq!(path, PathBuf::from("/tmp/parked-main.sock"));
    }

    #[test]
    fn uses_runtime_dir_when_set() {
        let path = socket_path_with_runtime_dir("main", Some("/run/user/1000"));
        assert_eq!(path, PathBuf::from("/run/user/1000/parked/main.sock"));
    }

    #[test]
    fn daemon_id_is_sanitized() {
        let path = socket_path_with_runtime_dir("ops/mail bot", None);
        assert_eq!(path, PathBuf::from("/tmp/parked-ops-mail-bot.sock"));
    }
}
