//! Environment-first configuration; CLI flags override.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite file holding the world.
    pub db_path: PathBuf,
    /// UNIX socket clients connect to.
    pub socket_path: PathBuf,
}

impl ServerConfig {
    pub fn load() -> ServerConfig {
        let db_path = env::var("HERMETICUM_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("hermeticum.db"));
        let socket_path = env::var("HERMETICUM_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp/hermeticum.sock"));
        ServerConfig {
            db_path,
            socket_path,
        }
    }
}
