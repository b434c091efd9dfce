//! Contest artifact layout on the shared filesystem.
//!
//! ```text
//! <directory>/<game>/champions/<user>/<champion_id>/
//!     champion.tgz                 source uploaded by the contestant
//!     champion-compiled.tgz        written on successful compilation
//!     compilation.log
//!     compilation-workernode-result.json
//! <directory>/<game>/matches/<id / 1000>/<id % 1000>/
//!     server.stdout.log, server.stderr.log
//!     dump.json.gz, replay.gz, server_stats.yaml.gz
//!     log-champ-<player_id>-<champion_id>.log
//!     server-workernode-result.json
//! ```
//!
//! Match directories are sharded on the thousands of the id to bound the
//! fan-out of any single directory.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::config::ContestConfig;

pub const CHAMPION_SOURCE: &str = "champion.tgz";
pub const CHAMPION_COMPILED: &str = "champion-compiled.tgz";
pub const COMPILATION_LOG: &str = "compilation.log";
pub const COMPILATION_RESULT: &str = "compilation-workernode-result.json";
pub const SERVER_STDOUT: &str = "server.stdout.log";
pub const SERVER_STDERR: &str = "server.stderr.log";
pub const MATCH_DUMP: &str = "dump.json.gz";
pub const MATCH_REPLAY: &str = "replay.gz";
pub const MATCH_STATS: &str = "server_stats.yaml.gz";
pub const MATCH_RESULT: &str = "server-workernode-result.json";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid base64 payload for {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("cannot serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_b64(what: &str, data: &str) -> Result<Vec<u8>, StorageError> {
    STANDARD.decode(data).map_err(|source| StorageError::Decode {
        what: what.to_string(),
        source,
    })
}

/// Log file name of one match participant.
pub fn player_log_name(player_id: i64, champion_id: i64) -> String {
    format!("log-champ-{}-{}.log", player_id, champion_id)
}

#[derive(Debug, Clone)]
pub struct Storage {
    contest: ContestConfig,
}

impl Storage {
    pub fn new(contest: ContestConfig) -> Self {
        Self { contest }
    }

    fn game_dir(&self) -> PathBuf {
        self.contest.directory.join(&self.contest.game)
    }

    pub fn champion_dir(&self, user: &str, champion_id: i64) -> PathBuf {
        self.game_dir()
            .join("champions")
            .join(user)
            .join(champion_id.to_string())
    }

    pub fn match_dir(&self, match_id: i64) -> PathBuf {
        self.game_dir()
            .join("matches")
            .join(format!("{:03}", match_id / 1000))
            .join(format!("{:03}", match_id % 1000))
    }

    pub async fn read_champion_source(
        &self,
        user: &str,
        champion_id: i64,
    ) -> Result<Vec<u8>, StorageError> {
        read(&self.champion_dir(user, champion_id).join(CHAMPION_SOURCE)).await
    }

    pub async fn read_compiled_champion(
        &self,
        user: &str,
        champion_id: i64,
    ) -> Result<Vec<u8>, StorageError> {
        read(&self.champion_dir(user, champion_id).join(CHAMPION_COMPILED)).await
    }

    pub async fn create_dir(&self, dir: &Path) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| StorageError::Io {
                path: dir.to_path_buf(),
                source,
            })
    }

    pub async fn write(&self, path: &Path, contents: impl AsRef<[u8]>) -> Result<(), StorageError> {
        tokio::fs::write(path, contents)
            .await
            .map_err(|source| StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Decode a base64 artifact and write it to `path`.
    pub async fn write_b64(&self, path: &Path, data: &str) -> Result<(), StorageError> {
        let what = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = decode_b64(&what, data)?;
        self.write(path, bytes).await
    }

    pub async fn write_json<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Serialize {
            what: path.display().to_string(),
            source,
        })?;
        self.write(path, json).await
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, StorageError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })
}
