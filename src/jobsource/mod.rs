//! Access to the contest job queue.
//!
//! Champions waiting for compilation and matches waiting to be played are
//! rows in the contest database. The scheduler only ever sees them through
//! the [`JobSource`] trait:
//!
//! - [`PgJobSource`]: the production implementation over PostgreSQL
//! - [`MemoryJobSource`]: an in-process store with the same semantics
//!
//! The job source is the authority for job status. In-memory scheduler state
//! is rebuilt from it (and from worker heartbeats) after a restart.

pub mod memory;
pub mod postgres;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryJobSource;
pub use postgres::PgJobSource;

#[derive(Error, Debug)]
pub enum JobSourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown status: {0}")]
    UnknownStatus(String),

    #[error("score {score} of player {player_id} does not fit the score column")]
    ScoreOutOfRange { player_id: i64, score: i64 },
}

/// Convert a score to the 32-bit integer the contest database stores.
pub fn score_column(player_id: i64, score: i64) -> Result<i32, JobSourceError> {
    i32::try_from(score).map_err(|_| JobSourceError::ScoreOutOfRange { player_id, score })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChampionStatus {
    New,
    Pending,
    Ready,
    Error,
    Failed,
}

impl ChampionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChampionStatus::New => "new",
            ChampionStatus::Pending => "pending",
            ChampionStatus::Ready => "ready",
            ChampionStatus::Error => "error",
            ChampionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ChampionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChampionStatus {
    type Err = JobSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ChampionStatus::New),
            "pending" => Ok(ChampionStatus::Pending),
            "ready" => Ok(ChampionStatus::Ready),
            "error" => Ok(ChampionStatus::Error),
            "failed" => Ok(ChampionStatus::Failed),
            other => Err(JobSourceError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStatus {
    Creating,
    New,
    Pending,
    Done,
    Failed,
    Cancelled,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Creating => "creating",
            MatchStatus::New => "new",
            MatchStatus::Pending => "pending",
            MatchStatus::Done => "done",
            MatchStatus::Failed => "failed",
            MatchStatus::Cancelled => "cancelled",
        }
    }

    /// A finished match is never overwritten by a late status write.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Done)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = JobSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(MatchStatus::Creating),
            "new" => Ok(MatchStatus::New),
            "pending" => Ok(MatchStatus::Pending),
            "done" => Ok(MatchStatus::Done),
            "failed" => Ok(MatchStatus::Failed),
            "cancelled" => Ok(MatchStatus::Cancelled),
            other => Err(JobSourceError::UnknownStatus(other.to_string())),
        }
    }
}

/// A champion row as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChampionRow {
    pub champion_id: i64,
    pub username: String,
}

/// One participant of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPlayerRow {
    pub champion_id: i64,
    /// Match player id, the key scores are written against
    pub player_id: i64,
    pub username: String,
}

/// A match row with its participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRow {
    pub match_id: i64,
    pub map_contents: Option<String>,
    pub players: Vec<MatchPlayerRow>,
}

/// Query and update surface of the contest database.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn get_champions(&self, status: ChampionStatus)
        -> Result<Vec<ChampionRow>, JobSourceError>;

    async fn set_champion_status(
        &self,
        champion_id: i64,
        status: ChampionStatus,
    ) -> Result<(), JobSourceError>;

    /// Matches in `status`, tournament matches first.
    async fn get_matches(&self, status: MatchStatus) -> Result<Vec<MatchRow>, JobSourceError>;

    /// No-op when the match is already `done`.
    async fn set_match_status(
        &self,
        match_id: i64,
        status: MatchStatus,
    ) -> Result<(), JobSourceError>;

    async fn set_player_score(
        &self,
        player_id: i64,
        score: i64,
        had_timeout: bool,
    ) -> Result<(), JobSourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn champion_status_string_forms() {
        for status in [
            ChampionStatus::New,
            ChampionStatus::Pending,
            ChampionStatus::Ready,
            ChampionStatus::Error,
            ChampionStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ChampionStatus>().unwrap(), status);
        }
        assert!("compiling".parse::<ChampionStatus>().is_err());
    }

    #[test]
    fn match_status_string_forms() {
        assert_eq!(MatchStatus::Cancelled.to_string(), "cancelled");
        assert_eq!("creating".parse::<MatchStatus>().unwrap(), MatchStatus::Creating);
        assert!(matches!(
            "running".parse::<MatchStatus>(),
            Err(JobSourceError::UnknownStatus(s)) if s == "running"
        ));
    }

    #[test]
    fn only_done_is_terminal() {
        assert!(MatchStatus::Done.is_terminal());
        assert!(!MatchStatus::Failed.is_terminal());
        assert!(!MatchStatus::Pending.is_terminal());
    }
}
