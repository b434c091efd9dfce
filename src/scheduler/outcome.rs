//! Recording of results reported by workers.
//!
//! Artifacts are written best-effort: a failed write is logged and counted
//! but never keeps the job out of a final status, except for the compiled
//! champion whose absence would make a `ready` status a lie.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{MasterError, Result};
use crate::jobsource::{ChampionStatus, MatchStatus};
use crate::metrics::MasterMetrics;
use crate::scheduler::task::TaskContext;
use crate::storage::{self, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompilationOutcome {
    pub success: bool,
    /// Internal worker error, as opposed to the champion failing to build
    pub error: Option<String>,
    pub stdout: Option<String>,
    /// Base64 encoded compiled tarball
    #[serde(skip)]
    pub champion_compiled: Option<String>,
}

impl CompilationOutcome {
    pub fn status(&self) -> ChampionStatus {
        if self.success {
            ChampionStatus::Ready
        } else if self.error.is_some() {
            ChampionStatus::Failed
        } else {
            ChampionStatus::Error
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlayerOutcome {
    pub champion_id: i64,
    pub stdout: Option<String>,
}

/// Base64 fields are kept out of the JSON summary written next to the
/// decoded artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    #[serde(skip)]
    pub dump: Option<String>,
    #[serde(skip)]
    pub replay: Option<String>,
    #[serde(skip)]
    pub stats: Option<String>,
    /// Keyed by match player id
    pub players: BTreeMap<i64, PlayerOutcome>,
    /// JSON list of `{"player", "score", "nb_timeout"}`
    pub match_result: String,
}

/// One entry of a match score list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScoreEntry {
    pub player: i64,
    pub score: i64,
    pub nb_timeout: i64,
}

/// Parse a score list. Scores are stored as 32-bit integers, so a score
/// outside that range makes the whole list malformed.
pub fn parse_scores(match_result: &str) -> Result<Vec<ScoreEntry>> {
    let scores: Vec<ScoreEntry> = serde_json::from_str(match_result)
        .map_err(|e| MasterError::MalformedResult(e.to_string()))?;
    if let Some(entry) = scores.iter().find(|e| i32::try_from(e.score).is_err()) {
        return Err(MasterError::MalformedResult(format!(
            "score {} of player {} out of range",
            entry.score, entry.player
        )));
    }
    Ok(scores)
}

fn log_artifact_error(metrics: &MasterMetrics, what: &str, err: &StorageError) {
    metrics.exceptions.inc();
    tracing::warn!(artifact = what, error = %err, "Failed to store artifact");
}

/// Store compilation artifacts and move the champion to its final status.
pub async fn record_compilation(
    ctx: &TaskContext,
    metrics: &MasterMetrics,
    user: &str,
    champion_id: i64,
    outcome: &CompilationOutcome,
) -> Result<ChampionStatus> {
    let mut status = outcome.status();
    let started = Instant::now();
    let dir = ctx.storage.champion_dir(user, champion_id);
    if let Err(e) = ctx.storage.create_dir(&dir).await {
        log_artifact_error(metrics, "champion directory", &e);
    }

    if status == ChampionStatus::Ready {
        let stored = match &outcome.champion_compiled {
            Some(data) => match ctx
                .storage
                .write_b64(&dir.join(storage::CHAMPION_COMPILED), data)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    log_artifact_error(metrics, storage::CHAMPION_COMPILED, &e);
                    false
                }
            },
            None => {
                tracing::warn!(user, champion_id, "Successful compilation without compiled champion");
                false
            }
        };
        if !stored {
            status = ChampionStatus::Failed;
        }
    }

    if let Some(stdout) = &outcome.stdout {
        if let Err(e) = ctx.storage.write(&dir.join(storage::COMPILATION_LOG), stdout).await {
            log_artifact_error(metrics, storage::COMPILATION_LOG, &e);
        }
    }
    if let Err(e) = ctx
        .storage
        .write_json(&dir.join(storage::COMPILATION_RESULT), outcome)
        .await
    {
        log_artifact_error(metrics, storage::COMPILATION_RESULT, &e);
    }
    metrics.compilation_done_file.observe(started.elapsed());

    ctx.jobs.set_champion_status(champion_id, status).await?;
    tracing::info!(user, champion_id, status = %status, "Compilation done");
    Ok(status)
}

/// Store match artifacts, write scores and move the match to its final
/// status. A malformed score list fails the match.
pub async fn record_match(
    ctx: &TaskContext,
    metrics: &MasterMetrics,
    match_id: i64,
    outcome: &MatchOutcome,
) -> Result<MatchStatus> {
    let started = Instant::now();
    let dir = ctx.storage.match_dir(match_id);
    if let Err(e) = ctx.storage.create_dir(&dir).await {
        log_artifact_error(metrics, "match directory", &e);
    }

    for (player_id, player) in &outcome.players {
        if let Some(stdout) = &player.stdout {
            let name = storage::player_log_name(*player_id, player.champion_id);
            if let Err(e) = ctx.storage.write(&dir.join(&name), stdout).await {
                log_artifact_error(metrics, &name, &e);
            }
        }
    }

    let texts = [
        (storage::SERVER_STDOUT, &outcome.stdout),
        (storage::SERVER_STDERR, &outcome.stderr),
    ];
    for (name, text) in texts {
        if let Some(text) = text {
            if let Err(e) = ctx.storage.write(&dir.join(name), text).await {
                log_artifact_error(metrics, name, &e);
            }
        }
    }

    let blobs = [
        (storage::MATCH_DUMP, &outcome.dump),
        (storage::MATCH_REPLAY, &outcome.replay),
        (storage::MATCH_STATS, &outcome.stats),
    ];
    for (name, blob) in blobs {
        if let Some(data) = blob {
            if let Err(e) = ctx.storage.write_b64(&dir.join(name), data).await {
                log_artifact_error(metrics, name, &e);
            }
        }
    }

    if let Err(e) = ctx
        .storage
        .write_json(&dir.join(storage::MATCH_RESULT), outcome)
        .await
    {
        log_artifact_error(metrics, storage::MATCH_RESULT, &e);
    }
    metrics.match_done_file.observe(started.elapsed());

    let started = Instant::now();
    let mut status = if outcome.success {
        MatchStatus::Done
    } else {
        MatchStatus::Failed
    };

    if status == MatchStatus::Done {
        match parse_scores(&outcome.match_result) {
            Ok(scores) => {
                for entry in scores {
                    ctx.jobs
                        .set_player_score(entry.player, entry.score, entry.nb_timeout != 0)
                        .await?;
                }
            }
            Err(e) => {
                metrics.bad_result.inc();
                tracing::warn!(match_id, error = %e, "Malformed match result, failing match");
                status = MatchStatus::Failed;
            }
        }
    }

    ctx.jobs.set_match_status(match_id, status).await?;
    metrics.match_done_db.observe(started.elapsed());
    tracing::info!(match_id, status = %status, "Match done");
    Ok(status)
}
