use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::jobsource::{
    score_column, ChampionRow, ChampionStatus, JobSource, JobSourceError, MatchPlayerRow,
    MatchRow, MatchStatus,
};

/// Score written for a match player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerScore {
    pub score: i64,
    pub had_timeout: bool,
}

#[derive(Debug)]
struct ChampionEntry {
    username: String,
    status: ChampionStatus,
    history: Vec<ChampionStatus>,
}

#[derive(Debug)]
struct MatchEntry {
    map_contents: Option<String>,
    players: Vec<MatchPlayerRow>,
    tournament: bool,
    status: MatchStatus,
    history: Vec<MatchStatus>,
}

#[derive(Debug, Default)]
struct MemoryState {
    champions: BTreeMap<i64, ChampionEntry>,
    matches: BTreeMap<i64, MatchEntry>,
    scores: HashMap<i64, PlayerScore>,
}

/// In-process job source.
///
/// Updates on unknown ids are silently ignored, like an `UPDATE` matching no
/// row. Every status write is recorded so callers can audit transitions.
#[derive(Debug, Default)]
pub struct MemoryJobSource {
    state: Mutex<MemoryState>,
}

impl MemoryJobSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind, keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_champion(&self, champion_id: i64, username: &str, status: ChampionStatus) {
        self.lock().champions.insert(
            champion_id,
            ChampionEntry {
                username: username.to_string(),
                status,
                history: Vec::new(),
            },
        );
    }

    pub fn add_match(
        &self,
        match_id: i64,
        map_contents: Option<String>,
        players: Vec<MatchPlayerRow>,
        status: MatchStatus,
    ) {
        self.insert_match(match_id, map_contents, players, status, false);
    }

    /// Tournament matches are returned before free-play ones.
    pub fn add_tournament_match(
        &self,
        match_id: i64,
        map_contents: Option<String>,
        players: Vec<MatchPlayerRow>,
        status: MatchStatus,
    ) {
        self.insert_match(match_id, map_contents, players, status, true);
    }

    fn insert_match(
        &self,
        match_id: i64,
        map_contents: Option<String>,
        players: Vec<MatchPlayerRow>,
        status: MatchStatus,
        tournament: bool,
    ) {
        self.lock().matches.insert(
            match_id,
            MatchEntry {
                map_contents,
                players,
                tournament,
                status,
                history: Vec::new(),
            },
        );
    }

    pub fn champion_status(&self, champion_id: i64) -> Option<ChampionStatus> {
        self.lock().champions.get(&champion_id).map(|c| c.status)
    }

    pub fn match_status(&self, match_id: i64) -> Option<MatchStatus> {
        self.lock().matches.get(&match_id).map(|m| m.status)
    }

    /// Every status written for the champion, in order.
    pub fn champion_history(&self, champion_id: i64) -> Vec<ChampionStatus> {
        self.lock()
            .champions
            .get(&champion_id)
            .map(|c| c.history.clone())
            .unwrap_or_default()
    }

    /// Every status applied to the match, in order. Writes ignored because
    /// the match was already done are not recorded.
    pub fn match_history(&self, match_id: i64) -> Vec<MatchStatus> {
        self.lock()
            .matches
            .get(&match_id)
            .map(|m| m.history.clone())
            .unwrap_or_default()
    }

    pub fn player_score(&self, player_id: i64) -> Option<PlayerScore> {
        self.lock().scores.get(&player_id).copied()
    }
}

#[async_trait]
impl JobSource for MemoryJobSource {
    async fn get_champions(
        &self,
        status: ChampionStatus,
    ) -> Result<Vec<ChampionRow>, JobSourceError> {
        Ok(self
            .lock()
            .champions
            .iter()
            .filter(|(_, c)| c.status == status)
            .map(|(id, c)| ChampionRow {
                champion_id: *id,
                username: c.username.clone(),
            })
            .collect())
    }

    async fn set_champion_status(
        &self,
        champion_id: i64,
        status: ChampionStatus,
    ) -> Result<(), JobSourceError> {
        if let Some(champion) = self.lock().champions.get_mut(&champion_id) {
            champion.status = status;
            champion.history.push(status);
        }
        Ok(())
    }

    async fn get_matches(&self, status: MatchStatus) -> Result<Vec<MatchRow>, JobSourceError> {
        let state = self.lock();
        let mut rows: Vec<(bool, MatchRow)> = state
            .matches
            .iter()
            .filter(|(_, m)| m.status == status)
            .map(|(id, m)| {
                (
                    m.tournament,
                    MatchRow {
                        match_id: *id,
                        map_contents: m.map_contents.clone(),
                        players: m.players.clone(),
                    },
                )
            })
            .collect();
        // Stable: ids stay ascending within each group.
        rows.sort_by_key(|(tournament, _)| !*tournament);
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    async fn set_match_status(
        &self,
        match_id: i64,
        status: MatchStatus,
    ) -> Result<(), JobSourceError> {
        if let Some(m) = self.lock().matches.get_mut(&match_id) {
            if !m.status.is_terminal() {
                m.status = status;
                m.history.push(status);
            }
        }
        Ok(())
    }

    async fn set_player_score(
        &self,
        player_id: i64,
        score: i64,
        had_timeout: bool,
    ) -> Result<(), JobSourceError> {
        score_column(player_id, score)?;
        self.lock()
            .scores
            .insert(player_id, PlayerScore { score, had_timeout });
        Ok(())
    }
}
