use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::jobsource::{
    score_column, ChampionRow, ChampionStatus, JobSource, JobSourceError, MatchPlayerRow,
    MatchRow, MatchStatus,
};

const GET_CHAMPIONS: &str = r#"
    SELECT
        stechec_champion.id::bigint AS id,
        auth_user.username AS username
    FROM stechec_champion
    LEFT JOIN auth_user ON auth_user.id = stechec_champion.author_id
    WHERE stechec_champion.status = $1
    ORDER BY stechec_champion.id
"#;

const SET_CHAMPION_STATUS: &str = r#"
    UPDATE stechec_champion
    SET status = $1
    WHERE stechec_champion.id = $2
"#;

// Tournament matches first, then free-play, oldest first within each group.
const GET_MATCHES: &str = r#"
    SELECT
        stechec_match.id::bigint AS match_id,
        stechec_map.contents AS map_contents,
        array_agg(stechec_champion.id::bigint ORDER BY stechec_matchplayer.id) AS champion_ids,
        array_agg(stechec_matchplayer.id::bigint ORDER BY stechec_matchplayer.id) AS player_ids,
        array_agg(auth_user.username ORDER BY stechec_matchplayer.id) AS usernames
    FROM stechec_match
    LEFT JOIN stechec_map ON stechec_map.id = stechec_match.map_id
    JOIN stechec_matchplayer ON stechec_matchplayer.match_id = stechec_match.id
    JOIN stechec_champion ON stechec_champion.id = stechec_matchplayer.champion_id
    JOIN auth_user ON auth_user.id = stechec_champion.author_id
    WHERE stechec_match.status = $1
    GROUP BY stechec_match.id, stechec_map.contents
    ORDER BY (stechec_match.tournament_id IS NULL), stechec_match.id
"#;

const SET_MATCH_STATUS: &str = r#"
    UPDATE stechec_match
    SET status = $1
    WHERE stechec_match.id = $2
      AND stechec_match.status <> 'done'
"#;

const SET_PLAYER_SCORE: &str = r#"
    UPDATE stechec_matchplayer
    SET score = $1, has_timeout = $2
    WHERE stechec_matchplayer.id = $3
"#;

type MatchRecord = (i64, Option<String>, Vec<i64>, Vec<i64>, Vec<String>);

/// Job source backed by the contest PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PgJobSource {
    pool: PgPool,
}

impl PgJobSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect lazily; the first query opens the connection, so a database
    /// that is down at startup only fails the dbwatcher iterations.
    pub fn connect_lazy(database_url: &str) -> Result<Self, JobSourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }
}

fn match_row(record: MatchRecord) -> MatchRow {
    let (match_id, map_contents, champion_ids, player_ids, usernames) = record;
    let players = champion_ids
        .into_iter()
        .zip(player_ids)
        .zip(usernames)
        .map(|((champion_id, player_id), username)| MatchPlayerRow {
            champion_id,
            player_id,
            username,
        })
        .collect();
    MatchRow {
        match_id,
        map_contents,
        players,
    }
}

#[async_trait]
impl JobSource for PgJobSource {
    async fn get_champions(
        &self,
        status: ChampionStatus,
    ) -> Result<Vec<ChampionRow>, JobSourceError> {
        let rows = sqlx::query_as::<_, (i64, Option<String>)>(GET_CHAMPIONS)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(champion_id, username)| ChampionRow {
                champion_id,
                username: username.unwrap_or_default(),
            })
            .collect())
    }

    async fn set_champion_status(
        &self,
        champion_id: i64,
        status: ChampionStatus,
    ) -> Result<(), JobSourceError> {
        sqlx::query(SET_CHAMPION_STATUS)
            .bind(status.as_str())
            .bind(champion_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_matches(&self, status: MatchStatus) -> Result<Vec<MatchRow>, JobSourceError> {
        let rows = sqlx::query_as::<_, MatchRecord>(GET_MATCHES)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(match_row).collect())
    }

    async fn set_match_status(
        &self,
        match_id: i64,
        status: MatchStatus,
    ) -> Result<(), JobSourceError> {
        sqlx::query(SET_MATCH_STATUS)
            .bind(status.as_str())
            .bind(match_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_player_score(
        &self,
        player_id: i64,
        score: i64,
        had_timeout: bool,
    ) -> Result<(), JobSourceError> {
        let score = score_column(player_id, score)?;
        sqlx::query(SET_PLAYER_SCORE)
            .bind(score)
            .bind(had_timeout)
            .bind(player_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
