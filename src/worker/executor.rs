use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::ExecutorConfig;

/// Compiled champion taking part in a match.
#[derive(Debug, Clone)]
pub struct MatchParticipant {
    pub player_id: i64,
    pub champion_id: i64,
    pub compiled: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationOutput {
    pub success: bool,
    /// Internal error of the worker; a champion that fails to build is a
    /// plain `success == false`
    pub error: Option<String>,
    pub log: String,
    pub compiled: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutput {
    pub success: bool,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub dump: Option<Vec<u8>>,
    pub replay: Option<Vec<u8>>,
    pub stats: Option<Vec<u8>>,
    /// Per player log, keyed by match player id
    pub player_logs: BTreeMap<i64, String>,
    /// Score list as produced by the match command, `[]` if none
    pub match_result: String,
}

/// Outcome of one shell command.
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Runs compilations and matches through the configured shell commands.
///
/// Every job gets its own scratch directory which is removed afterwards.
/// Inputs are exposed through environment variables:
///
/// - compilation: `CHAMPION_TGZ`, `COMPILED_TGZ`
/// - match: `MATCH_ID`, `MAP_FILE` (when a map is given), `PLAYERS`
///   (`player_id:champion_id:path` entries separated by spaces) and
///   `OUTPUT_DIR`, where the command leaves `dump.json.gz`, `replay.gz`,
///   `stats.yaml.gz`, `result.json` and `player-<id>.log`
#[derive(Debug, Clone)]
pub struct JobExecutor {
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub async fn compile(&self, champion_id: i64, champion_tgz: &[u8]) -> CompilationOutput {
        tracing::info!(champion_id, "Compiling champion");

        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return compilation_error(format!("cannot create work directory: {}", e)),
        };
        let source = dir.path().join("champion.tgz");
        let compiled = dir.path().join("champion-compiled.tgz");
        if let Err(e) = tokio::fs::write(&source, champion_tgz).await {
            return compilation_error(format!("cannot write champion source: {}", e));
        }

        let mut cmd = self.command(&self.config.compile_command, dir.path());
        cmd.env("CHAMPION_TGZ", &source).env("COMPILED_TGZ", &compiled);

        let output = match self.run(cmd, self.config.compilation_timeout).await {
            Ok(output) => output,
            Err(RunError::Timeout) => {
                tracing::warn!(champion_id, "Compilation timed out");
                return CompilationOutput {
                    success: false,
                    error: None,
                    log: format!(
                        "Compilation timed out after {}s\n",
                        self.config.compilation_timeout.as_secs()
                    ),
                    compiled: None,
                };
            }
            Err(RunError::Spawn(e)) => {
                return compilation_error(format!("cannot run compiler: {}", e));
            }
        };

        let log = format!("{}{}", output.stdout, output.stderr);
        let artifact = if output.success {
            tokio::fs::read(&compiled).await.ok()
        } else {
            None
        };

        tracing::info!(
            champion_id,
            exit_code = ?output.exit_code,
            compiled = artifact.is_some(),
            "Compilation finished"
        );

        CompilationOutput {
            success: artifact.is_some(),
            error: None,
            log,
            compiled: artifact,
        }
    }

    pub async fn run_match(
        &self,
        match_id: i64,
        participants: &[MatchParticipant],
        map: Option<&[u8]>,
    ) -> MatchOutput {
        tracing::info!(match_id, players = participants.len(), "Running match");

        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return match_error(format!("cannot create work directory: {}", e)),
        };
        let output_dir = dir.path().join("output");
        if let Err(e) = tokio::fs::create_dir(&output_dir).await {
            return match_error(format!("cannot create output directory: {}", e));
        }

        let mut players = Vec::with_capacity(participants.len());
        for p in participants {
            let path = dir.path().join(format!("player-{}.tgz", p.player_id));
            if let Err(e) = tokio::fs::write(&path, &p.compiled).await {
                return match_error(format!("cannot write champion {}: {}", p.champion_id, e));
            }
            players.push(format!("{}:{}:{}", p.player_id, p.champion_id, path.display()));
        }

        let mut cmd = self.command(&self.config.match_command, dir.path());
        cmd.env("MATCH_ID", match_id.to_string())
            .env("PLAYERS", players.join(" "))
            .env("OUTPUT_DIR", &output_dir);
        if let Some(map) = map {
            let map_file = dir.path().join("map.txt");
            if let Err(e) = tokio::fs::write(&map_file, map).await {
                return match_error(format!("cannot write map: {}", e));
            }
            cmd.env("MAP_FILE", &map_file);
        }

        let output = match self.run(cmd, self.config.match_timeout).await {
            Ok(output) => output,
            Err(RunError::Timeout) => {
                tracing::warn!(match_id, "Match timed out");
                return MatchOutput {
                    stderr: format!(
                        "Match timed out after {}s\n",
                        self.config.match_timeout.as_secs()
                    ),
                    match_result: "[]".to_string(),
                    ..Default::default()
                };
            }
            Err(RunError::Spawn(e)) => return match_error(format!("cannot run match: {}", e)),
        };

        let mut player_logs = BTreeMap::new();
        for p in participants {
            let log = output_dir.join(format!("player-{}.log", p.player_id));
            if let Ok(contents) = tokio::fs::read(&log).await {
                player_logs.insert(p.player_id, String::from_utf8_lossy(&contents).into_owned());
            }
        }
        let match_result = tokio::fs::read_to_string(output_dir.join("result.json"))
            .await
            .unwrap_or_else(|_| "[]".to_string());

        tracing::info!(match_id, exit_code = ?output.exit_code, "Match finished");

        MatchOutput {
            success: output.success,
            error: None,
            stdout: output.stdout,
            stderr: output.stderr,
            dump: tokio::fs::read(output_dir.join("dump.json.gz")).await.ok(),
            replay: tokio::fs::read(output_dir.join("replay.gz")).await.ok(),
            stats: tokio::fs::read(output_dir.join("stats.yaml.gz")).await.ok(),
            player_logs,
            match_result,
        }
    }

    fn command(&self, script: &str, workdir: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command, timeout: Duration) -> Result<CommandOutput, RunError> {
        let child = cmd.spawn().map_err(RunError::Spawn)?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => Err(RunError::Timeout),
            Ok(Err(e)) => Err(RunError::Spawn(e)),
            Ok(Ok(output)) => Ok(CommandOutput {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }
}

#[derive(Debug)]
enum RunError {
    Timeout,
    Spawn(std::io::Error),
}

fn compilation_error(error: String) -> CompilationOutput {
    tracing::error!(error = %error, "Compilation could not run");
    CompilationOutput {
        success: false,
        error: Some(error),
        ..Default::default()
    }
}

fn match_error(error: String) -> MatchOutput {
    tracing::error!(error = %error, "Match could not run");
    MatchOutput {
        success: false,
        error: Some(error),
        match_result: "[]".to_string(),
        ..Default::default()
    }
}
