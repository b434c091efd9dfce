use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where champion sources, compiled champions and match artifacts live.
#[derive(Debug, Clone)]
pub struct ContestConfig {
    /// Root of the shared contest filesystem
    pub directory: PathBuf,
    /// Game name, used as the first path component under `directory`
    pub game: String,
}

impl Default for ContestConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/prologin/concours_shared"),
            game: "prologin".to_string(),
        }
    }
}

/// Retry, timeout and cost settings shared by every task kind.
#[derive(Debug, Clone)]
pub struct TaskLimits {
    /// Attempts allowed per task before it is permanently failed
    pub max_task_tries: u32,
    pub compilation_timeout: Option<Duration>,
    pub match_timeout: Option<Duration>,
    /// Slot cost of a champion compilation
    pub compilation_slots: u32,
    /// Slot cost of a match (server + clients)
    pub match_slots: u32,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            max_task_tries: 3,
            compilation_timeout: Some(Duration::from_secs(400)),
            match_timeout: Some(Duration::from_secs(600)),
            compilation_slots: 1,
            match_slots: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    /// A worker missing heartbeats for this long is declared dead
    pub worker_timeout: Duration,
    pub janitor_interval: Duration,
    pub dbwatcher_interval: Duration,
    /// Pause after a failed dbwatcher iteration
    pub dbwatcher_backoff: Duration,
    pub limits: TaskLimits,
    pub contest: ContestConfig,
    /// Shared secret expected on every RPC, if any
    pub shared_secret: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:8067"
                .parse()
                .expect("default listen address is valid"),
            worker_timeout: Duration::from_secs(10),
            janitor_interval: Duration::from_secs(1),
            dbwatcher_interval: Duration::from_secs(1),
            dbwatcher_backoff: Duration::from_secs(5),
            limits: TaskLimits::default(),
            contest: ContestConfig::default(),
            shared_secret: None,
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_contest(mut self, directory: PathBuf, game: String) -> Self {
        self.contest = ContestConfig { directory, game };
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_shared_secret(mut self, secret: Option<String>) -> Self {
        self.shared_secret = secret;
        self
    }
}

/// Commands a worker node runs for the jobs it accepts.
///
/// Both commands are executed with `sh -c` inside a scratch directory; the
/// sandboxing itself is the command's business.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Reads `$CHAMPION_TGZ`, must produce `$COMPILED_TGZ`
    pub compile_command: String,
    /// Reads `$MATCH_ID`, `$MAP_FILE` and `$PLAYERS`, writes into `$OUTPUT_DIR`
    pub match_command: String,
    pub compilation_timeout: Duration,
    pub match_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            compile_command: "stechec2-compile \"$CHAMPION_TGZ\" \"$COMPILED_TGZ\"".to_string(),
            match_command: "stechec2-run-match".to_string(),
            compilation_timeout: Duration::from_secs(300),
            match_timeout: Duration::from_secs(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    /// Hostname advertised to the masternode
    pub hostname: String,
    pub max_slots: u32,
    /// Masternode address, `host:port`
    pub master_addr: String,
    pub heartbeat_interval: Duration,
    pub shared_secret: Option<String>,
    pub executor: ExecutorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:8068"
                .parse()
                .expect("default listen address is valid"),
            hostname: "localhost".to_string(),
            max_slots: 10,
            master_addr: "127.0.0.1:8067".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            shared_secret: None,
            executor: ExecutorConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Port advertised to the masternode
    pub fn port(&self) -> u16 {
        self.listen_addr.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_limits_default() {
        let limits = TaskLimits::default();
        assert_eq!(limits.max_task_tries, 3);
        assert_eq!(limits.compilation_slots, 1);
        assert_eq!(limits.match_slots, 5);
        assert_eq!(limits.compilation_timeout, Some(Duration::from_secs(400)));
        assert_eq!(limits.match_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn master_config_default() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8067");
        assert_eq!(cfg.worker_timeout, Duration::from_secs(10));
        assert_eq!(cfg.janitor_interval, Duration::from_secs(1));
        assert_eq!(cfg.dbwatcher_backoff, Duration::from_secs(5));
        assert!(cfg.shared_secret.is_none());
    }

    #[test]
    fn master_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = MasterConfig::new(addr)
            .with_contest(PathBuf::from("/srv/contest"), "tron".to_string())
            .with_worker_timeout(Duration::from_secs(3))
            .with_shared_secret(Some("hunter2".to_string()));
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.contest.directory, PathBuf::from("/srv/contest"));
        assert_eq!(cfg.contest.game, "tron");
        assert_eq!(cfg.worker_timeout, Duration::from_secs(3));
        assert_eq!(cfg.shared_secret.as_deref(), Some("hunter2"));
    }

    #[test]
    fn worker_config_port_follows_listen_addr() {
        let cfg = WorkerConfig {
            listen_addr: "0.0.0.0:9999".parse().unwrap(),
            ..WorkerConfig::default()
        };
        assert_eq!(cfg.port(), 9999);
        assert_eq!(cfg.max_slots, 10);
    }
}
