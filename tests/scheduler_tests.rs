mod test_harness;

use std::time::Duration;

use masternode::error::RpcError;
use masternode::jobsource::{ChampionStatus, JobSource, MatchStatus};
use masternode::scheduler::task::CompilationJob;
use masternode::scheduler::{
    CompilationOutcome, JobKind, MatchOutcome, PlayerOutcome, Task, TaskKey, WorkerKey,
};
use masternode::storage::{self, encode_b64};
use test_harness::{
    assert_eventually, compiled_of, player, source_of, wait_for, worker_info, TestMaster,
    WORKER_PORT,
};
use tokio_util::sync::CancellationToken;

fn compiled_ok(champion_id: i64) -> CompilationOutcome {
    CompilationOutcome {
        success: true,
        error: None,
        stdout: Some("build ok\n".to_string()),
        champion_compiled: Some(encode_b64(&compiled_of(champion_id))),
    }
}

#[tokio::test]
async fn test_dispatch_compilation_marks_pending() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    let worker = t.add_worker("w1", 10).await;

    let dispatched = t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    assert_eq!(dispatched, 1);
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::Pending));
    assert_eq!(t.slots_of("w1").await, Some(9));

    let calls = worker.compilation_payloads();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "alice");
    assert_eq!(calls[0].1, 1);
    assert_eq!(calls[0].2, encode_b64(&source_of(1)));
}

#[tokio::test]
async fn test_no_worker_leaves_jobs_new() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;

    let dispatched = t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    assert_eq!(dispatched, 0);
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::New));
    assert!(t.jobs.champion_history(1).is_empty());
}

fn compilation_tasks(t: &TestMaster, ids: &[i64]) -> Vec<Task> {
    let limits = &t.master.config().limits;
    ids.iter()
        .map(|id| {
            Task::compilation(
                CompilationJob {
                    champion_id: *id,
                    username: "alice".to_string(),
                },
                limits,
            )
        })
        .collect()
}

#[tokio::test]
async fn test_least_loaded_worker_gets_the_task() {
    let t = TestMaster::new();
    for id in 1..=11 {
        t.add_champion(id, "alice").await;
    }

    // b alone takes eight compilations, usage 0.8.
    let b = t.add_worker("b", 10).await;
    let to_b: Vec<i64> = (1..=8).collect();
    assert_eq!(
        t.master
            .dispatch_tasks(JobKind::Compilation, compilation_tasks(&t, &to_b))
            .await,
        8
    );
    assert_eq!(t.slots_of("b").await, Some(2));

    // a joins and, being idle, takes the next two, usage 0.2.
    let a = t.add_worker("a", 10).await;
    t.master
        .dispatch_tasks(JobKind::Compilation, compilation_tasks(&t, &[9, 10]))
        .await;
    assert_eq!(a.compilations(), vec![9, 10]);
    assert_eq!(t.slots_of("a").await, Some(8));

    t.master
        .dispatch_tasks(JobKind::Compilation, compilation_tasks(&t, &[11]))
        .await;
    assert_eq!(a.compilations(), vec![9, 10, 11]);
    assert_eq!(b.compilations().len(), 8);
}

#[tokio::test]
async fn test_dispatch_stops_at_first_task_that_does_not_fit() {
    let t = TestMaster::new();
    t.add_compiled_champion(1, "alice").await;
    t.add_compiled_champion(2, "bob").await;
    let players = vec![player(1, 10, "alice"), player(2, 11, "bob")];
    t.jobs
        .add_match(1, None, players.clone(), MatchStatus::New);
    t.jobs.add_match(2, None, players, MatchStatus::New);
    let worker = t.add_worker("w1", 6).await;

    let dispatched = t.master.poll_jobs(JobKind::Match).await.unwrap();

    assert_eq!(dispatched, 1);
    assert_eq!(t.jobs.match_status(1), Some(MatchStatus::Pending));
    assert_eq!(t.jobs.match_status(2), Some(MatchStatus::New));
    assert_eq!(t.slots_of("w1").await, Some(1));
    assert_eq!(worker.matches().len(), 1);
}

#[tokio::test]
async fn test_match_payload_carries_compiled_champions_and_map() {
    let t = TestMaster::new();
    t.add_compiled_champion(1, "alice").await;
    t.add_compiled_champion(2, "bob").await;
    t.jobs.add_match(
        7,
        Some("map contents".to_string()),
        vec![player(1, 10, "alice"), player(2, 11, "bob")],
        MatchStatus::New,
    );
    let worker = t.add_worker("w1", 10).await;

    t.master.poll_jobs(JobKind::Match).await.unwrap();

    let calls = worker.matches();
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    assert_eq!(call.match_id, 7);
    assert_eq!(call.players[&10].champion_id, 1);
    assert_eq!(call.players[&10].champion_compiled, encode_b64(&compiled_of(1)));
    assert_eq!(call.players[&11].champion_compiled, encode_b64(&compiled_of(2)));
    assert_eq!(call.map_contents, Some(encode_b64(b"map contents")));
    assert!(t.storage.match_dir(7).is_dir(), "match directory created");
}

#[tokio::test]
async fn test_tournament_matches_dispatched_first() {
    let t = TestMaster::new();
    t.add_compiled_champion(1, "alice").await;
    let players = vec![player(1, 10, "alice")];
    t.jobs.add_match(1, None, players.clone(), MatchStatus::New);
    t.jobs
        .add_tournament_match(2, None, players, MatchStatus::New);
    let worker = t.add_worker("w1", 5).await;

    assert_eq!(t.master.poll_jobs(JobKind::Match).await.unwrap(), 1);

    assert_eq!(worker.matches()[0].match_id, 2);
    assert_eq!(t.jobs.match_status(1), Some(MatchStatus::New));
}

#[tokio::test]
async fn test_compilation_done_stores_artifacts() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    let accepted = t
        .master
        .compilation_done(worker_info("w1", 10, 10), "alice", 1, compiled_ok(1))
        .await;

    assert!(accepted);
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::Ready));
    assert_eq!(t.slots_of("w1").await, Some(10));

    let dir = t.storage.champion_dir("alice", 1);
    assert_eq!(
        std::fs::read(dir.join(storage::CHAMPION_COMPILED)).unwrap(),
        compiled_of(1)
    );
    assert_eq!(
        std::fs::read_to_string(dir.join(storage::COMPILATION_LOG)).unwrap(),
        "build ok\n"
    );
    assert!(dir.join(storage::COMPILATION_RESULT).exists());
}

#[tokio::test]
async fn test_duplicate_completion_is_ignored() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    assert!(
        t.master
            .compilation_done(worker_info("w1", 10, 10), "alice", 1, compiled_ok(1))
            .await
    );
    assert!(
        !t.master
            .compilation_done(worker_info("w1", 10, 10), "alice", 1, compiled_ok(1))
            .await
    );

    assert_eq!(t.slots_of("w1").await, Some(10));
    assert_eq!(
        t.jobs.champion_history(1),
        vec![ChampionStatus::Pending, ChampionStatus::Ready]
    );
}

#[tokio::test]
async fn test_compilation_failure_statuses() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    t.add_champion(2, "bob").await;
    t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    let champion_broken = CompilationOutcome {
        success: false,
        error: None,
        stdout: Some("syntax error\n".to_string()),
        champion_compiled: None,
    };
    let worker_broken = CompilationOutcome {
        success: false,
        error: Some("disk full".to_string()),
        stdout: None,
        champion_compiled: None,
    };
    t.master
        .compilation_done(worker_info("w1", 10, 10), "alice", 1, champion_broken)
        .await;
    t.master
        .compilation_done(worker_info("w1", 10, 10), "bob", 2, worker_broken)
        .await;

    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::Error));
    assert_eq!(t.jobs.champion_status(2), Some(ChampionStatus::Failed));
}

#[tokio::test]
async fn test_result_from_unknown_worker_is_discarded() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    let accepted = t
        .master
        .compilation_done(worker_info("ghost", 10, 10), "alice", 1, compiled_ok(1))
        .await;

    assert!(!accepted);
    assert_eq!(t.master.metrics().snapshot().zombie_worker, 1);
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::Pending));
    assert_eq!(t.slots_of("w1").await, Some(9));
}

async fn setup_played_match(t: &TestMaster) {
    t.add_compiled_champion(1, "alice").await;
    t.add_compiled_champion(2, "bob").await;
    t.jobs.add_match(
        1234,
        None,
        vec![player(1, 10, "alice"), player(2, 11, "bob")],
        MatchStatus::New,
    );
    t.add_worker("w1", 10).await;
    assert_eq!(t.master.poll_jobs(JobKind::Match).await.unwrap(), 1);
}

fn match_outcome(match_result: &str) -> MatchOutcome {
    let mut outcome = MatchOutcome {
        success: true,
        stdout: Some("server out".to_string()),
        stderr: Some("server err".to_string()),
        dump: Some(encode_b64(b"dump")),
        replay: Some(encode_b64(b"replay")),
        stats: Some(encode_b64(b"stats")),
        match_result: match_result.to_string(),
        ..Default::default()
    };
    outcome.players.insert(
        10,
        PlayerOutcome {
            champion_id: 1,
            stdout: Some("alice says hi".to_string()),
        },
    );
    outcome
}

#[tokio::test]
async fn test_match_done_writes_scores_and_artifacts() {
    let t = TestMaster::new();
    setup_played_match(&t).await;

    let outcome = match_outcome(
        r#"[{"player": 10, "score": 42, "nb_timeout": 0}, {"player": 11, "score": 3, "nb_timeout": 2}]"#,
    );
    assert!(
        t.master
            .match_done(worker_info("w1", 10, 10), 1234, outcome)
            .await
    );

    assert_eq!(t.jobs.match_status(1234), Some(MatchStatus::Done));
    let alice = t.jobs.player_score(10).unwrap();
    assert_eq!((alice.score, alice.had_timeout), (42, false));
    let bob = t.jobs.player_score(11).unwrap();
    assert_eq!((bob.score, bob.had_timeout), (3, true));

    let dir = t.storage.match_dir(1234);
    assert!(dir.ends_with("001/234"));
    assert_eq!(std::fs::read(dir.join(storage::MATCH_DUMP)).unwrap(), b"dump");
    assert_eq!(std::fs::read(dir.join(storage::MATCH_REPLAY)).unwrap(), b"replay");
    assert_eq!(std::fs::read(dir.join(storage::MATCH_STATS)).unwrap(), b"stats");
    assert_eq!(
        std::fs::read_to_string(dir.join(storage::SERVER_STDOUT)).unwrap(),
        "server out"
    );
    assert_eq!(
        std::fs::read_to_string(dir.join(storage::player_log_name(10, 1))).unwrap(),
        "alice says hi"
    );
    assert!(dir.join(storage::MATCH_RESULT).exists());
    assert_eq!(t.slots_of("w1").await, Some(10));
}

#[tokio::test]
async fn test_malformed_match_result_fails_match() {
    let t = TestMaster::new();
    setup_played_match(&t).await;

    let outcome = match_outcome(r#"[{"player": 10, "score": 42}]"#);
    assert!(
        t.master
            .match_done(worker_info("w1", 10, 10), 1234, outcome)
            .await
    );

    assert_eq!(t.jobs.match_status(1234), Some(MatchStatus::Failed));
    assert_eq!(t.master.metrics().snapshot().bad_result, 1);
    assert!(t.jobs.player_score(10).is_none());
}

#[tokio::test]
async fn test_unsuccessful_match_is_failed_without_scores() {
    let t = TestMaster::new();
    setup_played_match(&t).await;

    let outcome = MatchOutcome {
        success: false,
        match_result: r#"[{"player": 10, "score": 42, "nb_timeout": 0}]"#.to_string(),
        ..Default::default()
    };
    t.master
        .match_done(worker_info("w1", 10, 10), 1234, outcome)
        .await;

    assert_eq!(t.jobs.match_status(1234), Some(MatchStatus::Failed));
    assert!(t.jobs.player_score(10).is_none());
}

#[tokio::test]
async fn test_out_of_range_score_fails_match() {
    let t = TestMaster::new();
    setup_played_match(&t).await;

    let outcome = match_outcome(
        r#"[{"player": 10, "score": 3, "nb_timeout": 0}, {"player": 11, "score": 4294967296, "nb_timeout": 0}]"#,
    );
    assert!(
        t.master
            .match_done(worker_info("w1", 10, 10), 1234, outcome)
            .await
    );

    assert_eq!(t.jobs.match_status(1234), Some(MatchStatus::Failed));
    assert_eq!(t.master.metrics().snapshot().bad_result, 1);
    // No partial score list.
    assert!(t.jobs.player_score(10).is_none());
    assert!(t.jobs.player_score(11).is_none());
}

#[tokio::test]
async fn test_result_handling_is_timed() {
    let t = TestMaster::new();
    setup_played_match(&t).await;
    t.add_champion(5, "carol").await;
    assert_eq!(t.master.poll_jobs(JobKind::Compilation).await.unwrap(), 1);

    t.master
        .compilation_done(worker_info("w1", 10, 10), "carol", 5, compiled_ok(5))
        .await;
    t.master
        .match_done(
            worker_info("w1", 10, 10),
            1234,
            match_outcome(r#"[{"player": 10, "score": 1, "nb_timeout": 0}]"#),
        )
        .await;

    let snapshot = t.master.metrics().snapshot();
    assert_eq!(snapshot.compilation_done_file.count, 1);
    assert_eq!(snapshot.match_done_file.count, 1);
    assert_eq!(snapshot.match_done_db.count, 1);

    // Discarded reports are not timed.
    t.master
        .match_done(worker_info("w1", 10, 10), 1234, match_outcome("[]"))
        .await;
    assert_eq!(t.master.metrics().snapshot().match_done_db.count, 1);
}

#[tokio::test]
async fn test_rejected_rpc_is_recorded_not_pending() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    let worker = t.add_worker("w1", 10).await;
    worker.fail_with(Some(RpcError::Remote {
        code: tonic::Code::ResourceExhausted,
        message: "No free slot".to_string(),
    }));

    assert_eq!(t.master.poll_jobs(JobKind::Compilation).await.unwrap(), 1);

    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::New));
    assert!(t.master.is_tracked(&TaskKey::Compilation(1)).await);

    // The janitor picks the errored attempt up on its next sweep.
    worker.fail_with(None);
    let report = t.master.janitor_sweep().await;
    assert_eq!(report.resubmitted, vec![TaskKey::Compilation(1)]);
    let jobs = t.jobs.clone();
    assert_eventually(
        || {
            let jobs = jobs.clone();
            async move { jobs.champion_status(1) == Some(ChampionStatus::Pending) }
        },
        Duration::from_secs(5),
        "resubmitted compilation should become pending",
    )
    .await;
    assert_eq!(worker.compilations(), vec![1, 1]);
}

#[tokio::test]
async fn test_missing_source_is_an_attempt_error() {
    let t = TestMaster::new();
    t.jobs.add_champion(1, "alice", ChampionStatus::New);
    let worker = t.add_worker("w1", 10).await;

    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    assert!(worker.compilations().is_empty());
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::New));
    assert!(t.master.is_tracked(&TaskKey::Compilation(1)).await);
}

#[tokio::test]
async fn test_tracked_jobs_are_not_dispatched_twice() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    let worker = t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    // Someone resets the row while the worker still runs it.
    t.jobs
        .set_champion_status(1, ChampionStatus::New)
        .await
        .unwrap();
    assert_eq!(t.master.poll_jobs(JobKind::Compilation).await.unwrap(), 0);
    assert_eq!(worker.compilations(), vec![1]);
}

#[tokio::test]
async fn test_unreachable_worker_is_not_registered() {
    let t = TestMaster::new();
    let worker = t.connector.add("w1");
    worker.set_reachable(false);

    assert!(!t.master.update_worker(worker_info("w1", 10, 10)).await);
    assert_eq!(t.master.worker_count().await, 0);

    // Unknown to the connector altogether.
    assert!(!t.master.update_worker(worker_info("w2", 10, 10)).await);
    assert_eq!(t.master.worker_count().await, 0);
}

#[tokio::test]
async fn test_update_worker_refreshes_capacity() {
    let t = TestMaster::new();
    t.add_worker("w1", 10).await;

    assert!(t.master.update_worker(worker_info("w1", 4, 20)).await);

    let status = t.master.status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].max_slots, 20);
    assert_eq!(status[0].slots, 20);
    assert_eq!(status[0].reported_slots, 4);
}

#[tokio::test]
async fn test_first_heartbeat_redispatches_tasks() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::Pending));

    // The worker process restarted.
    assert!(t.master.heartbeat(worker_info("w1", 10, 10), true).await);

    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::New));
    assert!(!t.master.is_tracked(&TaskKey::Compilation(1)).await);
    assert_eq!(t.slots_of("w1").await, Some(10));
    assert_eq!(t.master.metrics().snapshot().task_redispatch, 1);
}

#[tokio::test]
async fn test_regular_heartbeat_keeps_tasks() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    assert!(t.master.heartbeat(worker_info("w1", 9, 10), false).await);

    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::Pending));
    assert!(t.master.is_tracked(&TaskKey::Compilation(1)).await);
}

#[tokio::test(start_paused = true)]
async fn test_dead_worker_tasks_are_redispatched() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    tokio::time::advance(Duration::from_secs(11)).await;
    let report = t.master.janitor_sweep().await;

    assert_eq!(report.timed_out_workers, vec![WorkerKey::new("w1", WORKER_PORT)]);
    assert_eq!(report.redispatched, vec![TaskKey::Compilation(1)]);
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::New));
    assert_eq!(t.master.worker_count().await, 0);
    assert_eq!(t.master.metrics().snapshot().worker_timeout, 1);

    // A late result from the dead worker is dropped.
    assert!(
        !t.master
            .compilation_done(worker_info("w1", 10, 10), "alice", 1, compiled_ok(1))
            .await
    );
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::New));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_task_is_retried_then_failed() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    let worker = t.add_worker("w1", 10).await;
    t.master.poll_jobs(JobKind::Compilation).await.unwrap();

    for attempt in 2..=3 {
        tokio::time::advance(Duration::from_secs(401)).await;
        t.master.heartbeat(worker_info("w1", 9, 10), false).await;

        let report = t.master.janitor_sweep().await;
        assert_eq!(report.resubmitted, vec![TaskKey::Compilation(1)]);
        let expected = attempt as usize;
        assert!(
            wait_for(
                || {
                    let worker = worker.clone();
                    async move { worker.compilations().len() == expected }
                },
                Duration::from_secs(1),
                Duration::from_millis(1),
            )
            .await
        );
    }

    tokio::time::advance(Duration::from_secs(401)).await;
    t.master.heartbeat(worker_info("w1", 9, 10), false).await;
    let report = t.master.janitor_sweep().await;

    assert_eq!(report.failed, vec![TaskKey::Compilation(1)]);
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::Failed));
    assert_eq!(t.slots_of("w1").await, Some(10));

    let snapshot = t.master.metrics().snapshot();
    assert_eq!(snapshot.task_resubmit, 2);
    assert_eq!(snapshot.task_fail, 1);

    // Nothing left to do.
    let report = t.master.janitor_sweep().await;
    assert!(report.failed.is_empty());
    assert_eq!(t.master.metrics().snapshot().task_fail, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_redispatches_instead_of_failing() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    let worker = t.add_worker("w1", 10).await;
    worker.fail_with(Some(RpcError::Transport("connection refused".to_string())));

    // Well past the try limit, on a worker that keeps heartbeating.
    for _ in 0..5 {
        assert_eq!(t.master.poll_jobs(JobKind::Compilation).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        t.master.heartbeat(worker_info("w1", 10, 10), false).await;

        let report = t.master.janitor_sweep().await;
        assert_eq!(report.redispatched, vec![TaskKey::Compilation(1)]);
        assert!(report.resubmitted.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::New));
        assert!(!t.master.is_tracked(&TaskKey::Compilation(1)).await);
        assert_eq!(t.slots_of("w1").await, Some(10));
    }

    let snapshot = t.master.metrics().snapshot();
    assert_eq!(snapshot.task_fail, 0);
    assert_eq!(snapshot.task_resubmit, 0);
    assert_eq!(snapshot.transport_error, 5);
    assert_eq!(snapshot.task_redispatch, 5);
    assert!(!t
        .jobs
        .champion_history(1)
        .contains(&ChampionStatus::Failed));

    // The link comes back.
    worker.fail_with(None);
    assert_eq!(t.master.poll_jobs(JobKind::Compilation).await.unwrap(), 1);
    assert_eq!(t.jobs.champion_status(1), Some(ChampionStatus::Pending));
}

#[tokio::test(start_paused = true)]
async fn test_full_worker_then_timeout_match_scenario() {
    let t = TestMaster::new();
    t.add_compiled_champion(1, "alice").await;
    t.add_compiled_champion(2, "bob").await;
    let worker = t.add_worker("w1", 5).await;
    t.jobs.add_match(
        1,
        None,
        vec![player(1, 10, "alice"), player(2, 11, "bob")],
        MatchStatus::New,
    );
    t.jobs.add_match(
        2,
        None,
        vec![player(1, 20, "alice"), player(2, 21, "bob")],
        MatchStatus::New,
    );

    // The first match fills the worker.
    assert_eq!(t.master.poll_jobs(JobKind::Match).await.unwrap(), 1);
    assert_eq!(t.slots_of("w1").await, Some(0));
    assert_eq!(t.jobs.match_status(1), Some(MatchStatus::Pending));
    assert_eq!(t.jobs.match_status(2), Some(MatchStatus::New));
    assert_eq!(t.master.poll_jobs(JobKind::Match).await.unwrap(), 0);

    // The worker goes silent.
    tokio::time::advance(Duration::from_secs(11)).await;
    let report = t.master.janitor_sweep().await;
    assert_eq!(report.timed_out_workers, vec![WorkerKey::new("w1", WORKER_PORT)]);
    assert_eq!(report.redispatched, vec![TaskKey::Match(1)]);
    assert_eq!(t.jobs.match_status(1), Some(MatchStatus::New));
    assert_eq!(t.master.worker_count().await, 0);

    // Nowhere to run anything until it registers again.
    assert_eq!(t.master.poll_jobs(JobKind::Match).await.unwrap(), 0);
    assert_eq!(t.jobs.match_status(1), Some(MatchStatus::New));
    assert_eq!(t.jobs.match_status(2), Some(MatchStatus::New));

    assert!(t.master.heartbeat(worker_info("w1", 5, 5), true).await);
    assert_eq!(t.slots_of("w1").await, Some(5));

    for match_id in [1, 2] {
        assert_eq!(t.master.poll_jobs(JobKind::Match).await.unwrap(), 1);
        assert_eq!(t.jobs.match_status(match_id), Some(MatchStatus::Pending));
        assert_eq!(t.slots_of("w1").await, Some(0));

        assert!(
            t.master
                .match_done(worker_info("w1", 5, 5), match_id, match_outcome("[]"))
                .await
        );
        assert_eq!(t.jobs.match_status(match_id), Some(MatchStatus::Done));
        assert_eq!(t.slots_of("w1").await, Some(5));
    }

    let played: Vec<i64> = worker.matches().iter().map(|c| c.match_id).collect();
    assert_eq!(played, vec![1, 1, 2]);
    assert_eq!(t.master.metrics().snapshot().task_fail, 0);
}

#[tokio::test]
async fn test_recover_pending_jobs_at_startup() {
    let t = TestMaster::new();
    t.jobs.add_champion(5, "alice", ChampionStatus::Pending);
    t.jobs.add_champion(6, "bob", ChampionStatus::Ready);
    t.jobs
        .add_match(9, None, vec![player(5, 50, "alice")], MatchStatus::Pending);

    assert_eq!(t.master.recover_pending(JobKind::Compilation).await.unwrap(), 1);
    assert_eq!(t.master.recover_pending(JobKind::Match).await.unwrap(), 1);

    assert_eq!(t.jobs.champion_status(5), Some(ChampionStatus::New));
    assert_eq!(t.jobs.champion_status(6), Some(ChampionStatus::Ready));
    assert_eq!(t.jobs.match_status(9), Some(MatchStatus::New));
}

#[tokio::test]
async fn test_dbwatcher_dispatches_until_shutdown() {
    let t = TestMaster::with_config(|c| {
        c.dbwatcher_interval = Duration::from_millis(20);
    });
    t.add_worker("w1", 10).await;
    // Left pending by a previous masternode.
    t.add_champion(1, "alice").await;
    t.jobs.add_champion(1, "alice", ChampionStatus::Pending);
    t.add_champion(2, "bob").await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(
        t.master
            .clone()
            .run_dbwatcher(JobKind::Compilation, shutdown.clone()),
    );

    let jobs = t.jobs.clone();
    assert_eventually(
        || {
            let jobs = jobs.clone();
            async move {
                jobs.champion_status(1) == Some(ChampionStatus::Pending)
                    && jobs.champion_status(2) == Some(ChampionStatus::Pending)
            }
        },
        Duration::from_secs(5),
        "both champions should be dispatched",
    )
    .await;
    assert_eq!(t.jobs.champion_history(1)[0], ChampionStatus::New);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dbwatcher stops on shutdown")
        .unwrap();
    assert!(t.master.metrics().snapshot().compilation_requests >= 2);
}

#[tokio::test]
async fn test_end_to_end_match() {
    let t = TestMaster::new();
    t.add_champion(1, "alice").await;
    t.add_champion(2, "bob").await;
    t.add_worker("w1", 10).await;

    assert_eq!(t.master.poll_jobs(JobKind::Compilation).await.unwrap(), 2);
    for (id, user) in [(1, "alice"), (2, "bob")] {
        assert!(
            t.master
                .compilation_done(worker_info("w1", 10, 10), user, id, compiled_ok(id))
                .await
        );
    }

    t.jobs.add_match(
        3,
        None,
        vec![player(1, 30, "alice"), player(2, 31, "bob")],
        MatchStatus::New,
    );
    assert_eq!(t.master.poll_jobs(JobKind::Match).await.unwrap(), 1);
    assert_eq!(t.slots_of("w1").await, Some(5));

    let outcome = MatchOutcome {
        success: true,
        match_result:
            r#"[{"player": 30, "score": 1, "nb_timeout": 0}, {"player": 31, "score": 0, "nb_timeout": 0}]"#
                .to_string(),
        ..Default::default()
    };
    assert!(t.master.match_done(worker_info("w1", 10, 10), 3, outcome).await);

    assert_eq!(
        t.jobs.match_history(3),
        vec![MatchStatus::Pending, MatchStatus::Done]
    );
    assert_eq!(t.jobs.player_score(30).unwrap().score, 1);
    assert_eq!(t.slots_of("w1").await, Some(10));

    let snapshot = t.master.metrics().snapshot();
    assert_eq!(snapshot.task_dispatch, 3);
    assert_eq!(snapshot.compilation_requests, 2);
    assert_eq!(snapshot.match_requests, 1);
}
