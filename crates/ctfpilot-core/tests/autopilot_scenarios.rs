mod support;

use std::sync::Arc;
use std::time::Duration;

use ctfpilot_core::{AutopilotConfig, AutopilotError};
use ctfpilot_orchestrator::AutopilotEvent;
use ctfpilot_types::{AiInsight, Category, Challenge, Phase, StepStatus};

use support::*;

fn challenge(files: &[&str], description: &str) -> Challenge {
    Challenge::new(files.iter().map(|f| f.to_string()).collect(), description)
}

#[tokio::test]
async fn flag_in_recon_skips_every_later_phase() {
    let h = harness(
        ScriptedExecutor::new().respond("strings", "junk\nCTF{abc}\nmore junk"),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| Ok(AiInsight::default())),
        RecordingRunner::new(),
        fast_config(10),
    );
    let handle = h.autopilot.start(challenge(&["chall.bin"], "")).unwrap();
    let outcome = within(handle.wait()).await;

    assert_eq!(outcome.phase, Phase::Completed);
    assert!(outcome.success);
    assert_eq!(outcome.flags, vec!["CTF{abc}"]);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(h.classifier.calls(), 0);
    assert!(h.analyst.attempts_seen().is_empty());
    assert!(h.runner.calls().is_empty());
    assert_eq!(
        *h.observer.completed.lock().unwrap(),
        vec![(true, vec!["CTF{abc}".to_string()])]
    );
    assert_eq!(*h.observer.found.lock().unwrap(), vec!["CTF{abc}"]);

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.progress, 100);
    assert_eq!(snapshot.steps.len(), 2);
    assert_eq!(snapshot.steps[1].flags_found, vec!["CTF{abc}"]);
}

#[tokio::test]
async fn recon_inspects_only_the_first_five_files_and_survives_failures() {
    let files = ["a", "b", "c", "d", "e", "f", "g"];
    let h = harness(
        ScriptedExecutor::new().respond_output(
            "file b",
            ctfpilot_types::CommandOutput {
                stderr: "cannot open".to_string(),
                exit_code: 1,
                ..Default::default()
            },
        ),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| {
            Ok(AiInsight {
                should_continue: false,
                ..AiInsight::default()
            })
        }),
        RecordingRunner::new(),
        fast_config(3),
    );
    let handle = h.autopilot.start(challenge(&files, "")).unwrap();
    within(handle.wait()).await;

    let calls = h.executor.calls();
    assert_eq!(calls.len(), 10);
    assert!(!calls.iter().any(|c| c.ends_with(" f") || c.ends_with(" g")));
    let snapshot = handle.snapshot();
    let failed: Vec<_> = snapshot
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .map(|s| s.command.clone())
        .collect();
    assert_eq!(failed, vec!["file b"]);
}

#[tokio::test]
async fn analyst_candidate_on_third_attempt_completes_run() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("crypto", 0.9),
        ScriptedAnalyst::new(|request| {
            if request.attempt_number == 3 {
                Ok(AiInsight {
                    flag_candidates: vec!["CTF{xyz}".to_string()],
                    ..AiInsight::default()
                })
            } else {
                Ok(insight_with(vec![command("xxd", &["cipher.txt"])]))
            }
        }),
        RecordingRunner::new(),
        fast_config(10),
    );
    let handle = h.autopilot.start(challenge(&["cipher.txt"], "decode me")).unwrap();
    let outcome = within(handle.wait()).await;

    assert_eq!(outcome.phase, Phase::Completed);
    assert_eq!(outcome.flags, vec!["CTF{xyz}"]);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.category, Some(Category::Crypto));
    assert_eq!(h.analyst.attempts_seen(), vec![1, 2, 3]);
    assert!(h.analyst.requests().iter().all(|r| r.category == "crypto"));
    assert!(h.runner.calls().is_empty());
    assert_eq!(
        *h.observer.completed.lock().unwrap(),
        vec![(true, vec!["CTF{xyz}".to_string()])]
    );
    assert!((handle.snapshot().confidence - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn failing_collaborators_fall_back_to_keywords_and_script() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::failing(),
        ScriptedAnalyst::failing(),
        RecordingRunner::new(),
        fast_config(4),
    );
    let mut events = h.autopilot.subscribe();
    let handle = h
        .autopilot
        .start(challenge(&["key.pem"], "Weak RSA key, small e"))
        .unwrap();
    let outcome = within(handle.wait()).await;

    assert_eq!(outcome.phase, Phase::Completed);
    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.category, Some(Category::Crypto));
    assert_eq!(h.analyst.attempts_seen(), vec![1, 2, 3, 4]);
    // recon only: file + strings
    assert_eq!(h.executor.calls().len(), 2);

    let scripts = h.runner.calls();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].script.contains("# Category: crypto"));
    assert_eq!(scripts[0].packages, vec!["pycryptodome"]);
    assert_eq!(scripts[0].timeout_secs, 120);
    assert_eq!(*h.observer.completed.lock().unwrap(), vec![(false, Vec::new())]);

    let category = next_matching(&mut events, |e| {
        matches!(e, AutopilotEvent::CategoryChanged { .. })
    })
    .await;
    match category {
        AutopilotEvent::CategoryChanged {
            category,
            confidence,
            rule_based,
            ..
        } => {
            assert_eq!(category, Category::Crypto);
            assert_eq!(confidence, 0.5);
            assert!(rule_based);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let failures = {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, AutopilotEvent::AnalysisFailed { .. }) {
                count += 1;
            }
        }
        count
    };
    assert_eq!(failures, 4);
}

#[tokio::test]
async fn retry_loop_never_exceeds_max_attempts() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| Ok(insight_with(vec![command("xxd", &["a.bin"])]))),
        RecordingRunner::new(),
        fast_config(7),
    );
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();
    let outcome = within(handle.wait()).await;

    assert_eq!(h.analyst.attempts_seen(), (1..=7).collect::<Vec<u32>>());
    assert_eq!(outcome.attempts, 7);
    assert_eq!(h.runner.calls().len(), 1);
    // 2 recon commands + one command per attempt
    assert_eq!(h.executor.calls().len(), 2 + 7);
}

#[tokio::test]
async fn analyst_giving_up_ends_loop_and_category_revision_picks_template() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|request| {
            Ok(AiInsight {
                category: "binary".to_string(),
                analysis: "statically linked, no canary".to_string(),
                should_continue: request.attempt_number < 2,
                ..AiInsight::default()
            })
        }),
        RecordingRunner::new(),
        fast_config(10),
    );
    let handle = h.autopilot.start(challenge(&["vuln"], "")).unwrap();
    let outcome = within(handle.wait()).await;

    assert_eq!(h.analyst.attempts_seen(), vec![1, 2]);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.category, Some(Category::Pwn));
    let scripts = h.runner.calls();
    assert_eq!(scripts[0].packages, vec!["pwntools"]);
    assert!(scripts[0].script.contains("#   statically linked, no canary"));
}

#[tokio::test]
async fn script_flags_come_from_stdout_only() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| {
            Ok(AiInsight {
                should_continue: false,
                ..AiInsight::default()
            })
        }),
        RecordingRunner::printing("[a.bin:rot13] CTF{rot_me}\n", "warning: flag{not_this}"),
        fast_config(2),
    );
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();
    let outcome = within(handle.wait()).await;

    assert!(outcome.success);
    assert_eq!(outcome.flags, vec!["CTF{rot_me}"]);
    let snapshot = handle.snapshot();
    let script_step = snapshot.steps.last().unwrap();
    assert!(script_step.generated_script);
    assert_eq!(script_step.phase, Phase::ScriptExecution);
    assert!(script_step.script.as_deref().unwrap().contains("FLAG_RE"));
}

#[tokio::test]
async fn history_keeps_only_the_most_recent_entries() {
    let config = AutopilotConfig {
        history_capacity: 3,
        ..fast_config(3)
    };
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|request| {
            let n = request.attempt_number;
            let first = format!("first{n}");
            let second = format!("second{n}");
            Ok(insight_with(vec![
                command("xxd", &[first.as_str()]),
                command("xxd", &[second.as_str()]),
            ]))
        }),
        RecordingRunner::new(),
        config,
    );
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();
    within(handle.wait()).await;

    let requests = h.analyst.requests();
    let seen: Vec<Vec<String>> = requests
        .iter()
        .map(|r| r.history.iter().map(|e| e.command_line()).collect())
        .collect();
    assert_eq!(seen[0], vec!["file a.bin", "strings -n 4 a.bin"]);
    assert_eq!(seen[1], vec!["strings -n 4 a.bin", "xxd first1", "xxd second1"]);
    assert_eq!(seen[2], vec!["xxd second1", "xxd first2", "xxd second2"]);
}

#[tokio::test]
async fn repeated_candidates_are_reported_once() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| {
            Ok(AiInsight {
                flag_candidates: vec!["CTF{dup}".to_string(), "CTF{dup}".to_string()],
                ..AiInsight::default()
            })
        }),
        RecordingRunner::new(),
        fast_config(5),
    );
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();
    let outcome = within(handle.wait()).await;

    assert_eq!(outcome.flags, vec!["CTF{dup}"]);
    assert_eq!(*h.observer.found.lock().unwrap(), vec!["CTF{dup}"]);
}

#[tokio::test]
async fn flag_mid_batch_stops_remaining_commands() {
    let h = harness(
        ScriptedExecutor::new().respond("binwalk", "DECIMAL ... flag{carved}"),
        ScriptedClassifier::answering("forensics", 0.7),
        ScriptedAnalyst::new(|_| {
            Ok(insight_with(vec![
                command("exiftool", &["img.png"]),
                command("binwalk", &["-e", "img.png"]),
                command("zsteg", &["img.png"]),
            ]))
        }),
        RecordingRunner::new(),
        fast_config(5),
    );
    let handle = h.autopilot.start(challenge(&["img.png"], "")).unwrap();
    let outcome = within(handle.wait()).await;

    assert_eq!(outcome.flags, vec!["flag{carved}"]);
    assert_eq!(outcome.attempts, 1);
    let calls = h.executor.calls();
    assert!(calls.iter().any(|c| c.starts_with("binwalk")));
    assert!(!calls.iter().any(|c| c.starts_with("zsteg")));
    assert_eq!(h.analyst.attempts_seen(), vec![1]);
}

#[tokio::test]
async fn pause_freezes_attempts_until_resume() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| Ok(insight_with(vec![command("xxd", &["a.bin"])]))).pausing_at(5),
        RecordingRunner::new(),
        fast_config(8),
    );
    let mut events = h.autopilot.subscribe();
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();
    h.analyst.attach(handle.control().clone());

    let paused = next_matching(&mut events, |e| matches!(e, AutopilotEvent::Paused { .. })).await;
    assert!(matches!(paused, AutopilotEvent::Paused { attempts: 4, .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.analyst.attempts_seen(), vec![1, 2, 3, 4, 5]);
    let snapshot = h.autopilot.snapshot();
    assert!(snapshot.paused);
    assert_eq!(snapshot.attempts, 4);
    assert_eq!(snapshot.phase, Phase::AiAnalysis);

    assert!(h.autopilot.resume());
    let outcome = within(handle.wait()).await;
    assert_eq!(h.analyst.attempts_seen(), (1..=8).collect::<Vec<u32>>());
    assert_eq!(outcome.attempts, 8);
    assert!(!handle.snapshot().paused);
}

#[tokio::test]
async fn cancel_records_in_flight_command_and_skips_the_rest() {
    let h = harness(
        ScriptedExecutor::new()
            .respond("xxd", "00000000: 4865 6c6c 6f")
            .block_once_on("xxd"),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| {
            Ok(insight_with(vec![
                command("xxd", &["a.bin"]),
                command("binwalk", &["a.bin"]),
                command("foremost", &["-i", "a.bin"]),
            ]))
        }),
        RecordingRunner::new(),
        fast_config(10),
    );
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();

    within(h.executor.entered.notified()).await;
    handle.cancel();
    h.executor.release.notify_one();
    let outcome = within(handle.wait()).await;

    assert_eq!(outcome.phase, Phase::Cancelled);
    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(h.analyst.attempts_seen(), vec![1]);
    assert!(!h.executor.calls().iter().any(|c| c.starts_with("binwalk")));
    assert!(h.runner.calls().is_empty());

    let steps = handle.snapshot().steps;
    let tail: Vec<_> = steps
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|s| (s.command.clone(), s.status))
        .collect();
    assert_eq!(
        tail,
        vec![
            ("xxd a.bin".to_string(), StepStatus::Success),
            ("binwalk a.bin".to_string(), StepStatus::Skipped),
            ("foremost -i a.bin".to_string(), StepStatus::Skipped),
        ]
    );
    assert_eq!(steps[steps.len() - 3].stdout, "00000000: 4865 6c6c 6f");
    assert_eq!(h.observer.cancelled.lock().unwrap().len(), 1);
    assert!(h.observer.completed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_during_suggestion_discards_the_answer() {
    let h = harness(
        ScriptedExecutor::new().respond("xxd", "CTF{too_late}"),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| {
            Ok(AiInsight {
                category: "crypto".to_string(),
                flag_candidates: vec!["CTF{late_candidate}".to_string()],
                ..insight_with(vec![
                    command("xxd", &["a.bin"]),
                    command("binwalk", &["a.bin"]),
                ])
            })
        })
        .holding_at(1),
        RecordingRunner::new(),
        fast_config(5),
    );
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();

    within(h.analyst.entered.notified()).await;
    let recon_calls = h.executor.calls();
    handle.cancel();
    h.analyst.release.notify_one();
    let outcome = within(handle.wait()).await;

    assert_eq!(outcome.phase, Phase::Cancelled);
    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 0);
    assert!(outcome.flags.is_empty());
    assert_eq!(h.analyst.attempts_seen(), vec![1]);
    assert_eq!(h.executor.calls(), recon_calls);
    assert!(h.runner.calls().is_empty());

    let snapshot = handle.snapshot();
    assert_ne!(snapshot.category, Some(Category::Crypto));
    assert!(!snapshot
        .steps
        .iter()
        .any(|s| s.command.starts_with("xxd") || s.command.starts_with("binwalk")));
    assert_eq!(
        *h.observer.cancelled.lock().unwrap(),
        vec![Vec::<String>::new()]
    );
    assert!(h.observer.found.lock().unwrap().is_empty());
    assert!(h.observer.completed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn snapshots_share_finished_steps_with_the_run() {
    let h = harness(
        ScriptedExecutor::new().block_once_on("strings"),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| {
            Ok(AiInsight {
                should_continue: false,
                ..AiInsight::default()
            })
        }),
        RecordingRunner::new(),
        fast_config(1),
    );
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();

    within(h.executor.entered.notified()).await;
    let mid = handle.snapshot();
    h.executor.release.notify_one();
    within(handle.wait()).await;
    let end = handle.snapshot();

    assert_eq!(mid.steps[0].command, "file a.bin");
    assert!(Arc::ptr_eq(&mid.steps[0], &end.steps[0]));
    assert!(end.steps.len() > mid.steps.len());
}

#[tokio::test]
async fn starting_again_cancels_the_previous_run() {
    let h = harness(
        ScriptedExecutor::new().block_once_on("file first.bin"),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| {
            Ok(AiInsight {
                should_continue: false,
                ..AiInsight::default()
            })
        }),
        RecordingRunner::new(),
        fast_config(2),
    );
    let first = h.autopilot.start(challenge(&["first.bin"], "")).unwrap();
    within(h.executor.entered.notified()).await;

    let second = h.autopilot.start(challenge(&["second.bin"], "")).unwrap();
    h.executor.release.notify_one();

    let first_outcome = within(first.wait()).await;
    let second_outcome = within(second.wait()).await;
    assert_eq!(first_outcome.phase, Phase::Cancelled);
    assert_eq!(second_outcome.phase, Phase::Completed);
    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(h.autopilot.snapshot().run_id.as_deref(), Some(second.run_id()));
}

#[tokio::test]
async fn reset_returns_to_idle() {
    let h = harness(
        ScriptedExecutor::new().block_once_on("file"),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| Ok(AiInsight::default())),
        RecordingRunner::new(),
        fast_config(2),
    );
    let handle = h.autopilot.start(challenge(&["a.bin"], "")).unwrap();
    within(h.executor.entered.notified()).await;

    h.autopilot.reset();
    assert_eq!(h.autopilot.snapshot().phase, Phase::Idle);
    assert!(h.autopilot.wait().await.is_none());

    h.executor.release.notify_one();
    assert_eq!(within(handle.wait()).await.phase, Phase::Cancelled);
}

#[tokio::test]
async fn invalid_inputs_are_rejected_at_start() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| Ok(AiInsight::default())),
        RecordingRunner::new(),
        fast_config(0),
    );
    let err = h.autopilot.start(challenge(&["a"], "")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AutopilotError>(),
        Some(AutopilotError::ZeroMaxAttempts)
    ));

    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| Ok(AiInsight::default())),
        RecordingRunner::new(),
        fast_config(3),
    );
    let err = h
        .autopilot
        .start(challenge(&["a"], "").with_flag_pattern("([unclosed"))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AutopilotError>(),
        Some(AutopilotError::InvalidFlagPattern { .. })
    ));
}

#[tokio::test]
async fn custom_flag_pattern_is_detected_in_recon() {
    let h = harness(
        ScriptedExecutor::new().respond("strings", "key: SECRET-1234-ABCD"),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| Ok(AiInsight::default())),
        RecordingRunner::new(),
        fast_config(3),
    );
    let handle = h
        .autopilot
        .start(challenge(&["a"], "").with_flag_pattern(r"SECRET-\d{4}-[A-Z]{4}"))
        .unwrap();
    let outcome = within(handle.wait()).await;
    assert_eq!(outcome.flags, vec!["SECRET-1234-ABCD"]);
}

#[tokio::test]
async fn panicking_collaborator_fails_the_run() {
    let h = harness(
        ScriptedExecutor::new(),
        ScriptedClassifier::answering("misc", 0.4),
        ScriptedAnalyst::new(|_| panic!("analyst bug")),
        RecordingRunner::new(),
        fast_config(3),
    );
    let mut events = h.autopilot.subscribe();
    let handle = h.autopilot.start(challenge(&["a"], "")).unwrap();
    let outcome = within(handle.wait()).await;

    assert_eq!(outcome.phase, Phase::Failed);
    assert!(!outcome.success);
    assert_eq!(*h.observer.completed.lock().unwrap(), vec![(false, Vec::new())]);
    assert_eq!(handle.snapshot().phase, Phase::Failed);
    next_matching(&mut events, |e| matches!(e, AutopilotEvent::RunFailed { .. })).await;
}
