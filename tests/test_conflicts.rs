//! Conflict detection and resolution through full sessions

mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;

use common::{config, Script, ScriptedExecutor};
use subagent_orchestra::{
    ConflictStatus, ConflictType, OrchestraError, OrchestrationConfig, OrchestrationEvent,
    OrchestrationService, Resolution, ResolveRequest, SessionStatus, Severity, TaskDescriptor,
    TaskPlan, TaskStatus, TaskType,
};

fn task(key: &str, task_type: TaskType) -> TaskDescriptor {
    TaskDescriptor::new(key, task_type)
}

fn service(config: OrchestrationConfig, executor: Arc<ScriptedExecutor>) -> OrchestrationService {
    OrchestrationService::new(config, executor).unwrap()
}

fn a_b_then_c() -> TaskPlan {
    TaskPlan::new(vec![
        task("a", TaskType::Backend),
        task("b", TaskType::Frontend),
        task("c", TaskType::Tests).with_deps(["a", "b"]),
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_divergent_config_json_opens_one_conflict() {
    let executor = ScriptedExecutor::new()
        .script("a", Script::ok().delay_ms(10).writes("config.json", "x"))
        .script("b", Script::ok().delay_ms(20).writes("config.json", "y"))
        .script("c", Script::ok().writes("tests/config_test.rs", "#[test] fn t() {}"));
    let service = service(config(), executor.clone());

    let id = service.start_with_plan("req-config", a_b_then_c()).unwrap().orchestration_id;
    assert_eq!(
        service.wait(id).await.unwrap(),
        SessionStatus::CompletedWithConflicts
    );

    let list = service.conflicts(id).unwrap();
    assert_eq!(list.conflict_count, 1);
    let conflict = &list.conflicts[0];
    assert_eq!(conflict.path, "config.json");
    assert_eq!(conflict.conflict_type, ConflictType::Content);
    assert_eq!(conflict.contributors, vec!["a", "b"]);
    assert_eq!(conflict.status, ConflictStatus::Open);

    // c ran regardless of the open conflict, after both writers
    let tasks = service.tasks(id).unwrap();
    let c = tasks.iter().find(|t| t.id == "c").unwrap();
    assert_eq!(c.status, TaskStatus::Completed);
    for dep in ["a", "b"] {
        let dep = tasks.iter().find(|t| t.id == dep).unwrap();
        assert!(dep.completed_at.unwrap() <= c.started_at.unwrap());
    }
    assert_eq!(executor.start_order().last().map(String::as_str), Some("c"));

    let status = service.status(id).unwrap();
    assert!(status.has_conflicts);
    assert_eq!(status.open_conflicts, 1);

    let results = service.results(id).unwrap();
    let config_file = results.files.iter().find(|f| f.path == "config.json").unwrap();
    assert_eq!(config_file.contributors, vec!["a", "b"]);
    assert!(config_file.has_open_conflict);

    // the conflict is announced before the completion of the task that caused it
    let events = service.stream(id).unwrap().collect_all().await;
    let detected = events
        .iter()
        .position(|e| matches!(e.event, OrchestrationEvent::ConflictDetected { .. }))
        .unwrap();
    let b_completed = events
        .iter()
        .position(|e| {
            matches!(&e.event, OrchestrationEvent::TaskCompleted { task_id, .. } if task_id == "b")
        })
        .unwrap();
    assert!(detected < b_completed);
    assert!(events[detected].sequence < events[b_completed].sequence);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identical_writes_do_not_conflict() {
    let executor = ScriptedExecutor::new()
        .script("a", Script::ok().writes("shared/types.ts", "export type Id = string;\n"))
        .script("b", Script::ok().writes("shared/types.ts", "export type Id = string;\n"));
    let service = service(config(), executor);

    let id = service.start_with_plan("req-same", a_b_then_c()).unwrap().orchestration_id;
    assert_eq!(service.wait(id).await.unwrap(), SessionStatus::Completed);

    assert_eq!(service.conflicts(id).unwrap().conflict_count, 0);
    let results = service.results(id).unwrap();
    assert_eq!(results.files.len(), 1);
    assert_eq!(results.files[0].contributors.len(), 2);
    assert_eq!(results.files[0].content_length, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_writers_share_one_conflict_record() {
    let executor = ScriptedExecutor::new();
    let mut tasks = Vec::new();
    for (i, key) in ["w1", "w2", "w3", "w4"].iter().enumerate() {
        executor.script(
            key,
            Script::ok()
                .delay_ms(5 * i as u64)
                .writes("src/routes.ts", &format!("export const v = {};\n", i)),
        );
        tasks.push(task(key, TaskType::Backend));
    }
    let service = service(config(), executor);

    let id = service
        .start_with_plan("req-many", TaskPlan::new(tasks))
        .unwrap()
        .orchestration_id;
    service.wait(id).await.unwrap();

    let list = service.conflicts(id).unwrap();
    assert_eq!(list.conflict_count, 1);
    let conflict = &list.conflicts[0];
    assert_eq!(conflict.contributors.len(), 4);
    assert_eq!(conflict.candidates.len(), 4);

    // every writer appears in the detection events, all under the same id
    let events = service.stream(id).unwrap().collect_all().await;
    let detected: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.event {
            OrchestrationEvent::ConflictDetected { conflict_id, .. } => Some(*conflict_id),
            _ => None,
        })
        .collect();
    assert_eq!(detected.len(), 3);
    assert!(detected.iter().all(|c| *c == conflict.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resolve_winner_once_and_settle_session() {
    let executor = ScriptedExecutor::new()
        .script("a", Script::ok().delay_ms(10).writes("config.json", "{\"port\": 1}"))
        .script("b", Script::ok().delay_ms(20).writes("config.json", "{\"port\": 2}"));
    let service = service(config(), executor);

    let id = service.start_with_plan("req-resolve", a_b_then_c()).unwrap().orchestration_id;
    assert_eq!(
        service.wait(id).await.unwrap(),
        SessionStatus::CompletedWithConflicts
    );
    let conflict_id = service.conflicts(id).unwrap().conflicts[0].id;
    assert_eq!(service.conflicts(id).unwrap().conflicts[0].severity, Severity::Critical);

    let err = service
        .resolve_conflict(conflict_id, ResolveRequest::winner("c"))
        .unwrap_err();
    assert!(matches!(err, OrchestraError::UnknownContributor { .. }));

    let resolved = service
        .resolve_conflict(conflict_id, ResolveRequest::winner("b").by("reviewer"))
        .unwrap();
    assert_eq!(resolved.status, ConflictStatus::Resolved);
    assert_eq!(
        resolved.resolution,
        Some(Resolution::WinningTask {
            task_id: "b".into()
        })
    );
    assert_eq!(resolved.resolved_by.as_deref(), Some("reviewer"));
    assert_eq!(resolved.contributors, vec!["a", "b"]);

    let handle = service.session(id).unwrap();
    let file = handle
        .results()
        .into_iter()
        .find(|f| f.path == "config.json")
        .unwrap();
    assert_eq!(file.content.as_deref(), Some("{\"port\": 2}"));
    assert_eq!(file.contributors, vec!["a", "b"]);

    let err = service
        .resolve_conflict(conflict_id, ResolveRequest::winner("a"))
        .unwrap_err();
    assert!(matches!(err, OrchestraError::AlreadyResolved { conflict_id: c } if c == conflict_id));
    assert_eq!(
        handle.results().into_iter().find(|f| f.path == "config.json").unwrap().content.as_deref(),
        Some("{\"port\": 2}")
    );

    assert_eq!(service.wait(id).await.unwrap(), SessionStatus::Completed);
    assert!(!service.status(id).unwrap().has_conflicts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auto_resolve_merges_pure_insertions() {
    let executor = ScriptedExecutor::new()
        .script(
            "a",
            Script::ok()
                .delay_ms(10)
                .writes("docs/guide.md", "# Guide\nintro\nend\n"),
        )
        .script(
            "b",
            Script::ok()
                .delay_ms(20)
                .writes("docs/guide.md", "# Guide\nend\nappendix\n"),
        );
    let config = OrchestrationConfig::builder()
        .auto_resolve(true)
        .build()
        .unwrap();
    let service = service(config, executor);

    let id = service.start_with_plan("req-auto", a_b_then_c()).unwrap().orchestration_id;
    assert_eq!(service.wait(id).await.unwrap(), SessionStatus::Completed);

    let conflict = &service.conflicts(id).unwrap().conflicts[0];
    assert_eq!(conflict.status, ConflictStatus::Resolved);
    assert_eq!(conflict.resolved_by.as_deref(), Some("auto"));

    let file = service
        .session(id)
        .unwrap()
        .results()
        .into_iter()
        .find(|f| f.path == "docs/guide.md")
        .unwrap();
    assert_eq!(file.content.as_deref(), Some("# Guide\nintro\nend\nappendix\n"));

    let events = service.stream(id).unwrap().collect_all().await;
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| e.event.kind())
        .filter(|k| k.starts_with("Conflict"))
        .collect();
    assert_eq!(kinds, vec!["ConflictDetected", "ConflictResolved"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manual_merge_and_auto_request() {
    let executor = ScriptedExecutor::new()
        .script("a", Script::ok().delay_ms(10).writes("src/app.ts", "const a = 1;\n"))
        .script("b", Script::ok().delay_ms(20).writes("src/app.ts", "const a = 2;\n"));
    let service = service(config(), executor);

    let id = service.start_with_plan("req-merge", a_b_then_c()).unwrap().orchestration_id;
    service.wait(id).await.unwrap();
    let conflict_id = service.conflicts(id).unwrap().conflicts[0].id;

    // both sides changed the same line, nothing to merge automatically
    let still_open = service
        .resolve_conflict(conflict_id, ResolveRequest::auto())
        .unwrap();
    assert_eq!(still_open.status, ConflictStatus::Open);

    let resolved = service
        .resolve_conflict(
            conflict_id,
            ResolveRequest::merged("const a = 3;\n").by("alice"),
        )
        .unwrap();
    assert!(matches!(
        resolved.resolution,
        Some(Resolution::MergedContent { ref content }) if content == "const a = 3;\n"
    ));
    assert_eq!(service.status(id).unwrap().status, SessionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_against_write_is_structural() {
    let executor = ScriptedExecutor::new()
        .script("a", Script::ok().delay_ms(10).writes("src/legacy.rs", "fn old() {}"))
        .script("b", Script::ok().delay_ms(20).deletes("src/legacy.rs"));
    let service = service(config(), executor);

    let id = service.start_with_plan("req-delete", a_b_then_c()).unwrap().orchestration_id;
    service.wait(id).await.unwrap();

    let conflict = &service.conflicts(id).unwrap().conflicts[0];
    assert!(matches!(conflict.conflict_type, ConflictType::Structural { .. }));

    let results = service.results(id).unwrap();
    let file = results.files.iter().find(|f| f.path == "src/legacy.rs").unwrap();
    assert!(!file.deleted);

    service
        .resolve_conflict(conflict.id, ResolveRequest::winner("b"))
        .unwrap();
    let results = service.results(id).unwrap();
    let file = results.files.iter().find(|f| f.path == "src/legacy.rs").unwrap();
    assert!(file.deleted);
    assert_eq!(file.content_length, 0);
}

#[tokio::test]
async fn test_unknown_conflict_is_reported() {
    let service = service(config(), ScriptedExecutor::new());
    let missing = uuid::Uuid::new_v4();
    let err = service
        .resolve_conflict(missing, ResolveRequest::auto())
        .unwrap_err();
    assert!(matches!(err, OrchestraError::ConflictNotFound(id) if id == missing));

    let err = service
        .resolve_conflict(missing, ResolveRequest::default())
        .unwrap_err();
    assert!(matches!(err, OrchestraError::InvalidRequest(_)));
}
