use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use subagent_orchestra::{
    init_tracing, CancellationToken, ExecutionError, ExecutionRequest, OrchestrationConfig,
    OrchestrationEvent, OrchestrationService, ResolveRequest, TaskExecutor, TaskOutput, TaskPlan,
    TaskType,
};

/// Pretends to be a model call: waits a little, then answers in markdown
struct SimulatedExecutor;

impl SimulatedExecutor {
    fn answer(request: &ExecutionRequest) -> String {
        match request.task_type {
            TaskType::Schema => "### db/schema.sql\n```sql\ncreate table users (id int primary key);\ncreate table orders (id int, user_id int);\n```\n".to_string(),
            TaskType::Backend => concat!(
                "### src/api.ts\n```typescript\nexport const routes = ['/users', '/orders'];\n```\n",
                "### config.json\n```json\n{ \"port\": 8080, \"db\": \"orders\" }\n```\n"
            )
            .to_string(),
            TaskType::Frontend => concat!(
                "### web/App.tsx\n```tsx\nexport default function App() { return null; }\n```\n",
                "### config.json\n```json\n{ \"port\": 3000 }\n```\n"
            )
            .to_string(),
            TaskType::Tests => "### tests/api.test.ts\n```typescript\ntest('routes', () => {});\n```\n".to_string(),
            _ => format!(
                "### README.md\n```markdown\n# {}\n\n{}\n```\n",
                request.name, request.description
            ),
        }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, ExecutionError> {
        let delay = Duration::from_millis(50 + fastrand::u64(0..150));
        tokio::select! {
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(TaskOutput::from_markdown(&Self::answer(&request)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OrchestrationConfig::development().with_env_overrides()?;
    init_tracing(&config.logging);

    let plan_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "plan.yaml".to_string());
    let plan = TaskPlan::from_yaml_file(&plan_path)
        .with_context(|| format!("loading task plan from {}", plan_path))?;

    let service = OrchestrationService::new(config, Arc::new(SimulatedExecutor))?;
    let started = service.start_with_plan("demo-request", plan)?;
    println!(
        "orchestration {} started with {} tasks",
        started.orchestration_id, started.total_tasks
    );

    let mut events = service.stream(started.orchestration_id)?;
    while let Some(event) = events.next().await {
        println!("{}", event.to_json()?);
        if let OrchestrationEvent::ConflictDetected {
            conflict_id,
            contributors,
            ..
        } = &event.event
        {
            tracing::info!(%conflict_id, ?contributors, "conflict will be resolved after the run");
        }
    }

    let id = started.orchestration_id;
    for conflict in service.conflicts(id)?.conflicts {
        if !conflict.is_open() {
            continue;
        }
        // keep the first writer's version
        let winner = conflict.contributors[0].clone();
        let request = ResolveRequest::winner(winner).by("demo");
        let resolved = service.resolve_conflict(conflict.id, request)?;
        println!("resolved {} in favour of {:?}", resolved.path, resolved.resolution);
    }

    let results = service.results(id)?;
    println!("\nfinal status: {:?}", service.status(id)?.status);
    for file in results.files {
        println!(
            "{:<24} {:<12} {:>5} bytes  {}",
            file.path,
            file.language.as_str(),
            file.content_length,
            file.contributors.join(", ")
        );
    }
    Ok(())
}
