//! Stage execution driver: wraps caller-supplied stage logic in the
//! running -> passed/failed lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use corvus_types::{
    compute_input_hash, compute_output_hash, CorvusError, LedgerEntry, Result, StageState,
    StateTable, TrustContext,
};

use crate::stage_machine::{StageMachine, TransitionInputs};

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub result: Value,
    pub artifact_references: Vec<String>,
}

impl StageOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            artifact_references: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifact_references: Vec<String>) -> Self {
        self.artifact_references = artifact_references;
        self
    }
}

// ---------------------------------------------------------------------------
// StageHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Run the stage's work. An `Err` fails the stage and cascades.
    async fn execute(&self, run_id: &str, payload: &Value) -> Result<StageOutput>;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub const INTAKE_STAGE: &str = "s0_intake";

pub struct Orchestrator {
    machine: Arc<StageMachine>,
    trust_context: TrustContext,
    handlers: HashMap<String, Box<dyn StageHandler>>,
}

impl Orchestrator {
    pub fn new(machine: Arc<StageMachine>, trust_context: TrustContext) -> Self {
        Self {
            machine,
            trust_context,
            handlers: HashMap::new(),
        }
    }

    pub fn machine(&self) -> &Arc<StageMachine> {
        &self.machine
    }

    pub fn register_handler(&mut self, stage_id: impl Into<String>, handler: impl StageHandler + 'static) {
        self.handlers.insert(stage_id.into(), Box::new(handler));
    }

    pub fn has_handler(&self, stage_id: &str) -> bool {
        self.handlers.contains_key(stage_id)
    }

    /// Initialize a new run and record intake as passed.
    pub async fn start_run(&self, run_id: &str, prerequisites: Vec<Value>) -> Result<StateTable> {
        self.machine.initialize_run(run_id).await?;

        self.machine
            .transition(
                run_id,
                INTAKE_STAGE,
                StageState::Running,
                TransitionInputs {
                    input_hash: compute_input_hash(INTAKE_STAGE, &json!({ "prerequisites": prerequisites })),
                    trust_context: self.trust_context.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let stage_count = self.machine.graph().len();
        self.machine
            .transition(
                run_id,
                INTAKE_STAGE,
                StageState::Passed,
                TransitionInputs {
                    output_hash: compute_output_hash(
                        INTAKE_STAGE,
                        &json!({ "run_id": run_id, "stage_count": stage_count }),
                    ),
                    trust_context: self.trust_context.clone(),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(run_id = %run_id, "Run started");
        self.machine.get_all_states(run_id).await
    }

    /// Rebuild a run's state from the ledger and check its version pins.
    pub async fn resume_run(&self, run_id: &str) -> Result<StateTable> {
        let states = self.machine.rebuild_run(run_id).await?;
        self.machine.check_version_drift(run_id).await?;
        tracing::info!(run_id = %run_id, "Run resumed");
        Ok(states)
    }

    /// Run one stage through its handler.
    ///
    /// A stage without a registered handler passes through with a note. A
    /// handler error is recorded as `failed` (which cascades) and returned as
    /// [`CorvusError::StageExecution`].
    pub async fn execute_stage(&self, run_id: &str, stage_id: &str, payload: Value) -> Result<StageOutput> {
        let input_hash = compute_input_hash(stage_id, &payload);

        self.machine
            .transition(
                run_id,
                stage_id,
                StageState::Running,
                TransitionInputs {
                    input_hash: input_hash.clone(),
                    trust_context: self.trust_context.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let outcome = match self.handlers.get(stage_id) {
            Some(handler) => handler.execute(run_id, &payload).await,
            None => Ok(StageOutput::new(
                json!({ "status": "passed", "note": "no handler registered" }),
            )),
        };

        match outcome {
            Ok(output) => {
                self.machine
                    .transition(
                        run_id,
                        stage_id,
                        StageState::Passed,
                        TransitionInputs {
                            input_hash,
                            output_hash: compute_output_hash(stage_id, &output.result),
                            artifact_references: output.artifact_references.clone(),
                            trust_context: self.trust_context.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(output)
            }
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(run_id = %run_id, stage_id = %stage_id, error = %message, "Stage handler failed");
                self.machine
                    .transition(
                        run_id,
                        stage_id,
                        StageState::Failed,
                        TransitionInputs {
                            input_hash,
                            output_hash: compute_output_hash(stage_id, &json!({ "error": message })),
                            trust_context: self.trust_context.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;
                Err(CorvusError::StageExecution {
                    stage_id: stage_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Record an operator waiver for a blocked stage.
    pub async fn waive_stage(
        &self,
        run_id: &str,
        stage_id: &str,
        waiver_references: Vec<String>,
    ) -> Result<LedgerEntry> {
        self.machine
            .transition(
                run_id,
                stage_id,
                StageState::Waived,
                TransitionInputs {
                    waiver_references,
                    trust_context: self.trust_context.clone(),
                    ..Default::default()
                },
            )
            .await
    }

    /// Stages that may start now, in topological order.
    pub async fn next_ready_stages(&self, run_id: &str) -> Result<Vec<String>> {
        let mut ready = Vec::new();
        for stage_id in self.machine.graph().stage_ids() {
            if self.machine.can_start(run_id, stage_id).await?.0 {
                ready.push(stage_id.clone());
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PrerequisiteGraph;
    use corvus_ledger::RunLedger;
    use corvus_types::default_stage_definitions;

    struct Echo;

    #[async_trait]
    impl StageHandler for Echo {
        async fn execute(&self, _run_id: &str, payload: &Value) -> Result<StageOutput> {
            Ok(StageOutput::new(payload.clone()).with_artifacts(vec!["sha256:feed".into()]))
        }
    }

    struct Boom;

    #[async_trait]
    impl StageHandler for Boom {
        async fn execute(&self, _run_id: &str, _payload: &Value) -> Result<StageOutput> {
            Err(CorvusError::Config("toolchain missing".into()))
        }
    }

    async fn orchestrator() -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(RunLedger::open(dir.path().join("ledger.db")).await.unwrap());
        let graph = Arc::new(PrerequisiteGraph::new(default_stage_definitions()).unwrap());
        let machine = Arc::new(StageMachine::new(ledger, graph));
        let trust = TrustContext::from([("plugin_key".to_string(), "fp-1".to_string())]);
        (dir, Orchestrator::new(machine, trust))
    }

    #[tokio::test]
    async fn start_run_passes_intake() {
        let (_dir, orch) = orchestrator().await;
        let states = orch.start_run("run-1", vec![json!({ "name": "rustc" })]).await.unwrap();
        assert_eq!(states[INTAKE_STAGE], StageState::Passed);

        let entries = orch.machine().ledger().get_run_entries("run-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].input_hash.is_empty());
        assert!(!entries[1].output_hash.is_empty());
        assert_eq!(entries[1].trust_context["plugin_key"], "fp-1");
        assert_eq!(orch.next_ready_stages("run-1").await.unwrap(), vec!["s1_prerequisites"]);
    }

    #[tokio::test]
    async fn start_run_twice_is_rejected() {
        let (_dir, orch) = orchestrator().await;
        orch.start_run("run-1", vec![]).await.unwrap();
        let err = orch.start_run("run-1", vec![]).await.unwrap_err();
        assert!(matches!(err, CorvusError::RunAlreadyInitialized(_)));
    }

    #[tokio::test]
    async fn handler_output_is_hashed_and_recorded() {
        let (_dir, mut orch) = orchestrator().await;
        orch.register_handler("s1_prerequisites", Echo);
        orch.start_run("run-1", vec![]).await.unwrap();

        let payload = json!({ "deps": ["serde"] });
        let output = orch.execute_stage("run-1", "s1_prerequisites", payload.clone()).await.unwrap();
        assert_eq!(output.result, payload);

        let last = orch.machine().ledger().get_latest("run-1").await.unwrap().unwrap();
        assert_eq!(last.state_transition, "running->passed");
        assert_eq!(last.input_hash, compute_input_hash("s1_prerequisites", &payload));
        assert_eq!(last.output_hash, compute_output_hash("s1_prerequisites", &payload));
        assert_eq!(last.artifact_references, vec!["sha256:feed"]);
    }

    #[tokio::test]
    async fn missing_handler_passes_through() {
        let (_dir, orch) = orchestrator().await;
        orch.start_run("run-1", vec![]).await.unwrap();
        let output = orch.execute_stage("run-1", "s1_prerequisites", json!({})).await.unwrap();
        assert_eq!(output.result["note"], "no handler registered");
    }

    #[tokio::test]
    async fn handler_error_fails_stage_and_cascades() {
        let (_dir, mut orch) = orchestrator().await;
        orch.register_handler("s1_prerequisites", Boom);
        orch.start_run("run-1", vec![]).await.unwrap();

        let err = orch.execute_stage("run-1", "s1_prerequisites", json!({})).await.unwrap_err();
        match err {
            CorvusError::StageExecution { stage_id, message } => {
                assert_eq!(stage_id, "s1_prerequisites");
                assert!(message.contains("toolchain missing"));
            }
            other => panic!("expected stage execution error, got {other:?}"),
        }

        let states = orch.machine().get_all_states("run-1").await.unwrap();
        assert_eq!(states["s1_prerequisites"], StageState::Failed);
        assert_eq!(states["s2_environment"], StageState::Blocked);
        assert!(orch.next_ready_stages("run-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_out_of_order_is_rejected_before_the_handler_runs() {
        let (_dir, orch) = orchestrator().await;
        orch.start_run("run-1", vec![]).await.unwrap();
        let err = orch.execute_stage("run-1", "s3_test_contract", json!({})).await.unwrap_err();
        assert!(matches!(err, CorvusError::PrerequisiteNotMet { .. }));
        assert_eq!(orch.machine().ledger().entry_count("run-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn waive_requires_a_blocked_stage() {
        let (_dir, orch) = orchestrator().await;
        orch.start_run("run-1", vec![]).await.unwrap();

        let err = orch
            .waive_stage("run-1", "s55_accessibility", vec!["w-1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, CorvusError::InvalidTransition { .. }));

        orch.machine()
            .transition("run-1", "s55_accessibility", StageState::Blocked, TransitionInputs::default())
            .await
            .unwrap();
        let entry = orch
            .waive_stage("run-1", "s55_accessibility", vec!["w-1".into()])
            .await
            .unwrap();
        assert_eq!(entry.state_transition, "blocked->waived");
        assert_eq!(entry.waiver_references, vec!["w-1"]);
    }

    #[tokio::test]
    async fn resume_rebuilds_from_ledger() {
        let (_dir, orch) = orchestrator().await;
        orch.start_run("run-1", vec![]).await.unwrap();
        orch.execute_stage("run-1", "s1_prerequisites", json!({})).await.unwrap();

        let resumed = Orchestrator::new(
            Arc::new(StageMachine::new(
                Arc::clone(orch.machine().ledger()),
                Arc::clone(orch.machine().graph()),
            )),
            TrustContext::new(),
        );
        let states = resumed.resume_run("run-1").await.unwrap();
        assert_eq!(states["s1_prerequisites"], StageState::Passed);
        assert_eq!(resumed.next_ready_stages("run-1").await.unwrap(), vec!["s2_environment"]);
    }
}
