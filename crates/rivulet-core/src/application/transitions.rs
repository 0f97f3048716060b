use crate::domain::execution_state::NextAction;
use crate::domain::flow_definition::{FlowDefinition, StepInstance, StepKind};
use crate::expression::ConditionEvaluator;
use crate::CoreError;
use serde_json::Value;
use tracing::debug;

/// Picks the next step and the action the orchestrator takes for it
#[derive(Clone)]
pub struct TransitionResolver {
    evaluator: ConditionEvaluator,
}

impl TransitionResolver {
    /// Create a resolver
    pub fn new(evaluator: ConditionEvaluator) -> Self {
        Self { evaluator }
    }

    /// First transition whose condition holds, else the default; `None`
    /// ends the path.
    pub async fn next_step(
        &self,
        step: &StepInstance,
        scope: &Value,
    ) -> Result<Option<String>, CoreError> {
        for transition in &step.transitions {
            if self.evaluator.evaluate(&transition.condition, scope).await? {
                debug!(
                    step_id = %step.step_instance_id,
                    condition = %transition.condition,
                    next = %transition.next_step_instance_id,
                    "Transition selected"
                );
                return Ok(Some(transition.next_step_instance_id.clone()));
            }
        }
        Ok(step.default_next_step_instance_id.clone())
    }

    /// Action for moving onto `next`
    pub fn action_for(flow: &FlowDefinition, next: Option<&str>) -> Result<NextAction, CoreError> {
        let Some(next) = next else {
            return Ok(NextAction::Finalize);
        };
        let step = flow
            .step(next)
            .ok_or_else(|| CoreError::StepNotFound(next.to_string()))?;
        Ok(match &step.kind {
            StepKind::WaitForExternalEvent(_) => NextAction::Suspend,
            StepKind::PollExternalApi(poll) => NextAction::Poll {
                polling_config: poll.polling_config.clone(),
            },
            _ => NextAction::Continue,
        })
    }
}
