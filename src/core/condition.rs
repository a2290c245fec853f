//! Condition and error policies for a step

use serde::{Deserialize, Serialize};

/// What a step does when its condition renders `false`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionFailAction {
    /// Stop the branch, optionally answering with the fail message
    #[default]
    Stop,
    /// Fail the branch with a 400 carrying the fail message
    Error,
    /// Skip this step's own call but still visit its children
    Ignore,
}

/// What a step does when its backend call fails or answers >= 400
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnErrorPolicy {
    /// Halt the branch and propagate the backend response untouched
    #[default]
    Stop,
    /// Swallow the error into an empty `{}` 200 and continue
    Ignore,
}

/// Condition attached to a step
#[derive(Debug, Clone, PartialEq)]
pub struct StepCondition {
    /// Boolean template expression
    pub expression: String,

    /// Behaviour when the expression renders `false`
    pub fail_action: ConditionFailAction,

    /// Template rendered as the synthetic response body on failure
    pub fail_message: Option<String>,
}

/// Resolution of a rendered condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// Condition holds, run the step
    Proceed,
    /// Skip the step's own target, continue with its children
    SkipToChildren,
    /// End the branch; answer with the fail message (200) if one renders
    Stop,
    /// End the branch with a 400 error
    Fail,
}

impl StepCondition {
    /// Whether a rendered expression counts as a held condition.
    ///
    /// Only the literal `false` fails; "no value" and anything else holds.
    pub fn holds(rendered: &str) -> bool {
        !rendered.trim().eq_ignore_ascii_case("false")
    }

    /// Map a rendered expression to the state-machine transition
    pub fn resolve(&self, rendered: &str, has_children: bool) -> ConditionOutcome {
        if Self::holds(rendered) {
            return ConditionOutcome::Proceed;
        }

        match self.fail_action {
            ConditionFailAction::Error => ConditionOutcome::Fail,
            ConditionFailAction::Stop => ConditionOutcome::Stop,
            ConditionFailAction::Ignore if has_children => ConditionOutcome::SkipToChildren,
            ConditionFailAction::Ignore => ConditionOutcome::Stop,
        }
    }
}
