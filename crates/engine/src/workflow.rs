//! Workflow definitions and the registry they are resolved from.
//!
//! A definition is an ordered list of phases, each an ordered list of
//! steps.  Definitions are built once at startup and never mutated.
//!
//! Rules enforced by [`WorkflowDefinition::validate`]:
//! 1. At least one phase.
//! 2. Every phase has at least one step.
//!
//! Phase and step indices are 1-based, matching the execution context.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use steps::Step;

use crate::EngineError;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

pub struct WorkflowDefinition {
    run_type: String,
    description: String,
    phases: Vec<Vec<Arc<dyn Step>>>,
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape: Vec<usize> = self.phases.iter().map(Vec::len).collect();
        f.debug_struct("WorkflowDefinition")
            .field("run_type", &self.run_type)
            .field("phases", &shape)
            .finish()
    }
}

impl WorkflowDefinition {
    pub fn builder(run_type: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            run_type: run_type.into(),
            description: String::new(),
            phases: Vec::new(),
        }
    }

    pub fn run_type(&self) -> &str {
        &self.run_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Total number of steps across all phases.
    pub fn step_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    /// # Errors
    /// [`EngineError::InvalidDefinition`] if there are no phases or a phase
    /// has no steps.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.phases.is_empty() {
            return Err(self.invalid("workflow has no phases"));
        }
        if let Some(i) = self.phases.iter().position(Vec::is_empty) {
            return Err(self.invalid(format!("phase {} has no steps", i + 1)));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidDefinition {
            run_type: self.run_type.clone(),
            reason: reason.into(),
        }
    }

    pub fn get_phase(&self, phase_index: u32) -> Result<PhaseView<'_>, EngineError> {
        let count = self.phases.len();
        let steps = checked(phase_index, count)
            .map(|i| &self.phases[i])
            .ok_or(EngineError::OutOfBounds { aspect: "phase", index: phase_index, count })?;

        Ok(PhaseView {
            index: phase_index,
            is_last: phase_index as usize == count,
            steps,
        })
    }

    pub fn get_step(&self, phase_index: u32, step_index: u32) -> Result<StepView<'_>, EngineError> {
        self.get_phase(phase_index)?.get_step(step_index)
    }

    /// Every step address in execution order.
    pub fn addresses(&self) -> impl Iterator<Item = StepView<'_>> + '_ {
        self.phases.iter().enumerate().flat_map(move |(p, steps)| {
            let phase_index = p as u32 + 1;
            steps.iter().enumerate().map(move |(s, step)| StepView {
                phase_index,
                index: s as u32 + 1,
                is_last: s + 1 == steps.len(),
                step,
            })
        })
    }
}

/// Map a 1-based index onto a slice position.
fn checked(index: u32, count: usize) -> Option<usize> {
    let i = index as usize;
    (i >= 1 && i <= count).then(|| i - 1)
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

pub struct PhaseView<'a> {
    pub index: u32,
    /// Last phase of the workflow.
    pub is_last: bool,
    steps: &'a [Arc<dyn Step>],
}

impl<'a> PhaseView<'a> {
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn get_step(&self, step_index: u32) -> Result<StepView<'a>, EngineError> {
        let count = self.steps.len();
        let step = checked(step_index, count)
            .map(|i| &self.steps[i])
            .ok_or(EngineError::OutOfBounds { aspect: "step", index: step_index, count })?;

        Ok(StepView {
            phase_index: self.index,
            index: step_index,
            is_last: step_index as usize == count,
            step,
        })
    }
}

pub struct StepView<'a> {
    pub phase_index: u32,
    pub index: u32,
    /// Last step of its phase.
    pub is_last: bool,
    pub step: &'a Arc<dyn Step>,
}

impl StepView<'_> {
    pub fn label(&self) -> &str {
        self.step.label()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct WorkflowBuilder {
    run_type: String,
    description: String,
    phases: Vec<Vec<Arc<dyn Step>>>,
}

impl WorkflowBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a phase made of `steps`, in order.
    pub fn phase(mut self, steps: impl IntoIterator<Item = Arc<dyn Step>>) -> Self {
        self.phases.push(steps.into_iter().collect());
        self
    }

    pub fn build(self) -> WorkflowDefinition {
        WorkflowDefinition {
            run_type: self.run_type,
            description: self.description,
            phases: self.phases,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRegistry
// ---------------------------------------------------------------------------

/// Maps run types to their definitions.  Populated at startup.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition; replaces any previous one for its run type.
    pub fn register(&mut self, workflow: WorkflowDefinition) -> &mut Self {
        self.workflows
            .insert(workflow.run_type.clone(), Arc::new(workflow));
        self
    }

    pub fn resolve(&self, run_type: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.workflows
            .get(run_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(run_type.to_owned()))
    }

    /// Registered run types, sorted.
    pub fn run_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorkflowDefinition>> {
        self.workflows.values()
    }
}
