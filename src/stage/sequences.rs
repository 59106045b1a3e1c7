use std::time::{Duration, Instant};
use tracing::warn;

use super::manager::StageManager;
use super::model::{SequenceStep, StepType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Enter,
    Leave,
}

/// Playback state machine for one sequence: perform the current step's
/// action, sleep the step duration, tear the step down, move on. Effects
/// started by a step run under an ephemeral `{effect_id}_seq` id that is
/// stopped when the step ends or the player is cancelled.
#[derive(Debug)]
pub struct SequencePlayer {
    sequence_id: String,
    steps: Vec<SequenceStep>,
    looped: bool,
    step_idx: usize,
    phase: Phase,
    active_ephemeral: Option<String>,
}

impl SequencePlayer {
    pub(super) fn new(sequence_id: String, steps: Vec<SequenceStep>, looped: bool) -> SequencePlayer {
        SequencePlayer {
            sequence_id,
            steps,
            looped,
            step_idx: 0,
            phase: Phase::Enter,
            active_ephemeral: None,
        }
    }

    /// Drive the player. Returns the delay until the next call, or None
    /// when playback has finished.
    pub(super) fn tick(&mut self, stage: &mut StageManager, now: Instant) -> Option<Duration> {
        if self.steps.is_empty() {
            return None;
        }

        loop {
            if self.step_idx >= self.steps.len() {
                if !self.looped {
                    return None;
                }
                self.step_idx = 0;
            }

            match self.phase {
                Phase::Enter => {
                    let step = self.steps[self.step_idx].clone();
                    self.enter_step(stage, &step, now);
                    self.phase = Phase::Leave;
                    return Some(Duration::from_millis(step.duration_ms));
                }
                Phase::Leave => {
                    self.leave_step(stage);
                    self.step_idx += 1;
                    self.phase = Phase::Enter;
                }
            }
        }
    }

    fn enter_step(&mut self, stage: &mut StageManager, step: &SequenceStep, now: Instant) {
        match step.step_type {
            StepType::Scene => {
                if let Some(target_id) = &step.target_id {
                    // Fire and forget; a fade already in progress wins.
                    if let Err(e) = stage.begin_scene_fade(target_id, now) {
                        warn!("Sequence {}: {}", self.sequence_id, e);
                    }
                }
            }
            StepType::Effect => {
                if let Some(target_id) = &step.target_id {
                    let ephemeral_id = format!("{}_seq", target_id);
                    match stage.start_effect_by_def(target_id, &ephemeral_id, now) {
                        Ok(()) => self.active_ephemeral = Some(ephemeral_id),
                        Err(e) => warn!(
                            "Sequence {} could not start effect {}: {}",
                            self.sequence_id, target_id, e
                        ),
                    }
                }
            }
            StepType::Wait => {}
        }
    }

    fn leave_step(&mut self, stage: &mut StageManager) {
        if let Some(ephemeral_id) = self.active_ephemeral.take() {
            stage.stop_effect_runtime(&ephemeral_id);
        }
    }

    /// Stop anything this player started. Called on cancellation and on
    /// cap eviction.
    pub(super) fn abort(&mut self, stage: &mut StageManager) {
        if let Some(ephemeral_id) = self.active_ephemeral.take() {
            stage.stop_effect_runtime(&ephemeral_id);
        }
    }
}
