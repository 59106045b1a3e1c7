use std::time::{Duration, Instant};

use super::effects::lerp_channel;
use super::manager::StageManager;
use super::model::Scene;

pub(super) const FADE_STEPS: u32 = 50;
pub(super) const FADE_STEP_INTERVAL: Duration = Duration::from_millis(40);

/// One in-flight scene fade. Only a single fade may run at a time; a second
/// activation while one is in progress starts nothing.
///
/// Start values are captured when the fade begins; only devices named in
/// the scene snapshot participate. A device deleted mid-fade is skipped on
/// the remaining sub-steps.
#[derive(Debug)]
pub struct SceneFade {
    lanes: Vec<FadeLane>,
    steps_done: u32,
    pub(super) next_due: Instant,
}

#[derive(Debug)]
struct FadeLane {
    device_id: String,
    start: Vec<u8>,
    target: Vec<u8>,
}

impl SceneFade {
    pub(super) fn new(stage: &StageManager, scene: &Scene, now: Instant) -> SceneFade {
        let mut lanes = Vec::new();

        for device in stage.devices() {
            if let Some(target) = scene.device_values.get(&device.name) {
                lanes.push(FadeLane {
                    device_id: device.id.clone(),
                    start: device.values.clone(),
                    target: target.clone(),
                });
            }
        }

        SceneFade {
            lanes,
            steps_done: 0,
            next_due: now,
        }
    }

    /// Advance one sub-step. Returns true once the final step has been
    /// written.
    pub(super) fn step(&mut self, stage: &mut StageManager) -> bool {
        self.steps_done += 1;
        let progress = self.steps_done as f64 / FADE_STEPS as f64;

        for lane in self.lanes.iter() {
            let idx = match stage.device_index(&lane.device_id) {
                Some(idx) => idx,
                None => continue,
            };

            stage.write_device(idx, |device| {
                for i in 0..device.values.len() {
                    if i < lane.start.len() && i < lane.target.len() {
                        device.values[i] = lerp_channel(lane.start[i], lane.target[i], progress);
                    }
                }
            });
        }

        self.steps_done >= FADE_STEPS
    }
}
