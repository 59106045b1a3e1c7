use serde_json::{json, Value};
use std::mem;
use std::time::{Duration, Instant};
use tokio::{select, sync::mpsc::Receiver, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::effects::{build_runtime, EffectRuntime, Targets};
use super::error::StageError;
use super::fader::{SceneFade, FADE_STEP_INTERVAL};
use super::model::{
    clamp_channel, AudioFrame, CompanionTrigger, Device, DeviceCreate, EffectCreate, EffectDef,
    Group, GroupCreate, GroupUpdate, GroupValues, IdGen, Scene, SceneCreate, SequenceCreate,
    SequenceDef, SequenceUpdate, StateSnapshot, MAX_ACTIVE_EFFECTS, MAX_ACTIVE_SEQUENCES,
    MAX_DEVICES, MAX_GROUPS, MAX_SCENES,
};
use super::sequences::SequencePlayer;
use crate::artnet::Transmitter;
use crate::messages::{PushEvent, ToStageManagerMessage};
use crate::store::{Store, StoreKind};

const TICK_DURATION: Duration = Duration::from_millis(20);
pub(super) const EFFECT_TIMEOUT: Duration = Duration::from_secs(3600);
pub(super) const SEQUENCE_TIMEOUT: Duration = Duration::from_secs(7200);

struct EffectEntry {
    id: String,
    runtime: Box<dyn EffectRuntime>,
    next_due: Instant,
    deadline: Instant,
}

struct SequenceEntry {
    id: String,
    player: SequencePlayer,
    next_due: Instant,
    deadline: Instant,
}

/// Owner of the whole stage model and of every running render task.
///
/// All collections are mutated only from this manager's task; render
/// runtimes, the fader and sequence players are step functions driven from
/// one periodic tick, so a device is never written from two places at once
/// and cancellation is a synchronous table removal.
pub struct StageManager {
    pub(super) devices: Vec<Device>,
    pub(super) scenes: Vec<Scene>,
    pub(super) groups: Vec<Group>,
    pub(super) effects: Vec<EffectDef>,
    pub(super) sequences: Vec<SequenceDef>,
    audio: AudioFrame,
    pub(super) transmitter: Transmitter,
    store: Store,
    push_tx: async_channel::Sender<PushEvent>,
    id_gen: IdGen,
    active_effects: Vec<EffectEntry>,
    active_sequences: Vec<SequenceEntry>,
    fade: Option<SceneFade>,
}

impl StageManager {
    pub fn new(
        transmitter: Transmitter,
        store: Store,
        push_tx: async_channel::Sender<PushEvent>,
    ) -> StageManager {
        StageManager {
            devices: Vec::new(),
            scenes: Vec::new(),
            groups: Vec::new(),
            effects: Vec::new(),
            sequences: Vec::new(),
            audio: AudioFrame::default(),
            transmitter,
            store,
            push_tx,
            id_gen: IdGen::default(),
            active_effects: Vec::new(),
            active_sequences: Vec::new(),
            fade: None,
        }
    }

    /// Load the persisted collections and fold their ids into the id
    /// generator so restarts never reissue one.
    pub fn load(&mut self) {
        let state = self.store.load_all();

        self.devices = state.devices;
        self.scenes = state.scenes;
        self.groups = state.groups;
        self.effects = state.effects;
        self.sequences = state.sequences;

        for device in self.devices.iter_mut() {
            device.values.resize(device.channel_count as usize, 0);
        }

        for id in self
            .devices
            .iter()
            .map(|d| d.id.as_str())
            .chain(self.scenes.iter().map(|s| s.id.as_str()))
            .chain(self.groups.iter().map(|g| g.id.as_str()))
            .chain(self.effects.iter().map(|e| e.id.as_str()))
            .chain(self.sequences.iter().map(|s| s.id.as_str()))
        {
            self.id_gen.observe(id);
        }
    }

    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        mut receiver: Receiver<ToStageManagerMessage>,
    ) {
        let mut tick_timer = interval(TICK_DURATION);

        loop {
            select! {
                _ = cancel.cancelled() => break,

                _ = tick_timer.tick() => self.tick(Instant::now()),

                message = receiver.recv() => match message {
                    None => break,
                    Some(message) => self.handle_message(message, Instant::now()),
                },
            }
        }

        self.shutdown();
        info!("StageManager stopped");
    }

    fn shutdown(&mut self) {
        let mut players = mem::take(&mut self.active_sequences);
        for entry in players.iter_mut() {
            entry.player.abort(self);
        }
        self.active_effects.clear();
        self.fade = None;
    }

    pub(super) fn tick(&mut self, now: Instant) {
        self.tick_effects(now);
        self.tick_sequences(now);
        self.tick_fade(now);
    }

    fn tick_effects(&mut self, now: Instant) {
        let mut entries = mem::take(&mut self.active_effects);

        entries.retain_mut(|entry| {
            if now >= entry.deadline {
                warn!(
                    "Effect {} timed out after {}s",
                    entry.id,
                    EFFECT_TIMEOUT.as_secs()
                );
                return false;
            }
            if now < entry.next_due {
                return true;
            }

            match entry.runtime.tick(self, now) {
                Ok(delay) => {
                    entry.next_due = now + delay;
                    true
                }
                Err(e) => {
                    error!("Effect {} error: {}", entry.id, e);
                    false
                }
            }
        });

        // Anything registered while ticking (e.g. a restarted effect) was
        // pushed onto the emptied table; keep it.
        entries.append(&mut self.active_effects);
        self.active_effects = entries;
    }

    fn tick_sequences(&mut self, now: Instant) {
        let mut entries = mem::take(&mut self.active_sequences);

        entries.retain_mut(|entry| {
            if now >= entry.deadline {
                warn!(
                    "Sequence {} timed out after {}s",
                    entry.id,
                    SEQUENCE_TIMEOUT.as_secs()
                );
                entry.player.abort(self);
                return false;
            }
            if now < entry.next_due {
                return true;
            }

            match entry.player.tick(self, now) {
                Some(delay) => {
                    entry.next_due = now + delay;
                    true
                }
                None => {
                    info!("Sequence {} finished", entry.id);
                    false
                }
            }
        });

        entries.append(&mut self.active_sequences);
        self.active_sequences = entries;
    }

    fn tick_fade(&mut self, now: Instant) {
        let mut fade = match self.fade.take() {
            Some(fade) => fade,
            None => return,
        };

        if now < fade.next_due {
            self.fade = Some(fade);
            return;
        }

        if fade.step(self) {
            debug!("Scene fade completed");
            self.save_devices();
            self.publish(PushEvent::DevicesUpdated(self.devices.clone()));
        } else {
            fade.next_due = now + FADE_STEP_INTERVAL;
            self.fade = Some(fade);
        }
    }

    // --- accessors used by the render runtimes ---

    pub(super) fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub(super) fn device_at(&self, idx: usize) -> &Device {
        &self.devices[idx]
    }

    pub(super) fn device_index(&self, device_id: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.id == device_id)
    }

    pub(super) fn audio(&self) -> AudioFrame {
        self.audio
    }

    /// Resolve effect targets to current device indices. Unresolved ids are
    /// silently skipped; group members come back in device-list order.
    pub(super) fn resolve_targets(&self, target_ids: &[String], is_group: bool) -> Vec<usize> {
        if is_group {
            let mut resolved = Vec::new();
            for group_id in target_ids {
                if let Some(group) = self.groups.iter().find(|g| &g.id == group_id) {
                    resolved.extend(
                        self.devices
                            .iter()
                            .enumerate()
                            .filter(|(_, d)| group.device_ids.contains(&d.id))
                            .map(|(i, _)| i),
                    );
                }
            }
            resolved
        } else {
            self.devices
                .iter()
                .enumerate()
                .filter(|(_, d)| target_ids.contains(&d.id))
                .map(|(i, _)| i)
                .collect()
        }
    }

    /// Mutate one device's values and transmit the resulting frame.
    pub(super) fn write_device<F: FnOnce(&mut Device)>(&mut self, idx: usize, mutate: F) {
        mutate(&mut self.devices[idx]);
        self.transmitter.send_device(&self.devices[idx]);
    }

    pub(super) fn fill_device(&mut self, idx: usize, value: u8) {
        self.write_device(idx, |device| {
            for v in device.values.iter_mut() {
                *v = value;
            }
        });
    }

    /// Write a color triple to channels 0..2 of an rgb/rgbw device; other
    /// device types are left alone.
    pub(super) fn set_device_color(&mut self, idx: usize, (r, g, b): (u8, u8, u8)) {
        if !self.devices[idx].is_color() || self.devices[idx].values.len() < 3 {
            return;
        }
        self.write_device(idx, |device| {
            device.values[0] = r;
            device.values[1] = g;
            device.values[2] = b;
        });
    }

    // --- supervisor ---

    fn insert_effect_entry(&mut self, effect_id: &str, runtime: Box<dyn EffectRuntime>, now: Instant) {
        if self.stop_effect_runtime(effect_id) {
            debug!("Replacing running effect {}", effect_id);
        }

        if self.active_effects.len() >= MAX_ACTIVE_EFFECTS {
            let oldest = self.active_effects.remove(0);
            warn!(
                "Effect limit reached ({}), stopping oldest: {}",
                MAX_ACTIVE_EFFECTS, oldest.id
            );
        }

        self.active_effects.push(EffectEntry {
            id: effect_id.to_string(),
            runtime,
            next_due: now,
            deadline: now + EFFECT_TIMEOUT,
        });
        info!("Started effect {}", effect_id);
    }

    /// Remove a running effect from the table; its last written frame stays
    /// on the devices. Returns whether anything was stopped.
    pub(super) fn stop_effect_runtime(&mut self, effect_id: &str) -> bool {
        let before = self.active_effects.len();
        self.active_effects.retain(|entry| entry.id != effect_id);

        let stopped = before != self.active_effects.len();
        if stopped {
            info!("Stopped effect {}", effect_id);
        }
        stopped
    }

    /// Instantiate a stored effect definition under the given runtime id
    /// (the definition id itself, or an ephemeral sequence-step id).
    pub(super) fn start_effect_by_def(
        &mut self,
        def_id: &str,
        run_id: &str,
        now: Instant,
    ) -> Result<(), StageError> {
        let def = self
            .effects
            .iter()
            .find(|e| e.id == def_id)
            .cloned()
            .ok_or_else(|| StageError::EffectNotFound(def_id.to_string()))?;

        let targets = Targets {
            ids: def.target_ids.clone(),
            is_group: def.is_group,
        };
        let runtime = build_runtime(&def.effect_type, &def.params, targets, now)?;

        self.insert_effect_entry(run_id, runtime, now);
        Ok(())
    }

    fn stop_sequence_runtime(&mut self, sequence_id: &str) -> bool {
        let mut stopped = false;

        while let Some(pos) = self
            .active_sequences
            .iter()
            .position(|entry| entry.id == sequence_id)
        {
            let mut entry = self.active_sequences.remove(pos);
            entry.player.abort(self);
            stopped = true;
        }

        if stopped {
            info!("Stopped sequence {}", sequence_id);
        }
        stopped
    }

    fn play_sequence(&mut self, sequence_id: &str, now: Instant) -> Result<(), StageError> {
        let sequence = self
            .sequences
            .iter()
            .find(|s| s.id == sequence_id)
            .cloned()
            .ok_or_else(|| StageError::SequenceNotFound(sequence_id.to_string()))?;

        self.stop_sequence_runtime(sequence_id);

        if self.active_sequences.len() >= MAX_ACTIVE_SEQUENCES {
            let mut oldest = self.active_sequences.remove(0);
            warn!(
                "Sequence limit reached ({}), stopping oldest: {}",
                MAX_ACTIVE_SEQUENCES, oldest.id
            );
            oldest.player.abort(self);
        }

        let player = SequencePlayer::new(sequence.id.clone(), sequence.steps, sequence.looped);
        self.active_sequences.push(SequenceEntry {
            id: sequence.id.clone(),
            player,
            next_due: now,
            deadline: now + SEQUENCE_TIMEOUT,
        });

        info!("Started sequence {}", sequence_id);
        Ok(())
    }

    /// Begin the 2 s fade towards a scene snapshot. A fade already in
    /// progress wins; the request is a no-op then.
    pub(super) fn begin_scene_fade(
        &mut self,
        scene_id: &str,
        now: Instant,
    ) -> Result<(), StageError> {
        if self.fade.is_some() {
            debug!("Fade already in progress, ignoring activation of {}", scene_id);
            return Ok(());
        }

        let scene = self
            .scenes
            .iter()
            .find(|s| s.id == scene_id)
            .ok_or_else(|| StageError::SceneNotFound(scene_id.to_string()))?;

        info!("Activating scene {} ({})", scene.name, scene.id);
        let mut fade = SceneFade::new(self, scene, now);
        fade.next_due = now;
        self.fade = Some(fade);
        Ok(())
    }

    // --- mutations ---

    fn add_device(&mut self, payload: DeviceCreate) -> Result<Device, StageError> {
        let (name, ip) = payload.validate()?;

        if self.devices.len() >= MAX_DEVICES {
            return Err(StageError::LimitReached("device", MAX_DEVICES));
        }
        if self.devices.iter().any(|d| {
            d.ip == ip && d.universe == payload.universe && d.start_channel == payload.start_channel
        }) {
            return Err(StageError::DuplicateDeviceAddress);
        }

        let device = Device {
            id: self.id_gen.next("device"),
            name,
            ip,
            universe: payload.universe,
            start_channel: payload.start_channel,
            channel_count: payload.channel_count,
            device_type: payload.device_type,
            fixture_id: payload.fixture_id,
            channel_layout: payload.channel_layout,
            values: vec![0; payload.channel_count as usize],
        };

        info!("Added device: {} ({})", device.name, device.id);
        self.devices.push(device.clone());
        self.save_devices();
        self.publish(PushEvent::DevicesUpdated(self.devices.clone()));
        Ok(device)
    }

    fn remove_device(&mut self, device_id: &str) -> Result<(), StageError> {
        let idx = self
            .device_index(device_id)
            .ok_or_else(|| StageError::DeviceNotFound(device_id.to_string()))?;

        let device = self.devices.remove(idx);
        self.transmitter.forget_device(&device.id);

        info!("Removed device: {} ({})", device.name, device.id);
        self.save_devices();
        self.publish(PushEvent::DevicesUpdated(self.devices.clone()));
        Ok(())
    }

    fn set_device_values(
        &mut self,
        device_id: &str,
        values: Vec<i64>,
    ) -> Result<Vec<u8>, StageError> {
        let idx = self
            .device_index(device_id)
            .ok_or_else(|| StageError::DeviceNotFound(device_id.to_string()))?;

        let expected = self.devices[idx].channel_count as usize;
        if values.len() != expected {
            return Err(StageError::Validation(format!(
                "Expected {} values, got {}",
                expected,
                values.len()
            )));
        }

        let clamped: Vec<u8> = values.into_iter().map(clamp_channel).collect();
        let broadcast = clamped.clone();
        self.write_device(idx, move |device| device.values = clamped);

        self.save_devices();
        self.publish(PushEvent::DeviceValuesUpdated {
            device_id: device_id.to_string(),
            values: broadcast.clone(),
        });
        Ok(broadcast)
    }

    fn set_device_channel(&mut self, device_id: &str, channel_idx: usize, value: i64) {
        let idx = match self.device_index(device_id) {
            Some(idx) => idx,
            None => {
                warn!("update_device_value for unknown device {}", device_id);
                return;
            }
        };
        if channel_idx >= self.devices[idx].values.len() {
            warn!(
                "update_device_value channel {} out of range for {}",
                channel_idx, device_id
            );
            return;
        }

        let value = clamp_channel(value);
        self.write_device(idx, |device| device.values[channel_idx] = value);
        self.save_devices();
        self.publish(PushEvent::DeviceValuesUpdated {
            device_id: device_id.to_string(),
            values: self.devices[idx].values.clone(),
        });
    }

    fn add_scene(&mut self, payload: SceneCreate) -> Result<Scene, StageError> {
        let name = super::model::validate_name(&payload.name)?;

        if self.scenes.len() >= MAX_SCENES {
            return Err(StageError::LimitReached("scene", MAX_SCENES));
        }

        // An empty snapshot captures the current values of every device.
        let device_values = if payload.device_values.is_empty() {
            self.devices
                .iter()
                .map(|d| (d.name.clone(), d.values.clone()))
                .collect()
        } else {
            payload
                .device_values
                .into_iter()
                .map(|(name, values)| {
                    (name, values.into_iter().map(clamp_channel).collect())
                })
                .collect()
        };

        let scene = Scene {
            id: self.id_gen.next("scene"),
            name,
            color: payload.color,
            device_values,
        };

        info!("Added scene: {} ({})", scene.name, scene.id);
        self.scenes.push(scene.clone());
        self.save_scenes();
        self.publish(PushEvent::ScenesUpdated(self.scenes.clone()));
        Ok(scene)
    }

    fn remove_scene(&mut self, scene_id: &str) -> Result<(), StageError> {
        let idx = self
            .scenes
            .iter()
            .position(|s| s.id == scene_id)
            .ok_or_else(|| StageError::SceneNotFound(scene_id.to_string()))?;

        self.scenes.remove(idx);
        self.save_scenes();
        self.publish(PushEvent::ScenesUpdated(self.scenes.clone()));
        Ok(())
    }

    fn add_group(&mut self, payload: GroupCreate) -> Result<Group, StageError> {
        let name = payload.validate()?;

        if self.groups.len() >= MAX_GROUPS {
            return Err(StageError::LimitReached("group", MAX_GROUPS));
        }

        let group = Group {
            id: self.id_gen.next("group"),
            name,
            device_ids: payload.device_ids,
        };

        info!("Added group: {} ({})", group.name, group.id);
        self.groups.push(group.clone());
        self.save_groups();
        self.publish(PushEvent::GroupsUpdated(self.groups.clone()));
        Ok(group)
    }

    fn update_group(&mut self, group_id: &str, update: GroupUpdate) -> Result<Group, StageError> {
        let name = match &update.name {
            Some(name) => Some(super::model::validate_name(name)?),
            None => None,
        };
        if let Some(device_ids) = &update.device_ids {
            if device_ids.is_empty() {
                return Err(StageError::Validation(String::from(
                    "Group needs at least one device",
                )));
            }
        }

        let group = self
            .groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| StageError::GroupNotFound(group_id.to_string()))?;

        if let Some(name) = name {
            group.name = name;
        }
        if let Some(device_ids) = update.device_ids {
            group.device_ids = device_ids;
        }
        let updated = group.clone();

        self.save_groups();
        self.publish(PushEvent::GroupsUpdated(self.groups.clone()));
        Ok(updated)
    }

    fn remove_group(&mut self, group_id: &str) -> Result<(), StageError> {
        let idx = self
            .groups
            .iter()
            .position(|g| g.id == group_id)
            .ok_or_else(|| StageError::GroupNotFound(group_id.to_string()))?;

        self.groups.remove(idx);
        self.save_groups();
        self.publish(PushEvent::GroupsUpdated(self.groups.clone()));
        Ok(())
    }

    fn set_group_values(
        &mut self,
        group_id: &str,
        values: GroupValues,
    ) -> Result<(), StageError> {
        let member_ids = self
            .groups
            .iter()
            .find(|g| g.id == group_id)
            .map(|g| g.device_ids.clone())
            .ok_or_else(|| StageError::GroupNotFound(group_id.to_string()))?;

        let member_idxs: Vec<usize> = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| member_ids.contains(&d.id))
            .map(|(i, _)| i)
            .collect();

        for idx in member_idxs {
            self.write_device(idx, |device| {
                if let Some(intensity) = values.intensity {
                    let v = clamp_channel(intensity);
                    for value in device.values.iter_mut() {
                        *value = v;
                    }
                }
                if let Some([r, g, b]) = values.rgb {
                    if device.is_color() && device.values.len() >= 3 {
                        device.values[0] = clamp_channel(r);
                        device.values[1] = clamp_channel(g);
                        device.values[2] = clamp_channel(b);
                    }
                }
            });
        }

        self.save_devices();
        self.publish(PushEvent::DevicesUpdated(self.devices.clone()));
        Ok(())
    }

    fn add_effect(&mut self, payload: EffectCreate) -> Result<EffectDef, StageError> {
        let name = payload.validate()?;

        let effect = EffectDef {
            id: self.id_gen.next("effect"),
            name,
            effect_type: payload.effect_type,
            target_ids: payload.target_ids,
            params: payload.params,
            is_group: payload.is_group,
        };

        info!("Created effect: {} ({})", effect.name, effect.id);
        self.effects.push(effect.clone());
        self.save_effects();
        self.publish(PushEvent::EffectsUpdated(self.effects.clone()));
        Ok(effect)
    }

    fn remove_effect(&mut self, effect_id: &str) -> Result<(), StageError> {
        // Stop the running instance, if any, before dropping the definition.
        self.stop_effect_runtime(effect_id);

        let idx = self
            .effects
            .iter()
            .position(|e| e.id == effect_id)
            .ok_or_else(|| StageError::EffectNotFound(effect_id.to_string()))?;

        self.effects.remove(idx);
        self.save_effects();
        self.publish(PushEvent::EffectsUpdated(self.effects.clone()));
        Ok(())
    }

    fn add_sequence(&mut self, payload: SequenceCreate) -> Result<SequenceDef, StageError> {
        let name = payload.validate()?;

        let sequence = SequenceDef {
            id: self.id_gen.next("seq"),
            name,
            looped: payload.looped,
            steps: payload.steps,
        };

        info!("Created sequence: {} ({})", sequence.name, sequence.id);
        self.sequences.push(sequence.clone());
        self.save_sequences();
        self.publish(PushEvent::SequencesUpdated(self.sequences.clone()));
        Ok(sequence)
    }

    fn update_sequence(
        &mut self,
        sequence_id: &str,
        update: SequenceUpdate,
    ) -> Result<SequenceDef, StageError> {
        let name = match &update.name {
            Some(name) => Some(super::model::validate_name(name)?),
            None => None,
        };
        if let Some(steps) = &update.steps {
            if steps.len() > super::model::MAX_SEQUENCE_STEPS {
                return Err(StageError::Validation(format!(
                    "Sequence has {} steps (maximum {})",
                    steps.len(),
                    super::model::MAX_SEQUENCE_STEPS
                )));
            }
        }

        let sequence = self
            .sequences
            .iter_mut()
            .find(|s| s.id == sequence_id)
            .ok_or_else(|| StageError::SequenceNotFound(sequence_id.to_string()))?;

        if let Some(name) = name {
            sequence.name = name;
        }
        if let Some(looped) = update.looped {
            sequence.looped = looped;
        }
        if let Some(steps) = update.steps {
            sequence.steps = steps;
        }
        let updated = sequence.clone();

        self.save_sequences();
        self.publish(PushEvent::SequencesUpdated(self.sequences.clone()));
        Ok(updated)
    }

    fn remove_sequence(&mut self, sequence_id: &str) -> Result<(), StageError> {
        self.stop_sequence_runtime(sequence_id);

        let idx = self
            .sequences
            .iter()
            .position(|s| s.id == sequence_id)
            .ok_or_else(|| StageError::SequenceNotFound(sequence_id.to_string()))?;

        self.sequences.remove(idx);
        self.save_sequences();
        self.publish(PushEvent::SequencesUpdated(self.sequences.clone()));
        Ok(())
    }

    // --- companion surface ---

    fn companion_actions(&self) -> Vec<Value> {
        let mut actions = Vec::new();

        for scene in self.scenes.iter() {
            actions.push(json!({
                "id": format!("scene_{}", scene.id),
                "type": "scene",
                "name": format!("Scene: {}", scene.name),
                "color": scene.color,
            }));
        }

        for group in self.groups.iter() {
            actions.push(json!({
                "id": format!("group_{}", group.id),
                "type": "group",
                "name": format!("Group: {}", group.name),
                "actions": ["on", "off", "toggle"],
            }));
        }

        for effect in self.effects.iter() {
            actions.push(json!({
                "id": format!("effect_{}", effect.id),
                "type": "effect",
                "name": format!("Effect: {}", effect.name),
                "effect_type": effect.effect_type,
            }));
        }

        actions
    }

    fn companion_trigger(
        &mut self,
        trigger: CompanionTrigger,
        now: Instant,
    ) -> Result<(), StageError> {
        match trigger.action_type.as_str() {
            "scene" => {
                let scene_id = trigger.id.strip_prefix("scene_").unwrap_or(&trigger.id);
                self.begin_scene_fade(scene_id, now)
            }
            "group" => {
                let group_id = trigger
                    .id
                    .strip_prefix("group_")
                    .unwrap_or(&trigger.id)
                    .to_string();
                let action = trigger.params.action.as_deref().unwrap_or("toggle");

                let intensity = match action {
                    "on" => 255,
                    "off" => 0,
                    _ => {
                        // Toggle based on the first member's first channel.
                        let member_idxs = self.resolve_targets(&[group_id.clone()], true);
                        let current = member_idxs
                            .first()
                            .and_then(|&idx| self.devices[idx].values.first())
                            .copied()
                            .unwrap_or(0);
                        if current > 0 {
                            0
                        } else {
                            255
                        }
                    }
                };

                self.set_group_values(
                    &group_id,
                    GroupValues {
                        intensity: Some(intensity),
                        rgb: None,
                    },
                )
            }
            "effect" => {
                let effect_id = trigger.id.strip_prefix("effect_").unwrap_or(&trigger.id);
                if trigger.params.stop.unwrap_or(false) {
                    self.stop_effect_runtime(effect_id);
                    Ok(())
                } else {
                    self.start_effect_by_def(effect_id, effect_id, now)
                }
            }
            other => Err(StageError::Validation(format!(
                "Unknown action type: '{}'",
                other
            ))),
        }
    }

    // --- plumbing ---

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            devices: self.devices.clone(),
            scenes: self.scenes.clone(),
            groups: self.groups.clone(),
            effects: self.effects.clone(),
            sequences: self.sequences.clone(),
        }
    }

    fn publish(&self, event: PushEvent) {
        if let Err(e) = self.push_tx.try_send(event) {
            warn!("Dropping push event: {}", e);
        }
    }

    fn save_devices(&self) {
        self.store.save(StoreKind::Devices, &self.devices);
    }

    fn save_scenes(&self) {
        self.store.save(StoreKind::Scenes, &self.scenes);
    }

    fn save_groups(&self) {
        self.store.save(StoreKind::Groups, &self.groups);
    }

    fn save_effects(&self) {
        self.store.save(StoreKind::Effects, &self.effects);
    }

    fn save_sequences(&self) {
        self.store.save(StoreKind::Sequences, &self.sequences);
    }

    pub(super) fn handle_message(&mut self, message: ToStageManagerMessage, now: Instant) {
        use ToStageManagerMessage::*;

        match message {
            GetSnapshot(reply_tx) => {
                let _ = reply_tx.send(self.snapshot());
            }

            AddDevice(payload, reply_tx) => {
                let _ = reply_tx.send(self.add_device(payload));
            }
            RemoveDevice(device_id, reply_tx) => {
                let _ = reply_tx.send(self.remove_device(&device_id));
            }
            SetDeviceValues(device_id, values, reply_tx) => {
                let _ = reply_tx.send(self.set_device_values(&device_id, values));
            }
            SetDeviceChannel {
                device_id,
                channel_idx,
                value,
            } => self.set_device_channel(&device_id, channel_idx, value),

            AddScene(payload, reply_tx) => {
                let _ = reply_tx.send(self.add_scene(payload));
            }
            RemoveScene(scene_id, reply_tx) => {
                let _ = reply_tx.send(self.remove_scene(&scene_id));
            }
            ActivateScene(scene_id, reply_tx) => {
                let _ = reply_tx.send(self.begin_scene_fade(&scene_id, now));
            }

            AddGroup(payload, reply_tx) => {
                let _ = reply_tx.send(self.add_group(payload));
            }
            UpdateGroup(group_id, update, reply_tx) => {
                let _ = reply_tx.send(self.update_group(&group_id, update));
            }
            RemoveGroup(group_id, reply_tx) => {
                let _ = reply_tx.send(self.remove_group(&group_id));
            }
            SetGroupValues(group_id, values, reply_tx) => {
                let _ = reply_tx.send(self.set_group_values(&group_id, values));
            }

            AddEffect(payload, reply_tx) => {
                let _ = reply_tx.send(self.add_effect(payload));
            }
            RemoveEffect(effect_id, reply_tx) => {
                let _ = reply_tx.send(self.remove_effect(&effect_id));
            }
            StartEffect(effect_id, reply_tx) => {
                let _ = reply_tx.send(self.start_effect_by_def(&effect_id, &effect_id, now));
            }
            StopEffect(effect_id, reply_tx) => {
                let _ = reply_tx.send(self.stop_effect_runtime(&effect_id));
            }

            AddSequence(payload, reply_tx) => {
                let _ = reply_tx.send(self.add_sequence(payload));
            }
            UpdateSequence(sequence_id, update, reply_tx) => {
                let _ = reply_tx.send(self.update_sequence(&sequence_id, update));
            }
            RemoveSequence(sequence_id, reply_tx) => {
                let _ = reply_tx.send(self.remove_sequence(&sequence_id));
            }
            PlaySequence(sequence_id, reply_tx) => {
                let _ = reply_tx.send(self.play_sequence(&sequence_id, now));
            }
            StopSequence(sequence_id, reply_tx) => {
                let _ = reply_tx.send(self.stop_sequence_runtime(&sequence_id));
            }

            CompanionActions(reply_tx) => {
                let _ = reply_tx.send(self.companion_actions());
            }
            CompanionTrigger(trigger, reply_tx) => {
                let _ = reply_tx.send(self.companion_trigger(trigger, now));
            }

            UpdateAudio(frame) => self.audio = frame.sanitized(),
        }
    }

    #[cfg(test)]
    pub(super) fn active_effect_ids(&self) -> Vec<String> {
        self.active_effects.iter().map(|e| e.id.clone()).collect()
    }

    #[cfg(test)]
    pub(super) fn active_sequence_ids(&self) -> Vec<String> {
        self.active_sequences.iter().map(|e| e.id.clone()).collect()
    }

    #[cfg(test)]
    pub(super) fn is_fading(&self) -> bool {
        self.fade.is_some()
    }
}
