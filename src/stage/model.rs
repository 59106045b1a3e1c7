use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;

use super::error::StageError;

pub const MAX_DEVICES: usize = 100;
pub const MAX_SCENES: usize = 200;
pub const MAX_GROUPS: usize = 50;
pub const MAX_SEQUENCE_STEPS: usize = 100;
pub const MAX_NAME_LENGTH: usize = 100;
pub const MAX_ACTIVE_EFFECTS: usize = 20;
pub const MAX_ACTIVE_SEQUENCES: usize = 5;

pub const DMX_CHANNEL_MIN: u16 = 1;
pub const DMX_CHANNEL_MAX: u16 = 512;
pub const MAX_UNIVERSE: u16 = 15;

/// Every channel sink clamps to the DMX byte range.
pub fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub ip: IpAddr,
    pub universe: u16,
    pub start_channel: u16,
    pub channel_count: u16,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_layout: Option<Value>,
    pub values: Vec<u8>,
}

impl Device {
    /// rgb and rgbw fixtures carry a color triple on channels 0..2.
    pub fn is_color(&self) -> bool {
        matches!(self.device_type.as_str(), "rgb" | "rgbw")
    }

    pub fn is_dimmer(&self) -> bool {
        self.device_type == "dimmer"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCreate {
    pub name: String,
    pub ip: String,
    pub universe: u16,
    pub start_channel: u16,
    pub channel_count: u16,
    pub device_type: String,
    #[serde(default)]
    pub fixture_id: Option<String>,
    #[serde(default)]
    pub channel_layout: Option<Value>,
}

impl DeviceCreate {
    /// Validate the payload, returning the trimmed name and parsed address.
    pub fn validate(&self) -> Result<(String, IpAddr), StageError> {
        let name = validate_name(&self.name)?;
        let ip = self
            .ip
            .parse::<IpAddr>()
            .map_err(|_| StageError::Validation(String::from("Invalid IP address")))?;

        if self.universe > MAX_UNIVERSE {
            return Err(StageError::Validation(format!(
                "Universe {} out of range (0-{})",
                self.universe, MAX_UNIVERSE
            )));
        }
        if self.start_channel < DMX_CHANNEL_MIN || self.start_channel > DMX_CHANNEL_MAX {
            return Err(StageError::Validation(format!(
                "Start channel {} out of range ({}-{})",
                self.start_channel, DMX_CHANNEL_MIN, DMX_CHANNEL_MAX
            )));
        }
        if self.channel_count < 1 || self.channel_count > DMX_CHANNEL_MAX {
            return Err(StageError::Validation(format!(
                "Channel count {} out of range (1-{})",
                self.channel_count, DMX_CHANNEL_MAX
            )));
        }
        if self.start_channel + self.channel_count - 1 > DMX_CHANNEL_MAX {
            return Err(StageError::Validation(format!(
                "Device spans channels {}-{} which exceeds the universe",
                self.start_channel,
                self.start_channel + self.channel_count - 1
            )));
        }

        Ok((name, ip))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub name: String,
    pub color: String,
    pub device_values: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneCreate {
    pub name: String,
    #[serde(default = "default_scene_color")]
    pub color: String,
    #[serde(default)]
    pub device_values: HashMap<String, Vec<i64>>,
}

fn default_scene_color() -> String {
    String::from("blue")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub device_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupCreate {
    pub name: String,
    pub device_ids: Vec<String>,
}

impl GroupCreate {
    pub fn validate(&self) -> Result<String, StageError> {
        if self.device_ids.is_empty() {
            return Err(StageError::Validation(String::from(
                "Group needs at least one device",
            )));
        }
        validate_name(&self.name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub device_ids: Option<Vec<String>>,
}

/// Mass-set payload for a group: a uniform intensity and/or a color triple
/// for the rgb/rgbw members.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupValues {
    #[serde(default)]
    pub intensity: Option<i64>,
    #[serde(default)]
    pub rgb: Option<[i64; 3]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectDef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub effect_type: String,
    pub target_ids: Vec<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EffectCreate {
    pub name: String,
    #[serde(rename = "type")]
    pub effect_type: String,
    pub target_ids: Vec<String>,
    #[serde(default = "default_params")]
    pub params: Value,
    #[serde(default)]
    pub is_group: bool,
}

fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}

impl EffectCreate {
    pub fn validate(&self) -> Result<String, StageError> {
        if self.target_ids.is_empty() {
            return Err(StageError::Validation(String::from(
                "Effect needs at least one target",
            )));
        }
        validate_name(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Scene,
    Effect,
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(rename = "duration_ms", alias = "duration", default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDef {
    pub id: String,
    pub name: String,
    #[serde(rename = "loop", default)]
    pub looped: bool,
    pub steps: Vec<SequenceStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceCreate {
    pub name: String,
    #[serde(rename = "loop", default)]
    pub looped: bool,
    pub steps: Vec<SequenceStep>,
}

impl SequenceCreate {
    pub fn validate(&self) -> Result<String, StageError> {
        if self.steps.len() > MAX_SEQUENCE_STEPS {
            return Err(StageError::Validation(format!(
                "Sequence has {} steps (maximum {})",
                self.steps.len(),
                MAX_SEQUENCE_STEPS
            )));
        }
        validate_name(&self.name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SequenceUpdate {
    pub name: Option<String>,
    #[serde(rename = "loop")]
    pub looped: Option<bool>,
    pub steps: Option<Vec<SequenceStep>>,
}

/// Latest frequency-band levels pushed by a client. Readers get the raw
/// last sample; there is no smoothing or decay on purpose.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AudioFrame {
    #[serde(default)]
    pub bass: f32,
    #[serde(default)]
    pub mid: f32,
    #[serde(default)]
    pub high: f32,
    #[serde(default)]
    pub overall: f32,
    #[serde(default)]
    pub peak: u32,
}

impl AudioFrame {
    pub fn sanitized(mut self) -> AudioFrame {
        self.bass = self.bass.clamp(0.0, 1.0);
        self.mid = self.mid.clamp(0.0, 1.0);
        self.high = self.high.clamp(0.0, 1.0);
        self.overall = self.overall.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyBand {
    Bass,
    Mid,
    High,
    Overall,
}

impl AudioFrame {
    pub fn band(&self, band: FrequencyBand) -> f32 {
        match band {
            FrequencyBand::Bass => self.bass,
            FrequencyBand::Mid => self.mid,
            FrequencyBand::High => self.high,
            FrequencyBand::Overall => self.overall,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub devices: Vec<Device>,
    pub scenes: Vec<Scene>,
    pub groups: Vec<Group>,
    pub effects: Vec<EffectDef>,
    pub sequences: Vec<SequenceDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanionParams {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub stop: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompanionTrigger {
    #[serde(rename = "type")]
    pub action_type: String,
    pub id: String,
    #[serde(default)]
    pub params: CompanionParams,
}

/// Generator for the `{kind}_{millis}` server-assigned ids. Monotonic even
/// when two creations land in the same millisecond or the clock steps back.
#[derive(Debug, Default)]
pub struct IdGen {
    last_ms: i64,
}

impl IdGen {
    pub fn next(&mut self, kind: &str) -> String {
        let mut ms = Utc::now().timestamp_millis();
        if ms <= self.last_ms {
            ms = self.last_ms + 1;
        }
        self.last_ms = ms;
        format!("{}_{}", kind, ms)
    }

    /// Fold an id loaded from disk into the generator so restarts never
    /// reissue it.
    pub fn observe(&mut self, id: &str) {
        if let Some(suffix) = id.rsplit('_').next() {
            if let Ok(ms) = suffix.parse::<i64>() {
                if ms > self.last_ms {
                    self.last_ms = ms;
                }
            }
        }
    }
}

pub fn validate_name(name: &str) -> Result<String, StageError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StageError::Validation(String::from("Name cannot be empty")));
    }
    if trimmed.len() > MAX_NAME_LENGTH {
        return Err(StageError::Validation(format!(
            "Name longer than {} characters",
            MAX_NAME_LENGTH
        )));
    }
    Ok(trimmed.to_string())
}
