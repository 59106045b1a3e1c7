use serde_json::{json, Value};
use tokio::sync::oneshot::Sender;

use crate::stage::model::{
    AudioFrame, CompanionTrigger, Device, DeviceCreate, EffectCreate, EffectDef, Group,
    GroupCreate, GroupUpdate, GroupValues, Scene, SceneCreate, SequenceCreate, SequenceDef,
    SequenceUpdate, StateSnapshot,
};
use crate::stage::StageError;

#[derive(Debug)]
pub enum ToStageManagerMessage {
    GetSnapshot(Sender<StateSnapshot>),

    AddDevice(DeviceCreate, Sender<Result<Device, StageError>>),
    RemoveDevice(String, Sender<Result<(), StageError>>),
    SetDeviceValues(String, Vec<i64>, Sender<Result<Vec<u8>, StageError>>),
    SetDeviceChannel {
        device_id: String,
        channel_idx: usize,
        value: i64,
    },

    AddScene(SceneCreate, Sender<Result<Scene, StageError>>),
    RemoveScene(String, Sender<Result<(), StageError>>),
    ActivateScene(String, Sender<Result<(), StageError>>),

    AddGroup(GroupCreate, Sender<Result<Group, StageError>>),
    UpdateGroup(String, GroupUpdate, Sender<Result<Group, StageError>>),
    RemoveGroup(String, Sender<Result<(), StageError>>),
    SetGroupValues(String, GroupValues, Sender<Result<(), StageError>>),

    AddEffect(EffectCreate, Sender<Result<EffectDef, StageError>>),
    RemoveEffect(String, Sender<Result<(), StageError>>),
    StartEffect(String, Sender<Result<(), StageError>>),
    StopEffect(String, Sender<bool>),

    AddSequence(SequenceCreate, Sender<Result<SequenceDef, StageError>>),
    UpdateSequence(String, SequenceUpdate, Sender<Result<SequenceDef, StageError>>),
    RemoveSequence(String, Sender<Result<(), StageError>>),
    PlaySequence(String, Sender<Result<(), StageError>>),
    StopSequence(String, Sender<bool>),

    CompanionActions(Sender<Vec<Value>>),
    CompanionTrigger(CompanionTrigger, Sender<Result<(), StageError>>),

    UpdateAudio(AudioFrame),
}

/// State delta fanned out to every push subscriber.
#[derive(Debug, Clone)]
pub enum PushEvent {
    DevicesUpdated(Vec<Device>),
    DeviceValuesUpdated { device_id: String, values: Vec<u8> },
    ScenesUpdated(Vec<Scene>),
    GroupsUpdated(Vec<Group>),
    EffectsUpdated(Vec<EffectDef>),
    SequencesUpdated(Vec<SequenceDef>),
}

impl PushEvent {
    pub fn to_json(&self) -> Value {
        match self {
            PushEvent::DevicesUpdated(devices) => {
                json!({"type": "devices_updated", "devices": devices})
            }
            PushEvent::DeviceValuesUpdated { device_id, values } => {
                json!({"type": "device_values_updated", "device_id": device_id, "values": values})
            }
            PushEvent::ScenesUpdated(scenes) => {
                json!({"type": "scenes_updated", "scenes": scenes})
            }
            PushEvent::GroupsUpdated(groups) => {
                json!({"type": "groups_updated", "groups": groups})
            }
            PushEvent::EffectsUpdated(effects) => {
                json!({"type": "effects_updated", "effects": effects})
            }
            PushEvent::SequencesUpdated(sequences) => {
                json!({"type": "sequences_updated", "sequences": sequences})
            }
        }
    }
}
