
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Scene '{0}' not found")]
    SceneNotFound(String),

    #[error("Group '{0}' not found")]
    GroupNotFound(String),

    #[error("Effect '{0}' not found")]
    EffectNotFound(String),

    #[error("Sequence '{0}' not found")]
    SequenceNotFound(String),

    #[error("Maximum {0} limit ({1}) reached")]
    LimitReached(&'static str, usize),

    #[error("Device with same IP, universe, and channel already exists")]
    DuplicateDeviceAddress,

    #[error("Unknown effect type: '{0}'")]
    UnknownEffectType(String),

    #[error("Invalid {0} parameters: {1}")]
    InvalidEffectParams(&'static str, #[source] serde_json::Error),

    #[error("Custom effect needs at least 2 keyframes")]
    NotEnoughKeyframes,

    #[error("{0}")]
    Validation(String),
}

impl StageError {
    /// Missing-id errors answer with `success: false` instead of a 4xx
    /// status; everything else is a client error.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StageError::DeviceNotFound(_)
                | StageError::SceneNotFound(_)
                | StageError::GroupNotFound(_)
                | StageError::EffectNotFound(_)
                | StageError::SequenceNotFound(_)
        )
    }
}
