
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtnetError {
    #[error("{0}")]
    Context(String),
}
