use crate::terrain_data::QuadCoordinate;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TerrainError {
    #[error("invalid terrain config: {0}")]
    InvalidConfig(String),
    #[error("sampler '{0}' is asynchronous, but does not store parent tiles")]
    InvalidPolicy(String),
    #[error("insufficient tile cache size for sampler '{sampler}' (tile {coordinate})")]
    InsufficientCache {
        sampler: String,
        coordinate: QuadCoordinate,
    },
    #[error("no tile storage named '{0}' has been registered")]
    UnknownStorage(String),
    #[error("failed to produce tile {coordinate}: {reason}")]
    Production {
        coordinate: QuadCoordinate,
        reason: String,
    },
}

pub type TerrainResult<T> = Result<T, TerrainError>;
