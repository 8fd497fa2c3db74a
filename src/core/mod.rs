pub mod entity;
pub mod error;

pub use entity::{ChangePatch, Entity, EntityId};
pub use error::{FlowError, Result};
