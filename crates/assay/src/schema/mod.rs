//! Column and value types shared by every part of the engine.

mod column;
mod types;

pub use column::{ColumnId, ColumnOrigin, InputColumn};
pub use types::{DataType, Value};
