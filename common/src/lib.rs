pub mod error;
pub mod grid;
pub mod ids;
pub mod payload;

pub use error::ProtocolError;
pub use grid::{Availability, GridClient, TaskStatus};
pub use ids::{new_result_id, ResultId, SessionId, TaskId, TaskOptions, TaskRequest};
pub use payload::{ComputeOp, TaskPayload};
