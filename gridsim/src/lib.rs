pub mod sim;
pub mod state;

pub use sim::{GridSim, GridSimConfig};
