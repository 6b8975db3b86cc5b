// Risk management: position sizing and the daily kill switch
pub mod engine;
pub mod kill_switch;
pub mod sizing;

pub use engine::RiskEngine;
pub use kill_switch::{EquityState, KillSwitch, KillSwitchTransition};
pub use sizing::{floor_to_step, position_size, SizingDecision, SizingRejection};
