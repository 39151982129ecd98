//! Session state machine and the lifecycle controller.

pub mod controller;
pub mod session;

pub use controller::BotController;
pub use session::{Leg, LegStatus, Session, SessionStatus};
