//! Domain models: campaigns, leads, operator sessions and websocket events.

pub mod campaign;
pub mod events;
pub mod lead;
pub mod operator;

pub use campaign::{Campaign, CampaignError, CampaignStats, CampaignStatus};
pub use events::{EventType, WsMessage};
pub use lead::{CallAttempt, Lead, LeadError, LeadStatus};
pub use operator::{OperatorInfo, OperatorSession, OperatorStatus};
