// Built-in profiles for the strategy registry
//
// One module per entity type, plus the association profiles. Each returns
// plain data; nothing here runs consolidation logic.

pub mod associations;
pub mod company;
pub mod counterparty;
pub mod fund;
pub mod investor;
