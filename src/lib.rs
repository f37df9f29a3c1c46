//! Hierarchy Sync Engine: watches Epics/Features/Stories in a work-item
//! tracker, detects significant changes, and drives an LLM generator to
//! keep child Stories (and optionally Test Cases) in sync.

pub mod config;
pub mod control;
pub mod error;
pub mod generator;
pub mod ledger;
pub mod mcp;
pub mod models;
pub mod reconciler;
pub mod scheduler;
pub mod significance;
pub mod snapshot_store;
pub mod token_accountant;
pub mod tracker;
pub mod worker;
