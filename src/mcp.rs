//! MCP tool surface (§6): the same operations exposed over `control::router`,
//! offered here as plain async functions so an MCP stdio transport can wire
//! them up as tools without duplicating any Scheduler/Accountant logic. No
//! transport is implemented — stdio/MCP wiring is an external collaborator
//! (§1) — this module only documents and exercises the tool surface.

use std::sync::{Arc, RwLock as StdRwLock};

use serde::Serialize;

use crate::config::Config;
use crate::models::SyncResult;
use crate::scheduler::{RootSummary, Scheduler, SchedulerStatus};
use crate::token_accountant::{Dashboard, TokenAccountant, TokenStats};

/// One entry per MCP tool this façade would register, named to match the
/// HTTP routes in `control::router` so the two surfaces stay in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Status,
    Roots,
    ForceCheck,
    ForceReextract,
    Stats,
    TokensDashboard,
}

impl Tool {
    pub fn name(self) -> &'static str {
        match self {
            Tool::Status => "hierarchy_sync.status",
            Tool::Roots => "hierarchy_sync.roots",
            Tool::ForceCheck => "hierarchy_sync.force_check",
            Tool::ForceReextract => "hierarchy_sync.force_reextract",
            Tool::Stats => "hierarchy_sync.stats",
            Tool::TokensDashboard => "hierarchy_sync.tokens_dashboard",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ToolError(String);

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ToolError {}

/// Holds the same handles `ControlState` does, so a future stdio transport
/// can share one `Scheduler`/`TokenAccountant` pair with the HTTP surface.
#[derive(Clone)]
pub struct McpTools {
    scheduler: Arc<Scheduler>,
    accountant: Arc<TokenAccountant>,
    config: Arc<StdRwLock<Config>>,
}

impl McpTools {
    pub fn new(
        scheduler: Arc<Scheduler>,
        accountant: Arc<TokenAccountant>,
        config: Arc<StdRwLock<Config>>,
    ) -> Self {
        McpTools {
            scheduler,
            accountant,
            config,
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub fn roots(&self) -> Vec<RootSummary> {
        self.scheduler.roots()
    }

    pub async fn force_check(&self, root_id: &str) -> Result<SyncResult, ToolError> {
        self.scheduler
            .force_check(root_id)
            .await
            .ok_or_else(|| ToolError(format!("root not monitored: {root_id}")))
    }

    pub async fn force_reextract(&self, root_id: &str) -> Result<SyncResult, ToolError> {
        if !self.config.read().expect("config lock poisoned").manual_override_enabled {
            return Err(ToolError("manual_override_enabled is false".to_string()));
        }
        self.scheduler
            .force_reextract(root_id)
            .await
            .ok_or_else(|| ToolError(format!("root not monitored: {root_id}")))
    }

    pub fn stats(&self) -> TokenStats {
        self.accountant.stats()
    }

    pub fn tokens_dashboard(&self) -> Dashboard {
        self.accountant.dashboard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_match_control_routes() {
        assert_eq!(Tool::Status.name(), "hierarchy_sync.status");
        assert_eq!(Tool::ForceReextract.name(), "hierarchy_sync.force_reextract");
    }
}
