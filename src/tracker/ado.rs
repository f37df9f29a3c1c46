//! Azure DevOps Tracker Adapter: a thin `reqwest` client over the Work
//! Item Tracking REST API, grounded on `ado_client.py` in
//! `original_source/` (WIQL queries, JSON-patch create/update, the
//! `System.LinkTypes.Hierarchy-*` relation for parent-child links). This
//! is the one concrete implementation of `TrackerAdapter`; the trait
//! itself is the contract boundary (§6 calls the tracker client an
//! external collaborator), same split as `OpenAiGenerator` for
//! `GeneratorAdapter`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode as ReqwestStatus};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ExistingChild, FieldMap, FeatureNode, Hierarchy, Root, RootType, TrackerAdapter};
use crate::error::TrackerError;

const API_VERSION: &str = "7.1";
const HIERARCHY_FORWARD: &str = "System.LinkTypes.Hierarchy-Forward";
const HIERARCHY_REVERSE: &str = "System.LinkTypes.Hierarchy-Reverse";

#[derive(Debug, Clone)]
pub struct AdoConfig {
    pub organization: String,
    pub project: String,
    pub personal_access_token: String,
    pub timeout_seconds: u64,
}

impl AdoConfig {
    /// Reads `ADO_ORGANIZATION`, `ADO_PROJECT`, `ADO_PAT` from the
    /// environment, the same variable names as `config.settings.Settings`
    /// in `original_source/`.
    pub fn from_env() -> Result<Self, TrackerError> {
        let organization = std::env::var("ADO_ORGANIZATION")
            .map_err(|_| TrackerError::Unavailable("ADO_ORGANIZATION not set".into()))?;
        let project = std::env::var("ADO_PROJECT")
            .map_err(|_| TrackerError::Unavailable("ADO_PROJECT not set".into()))?;
        let personal_access_token = std::env::var("ADO_PAT")
            .map_err(|_| TrackerError::Unavailable("ADO_PAT not set".into()))?;
        Ok(AdoConfig {
            organization,
            project,
            personal_access_token,
            timeout_seconds: 30,
        })
    }
}

pub struct AdoTracker {
    config: AdoConfig,
    client: Client,
}

#[derive(Deserialize)]
struct WiqlResult {
    #[serde(rename = "workItems")]
    work_items: Vec<WiqlWorkItemRef>,
}

#[derive(Deserialize)]
struct WiqlWorkItemRef {
    id: u64,
}

#[derive(Deserialize)]
struct WorkItemsBatch {
    value: Vec<WorkItem>,
}

#[derive(Deserialize)]
struct WorkItem {
    id: u64,
    fields: HashMap<String, Value>,
    #[serde(default)]
    relations: Vec<WorkItemRelation>,
}

#[derive(Deserialize, Clone)]
struct WorkItemRelation {
    rel: String,
    url: String,
}

impl AdoTracker {
    pub fn new(config: AdoConfig) -> Result<Self, TrackerError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
        Ok(AdoTracker { config, client })
    }

    fn org_url(&self) -> String {
        format!("https://dev.azure.com/{}", self.config.organization)
    }

    fn map_status(status: ReqwestStatus, id: &str) -> TrackerError {
        match status {
            ReqwestStatus::NOT_FOUND => TrackerError::NotFound(id.to_string()),
            ReqwestStatus::REQUEST_TIMEOUT | ReqwestStatus::GATEWAY_TIMEOUT => TrackerError::Timeout,
            other => TrackerError::Unavailable(format!("HTTP {other}")),
        }
    }

    async fn get_work_items(&self, ids: &[u64], expand_relations: bool) -> Result<Vec<WorkItem>, TrackerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_list = ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
        let mut url = format!(
            "{}/_apis/wit/workitems?ids={}&api-version={}",
            self.org_url(),
            id_list,
            API_VERSION
        );
        if expand_relations {
            url.push_str("&$expand=relations");
        }

        let response = self
            .client
            .get(&url)
            .basic_auth("", Some(&self.config.personal_access_token))
            .send()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), &id_list));
        }

        let batch: WorkItemsBatch = response
            .json()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
        Ok(batch.value)
    }

    async fn get_work_item(&self, id: &str, expand_relations: bool) -> Result<WorkItem, TrackerError> {
        let numeric: u64 = id
            .parse()
            .map_err(|_| TrackerError::NotFound(id.to_string()))?;
        let mut items = self.get_work_items(&[numeric], expand_relations).await?;
        items
            .pop()
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    fn field(item: &WorkItem, name: &str) -> String {
        item.fields
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn field_opt(item: &WorkItem, name: &str) -> Option<String> {
        item.fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn to_root(item: &WorkItem) -> Root {
        let root_type = Self::field(item, "System.WorkItemType")
            .parse()
            .unwrap_or(RootType::Epic);
        let last_modified = item
            .fields
            .get("System.ChangedDate")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Root {
            id: item.id.to_string(),
            root_type,
            title: Self::field(item, "System.Title"),
            description: Self::field(item, "System.Description"),
            state: Self::field(item, "System.State"),
            priority: Self::field_opt(item, "Microsoft.VSTS.Common.Priority"),
            area_path: Self::field_opt(item, "System.AreaPath"),
            iteration_path: Self::field_opt(item, "System.IterationPath"),
            last_modified,
        }
    }

    fn to_existing_child(item: &WorkItem, parent_id: &str) -> ExistingChild {
        ExistingChild {
            id: item.id.to_string(),
            title: Self::field(item, "System.Title"),
            description: Self::field(item, "System.Description"),
            state: Self::field(item, "System.State"),
            parent_id: parent_id.to_string(),
        }
    }

    fn child_ids(item: &WorkItem) -> Vec<u64> {
        item.relations
            .iter()
            .filter(|r| r.rel == HIERARCHY_FORWARD)
            .filter_map(|r| r.url.rsplit('/').next())
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    async fn wiql(&self, query: &str) -> Result<Vec<u64>, TrackerError> {
        let url = format!(
            "{}/{}/_apis/wit/wiql?api-version={}",
            self.org_url(),
            self.config.project,
            API_VERSION
        );
        let response = self
            .client
            .post(&url)
            .basic_auth("", Some(&self.config.personal_access_token))
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), "wiql"));
        }

        let result: WiqlResult = response
            .json()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
        Ok(result.work_items.into_iter().map(|w| w.id).collect())
    }
}

#[async_trait]
impl TrackerAdapter for AdoTracker {
    async fn get_root(&self, id: &str) -> Result<Root, TrackerError> {
        let item = self.get_work_item(id, false).await?;
        Ok(Self::to_root(&item))
    }

    async fn get_children(&self, id: &str) -> Result<Vec<ExistingChild>, TrackerError> {
        let parent = self.get_work_item(id, true).await?;
        let child_ids = Self::child_ids(&parent);
        let children = self.get_work_items(&child_ids, false).await?;
        Ok(children.iter().map(|c| Self::to_existing_child(c, id)).collect())
    }

    async fn get_hierarchy(&self, root_id: &str) -> Result<Hierarchy, TrackerError> {
        let root = self.get_work_item(root_id, true).await?;
        let feature_ids = Self::child_ids(&root);
        let feature_items = self.get_work_items(&feature_ids, true).await?;

        let mut features = Vec::with_capacity(feature_items.len());
        for feature in &feature_items {
            let story_ids = Self::child_ids(feature);
            let story_items = self.get_work_items(&story_ids, false).await?;
            let feature_id = feature.id.to_string();
            features.push(FeatureNode {
                id: feature_id.clone(),
                title: Self::field(feature, "System.Title"),
                stories: story_items
                    .iter()
                    .map(|s| Self::to_existing_child(s, &feature_id))
                    .collect(),
            });
        }

        Ok(Hierarchy { features })
    }

    async fn list_by_type(&self, root_type: RootType) -> Result<Vec<String>, TrackerError> {
        let query = format!(
            "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = '{}' AND [System.WorkItemType] = '{}'",
            self.config.project,
            root_type.as_str()
        );
        let ids = self.wiql(&query).await?;
        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    async fn create(
        &self,
        root_type: RootType,
        fields: FieldMap,
        parent: Option<&str>,
    ) -> Result<String, TrackerError> {
        let ops: Vec<Value> = fields
            .into_iter()
            .filter_map(|(name, value)| {
                let ado_field = match name.as_str() {
                    "title" => "/fields/System.Title",
                    "description" => "/fields/System.Description",
                    "priority" => "/fields/Microsoft.VSTS.Common.Priority",
                    _ => return None,
                };
                Some(json!({ "op": "add", "path": ado_field, "value": value }))
            })
            .collect();

        let url = format!(
            "{}/{}/_apis/wit/workitems/${}?api-version={}",
            self.org_url(),
            self.config.project,
            root_type.as_str(),
            API_VERSION
        );

        let response = self
            .client
            .post(&url)
            .basic_auth("", Some(&self.config.personal_access_token))
            .header("Content-Type", "application/json-patch+json")
            .json(&ops)
            .send()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), "create"));
        }

        let created: WorkItem = response
            .json()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
        let id = created.id.to_string();

        if let Some(parent_id) = parent {
            self.link_parent_child(parent_id, &id).await?;
        }

        Ok(id)
    }

    async fn update(&self, id: &str, fields: FieldMap) -> Result<(), TrackerError> {
        let ops: Vec<Value> = fields
            .into_iter()
            .filter_map(|(name, value)| {
                let ado_field = match name.as_str() {
                    "title" => "/fields/System.Title",
                    "description" => "/fields/System.Description",
                    "priority" => "/fields/Microsoft.VSTS.Common.Priority",
                    _ => return None,
                };
                Some(json!({ "op": "add", "path": ado_field, "value": value }))
            })
            .collect();

        let url = format!(
            "{}/_apis/wit/workitems/{}?api-version={}",
            self.org_url(),
            id,
            API_VERSION
        );

        let response = self
            .client
            .patch(&url)
            .basic_auth("", Some(&self.config.personal_access_token))
            .header("Content-Type", "application/json-patch+json")
            .json(&ops)
            .send()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), id));
        }
        Ok(())
    }

    async fn link_parent_child(&self, parent: &str, child: &str) -> Result<(), TrackerError> {
        let parent_url = format!("{}/_apis/wit/workitems/{}", self.org_url(), parent);
        let ops = json!([{
            "op": "add",
            "path": "/relations/-",
            "value": {
                "rel": HIERARCHY_REVERSE,
                "url": parent_url,
            },
        }]);

        let url = format!(
            "{}/_apis/wit/workitems/{}?api-version={}",
            self.org_url(),
            child,
            API_VERSION
        );

        let response = self
            .client
            .patch(&url)
            .basic_auth("", Some(&self.config.personal_access_token))
            .header("Content-Type", "application/json-patch+json")
            .json(&ops)
            .send()
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), child));
        }
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, TrackerError> {
        match self.get_work_item(id, false).await {
            Ok(_) => Ok(true),
            Err(TrackerError::NotFound(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }
}
