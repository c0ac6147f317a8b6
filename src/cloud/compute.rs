//! Compute Engine client for worker instances

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use super::GcpClient;
use crate::error::Result;

const COMPUTE_URL: &str = "https://compute.googleapis.com/compute/v1";
const SERVICE: &str = "compute";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Label identifying which job an instance works for
pub const JOB_LABEL: &str = "turbine-job";

/// Everything needed to create a worker instance
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub machine_type: String,
    pub image_project: String,
    pub image_family: String,
    pub disk_size_gb: u32,
    pub preemptible: bool,
    pub service_account: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

impl InstanceSpec {
    /// Request body for `instances.insert`
    pub fn to_body(&self, zone: &str) -> Value {
        let metadata: Vec<Value> = self
            .metadata
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        let maintenance = if self.preemptible { "TERMINATE" } else { "MIGRATE" };

        json!({
            "name": self.name,
            "machineType": format!("zones/{}/machineTypes/{}", zone, self.machine_type),
            "labels": self.labels,
            "scheduling": {
                "preemptible": self.preemptible,
                "automaticRestart": !self.preemptible,
                "onHostMaintenance": maintenance,
            },
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": format!(
                        "projects/{}/global/images/family/{}",
                        self.image_project, self.image_family
                    ),
                    "diskSizeGb": self.disk_size_gb.to_string(),
                },
            }],
            "networkInterfaces": [{
                "network": "global/networks/default",
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }],
            }],
            "serviceAccounts": [{
                "email": self.service_account.as_deref().unwrap_or("default"),
                "scopes": [CLOUD_PLATFORM_SCOPE],
            }],
            "metadata": { "items": metadata },
        })
    }
}

/// A listed instance
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
    next_page_token: Option<String>,
}

/// Client for the instances of one zone
#[derive(Clone)]
pub struct ComputeClient {
    gcp: GcpClient,
    project: String,
    zone: String,
}

impl ComputeClient {
    /// Create a client
    pub fn new(gcp: GcpClient, project: &str, zone: &str) -> Self {
        Self {
            gcp,
            project: project.to_string(),
            zone: zone.to_string(),
        }
    }

    /// Zone the client manages
    pub fn zone(&self) -> &str {
        &self.zone
    }

    fn instances_url(&self) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances",
            COMPUTE_URL, self.project, self.zone
        )
    }

    /// Start creating an instance (the operation is not awaited)
    pub async fn insert_instance(&self, spec: &InstanceSpec) -> Result<()> {
        let request = self
            .gcp
            .http()
            .post(self.instances_url())
            .json(&spec.to_body(&self.zone));
        self.gcp.send(SERVICE, request).await?;
        tracing::info!(instance = %spec.name, zone = %self.zone, "Requested instance");
        Ok(())
    }

    /// Start deleting an instance; a missing one is not an error
    pub async fn delete_instance(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.instances_url(), name);
        match self.gcp.send(SERVICE, self.gcp.http().delete(url)).await {
            Ok(_) => {
                tracing::info!(instance = name, "Requested instance deletion");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Instances carrying `label=value`
    pub async fn list_instances(&self, label: &str, value: &str) -> Result<Vec<Instance>> {
        let filter = format!("labels.{}={}", label, value);
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("filter", filter.clone())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let request = self.gcp.http().get(self.instances_url()).query(&query);
            let page: InstanceList = self.gcp.send_json(SERVICE, request).await?;
            instances.extend(page.items);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(preemptible: bool) -> InstanceSpec {
        let mut labels = BTreeMap::new();
        labels.insert(JOB_LABEL.to_string(), "sweep".to_string());
        let mut metadata = BTreeMap::new();
        metadata.insert("startup-script".to_string(), "#!/bin/sh\necho hi\n".to_string());

        InstanceSpec {
            name: "turbine-sweep-0".to_string(),
            machine_type: "e2-standard-2".to_string(),
            image_project: "debian-cloud".to_string(),
            image_family: "debian-12".to_string(),
            disk_size_gb: 20,
            preemptible,
            service_account: None,
            labels,
            metadata,
        }
    }

    #[test]
    fn test_insert_body() {
        let body = spec(false).to_body("us-central1-a");
        assert_eq!(body["machineType"], "zones/us-central1-a/machineTypes/e2-standard-2");
        assert_eq!(body["labels"][JOB_LABEL], "sweep");
        assert_eq!(
            body["disks"][0]["initializeParams"]["sourceImage"],
            "projects/debian-cloud/global/images/family/debian-12"
        );
        assert_eq!(body["serviceAccounts"][0]["email"], "default");
        assert_eq!(body["metadata"]["items"][0]["key"], "startup-script");
        assert_eq!(body["scheduling"]["onHostMaintenance"], "MIGRATE");
    }

    #[test]
    fn test_preemptible_scheduling() {
        let body = spec(true).to_body("europe-west1-b");
        assert_eq!(body["scheduling"]["preemptible"], true);
        assert_eq!(body["scheduling"]["automaticRestart"], false);
        assert_eq!(body["scheduling"]["onHostMaintenance"], "TERMINATE");
    }

    #[test]
    fn test_instance_list_parsing() {
        let page: InstanceList = serde_json::from_str(
            r#"{"items":[{"name":"turbine-sweep-0","status":"RUNNING","labels":{"turbine-job":"sweep"}}]}"#,
        )
        .unwrap();
        assert_eq!(page.items[0].name, "turbine-sweep-0");
        assert!(page.next_page_token.is_none());
    }
}
