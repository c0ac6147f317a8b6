//! Compute Engine worker fleets
//!
//! Each instance boots with a startup script that fetches the `turbine`
//! binary from the bucket (when it is not baked into the image), writes the
//! worker configuration from instance metadata and starts a worker that
//! deletes its own instance once the queue stays empty.

use std::collections::BTreeMap;

use crate::cloud::compute::{Instance, JOB_LABEL};
use crate::cloud::{ComputeClient, InstanceSpec};
use crate::config::Config;
use crate::error::{Result, TurbineError};
use crate::models::validate_resource_name;

/// Object the worker binary is uploaded to
pub const BINARY_OBJECT: &str = "bin/turbine";

/// Metadata key carrying the worker configuration
pub const CONFIG_METADATA_KEY: &str = "turbine-config";

/// Name of the `index`th instance for a job
pub fn instance_name(prefix: &str, job: &str, index: usize) -> Result<String> {
    let name = format!("{}-{}-{}", prefix, job, index);
    validate_resource_name(&name)?;
    Ok(name)
}

/// Configuration handed to fleet workers
pub fn worker_config(config: &Config, idle_polls: u32) -> Result<String> {
    let mut worker = config.clone();
    worker.worker.idle_polls = idle_polls;
    worker.worker.work_dir = None;
    worker.cloud.pubsub_endpoint = None;
    worker.cloud.storage_endpoint = None;
    toml::to_string_pretty(&worker).map_err(|e| TurbineError::config(e.to_string()))
}

/// Startup script run as root when an instance boots
pub fn startup_script(config: &Config, job: &str) -> Result<String> {
    let bucket = config.bucket()?;
    let binary = &config.fleet.worker_command;
    let object = BINARY_OBJECT.replace('/', "%2F");

    Ok(format!(
        r#"#!/bin/sh
set -e
MD=http://metadata.google.internal/computeMetadata/v1
mkdir -p /etc/turbine
curl -sf -H 'Metadata-Flavor: Google' "$MD/instance/attributes/{key}" > /etc/turbine/config.toml
if [ ! -x {binary} ]; then
  TOKEN=$(curl -sf -H 'Metadata-Flavor: Google' "$MD/instance/service-accounts/default/token" | sed -E 's/.*"access_token":"([^"]*)".*/\1/')
  curl -sf -H "Authorization: Bearer $TOKEN" -o {binary} "https://storage.googleapis.com/storage/v1/b/{bucket}/o/{object}?alt=media"
  chmod 755 {binary}
fi
exec {binary} --config /etc/turbine/config.toml worker --job {job} --shutdown-when-idle
"#,
        key = CONFIG_METADATA_KEY,
        job = job,
        binary = binary,
        bucket = bucket,
        object = object,
    ))
}

/// Build the instance specs for `count` workers of a job
pub fn instance_specs(
    config: &Config,
    job: &str,
    count: usize,
    first_index: usize,
    idle_polls: u32,
) -> Result<Vec<InstanceSpec>> {
    validate_resource_name(job)?;
    if idle_polls == 0 {
        return Err(TurbineError::config(
            "fleet workers need idle polls > 0 or they never shut down",
        ));
    }

    let script = startup_script(config, job)?;
    let worker_config = worker_config(config, idle_polls)?;

    (first_index..first_index + count)
        .map(|index| {
            let mut labels = BTreeMap::new();
            labels.insert(JOB_LABEL.to_string(), job.to_string());

            let mut metadata = BTreeMap::new();
            metadata.insert("startup-script".to_string(), script.clone());
            metadata.insert(CONFIG_METADATA_KEY.to_string(), worker_config.clone());

            Ok(InstanceSpec {
                name: instance_name(&config.fleet.instance_prefix, job, index)?,
                machine_type: config.fleet.machine_type.clone(),
                image_project: config.fleet.image_project.clone(),
                image_family: config.fleet.image_family.clone(),
                disk_size_gb: config.fleet.disk_size_gb,
                preemptible: config.fleet.preemptible,
                service_account: config.fleet.service_account.clone(),
                labels,
                metadata,
            })
        })
        .collect()
}

/// Start `count` worker instances for a job; returns their names
pub async fn launch(
    compute: &ComputeClient,
    config: &Config,
    job: &str,
    count: usize,
    idle_polls: u32,
) -> Result<Vec<String>> {
    let existing = compute.list_instances(JOB_LABEL, job).await?;
    let first_index = next_index(&existing, &config.fleet.instance_prefix, job);

    let specs = instance_specs(config, job, count, first_index, idle_polls)?;
    let mut names = Vec::with_capacity(specs.len());
    for spec in &specs {
        compute.insert_instance(spec).await?;
        names.push(spec.name.clone());
    }

    tracing::info!(job, count = names.len(), zone = compute.zone(), "Launched workers");
    Ok(names)
}

/// Delete every instance working for a job; returns their names
pub async fn teardown(compute: &ComputeClient, job: &str) -> Result<Vec<String>> {
    let instances = compute.list_instances(JOB_LABEL, job).await?;
    let mut names = Vec::with_capacity(instances.len());
    for instance in instances {
        compute.delete_instance(&instance.name).await?;
        names.push(instance.name);
    }

    tracing::info!(job, count = names.len(), "Tore down workers");
    Ok(names)
}

/// First unused instance index, so relaunching adds workers instead of colliding
fn next_index(existing: &[Instance], prefix: &str, job: &str) -> usize {
    let stem = format!("{}-{}-", prefix, job);
    existing
        .iter()
        .filter_map(|instance| instance.name.strip_prefix(&stem)?.parse::<usize>().ok())
        .map(|index| index + 1)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.set("cloud.project", "proj").unwrap();
        config
    }

    #[test]
    fn test_instance_names() {
        assert_eq!(instance_name("turbine", "sweep", 3).unwrap(), "turbine-sweep-3");
        let long_job = "j".repeat(60);
        assert!(instance_name("turbine", &long_job, 0).is_err());
    }

    #[test]
    fn test_startup_script_mentions_bucket_and_worker() {
        let script = startup_script(&config(), "sweep").unwrap();
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("/b/proj-turbine/o/bin%2Fturbine?alt=media"));
        assert!(script.contains("worker --job sweep --shutdown-when-idle"));
        assert!(script.contains("instance/attributes/turbine-config"));
    }

    #[test]
    fn test_specs_carry_label_and_config() {
        let specs = instance_specs(&config(), "sweep", 2, 4, 6).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "turbine-sweep-4");
        assert_eq!(specs[1].name, "turbine-sweep-5");
        assert_eq!(specs[0].labels.get(JOB_LABEL).map(String::as_str), Some("sweep"));

        let worker_toml = specs[0].metadata.get(CONFIG_METADATA_KEY).unwrap();
        let parsed: Config = toml::from_str(worker_toml).unwrap();
        assert_eq!(parsed.worker.idle_polls, 6);
        assert_eq!(parsed.cloud.project.as_deref(), Some("proj"));

        assert!(instance_specs(&config(), "sweep", 1, 0, 0).is_err());
    }

    #[test]
    fn test_next_index() {
        let existing: Vec<Instance> = ["turbine-sweep-0", "turbine-sweep-7", "other-sweep-9"]
            .iter()
            .map(|name| Instance {
                name: name.to_string(),
                status: "RUNNING".to_string(),
                labels: BTreeMap::new(),
            })
            .collect();
        assert_eq!(next_index(&existing, "turbine", "sweep"), 8);
        assert_eq!(next_index(&[], "turbine", "sweep"), 0);
    }
}
