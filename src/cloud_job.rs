//! Submit the instruction-generation run to Azure Machine Learning.
//!
//! Talks to the Azure Resource Manager REST API directly:
//!
//! 1. `GET  .../computes/{name}`: the compute target must exist.
//! 2. `PUT  .../environments/{name}/versions/{version}`: register the
//!    container image that ships the `cqa` binary.
//! 3. `PUT  .../jobs/{job}`: a command job running `cqa instruct` with the
//!    corpus as a `uri_file` input and the dataset as an uploaded output.
//!
//! Authentication is a bearer token from `AZURE_ACCESS_TOKEN`, or a
//! service-principal client-credentials grant using `AZURE_TENANT_ID`,
//! `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::CloudConfig;

const ARM_ENDPOINT: &str = "https://management.azure.com";
const ARM_SCOPE: &str = "https://management.azure.com/.default";
const LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";

/// Command run inside the job container.
pub const JOB_COMMAND: &str =
    "cqa instruct --input ${{inputs.input_data}} --output ${{outputs.instruction_dataset}}";

/// Schemes the job service can mount as `uri_file` inputs and outputs.
const REMOTE_SCHEMES: &[&str] = &["azureml://", "https://", "wasbs://", "abfss://"];

/// Whether `path` names datastore or blob storage rather than a local file.
pub fn is_remote_uri(path: &str) -> bool {
    REMOTE_SCHEMES.iter().any(|scheme| path.starts_with(scheme))
}

/// Compute sizes suggested for generation on CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmSize {
    Small,
    Medium,
    Large,
    XLarge,
}

impl VmSize {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            "xlarge" => Some(Self::XLarge),
            _ => None,
        }
    }

    /// Azure VM SKU.
    pub fn sku(&self) -> &'static str {
        match self {
            Self::Small => "Standard_DS3_v2",
            Self::Medium => "Standard_D4_v3",
            Self::Large => "Standard_D8_v3",
            Self::XLarge => "Standard_D16_v3",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Small => "4 cores, 14 GB RAM",
            Self::Medium => "4 cores, 16 GB RAM",
            Self::Large => "8 cores, 32 GB RAM",
            Self::XLarge => "16 cores, 64 GB RAM",
        }
    }
}

/// Workspace coordinates after environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub subscription_id: String,
    pub resource_group: String,
    pub workspace_name: String,
}

impl Workspace {
    /// `SUBSCRIPTION_ID`, `RESOURCE_GROUP` and `WORKSPACE_NAME` override the
    /// `[cloud]` section.
    pub fn resolve(config: &CloudConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let pick = |var: &str, value: &Option<String>, key: &str| -> Result<String> {
            env(var)
                .filter(|v| !v.is_empty())
                .or_else(|| value.clone())
                .ok_or_else(|| anyhow!("Set cloud.{} in config or {} in the environment", key, var))
        };
        Ok(Self {
            subscription_id: pick("SUBSCRIPTION_ID", &config.subscription_id, "subscription_id")?,
            resource_group: pick("RESOURCE_GROUP", &config.resource_group, "resource_group")?,
            workspace_name: pick("WORKSPACE_NAME", &config.workspace_name, "workspace_name")?,
        })
    }

    /// ARM resource id of the workspace.
    pub fn resource_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.MachineLearningServices/workspaces/{}",
            self.subscription_id, self.resource_group, self.workspace_name
        )
    }

    pub fn compute_id(&self, compute: &str) -> String {
        format!("{}/computes/{}", self.resource_id(), compute)
    }

    pub fn environment_id(&self, name: &str, version: &str) -> String {
        format!("{}/environments/{}/versions/{}", self.resource_id(), name, version)
    }

    pub fn job_id(&self, job: &str) -> String {
        format!("{}/jobs/{}", self.resource_id(), job)
    }

    fn url(&self, resource_id: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", ARM_ENDPOINT, resource_id, api_version)
    }

    pub fn studio_url(&self, job: &str) -> String {
        format!("https://ml.azure.com/runs/{}?wsid={}", job, self.resource_id())
    }
}

/// `COMPUTE_NAME` overrides `cloud.compute_name`.
pub fn resolve_compute_name(config: &CloudConfig, env: &dyn Fn(&str) -> Option<String>) -> String {
    env("COMPUTE_NAME")
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| config.compute_name.clone())
}

/// Environment versions are immutable, so the version is derived from the
/// image reference.
pub fn environment_version(image: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

pub fn build_environment_body(config: &CloudConfig) -> Value {
    json!({
        "properties": {
            "description": "Environment for Tunisian insurance QA generation",
            "image": config.image,
            "osType": "Linux"
        }
    })
}

pub fn build_job_body(config: &CloudConfig, compute_id: &str, environment_id: &str) -> Value {
    json!({
        "properties": {
            "jobType": "Command",
            "displayName": config.experiment_name,
            "experimentName": config.experiment_name,
            "computeId": compute_id,
            "environmentId": environment_id,
            "command": JOB_COMMAND,
            "inputs": {
                "input_data": {
                    "jobInputType": "uri_file",
                    "uri": config.input_data_path
                }
            },
            "outputs": {
                "instruction_dataset": {
                    "jobOutputType": "uri_file",
                    "uri": config.output_path,
                    "mode": "Upload"
                }
            },
            "resources": {
                "instanceCount": 1
            }
        }
    })
}

/// How to obtain an ARM bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    AccessToken(String),
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl Credential {
    pub fn from_env(env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(token) = env("AZURE_ACCESS_TOKEN").filter(|t| !t.is_empty()) {
            return Ok(Self::AccessToken(token));
        }
        match (
            env("AZURE_TENANT_ID"),
            env("AZURE_CLIENT_ID"),
            env("AZURE_CLIENT_SECRET"),
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Ok(Self::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            }),
            _ => bail!(
                "No Azure credentials found. Set AZURE_ACCESS_TOKEN, or AZURE_TENANT_ID, \
                 AZURE_CLIENT_ID and AZURE_CLIENT_SECRET for a service principal."
            ),
        }
    }

    pub async fn token(&self, client: &reqwest::Client) -> Result<String> {
        let (tenant_id, client_id, client_secret) = match self {
            Self::AccessToken(token) => return Ok(token.clone()),
            Self::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => (tenant_id, client_id, client_secret),
        };

        let url = format!("{}/{}/oauth2/v2.0/token", LOGIN_ENDPOINT, tenant_id);
        let response = client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", ARM_SCOPE),
            ])
            .send()
            .await
            .context("Azure token request failed")?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!(
                "Azure authentication failed ({}): {}",
                status,
                body.get("error_description")
                    .and_then(Value::as_str)
                    .unwrap_or("no description")
            );
        }
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Azure token response has no access_token"))
    }
}

/// Minimal ARM client for one workspace.
pub struct AzureMlClient {
    client: reqwest::Client,
    token: String,
    workspace: Workspace,
    api_version: String,
}

impl AzureMlClient {
    pub fn new(client: reqwest::Client, token: String, workspace: Workspace, api_version: &str) -> Self {
        Self {
            client,
            token,
            workspace,
            api_version: api_version.to_string(),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Option<Value>> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("Azure ML API error {}: {}", status, text);
        }
        Ok(Some(serde_json::from_str(&text).unwrap_or(Value::Null)))
    }

    pub async fn get_compute(&self, name: &str) -> Result<Option<Value>> {
        let url = self
            .workspace
            .url(&self.workspace.compute_id(name), &self.api_version);
        self.send(self.client.get(&url)).await
    }

    pub async fn list_computes(&self) -> Result<Vec<String>> {
        let url = self.workspace.url(
            &format!("{}/computes", self.workspace.resource_id()),
            &self.api_version,
        );
        let body = self.send(self.client.get(&url)).await?.unwrap_or(Value::Null);
        Ok(compute_names(&body))
    }

    pub async fn put_environment(&self, name: &str, version: &str, body: &Value) -> Result<()> {
        let url = self
            .workspace
            .url(&self.workspace.environment_id(name, version), &self.api_version);
        self.send(self.client.put(&url).json(body))
            .await?
            .ok_or_else(|| anyhow!("Workspace not found while registering environment"))?;
        Ok(())
    }

    pub async fn put_job(&self, job: &str, body: &Value) -> Result<Value> {
        let url = self
            .workspace
            .url(&self.workspace.job_id(job), &self.api_version);
        self.send(self.client.put(&url).json(body))
            .await?
            .ok_or_else(|| anyhow!("Workspace not found while submitting job"))
    }
}

fn compute_names(list: &Value) -> Vec<String> {
    list.get("value")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| c.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn compute_vm_size(compute: &Value) -> Option<&str> {
    compute
        .pointer("/properties/properties/vmSize")
        .and_then(Value::as_str)
}

/// What the platform reported for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub name: String,
    pub status: String,
    pub studio_url: String,
}

fn submitted_job(response: &Value, name: &str, workspace: &Workspace) -> SubmittedJob {
    let properties = response.get("properties");
    SubmittedJob {
        name: response
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string(),
        status: properties
            .and_then(|p| p.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        studio_url: properties
            .and_then(|p| p.pointer("/services/Studio/endpoint"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| workspace.studio_url(name)),
    }
}

fn new_job_name(experiment: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", experiment, &id[..8])
}

/// `cqa submit`
pub async fn run_submit(config: &CloudConfig, dry_run: bool) -> Result<()> {
    let env = |name: &str| std::env::var(name).ok();
    let workspace = Workspace::resolve(config, &env)?;
    let compute = resolve_compute_name(config, &env);
    let vm = VmSize::parse(&config.vm_size)
        .ok_or_else(|| anyhow!("Unknown cloud.vm_size '{}'", config.vm_size))?;

    let version = environment_version(&config.image);
    let environment_id = workspace.environment_id(&config.environment_name, &version);
    let job_name = new_job_name(&config.experiment_name);
    let job_body = build_job_body(config, &workspace.compute_id(&compute), &environment_id);

    if dry_run {
        println!("submit (dry-run)");
        println!("  workspace: {}", workspace.resource_id());
        println!("  compute: {}", compute);
        println!("  suggested vm size: {} ({})", vm.sku(), vm.describe());
        println!("  environment: {}:{}", config.environment_name, version);
        println!("  job: {}", job_name);
        println!("{}", serde_json::to_string_pretty(&job_body)?);
        return Ok(());
    }

    let credential = Credential::from_env(&env)?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let token = credential.token(&http).await?;
    let client = AzureMlClient::new(http, token, workspace.clone(), &config.api_version);

    match client.get_compute(&compute).await? {
        Some(target) => {
            println!("Found compute target: {}", compute);
            if let Some(size) = compute_vm_size(&target) {
                println!("  current VM size: {}", size);
            }
            println!("  suggested VM size: {} ({})", vm.sku(), vm.describe());
        }
        None => {
            let available = client.list_computes().await.unwrap_or_default();
            bail!(
                "Compute cluster '{}' not found. Available compute targets: {}",
                compute,
                if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available.join(", ")
                }
            );
        }
    }

    client
        .put_environment(
            &config.environment_name,
            &version,
            &build_environment_body(config),
        )
        .await?;
    tracing::info!(environment = %environment_id, "environment registered");

    let response = client.put_job(&job_name, &job_body).await?;
    let job = submitted_job(&response, &job_name, &workspace);

    println!("submit");
    println!("  job: {}", job.name);
    println!("  status: {}", job.status);
    println!("  studio: {}", job.studio_url);
    println!("ok");
    Ok(())
}
