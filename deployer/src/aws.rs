use crate::{
    AppSpecContent, CodeDeployMediator, ContainerDefinition, EcsMediator, Service, Task,
    TaskDefinition, TaskDefinitionTemplate, Volume,
};
use async_trait::async_trait;
use log::debug;
use rusoto_codedeploy::{
    AppSpecContent as RemoteAppSpecContent, CodeDeploy, CodeDeployClient, CreateDeploymentInput,
    RevisionLocation,
};
use rusoto_core::{Client, Region, RusotoError};
use rusoto_credential::{DefaultCredentialsProvider, ProfileProvider};
use rusoto_ecs::{
    DescribeServicesError, DescribeServicesRequest, DescribeTaskDefinitionRequest,
    DescribeTasksRequest, Ecs, EcsClient, ListTasksRequest, RegisterTaskDefinitionRequest,
    UpdateServiceRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu};
use std::path::PathBuf;
use std::str::FromStr;

// DescribeTasks accepts at most this many task ARNs per call
const DESCRIBE_TASKS_BATCH: usize = 100;

const AWS_CONFIG_FILE: &str = "AWS_CONFIG_FILE";
const DEFAULT_PROFILE: &str = "default";

type Result<T> = std::result::Result<T, Error>;

/// The error type for this module.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Cluster {} not found", cluster))]
    ClusterNotFound { cluster: String },

    #[snafu(display("Failed to read AWS config file {}: {}", path.display(), source))]
    ConfigFile {
        path: PathBuf,
        source: rusoto_credential::CredentialsError,
    },

    #[snafu(display("Failed to convert `{}` {} between ECS and local form: {}", api, field, source))]
    Convert {
        api: &'static str,
        field: &'static str,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to create the default AWS credentials provider: {}", source))]
    DefaultProvider {
        source: rusoto_credential::CredentialsError,
    },

    #[snafu(display(
        "Failed to create deployment for application {} and group {}: {}",
        application_name,
        deployment_group_name,
        source
    ))]
    CreateDeployment {
        application_name: String,
        deployment_group_name: String,
        source: RusotoError<rusoto_codedeploy::CreateDeploymentError>,
    },

    #[snafu(display("Missing field in `create_deployment` response: {}", field))]
    CodeDeployMissingField { field: &'static str },

    #[snafu(display("Failed to describe service {}: {}", service, source))]
    DescribeServices {
        service: String,
        source: RusotoError<DescribeServicesError>,
    },

    #[snafu(display("Failed to describe task definition {}: {}", task_definition, source))]
    DescribeTaskDefinition {
        task_definition: String,
        source: RusotoError<rusoto_ecs::DescribeTaskDefinitionError>,
    },

    #[snafu(display("Failed to describe tasks: {}", source))]
    DescribeTasks {
        source: RusotoError<rusoto_ecs::DescribeTasksError>,
    },

    #[snafu(display("Missing field in `{}` response: {}", api, field))]
    EcsMissingField {
        api: &'static str,
        field: &'static str,
    },

    #[snafu(display("Failed to create HTTP client: {}", source))]
    HttpClient {
        source: rusoto_core::request::TlsError,
    },

    #[snafu(display("Failed to list tasks of service {}: {}", service, source))]
    ListTasks {
        service: String,
        source: RusotoError<rusoto_ecs::ListTasksError>,
    },

    #[snafu(display("Unable to determine the home directory to find the AWS config file"))]
    NoHomeDir,

    #[snafu(display(
        "Unable to identify AWS region for profile {}. Specify one with --region, by setting \
         AWS_DEFAULT_REGION or in the AWS config file",
        profile
    ))]
    NoRegion { profile: String },

    #[snafu(display("Failed to parse region `{}` : {}", name, source))]
    ParseRegion {
        name: String,
        source: rusoto_signature::region::ParseRegionError,
    },

    #[snafu(display("Failed to create credentials provider for profile {}: {}", profile, source))]
    Profile {
        profile: String,
        source: rusoto_credential::CredentialsError,
    },

    #[snafu(display("Failed to register task definition {}: {}", family, source))]
    RegisterTaskDefinition {
        family: String,
        source: RusotoError<rusoto_ecs::RegisterTaskDefinitionError>,
    },

    #[snafu(display("Failed to update service {}: {}", service, source))]
    UpdateService {
        service: String,
        source: RusotoError<rusoto_ecs::UpdateServiceError>,
    },
}

impl From<Error> for crate::Error {
    fn from(e: Error) -> Self {
        crate::Error::new(e)
    }
}

/// Where the AWS config file is: `AWS_CONFIG_FILE` when set, `~/.aws/config` otherwise.
fn config_location() -> Result<PathBuf> {
    match std::env::var_os(AWS_CONFIG_FILE).filter(|path| !path.is_empty()) {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(dirs::home_dir()
            .context(self::NoHomeDir)?
            .join(".aws")
            .join("config")),
    }
}

/// Resolves the region to use. An explicit region wins, otherwise the region of the given profile
/// (or the default profile) in the AWS config file is used. Never falls back to a built-in region.
fn resolve_region<F>(
    region_name: Option<&str>,
    profile: Option<&str>,
    config_file: F,
) -> Result<Region>
where
    F: FnOnce() -> Result<PathBuf>,
{
    let name = match region_name {
        Some(name) => name.to_string(),
        None => {
            let profile = profile.unwrap_or(DEFAULT_PROFILE);
            let path = config_file()?;
            ProfileProvider::with_configuration(&path, profile)
                .region_from_profile()
                .context(self::ConfigFile { path: &path })?
                .context(self::NoRegion { profile })?
        }
    };
    Region::from_str(&name).context(self::ParseRegion { name: name.as_str() })
}

/// Create a rusoto client with credentials from the named profile or the default provider chain.
fn build_client(profile: Option<&str>) -> Result<Client> {
    let dispatcher = rusoto_core::HttpClient::new().context(self::HttpClient)?;
    Ok(match profile {
        Some(name) => {
            let mut provider =
                ProfileProvider::new().context(self::Profile { profile: name })?;
            provider.set_profile(name);
            Client::new_with(provider, dispatcher)
        }
        None => Client::new_with(
            DefaultCredentialsProvider::new().context(self::DefaultProvider)?,
            dispatcher,
        ),
    })
}

/// The region and client shared by the ECS and CodeDeploy mediators.
fn connect(region_name: Option<&str>, profile: Option<&str>) -> Result<(Region, Client)> {
    let region = resolve_region(region_name, profile, config_location)?;
    debug!("Using region {}", region.name());
    Ok((region, build_client(profile)?))
}

/// Moves a value between a rusoto shape and its local counterpart through their shared JSON form,
/// keeping every field neither side names explicitly.
fn convert<S, D>(value: &S, api: &'static str, field: &'static str) -> Result<D>
where
    S: Serialize,
    D: DeserializeOwned,
{
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .context(self::Convert { api, field })
}

// ECS reports an unknown cluster as an error rather than as a failure entry
fn describe_services_error(
    cluster: &str,
    service: &str,
    err: RusotoError<DescribeServicesError>,
) -> Error {
    match err {
        RusotoError::Service(DescribeServicesError::ClusterNotFound(_)) => Error::ClusterNotFound {
            cluster: cluster.to_string(),
        },
        source => Error::DescribeServices {
            service: service.to_string(),
            source,
        },
    }
}

fn task_definition_from(
    definition: Option<rusoto_ecs::TaskDefinition>,
    api: &'static str,
) -> Result<TaskDefinition> {
    let definition = definition.context(self::EcsMissingField {
        api,
        field: "task_definition",
    })?;
    let container_definitions = definition
        .container_definitions
        .context(self::EcsMissingField {
            api,
            field: "task_definition.container_definitions",
        })?
        .iter()
        .map(|container| convert(container, api, "container_definitions"))
        .collect::<Result<Vec<ContainerDefinition>>>()?;
    let volumes = definition
        .volumes
        .unwrap_or_default()
        .iter()
        .map(|volume| convert(volume, api, "volumes"))
        .collect::<Result<Vec<Volume>>>()?;
    Ok(TaskDefinition {
        task_definition_arn: definition.task_definition_arn.context(self::EcsMissingField {
            api,
            field: "task_definition.task_definition_arn",
        })?,
        family: definition.family.context(self::EcsMissingField {
            api,
            field: "task_definition.family",
        })?,
        revision: definition.revision.context(self::EcsMissingField {
            api,
            field: "task_definition.revision",
        })?,
        volumes,
        container_definitions,
    })
}

pub(crate) struct AwsEcsMediator {
    ecs_client: EcsClient,
}

impl AwsEcsMediator {
    pub(crate) fn new(region_name: Option<&str>, profile: Option<&str>) -> crate::Result<Self> {
        let (region, client) = connect(region_name, profile)?;
        Ok(AwsEcsMediator {
            ecs_client: EcsClient::new_with_client(client, region),
        })
    }
}

pub(crate) struct AwsCodeDeployMediator {
    code_deploy_client: CodeDeployClient,
}

impl AwsCodeDeployMediator {
    pub(crate) fn new(region_name: Option<&str>, profile: Option<&str>) -> crate::Result<Self> {
        let (region, client) = connect(region_name, profile)?;
        Ok(AwsCodeDeployMediator {
            code_deploy_client: CodeDeployClient::new_with_client(client, region),
        })
    }
}

#[async_trait]
impl CodeDeployMediator for AwsCodeDeployMediator {
    async fn create_deployment(
        &self,
        application_name: &str,
        deployment_group_name: &str,
        app_spec: &AppSpecContent,
    ) -> crate::Result<String> {
        let resp = self
            .code_deploy_client
            .create_deployment(CreateDeploymentInput {
                application_name: application_name.to_string(),
                deployment_group_name: Some(deployment_group_name.to_string()),
                revision: Some(RevisionLocation {
                    revision_type: Some("AppSpecContent".to_string()),
                    app_spec_content: Some(RemoteAppSpecContent {
                        content: Some(app_spec.content.clone()),
                        sha_256: Some(app_spec.sha256.clone()),
                    }),
                    ..RevisionLocation::default()
                }),
                ..CreateDeploymentInput::default()
            })
            .await
            .context(self::CreateDeployment {
                application_name,
                deployment_group_name,
            })?;
        Ok(resp.deployment_id.context(self::CodeDeployMissingField {
            field: "deployment_id",
        })?)
    }
}

#[async_trait]
impl EcsMediator for AwsEcsMediator {
    async fn describe_services(&self, cluster: &str, service: &str) -> crate::Result<Vec<Service>> {
        let resp = self
            .ecs_client
            .describe_services(DescribeServicesRequest {
                cluster: Some(cluster.to_string()),
                services: vec![service.to_string()],
                ..DescribeServicesRequest::default()
            })
            .await;
        let resp = resp.map_err(|e| describe_services_error(cluster, service, e))?;
        let mut services = Vec::new();
        for described in resp.services.unwrap_or_default() {
            services.push(Service {
                service_name: described.service_name.context(self::EcsMissingField {
                    api: "describe_services",
                    field: "services.service_name",
                })?,
                task_definition: described.task_definition,
            });
        }
        Ok(services)
    }

    async fn describe_task_definition(&self, task_definition: &str) -> crate::Result<TaskDefinition> {
        let resp = self
            .ecs_client
            .describe_task_definition(DescribeTaskDefinitionRequest {
                task_definition: task_definition.to_string(),
                ..DescribeTaskDefinitionRequest::default()
            })
            .await
            .context(self::DescribeTaskDefinition { task_definition })?;
        Ok(task_definition_from(
            resp.task_definition,
            "describe_task_definition",
        )?)
    }

    async fn register_task_definition(
        &self,
        template: &TaskDefinitionTemplate,
    ) -> crate::Result<TaskDefinition> {
        let api = "register_task_definition";
        let container_definitions = template
            .container_definitions
            .iter()
            .map(|container| convert(container, api, "container_definitions"))
            .collect::<Result<Vec<rusoto_ecs::ContainerDefinition>>>()?;
        let volumes = template
            .volumes
            .iter()
            .map(|volume| convert(volume, api, "volumes"))
            .collect::<Result<Vec<rusoto_ecs::Volume>>>()?;
        let resp = self
            .ecs_client
            .register_task_definition(RegisterTaskDefinitionRequest {
                family: template.family.clone(),
                container_definitions,
                volumes: Some(volumes),
                ..RegisterTaskDefinitionRequest::default()
            })
            .await
            .context(self::RegisterTaskDefinition {
                family: template.family.as_str(),
            })?;
        Ok(task_definition_from(resp.task_definition, api)?)
    }

    async fn update_service(
        &self,
        cluster: &str,
        service: &str,
        task_definition_arn: &str,
    ) -> crate::Result<()> {
        self.ecs_client
            .update_service(UpdateServiceRequest {
                cluster: Some(cluster.to_string()),
                service: service.to_string(),
                task_definition: Some(task_definition_arn.to_string()),
                ..UpdateServiceRequest::default()
            })
            .await
            .context(self::UpdateService { service })?;
        Ok(())
    }

    async fn list_running_tasks(&self, cluster: &str, service: &str) -> crate::Result<Vec<String>> {
        // contains token to fetch next page of tasks, set to None for 1st page
        let mut next_token: Option<String> = None;
        let mut task_arns = Vec::new();
        loop {
            let resp = self
                .ecs_client
                .list_tasks(ListTasksRequest {
                    cluster: Some(cluster.to_string()),
                    service_name: Some(service.to_string()),
                    desired_status: Some("RUNNING".to_string()),
                    next_token: next_token.clone(),
                    ..ListTasksRequest::default()
                })
                .await
                .context(self::ListTasks { service })?;
            task_arns.extend(resp.task_arns.unwrap_or_default());
            match resp.next_token {
                None => break,
                Some(token) => next_token = Some(token),
            };
        }
        Ok(task_arns)
    }

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> crate::Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for batch in task_arns.chunks(DESCRIBE_TASKS_BATCH) {
            let resp = self
                .ecs_client
                .describe_tasks(DescribeTasksRequest {
                    cluster: Some(cluster.to_string()),
                    tasks: batch.to_vec(),
                    ..DescribeTasksRequest::default()
                })
                .await
                .context(self::DescribeTasks)?;
            for task in resp.tasks.unwrap_or_default() {
                tasks.push(Task {
                    task_arn: task.task_arn.context(self::EcsMissingField {
                        api: "describe_tasks",
                        field: "tasks.task_arn",
                    })?,
                    task_definition_arn: task.task_definition_arn.context(
                        self::EcsMissingField {
                            api: "describe_tasks",
                            field: "tasks.task_definition_arn",
                        },
                    )?,
                });
            }
        }
        Ok(tasks)
    }
}
