/*!
We created a `lib.rs` file to facilitate testing in the `tests` folder. This project is not meant
to be used as a library in other projects.
!*/

#![deny(rust_2018_idioms)]

mod appspec;
mod args;
mod aws;
mod deployer;

pub use crate::appspec::{AppSpecContent, LoadBalancedContainer};
pub use crate::args::{Args, CodeDeployTarget, DefinitionSource, Deployment, PollConfig};
use crate::aws::{AwsCodeDeployMediator, AwsEcsMediator};
pub use crate::deployer::{Convergence, Deployer, Error as DeployError, Rollout};
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// An opaque error type to wrap more detailed error types. The inner type provides the message.
#[derive(Debug)]
pub struct Error(Box<dyn std::error::Error + Send + Sync + 'static>);
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new opaque error.
    pub fn new<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(source.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

// implement std::error::Error to support Error type as source for snafu
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Creates a new concrete implementation of [`EcsMediator`] using `rusoto`. When `region` is
/// `None` the region of `profile` (or the default profile) in the AWS config file is used. When
/// `profile` is given, credentials are read from that profile instead of the default provider
/// chain.
pub fn new_ecs(region: Option<&str>, profile: Option<&str>) -> Result<impl EcsMediator> {
    Ok(AwsEcsMediator::new(region, profile)?)
}

/// Creates a new concrete implementation of [`CodeDeployMediator`] using `rusoto`. Region and
/// credentials are resolved as for [`new_ecs`].
pub fn new_code_deploy(
    region: Option<&str>,
    profile: Option<&str>,
) -> Result<impl CodeDeployMediator> {
    Ok(AwsCodeDeployMediator::new(region, profile)?)
}

/// A container definition inside a task definition. Only `name` and `image` are interpreted, every
/// other ECS field is carried untouched in `settings` so that it survives re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl ContainerDefinition {
    /// A container definition with no settings beyond its name and image.
    pub fn new<S1, S2>(name: S1, image: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            name: name.into(),
            image: image.into(),
            settings: serde_json::Map::new(),
        }
    }
}

/// A task definition volume, opaque to this program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volume(pub serde_json::Value);

/// A registered task definition revision as returned by ECS.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub task_definition_arn: String,
    pub family: String,
    pub revision: i64,
    pub volumes: Vec<Volume>,
    pub container_definitions: Vec<ContainerDefinition>,
}

/// The mutable copy of a task definition that gets registered as a new revision.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinitionTemplate {
    pub family: String,
    pub volumes: Vec<Volume>,
    pub container_definitions: Vec<ContainerDefinition>,
}

impl From<&TaskDefinition> for TaskDefinitionTemplate {
    fn from(definition: &TaskDefinition) -> Self {
        Self {
            family: definition.family.clone(),
            volumes: definition.volumes.clone(),
            container_definitions: definition.container_definitions.clone(),
        }
    }
}

impl TaskDefinitionTemplate {
    /// Replaces the image of every container named by an override, in the order given. Overrides
    /// that name a container not present in the template are ignored. Returns `true` if at least
    /// one image changed.
    pub fn apply_image_overrides(&mut self, overrides: &[ImageOverride]) -> bool {
        let mut modified = false;
        for image_override in overrides {
            match self
                .container_definitions
                .iter_mut()
                .find(|container| container.name == image_override.container)
            {
                Some(container) => {
                    if container.image != image_override.image {
                        container.image = image_override.image.clone();
                        modified = true;
                    }
                }
                None => warn!(
                    "No container named '{}' in task definition family '{}', ignoring image '{}'",
                    image_override.container, self.family, image_override.image
                ),
            }
        }
        modified
    }
}

/// A new image reference for the container with the given name.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageOverride {
    pub container: String,
    pub image: String,
}

impl ImageOverride {
    pub fn new<S1, S2>(container: S1, image: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            container: container.into(),
            image: image.into(),
        }
    }
}

/// The cluster and, optionally, the service that should be rolled to a new task definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTarget {
    pub cluster: String,
    pub service: Option<String>,
}

// service details from `DescribeServicesResponse` will be mapped to this
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub service_name: String,
    // ARN of the task definition the service currently runs
    pub task_definition: Option<String>,
}

// task details from `DescribeTasksResponse` will be mapped to this
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_arn: String,
    pub task_definition_arn: String,
}

/// Introducing a trait abstraction over the the ECS API allows us to mock the API and write tests
/// without going to the extremely low level of `rusoto_mock`. That is, we can mock the higher level
/// use-cases of what we might send and receive to/from the API instead of mocking the API itself.
#[async_trait]
pub trait EcsMediator {
    /// Describes the named service. An empty list means ECS does not know the service.
    async fn describe_services(&self, cluster: &str, service: &str) -> Result<Vec<Service>>;

    /// Describes a task definition by family, `family:revision` or full ARN.
    async fn describe_task_definition(&self, task_definition: &str) -> Result<TaskDefinition>;

    /// Registers the template as a new revision of its family.
    async fn register_task_definition(
        &self,
        template: &TaskDefinitionTemplate,
    ) -> Result<TaskDefinition>;

    /// Points the service at the given task definition.
    async fn update_service(
        &self,
        cluster: &str,
        service: &str,
        task_definition_arn: &str,
    ) -> Result<()>;

    /// Lists the ARNs of tasks of the service whose desired status is RUNNING.
    async fn list_running_tasks(&self, cluster: &str, service: &str) -> Result<Vec<String>>;

    /// Describes the given tasks.
    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> Result<Vec<Task>>;
}

/// Blue/green deployments of ECS services go through CodeDeploy instead of UpdateService.
#[async_trait]
pub trait CodeDeployMediator {
    /// Starts a deployment of the AppSpec to the deployment group and returns the deployment id.
    async fn create_deployment(
        &self,
        application_name: &str,
        deployment_group_name: &str,
        app_spec: &AppSpecContent,
    ) -> Result<String>;
}
