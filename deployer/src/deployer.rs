use crate::{
    AppSpecContent, CodeDeployMediator, CodeDeployTarget, DefinitionSource, Deployment,
    EcsMediator, ImageOverride, LoadBalancedContainer, PollConfig, TaskDefinitionTemplate,
};
use log::{debug, info};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// The terminal states of waiting for a service to run a new task definition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Convergence {
    /// A running task of the service uses the new task definition.
    Converged,
    /// The timeout elapsed before any running task used the new task definition.
    TimedOut,
}

/// What a successful deployment did.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollout {
    /// Only-if-modified was requested and no image changed, nothing was registered.
    Unchanged,
    /// A new revision was registered, no service was targeted.
    Registered { task_definition_arn: String },
    /// A new revision was registered and a task of the service is running it.
    Converged { task_definition_arn: String },
}

/// Registers new task definition revisions and rolls ECS services over to them, either directly or
/// through a CodeDeploy blue/green deployment.
pub struct Deployer<T: EcsMediator, C: CodeDeployMediator> {
    ecs: T,
    code_deploy: C,
    poll: PollConfig,
}

impl<T: EcsMediator, C: CodeDeployMediator> Deployer<T, C> {
    /// Create a new `Deployer`.
    pub fn new(ecs: T, code_deploy: C, poll: PollConfig) -> Self {
        Self {
            ecs,
            code_deploy,
            poll,
        }
    }

    /// Carry out the deployment. A registered revision is never deregistered, and a service update
    /// is never reverted, even if a later step fails.
    pub async fn deploy(&self, deployment: &Deployment) -> Result<Rollout> {
        let cluster = deployment.target.cluster.as_str();
        let reference = match &deployment.source {
            DefinitionSource::Family(family) => family.clone(),
            DefinitionSource::CurrentService => {
                // `Deployment` fields are public, so it may not have come from `from_args`
                let service = deployment
                    .target
                    .service
                    .as_deref()
                    .context(MissingService)?;
                self.resolve_current_definition(cluster, service).await?
            }
        };

        let images = match &deployment.copy_images_from {
            Some(source_service) => self.copy_images(cluster, source_service).await?,
            None => deployment.images.clone(),
        };

        let mut template = self.load_definition(&reference).await?;
        let modified = template.apply_image_overrides(&images);
        if deployment.only_if_modified && !modified {
            info!("No container images were updated, not registering a new task definition");
            return Ok(Rollout::Unchanged);
        }

        let task_definition_arn = self.register_definition(&template).await?;
        info!("New task definition: {}", task_definition_arn);

        let service = match deployment.target.service.as_deref() {
            None => {
                info!("Successfully registered task definition");
                return Ok(Rollout::Registered {
                    task_definition_arn,
                });
            }
            Some(service) => service,
        };

        match &deployment.code_deploy {
            Some(target) => {
                self.create_code_deployment(target, &template, &task_definition_arn)
                    .await?;
            }
            None => self.update_service(cluster, service, &task_definition_arn).await?,
        }
        let convergence = self
            .wait_for_convergence(cluster, service, &task_definition_arn)
            .await?;
        ensure!(
            convergence == Convergence::Converged,
            ConvergenceTimeout {
                task_definition_arn: task_definition_arn.as_str(),
                timeout: self.poll.timeout,
            }
        );
        info!("Service updated successfully, new task definition is running");
        Ok(Rollout::Converged {
            task_definition_arn,
        })
    }

    /// Returns the ARN of the task definition the service currently runs.
    pub async fn resolve_current_definition(&self, cluster: &str, service: &str) -> Result<String> {
        info!("Looking up current task definition of service {}", service);
        let services = self
            .ecs
            .describe_services(cluster, service)
            .await
            .context(DescribeService { service })?;
        let described = services
            .into_iter()
            .next()
            .context(ServiceNotFound { cluster, service })?;
        let task_definition = described
            .task_definition
            .context(NoTaskDefinition { service })?;
        debug!("Service {} runs {}", service, task_definition);
        Ok(task_definition)
    }

    /// Fetches a task definition and returns a copy of it that can be changed freely.
    pub async fn load_definition(&self, reference: &str) -> Result<TaskDefinitionTemplate> {
        let definition = self
            .ecs
            .describe_task_definition(reference)
            .await
            .context(DescribeTaskDefinition { reference })?;
        debug!(
            "Loaded {} with {} container definition(s)",
            definition.task_definition_arn,
            definition.container_definitions.len()
        );
        Ok(TaskDefinitionTemplate::from(&definition))
    }

    /// Registers the template as a new revision and returns its ARN.
    pub async fn register_definition(&self, template: &TaskDefinitionTemplate) -> Result<String> {
        let registered = self
            .ecs
            .register_task_definition(template)
            .await
            .context(RegisterTaskDefinition {
                family: template.family.as_str(),
            })?;
        Ok(registered.task_definition_arn)
    }

    /// Points the service at the new task definition. Does not wait for anything to restart.
    pub async fn update_service(
        &self,
        cluster: &str,
        service: &str,
        task_definition_arn: &str,
    ) -> Result<()> {
        info!("Updating service {} to {}", service, task_definition_arn);
        self.ecs
            .update_service(cluster, service, task_definition_arn)
            .await
            .context(UpdateService { service })
    }

    /// Hands the new task definition to CodeDeploy, which shifts the service's traffic to it. The
    /// template must have exactly one container with a port mapping.
    pub async fn create_code_deployment(
        &self,
        target: &CodeDeployTarget,
        template: &TaskDefinitionTemplate,
        task_definition_arn: &str,
    ) -> Result<String> {
        let container = LoadBalancedContainer::find(&template.container_definitions)?;
        debug!(
            "Routing traffic to container {} on port {}",
            container.name, container.port
        );
        let app_spec = AppSpecContent::new(task_definition_arn, &container)?;
        info!(
            "Creating CodeDeploy deployment in application {}, group {}",
            target.application_name, target.deployment_group_name
        );
        let deployment_id = self
            .code_deploy
            .create_deployment(
                &target.application_name,
                &target.deployment_group_name,
                &app_spec,
            )
            .await
            .context(CreateDeployment {
                application_name: target.application_name.as_str(),
                deployment_group_name: target.deployment_group_name.as_str(),
            })?;
        info!("CodeDeploy deployment {} created", deployment_id);
        Ok(deployment_id)
    }

    /// Checks the running tasks of the service every backoff interval until one of them uses the
    /// given task definition, or until the timeout has passed.
    pub async fn wait_for_convergence(
        &self,
        cluster: &str,
        service: &str,
        task_definition_arn: &str,
    ) -> Result<Convergence> {
        let start = Instant::now();
        loop {
            sleep(self.poll.backoff).await;

            let task_arns = self
                .ecs
                .list_running_tasks(cluster, service)
                .await
                .context(ListTasks { service })?;
            let waiting_for = if task_arns.is_empty() {
                "No tasks are currently running"
            } else {
                let tasks = self
                    .ecs
                    .describe_tasks(cluster, &task_arns)
                    .await
                    .context(DescribeTasks { service })?;
                if tasks
                    .iter()
                    .any(|task| task.task_definition_arn == task_definition_arn)
                {
                    return Ok(Convergence::Converged);
                }
                "New task is not running yet"
            };

            if start.elapsed() > self.poll.timeout {
                return Ok(Convergence::TimedOut);
            }
            info!(
                "{}, backing off for {} seconds",
                waiting_for,
                self.poll.backoff.as_secs()
            );
        }
    }

    // Uses the images of every container of another service's current task definition
    async fn copy_images(&self, cluster: &str, source_service: &str) -> Result<Vec<ImageOverride>> {
        let reference = self
            .resolve_current_definition(cluster, source_service)
            .await?;
        let source = self.load_definition(&reference).await?;
        let images: Vec<ImageOverride> = source
            .container_definitions
            .iter()
            .map(|container| ImageOverride::new(&container.name, &container.image))
            .collect();
        ensure!(
            !images.is_empty(),
            NoImagesToCopy {
                service: source_service
            }
        );
        info!("Found and copied these container images:");
        for image in &images {
            info!("{}: {}", image.container, image.image);
        }
        Ok(images)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this module.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum Error {
    #[snafu(display("Failed to serialize AppSpec: {}", source))]
    AppSpecSerialize { source: serde_json::Error },

    #[snafu(display("--update and --task-definition cannot be used together"))]
    ConflictingSource,

    #[snafu(display(
        "New task definition {} is not running within {} second(s)",
        task_definition_arn,
        timeout.as_secs()
    ))]
    ConvergenceTimeout {
        task_definition_arn: String,
        timeout: Duration,
    },

    #[snafu(display(
        "Failed to create CodeDeploy deployment in application {}, group {}: {}",
        application_name,
        deployment_group_name,
        source
    ))]
    CreateDeployment {
        application_name: String,
        deployment_group_name: String,
        source: crate::Error,
    },

    #[snafu(display("Failed to describe service {}: {}", service, source))]
    DescribeService {
        service: String,
        source: crate::Error,
    },

    #[snafu(display("Failed to describe task definition {}: {}", reference, source))]
    DescribeTaskDefinition {
        reference: String,
        source: crate::Error,
    },

    #[snafu(display("Failed to describe running tasks of service {}: {}", service, source))]
    DescribeTasks {
        service: String,
        source: crate::Error,
    },

    #[snafu(display("Failed to list running tasks of service {}: {}", service, source))]
    ListTasks {
        service: String,
        source: crate::Error,
    },

    #[snafu(display("--code-deploy requires --app-name and --group-name"))]
    MissingCodeDeployTarget,

    #[snafu(display("--update requires --service-name"))]
    MissingService,

    #[snafu(display("You need to specify a --task-definition, or --update a service"))]
    MissingSource,

    #[snafu(display(
        "Container definitions with more than one portMappings block are not supported: {}",
        containers.join(", ")
    ))]
    MultiplePortMappings { containers: Vec<String> },

    #[snafu(display("No container images found to copy from service {}", service))]
    NoImagesToCopy { service: String },

    #[snafu(display("Unable to find a container definition with a portMappings block"))]
    NoPortMappings,

    #[snafu(display("Service {} has no task definition", service))]
    NoTaskDefinition { service: String },

    #[snafu(display("Failed to register task definition {}: {}", family, source))]
    RegisterTaskDefinition {
        family: String,
        source: crate::Error,
    },

    #[snafu(display("Service {} not found in cluster {}", service, cluster))]
    ServiceNotFound { cluster: String, service: String },

    #[snafu(display("Failed to update service {}: {}", service, source))]
    UpdateService {
        service: String,
        source: crate::Error,
    },
}

impl From<Error> for crate::Error {
    fn from(e: Error) -> Self {
        crate::Error::new(e)
    }
}
