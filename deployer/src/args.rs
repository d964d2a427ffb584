use crate::deployer::{
    self, ConflictingSource, MissingCodeDeployTarget, MissingService, MissingSource,
};
use crate::{ImageOverride, ServiceTarget};
use log::{info, LevelFilter};
use snafu::{ensure, OptionExt};
use std::time::Duration;
use structopt::StructOpt;

/// ECS Deployer
///
/// Registers a new revision of an ECS task definition, optionally with new container images, and
/// rolls a service over to it. When a service is given, waits until a task of the new revision is
/// running.
///
/// Region and profile can be specified by environment variable. Command-line arguments will
/// override a value that is given by environment variable.
///
#[derive(StructOpt, Debug)]
pub struct Args {
    /// The short name or full Amazon Resource Name (ARN) of the cluster
    #[structopt(short, long, default_value = "default")]
    pub cluster: String,
    /// The service to roll over to the new task definition. Without it, the new task definition is
    /// only registered.
    #[structopt(short, long)]
    pub service_name: Option<String>,
    /// The task definition family to base the new revision on. Required unless --update is given.
    #[structopt(short = "d", long)]
    pub task_definition: Option<String>,
    /// Base the new revision on the task definition the service is currently running
    #[structopt(short, long)]
    pub update: bool,
    /// Replace the image of a container, may be repeated
    #[structopt(short, long, number_of_values = 2, value_names = &["CONTAINER", "IMAGE"])]
    pub image: Vec<String>,
    /// Seconds to wait for a task of the new revision to be running
    #[structopt(short, long, default_value = "60")]
    pub timeout: u64,
    /// Seconds to wait between checks for running tasks
    #[structopt(short, long, default_value = "3")]
    pub backoff: u64,
    /// Use the container images of this service's task definition. Implies --update.
    #[structopt(short = "k", long)]
    pub copy_images: Option<String>,
    /// Only register a new revision when at least one image changed
    #[structopt(short = "O", long)]
    pub only_if_modified: bool,
    /// Roll the service out with a CodeDeploy blue/green deployment instead of updating it
    /// directly. Requires --app-name and --group-name.
    #[structopt(long)]
    pub code_deploy: bool,
    /// The CodeDeploy application name
    #[structopt(short, long)]
    pub app_name: Option<String>,
    /// The CodeDeploy deployment group name
    #[structopt(short, long)]
    pub group_name: Option<String>,
    /// The AWS Region in which the cluster is running
    #[structopt(short, long, env = "AWS_DEFAULT_REGION")]
    pub region: Option<String>,
    /// The AWS credentials profile to use
    #[structopt(short, long, env = "AWS_PROFILE")]
    pub profile: Option<String>,
    /// How much detail to log; from least to most: ERROR, WARN, INFO, DEBUG, TRACE
    #[structopt(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

impl Args {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            timeout: Duration::from_secs(self.timeout),
            backoff: Duration::from_secs(self.backoff),
        }
    }
}

/// How long to wait for a new task definition to be running, and how often to check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollConfig {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            backoff: Duration::from_secs(3),
        }
    }
}

/// Where the task definition that gets copied comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionSource {
    /// The latest active revision of a family, or a specific revision or ARN.
    Family(String),
    /// Whatever the target service is currently running.
    CurrentService,
}

/// The CodeDeploy application and deployment group of a blue/green service.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeDeployTarget {
    pub application_name: String,
    pub deployment_group_name: String,
}

/// A validated deployment request.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub target: ServiceTarget,
    pub source: DefinitionSource,
    pub images: Vec<ImageOverride>,
    // when set, images are taken from this service instead of `images`
    pub copy_images_from: Option<String>,
    pub only_if_modified: bool,
    // when set, the service is rolled out through CodeDeploy instead of UpdateService
    pub code_deploy: Option<CodeDeployTarget>,
}

impl Deployment {
    /// Checks that the arguments describe a deployment we can carry out.
    pub fn from_args(args: &Args) -> deployer::Result<Self> {
        let code_deploy = if args.code_deploy {
            match (&args.app_name, &args.group_name) {
                (Some(application_name), Some(deployment_group_name)) => Some(CodeDeployTarget {
                    application_name: application_name.clone(),
                    deployment_group_name: deployment_group_name.clone(),
                }),
                _ => return MissingCodeDeployTarget.fail(),
            }
        } else {
            None
        };
        if args.copy_images.is_some() && !args.update {
            info!("Implicitly enabling --update since --copy-images was given");
        }
        let update = args.update || args.copy_images.is_some();
        ensure!(!(update && args.task_definition.is_some()), ConflictingSource);
        let source = if update {
            ensure!(args.service_name.is_some(), MissingService);
            DefinitionSource::CurrentService
        } else {
            DefinitionSource::Family(args.task_definition.clone().context(MissingSource)?)
        };
        Ok(Self {
            target: ServiceTarget {
                cluster: args.cluster.clone(),
                service: args.service_name.clone(),
            },
            source,
            images: args
                .image
                .chunks_exact(2)
                .map(|pair| ImageOverride::new(&pair[0], &pair[1]))
                .collect(),
            copy_images_from: args.copy_images.clone(),
            only_if_modified: args.only_if_modified,
            code_deploy,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::DeployError;

    fn parse(args: &[&str]) -> Args {
        Args::from_iter_safe(std::iter::once("ecs-deployer").chain(args.iter().cloned())).unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&["--task-definition", "myapp"]);
        assert_eq!("default", args.cluster);
        assert_eq!(
            PollConfig {
                timeout: Duration::from_secs(60),
                backoff: Duration::from_secs(3),
            },
            args.poll_config()
        );
        assert_eq!(PollConfig::default(), args.poll_config());
    }

    #[test]
    fn repeated_images() {
        let args = parse(&[
            "-d", "myapp", "-i", "web", "img:v2", "--image", "worker", "img:v3",
        ]);
        let deployment = Deployment::from_args(&args).unwrap();
        assert_eq!(
            vec![
                ImageOverride::new("web", "img:v2"),
                ImageOverride::new("worker", "img:v3"),
            ],
            deployment.images
        );
        assert_eq!(DefinitionSource::Family("myapp".to_string()), deployment.source);
        assert_eq!(None, deployment.target.service);
    }

    #[test]
    fn image_needs_two_values() {
        let result = Args::from_iter_safe(&["ecs-deployer", "-d", "myapp", "-i", "web"]);
        assert!(result.is_err());
    }

    #[test]
    fn missing_source() {
        let args = parse(&["--service-name", "api"]);
        assert!(matches!(
            Deployment::from_args(&args),
            Err(DeployError::MissingSource)
        ));
    }

    #[test]
    fn update_conflicts_with_task_definition() {
        let args = parse(&["-u", "-s", "api", "-d", "myapp"]);
        assert!(matches!(
            Deployment::from_args(&args),
            Err(DeployError::ConflictingSource)
        ));
    }

    #[test]
    fn update_needs_service() {
        let args = parse(&["--update"]);
        assert!(matches!(
            Deployment::from_args(&args),
            Err(DeployError::MissingService)
        ));
    }

    #[test]
    fn copy_images_implies_update() {
        let args = parse(&["-c", "prod", "-s", "api", "-k", "api-canary", "-O"]);
        let deployment = Deployment::from_args(&args).unwrap();
        assert_eq!(DefinitionSource::CurrentService, deployment.source);
        assert_eq!(Some("api-canary".to_string()), deployment.copy_images_from);
        assert_eq!("prod", deployment.target.cluster);
        assert!(deployment.only_if_modified);
        assert_eq!(None, deployment.code_deploy);
    }

    #[test]
    fn code_deploy_target() {
        let args = parse(&[
            "-u",
            "-s",
            "api",
            "--code-deploy",
            "-a",
            "api-app",
            "--group-name",
            "api-group",
        ]);
        let deployment = Deployment::from_args(&args).unwrap();
        assert_eq!(
            Some(CodeDeployTarget {
                application_name: "api-app".to_string(),
                deployment_group_name: "api-group".to_string(),
            }),
            deployment.code_deploy
        );
    }

    #[test]
    fn code_deploy_needs_app_and_group() {
        for args in &[
            parse(&["-u", "-s", "api", "--code-deploy"]),
            parse(&["-u", "-s", "api", "--code-deploy", "-a", "api-app"]),
            parse(&["-u", "-s", "api", "--code-deploy", "-g", "api-group"]),
        ] {
            assert!(matches!(
                Deployment::from_args(args),
                Err(DeployError::MissingCodeDeployTarget)
            ));
        }
    }

    #[test]
    fn code_deploy_checked_first() {
        // reported even though no task definition source is given either
        let args = parse(&["--code-deploy", "-g", "api-group"]);
        assert!(matches!(
            Deployment::from_args(&args),
            Err(DeployError::MissingCodeDeployTarget)
        ));
    }

    #[test]
    fn app_and_group_without_code_deploy_are_unused() {
        let args = parse(&["-d", "myapp", "-a", "api-app", "-g", "api-group"]);
        assert_eq!(None, Deployment::from_args(&args).unwrap().code_deploy);
    }
}
