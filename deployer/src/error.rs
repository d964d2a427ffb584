//! Contains the error type for the `ecs-deployer` binary.

#![allow(clippy::default_trait_access)]

use snafu::Snafu;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for the binary.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Error {
    // The application failed to create CodeDeploy client
    #[snafu(display("Failed to create CodeDeploy client: {}", source))]
    CodeDeployClient { source: ecs_deployer::Error },

    // The deployment failed
    #[snafu(display("{}", source))]
    Deploy { source: ecs_deployer::DeployError },

    // The application failed to create ECS client
    #[snafu(display("Failed to create ECS client: {}", source))]
    EcsClient { source: ecs_deployer::Error },

    // The application failed to setup Logger
    #[snafu(display("Logger setup error: {}", source))]
    Logger { source: log::SetLoggerError },

    // The arguments do not describe a deployment
    #[snafu(display("{}", source))]
    Usage { source: ecs_deployer::DeployError },
}
