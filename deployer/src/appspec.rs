use crate::deployer::{self, AppSpecSerialize, MultiplePortMappings, NoPortMappings};
use crate::ContainerDefinition;
use serde::Serialize;
use sha2::{Digest, Sha256};
use snafu::{ensure, OptionExt, ResultExt};

const TARGET_SERVICE_TYPE: &str = "AWS::ECS::Service";

/// An AppSpec document and its SHA-256 digest, ready to be sent to CodeDeploy.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSpecContent {
    pub content: String,
    pub sha256: String,
}

/// The container that receives load balancer traffic in a blue/green deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancedContainer {
    pub name: String,
    pub port: i64,
}

impl LoadBalancedContainer {
    /// Finds the single container that has a port mapping. Containers without port mappings are
    /// skipped, only the first mapping of a container is considered.
    pub fn find(containers: &[ContainerDefinition]) -> deployer::Result<Self> {
        let mapped: Vec<Self> = containers
            .iter()
            .filter_map(|container| {
                let port = container
                    .settings
                    .get("portMappings")?
                    .get(0)?
                    .get("containerPort")?
                    .as_i64()?;
                Some(Self {
                    name: container.name.clone(),
                    port,
                })
            })
            .collect();
        ensure!(
            mapped.len() <= 1,
            MultiplePortMappings {
                containers: mapped
                    .iter()
                    .map(|container| container.name.clone())
                    .collect::<Vec<_>>()
            }
        );
        mapped.into_iter().next().context(NoPortMappings)
    }
}

// the AppSpec layout CodeDeploy expects for an ECS service
#[derive(Debug, Serialize)]
struct AppSpec<'a> {
    version: u8,
    #[serde(rename = "Resources")]
    resources: Vec<Resource<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Resource<'a> {
    target_service: TargetService<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TargetService<'a> {
    #[serde(rename = "Type")]
    kind: &'static str,
    properties: Properties<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Properties<'a> {
    task_definition: &'a str,
    load_balancer_info: LoadBalancerInfo<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancerInfo<'a> {
    container_name: &'a str,
    container_port: i64,
}

impl AppSpecContent {
    /// Builds the AppSpec that moves the service to `task_definition_arn`, routing traffic to the
    /// given container.
    pub fn new(
        task_definition_arn: &str,
        container: &LoadBalancedContainer,
    ) -> deployer::Result<Self> {
        let app_spec = AppSpec {
            version: 1,
            resources: vec![Resource {
                target_service: TargetService {
                    kind: TARGET_SERVICE_TYPE,
                    properties: Properties {
                        task_definition: task_definition_arn,
                        load_balancer_info: LoadBalancerInfo {
                            container_name: &container.name,
                            container_port: container.port,
                        },
                    },
                },
            }],
        };
        let content = serde_json::to_string(&app_spec).context(AppSpecSerialize)?;
        let sha256 = hex::encode(Sha256::digest(content.as_bytes()));
        Ok(Self { content, sha256 })
    }
}
