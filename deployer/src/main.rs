mod error;

use ecs_deployer::{new_code_deploy, new_ecs, Args, Deployer, Deployment, Rollout};
use log::info;
use snafu::ResultExt;
use std::process;
use structopt::StructOpt;

// Returning a Result from main makes it print a Debug representation of the error, but with Snafu
// we have nice Display representations of the error, so we wrap "main" (run) and print any error.
// https://github.com/shepmaster/snafu/issues/110
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}

async fn run() -> error::Result<()> {
    let args = Args::from_args();
    // Log setup
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .try_init()
        .context(error::Logger)?;
    info!("ecs-deployer started with {:?}", args);
    // Arguments are checked before any AWS client exists
    let deployment = Deployment::from_args(&args).context(error::Usage)?;
    let ecs = new_ecs(args.region.as_deref(), args.profile.as_deref()).context(error::EcsClient)?;
    let code_deploy = new_code_deploy(args.region.as_deref(), args.profile.as_deref())
        .context(error::CodeDeployClient)?;
    let deployer = Deployer::new(ecs, code_deploy, args.poll_config());
    match deployer.deploy(&deployment).await.context(error::Deploy)? {
        Rollout::Unchanged => info!("Nothing to deploy"),
        Rollout::Registered {
            task_definition_arn,
        } => info!("Registered {}", task_definition_arn),
        Rollout::Converged {
            task_definition_arn,
        } => info!("Service is running {}", task_definition_arn),
    }
    Ok(())
}
