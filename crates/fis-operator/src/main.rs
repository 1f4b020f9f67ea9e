//! fis-operator: drives AWS Fault Injection Service from Kubernetes CRDs

mod controller_runner;
mod crds;

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use fis_common::config::{EnvOverrides, OperatorSettings};
use fis_common::telemetry::{init_telemetry, LogFormat};
use fis_experiment::ExperimentContext;
use fis_provider::aws::{load_sdk_config, AwsSettings};
use fis_provider::{EksApi, EksClient, FisApi, FisClient, IamApi, IamClient};
use fis_template::TemplateContext;

use controller_runner::{build_experiment_controller, build_template_controller};

/// Kubernetes operator for AWS Fault Injection Service experiments
#[derive(Parser, Debug)]
#[command(name = "fis-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// EKS cluster name; enables access entries and resolves the cluster ARN
    #[arg(long, env = "EKS_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Cluster identifier passed to FIS targets; overrides the resolved ARN
    #[arg(long)]
    cluster_identifier: Option<String>,

    /// Default IAM role FIS assumes when a template names none
    #[arg(long)]
    role_arn: Option<String>,

    /// Default Kubernetes service account FIS runs as
    #[arg(long)]
    service_account: Option<String>,

    /// AWS region; defaults to the SDK provider chain
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Concurrent reconciles per controller
    #[arg(long, default_value_t = 4)]
    concurrency: u16,

    /// JSON logs instead of plain text
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crds::render_crds()?);
        return Ok(());
    }

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_telemetry(format)?;

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let sdk_config = load_sdk_config(&AwsSettings {
        region: cli.region.clone(),
        ..Default::default()
    })
    .await;

    let fis: Arc<dyn FisApi> = Arc::new(FisClient::new(&sdk_config));
    let iam: Arc<dyn IamApi> = Arc::new(IamClient::new(&sdk_config));
    let eks: Arc<dyn EksApi> = Arc::new(EksClient::new(&sdk_config));

    let settings = Arc::new(OperatorSettings {
        env: EnvOverrides::from_env(),
        cluster_identifier: resolve_cluster_identifier(&cli, eks.as_ref()).await,
        role_arn: cli.role_arn.clone(),
        service_account: cli.service_account.clone(),
        eks_cluster_name: cli.cluster_name.clone(),
    });

    match &settings.eks_cluster_name {
        Some(cluster) => tracing::info!(%cluster, "EKS access entries enabled"),
        None => tracing::info!("no EKS cluster name configured; access entries disabled"),
    }

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    crds::ensure_crds_installed(&client).await?;

    let template_ctx = Arc::new(TemplateContext::new(
        client.clone(),
        fis.clone(),
        iam,
        eks,
        settings,
    ));
    let experiment_ctx = Arc::new(ExperimentContext::new(client.clone(), fis));

    tracing::info!(concurrency = cli.concurrency, "starting controllers");
    let controllers = vec![
        build_template_controller(client.clone(), template_ctx, cli.concurrency),
        build_experiment_controller(client, experiment_ctx, cli.concurrency),
    ];

    futures::future::join_all(controllers).await;
    tracing::info!("controllers stopped");
    Ok(())
}

/// `--cluster-identifier` wins; otherwise look up the ARN of `--cluster-name`
async fn resolve_cluster_identifier(cli: &Cli, eks: &dyn EksApi) -> Option<String> {
    if let Some(id) = cli.cluster_identifier.as_deref().filter(|s| !s.is_empty()) {
        return Some(id.to_string());
    }
    let cluster = cli.cluster_name.as_deref()?;
    match eks.describe_cluster_arn(cluster).await {
        Ok(arn) => {
            tracing::info!(%cluster, %arn, "resolved cluster identifier");
            Some(arn)
        }
        Err(e) => {
            tracing::warn!(%cluster, error = %e, "failed to resolve cluster ARN");
            None
        }
    }
}
