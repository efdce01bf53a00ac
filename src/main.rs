use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{Arg, ArgAction, ArgMatches, Command};
use r_deploy::{
    Result,
    api::StatusServer,
    config::{Backend, Config, build_graph, service_spec, set_image_tag, stack::applied_image_tag},
    deployment::{ServiceSupervisor, types::Outcome},
    graph::ResourceGraph,
    provisioner::{
        DestroyOptions, Plan, ProvisionError, Provisioner, ResolvedState, ResourceProvider, include_orphans,
    },
    publisher::{
        Artifact, BuildContext, PublishOptions, Publisher, TagGenerator,
        builder::ContextDigester,
        types::{ImageBuilder, ImageRegistry},
    },
    runtime::{ClusterRuntime, DockerImageStore, DockerRuntime, HttpBalancer, LoadBalancer},
    sim::{MemoryRegistry, SimBalancer, SimCluster, SimProvider, StaticIdentity},
    store::StateStore,
};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{error, info, warn};

const VERBOSE_FLAG: &str = "verbose";
const CONFIG_ARG: &str = "config";

const PLAN_CMD: &str = "plan";
const APPLY_CMD: &str = "apply";
const DESTROY_CMD: &str = "destroy";
const PUBLISH_CMD: &str = "publish";
const DEPLOY_CMD: &str = "deploy";

/// Prefix of the execution identities the local identity provider issues.
const IDENTITY_PREFIX: &str = "local";

/// Collaborators selected by the configured backend.
struct Backends {
    provider: Arc<dyn ResourceProvider>,
    builder: Arc<dyn ImageBuilder>,
    registry: Arc<dyn ImageRegistry>,
    cluster: Arc<dyn ClusterRuntime>,
    balancer: Arc<dyn LoadBalancer>,
}

impl Backends {
    fn new(config: &Config, state: &ResolvedState) -> Result<Self> {
        // Infrastructure resources are modelled in memory on every backend.
        let provider = Arc::new(SimProvider::with_state(
            Arc::new(StaticIdentity::new(IDENTITY_PREFIX)),
            state,
        ));

        Ok(match config.backend {
            Backend::Sim => Backends {
                provider,
                builder: Arc::new(ContextDigester),
                registry: Arc::new(MemoryRegistry::new()),
                cluster: Arc::new(SimCluster::new()),
                balancer: Arc::new(SimBalancer::new()),
            },
            Backend::Docker => {
                let runtime = DockerRuntime::connect(config.docker.host.clone())?;
                let store = Arc::new(DockerImageStore::for_runtime(&runtime));
                let balancer = HttpBalancer::new(
                    config.health_check.path.clone(),
                    config.healthy_codes()?,
                    Duration::from_millis(config.health_check.probe_timeout_ms),
                )?;
                Backends {
                    provider,
                    builder: store.clone(),
                    registry: store,
                    cluster: Arc::new(runtime),
                    balancer: Arc::new(balancer),
                }
            }
        })
    }
}

fn config_arg() -> Arg {
    Arg::new(CONFIG_ARG)
        .long(CONFIG_ARG)
        .help("Path to YAML config file (defaults apply when omitted)")
        .value_parser(clap::value_parser!(PathBuf))
}

fn load(matches: &ArgMatches) -> Result<(Config, StateStore, ResolvedState)> {
    let config = Config::load_or_default(matches.get_one::<PathBuf>(CONFIG_ARG).map(PathBuf::as_path))?;
    let store = StateStore::open(&config.state_dir)?;
    let state = store.load_state()?;
    Ok((config, store, state))
}

/// The stack graph, pointed at the last applied image tag if there is one.
fn current_graph(config: &Config, state: &ResolvedState) -> Result<ResourceGraph> {
    let mut graph = build_graph(config)?;
    if let Some(tag) = applied_image_tag(state) {
        set_image_tag(&mut graph, tag)?;
    }
    Ok(graph)
}

fn print_plan(plan: &Plan) {
    for step in &plan.steps {
        let reason = step.reason.as_deref().unwrap_or("");
        println!(
            "{:>2}  {:<8} {:<14} {:<18} {reason}",
            step.level,
            step.action.to_string(),
            step.kind.as_str(),
            step.name
        );
    }
    for orphan in &plan.orphans {
        println!("    orphan   {orphan} (removed only by destroy)");
    }
}

/// Saves the snapshot a failed provisioning call left behind, so the next run resumes.
fn keep_partial(store: &StateStore, err: ProvisionError) -> r_deploy::Error {
    if let Some(state) = err.resumable_state() {
        if let Err(save) = store.save_state(state) {
            error!(error = %save, "failed to persist partial state");
        }
    }
    err.into()
}

async fn provision(
    config: &Config,
    store: &StateStore,
    state: ResolvedState,
    graph: &ResourceGraph,
    provider: Arc<dyn ResourceProvider>,
) -> Result<ResolvedState> {
    let provisioner = Provisioner::new(provider);
    let plan = provisioner.plan(graph, &state)?;
    print_plan(&plan);
    if !plan.has_changes() {
        info!(service = %config.service, "infrastructure is up to date");
        return Ok(state);
    }

    let (state, report) = provisioner
        .apply(&plan, state)
        .await
        .map_err(|err| keep_partial(store, err))?;
    store.save_state(&state)?;
    info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        restored = report.restored.len(),
        deleted = report.deleted.len(),
        "applied plan"
    );
    Ok(state)
}

async fn publish(config: &Config, backends: &Backends, reuse_tag: bool) -> Result<Artifact> {
    let publisher = Publisher::new(
        backends.builder.clone(),
        backends.registry.clone(),
        TagGenerator::new(config.image.tag_length)?,
    );
    let context = BuildContext {
        repository: config.image.repository.clone(),
        source: config.image.source.clone(),
        platform: config.image.platform,
    };
    let artifact = publisher.publish(&context, PublishOptions { reuse_tag }).await?;
    println!("{} {}", artifact.reference(), artifact.digest);
    Ok(artifact)
}

async fn plan_cmd(matches: &ArgMatches) -> Result<()> {
    let (config, _, state) = load(matches)?;
    let graph = current_graph(&config, &state)?;
    let plan = Provisioner::new(Backends::new(&config, &state)?.provider).plan(&graph, &state)?;
    print_plan(&plan);
    Ok(())
}

async fn apply_cmd(matches: &ArgMatches) -> Result<()> {
    let (config, store, state) = load(matches)?;
    let graph = current_graph(&config, &state)?;
    let provider = Backends::new(&config, &state)?.provider;
    provision(&config, &store, state, &graph, provider).await?;
    Ok(())
}

async fn destroy_cmd(matches: &ArgMatches) -> Result<()> {
    let (config, store, state) = load(matches)?;
    let mut graph = current_graph(&config, &state)?;
    // Resources the config no longer declares are still destroyable.
    for orphan in include_orphans(&mut graph, &state)? {
        info!(resource = %orphan, "including orphan");
    }
    let targets: Vec<&str> = matches
        .get_many::<String>("target")
        .map(|targets| targets.map(String::as_str).collect())
        .unwrap_or_default();
    let selected = if targets.is_empty() {
        graph
    } else {
        graph.subgraph(targets)
    };
    let options = DestroyOptions {
        force: matches.get_flag("force"),
    };

    let provisioner = Provisioner::new(Backends::new(&config, &state)?.provider);
    let (state, report) = provisioner
        .destroy(&selected, state, options)
        .await
        .map_err(|err| keep_partial(&store, err))?;
    store.save_state(&state)?;
    for name in &report.deleted {
        println!("deleted  {name}");
    }
    for name in &report.retained {
        println!("retained {name}");
    }
    for id in &report.revisions {
        println!("deleted  revision {id}");
    }
    Ok(())
}

async fn publish_cmd(matches: &ArgMatches) -> Result<()> {
    let (config, _, state) = load(matches)?;
    let backends = Backends::new(&config, &state)?;
    publish(&config, &backends, matches.get_flag("reuse-tag")).await?;
    Ok(())
}

async fn deploy_cmd(matches: &ArgMatches) -> Result<()> {
    let (config, store, state) = load(matches)?;
    let backends = Backends::new(&config, &state)?;

    let artifact = publish(&config, &backends, matches.get_flag("reuse-tag")).await?;
    let stable_tag = applied_image_tag(&state).map(str::to_string);
    let mut graph = build_graph(&config)?;
    set_image_tag(&mut graph, &artifact.tag)?;
    let state = provision(&config, &store, state, &graph, backends.provider.clone()).await?;
    let spec = service_spec(&config, &state)?;

    let supervisor = Arc::new(ServiceSupervisor::new(
        config.service.clone(),
        store.load_spec()?,
        backends.cluster.clone(),
        backends.balancer.clone(),
    ));

    let server = match matches.get_one::<String>("listen") {
        Some(address) => {
            let listener = TcpListener::bind(address).await?;
            let (stop, stopped) = oneshot::channel::<()>();
            let server = StatusServer::new(supervisor.clone(), store.clone());
            let handle = tokio::spawn(server.serve(listener, async move {
                let _ = stopped.await;
            }));
            Some((stop, handle))
        }
        None => None,
    };

    let result = supervisor.deploy(spec.clone()).await;
    let rolled_back = matches!(
        supervisor.status().last_run.and_then(|run| run.outcome),
        Some(Outcome::RolledBack)
    );
    if let (true, Some(tag)) = (rolled_back, stable_tag) {
        // The service runs the previous revision again; point the stack back at it.
        info!(tag = %tag, "restoring the stable task template");
        set_image_tag(&mut graph, &tag)?;
        provision(&config, &store, state, &graph, backends.provider.clone()).await?;
    }
    if let Some(run) = supervisor.status().last_run {
        store.archive_run(&run)?;
        println!(
            "run {} {} -> {}: {}",
            run.id,
            run.from.as_ref().map_or_else(|| "none".to_string(), |v| v.to_string()),
            run.to,
            match run.outcome {
                Some(Outcome::Succeeded) => "succeeded",
                Some(Outcome::RolledBack) => "rolled back",
                Some(Outcome::Failed) | None => "failed",
            }
        );
    }

    if let Some((stop, handle)) = server {
        let _ = stop.send(());
        if let Ok(Err(err)) = handle.await {
            warn!(error = %err, "status server stopped with an error");
        }
    }

    result?;
    store.save_spec(&spec)?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("r_deploy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Provision a load-balanced container service and roll out new versions without downtime.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(PLAN_CMD)
                .about("Show the steps needed to reach the configured infrastructure.")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new(APPLY_CMD)
                .about("Create, update or replace resources until the infrastructure matches the config.")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new(DESTROY_CMD)
                .about("Delete resources in reverse dependency order.")
                .arg(config_arg())
                .arg(
                    Arg::new("target")
                        .long("target")
                        .help("Resource to destroy (repeatable; all resources when omitted)")
                        .action(ArgAction::Append)
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("Also destroy resources that depend on the targets")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new(PUBLISH_CMD)
                .about("Publish the service image under a fresh immutable tag.")
                .arg(config_arg())
                .arg(
                    Arg::new("reuse-tag")
                        .long("reuse-tag")
                        .help("Return the existing tag when identical content is already published")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new(DEPLOY_CMD)
                .about("Publish, provision and roll the service to the new image.")
                .arg(config_arg())
                .arg(
                    Arg::new("reuse-tag")
                        .long("reuse-tag")
                        .help("Return the existing tag when identical content is already published")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("listen")
                        .long("listen")
                        .help("Address to serve deployment status on while the rollout runs")
                        .value_parser(clap::value_parser!(String)),
                ),
        )
        .get_matches();

    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let result = match matches.subcommand() {
        Some((PLAN_CMD, matches)) => plan_cmd(matches).await,
        Some((APPLY_CMD, matches)) => apply_cmd(matches).await,
        Some((DESTROY_CMD, matches)) => destroy_cmd(matches).await,
        Some((PUBLISH_CMD, matches)) => publish_cmd(matches).await,
        Some((DEPLOY_CMD, matches)) => deploy_cmd(matches).await,
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
            return ExitCode::FAILURE;
        }
        None => {
            error!("no subcommand provided");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}
