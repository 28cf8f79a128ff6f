use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use k8s_openapi::serde_json;
use kube::ResourceExt;
use kubecache::k8s::cache::{
    CacheConfig, ClusterCacheManager, ClusterCredentials, ClusterDescriptor, ClusterId,
    ResourceKind,
};
use kubecache::k8s::selector::LabelSelector;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubeconfig file to register as a cluster; repeat for several clusters
    #[arg(short, long)]
    kubeconfig: Vec<PathBuf>,

    /// JSON file holding a list of cluster descriptors
    #[arg(long)]
    clusters: Option<PathBuf>,

    /// Kinds to cache, comma separated (defaults to the configured kind set)
    #[arg(long, value_delimiter = ',')]
    kinds: Vec<ResourceKind>,

    /// Only cache namespaced objects from this namespace
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector for the pods printed after warm-up
    #[arg(short = 'l', long, default_value = "")]
    selector: String,

    /// How long to wait for each cluster's first sync
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// JSON cache configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep watching after warm-up and print every cache change until interrupted
    #[arg(short, long)]
    follow: bool,
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CacheConfig> {
    let Some(path) = path else {
        return Ok(CacheConfig::default());
    };
    let raw = read_file(path)?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn load_descriptors(args: &Args) -> anyhow::Result<Vec<ClusterDescriptor>> {
    let mut descriptors: Vec<ClusterDescriptor> = match &args.clusters {
        Some(path) => {
            let raw = read_file(path)?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Vec::new(),
    };

    let next_id = descriptors.iter().map(|d| d.id.0).max().unwrap_or(0) + 1;
    for (offset, path) in (0u64..).zip(&args.kubeconfig) {
        let content = read_file(path)?;
        descriptors.push(ClusterDescriptor {
            id: ClusterId(next_id + offset),
            name: path.file_stem().map(|stem| stem.to_string_lossy().into_owned()),
            api_server: String::new(),
            credentials: ClusterCredentials::Kubeconfig { content, context: None },
            namespace: None,
        });
    }

    if let Some(namespace) = &args.namespace {
        for descriptor in &mut descriptors {
            descriptor.namespace = Some(namespace.clone());
        }
    }
    Ok(descriptors)
}

fn print_cluster(
    manager: &ClusterCacheManager,
    descriptor: &ClusterDescriptor,
    selector: &LabelSelector,
    kinds: &[ResourceKind],
) {
    println!("== {} ({})", descriptor.display_name(), descriptor.id);
    for stats in manager.stats().iter().filter(|s| s.identity.cluster_id == descriptor.id) {
        for session in &stats.sessions {
            println!(
                "   {:<12} {:>6} objects  lists={} restarts={}",
                session.kind.as_str(),
                session.objects,
                session.lists,
                session.watch_restarts
            );
        }
    }

    if !kinds.contains(&ResourceKind::Pod) {
        return;
    }
    match manager.pods_lister(descriptor.id).and_then(|pods| pods.list_all(selector)) {
        Ok(pods) => {
            for pod in pods {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.phase.clone())
                    .unwrap_or_default();
                let namespace = pod.namespace().unwrap_or_default();
                println!("   pod {}/{} {}", namespace, pod.name_any(), phase);
            }
        }
        Err(e) => error!(cluster = %descriptor.id, "could not list pods: {}", e),
    }
}

async fn follow(manager: &ClusterCacheManager) -> anyhow::Result<()> {
    let (id, mut updates) = manager.subscribe("*").await;
    info!("following cache changes, ctrl-c to stop");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                println!("{:<9} {} {}", format!("{:?}", update.action), update.key(), update.name);
            }
        }
    }
    manager.unsubscribe(&id).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let descriptors = load_descriptors(&args)?;
    if descriptors.is_empty() {
        anyhow::bail!("no clusters given; pass --kubeconfig or --clusters");
    }
    let selector: LabelSelector = args.selector.parse()?;
    let kinds = if args.kinds.is_empty() {
        config.default_kinds.clone()
    } else {
        args.kinds.clone()
    };
    let timeout = args
        .timeout_secs
        .map_or_else(|| config.default_sync_timeout(), Duration::from_secs);

    let manager = ClusterCacheManager::with_kube_client(config);
    let results = join_all(
        descriptors
            .iter()
            .map(|descriptor| manager.ensure_kinds_and_wait(descriptor, &kinds, timeout)),
    )
    .await;

    for (descriptor, result) in descriptors.iter().zip(results) {
        match result {
            Ok(()) => {
                info!(cluster = %descriptor.id, "cache ready");
                print_cluster(&manager, descriptor, &selector, &kinds);
            }
            Err(e) => error!(
                cluster = %descriptor.id,
                status = e.http_status(),
                retryable = e.is_retryable(),
                "{}",
                e
            ),
        }
    }

    if args.follow {
        follow(&manager).await?;
    }

    manager.shutdown().await;
    Ok(())
}
