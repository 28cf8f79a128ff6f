// Client creation for registered clusters, with custom user-agent support for kube 2.x
use crate::error::{Error, Result as KcResult};
use crate::k8s::cache::{ClusterCredentials, ClusterDescriptor};
use hyper::http::{HeaderName, HeaderValue};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, warn};
use x509_parser::pem::Pem;

/// Create a new k8s client for the cluster described by `descriptor`
///
/// # Errors
///
/// Will return `Err` if the kubeconfig cannot be parsed, the API server URL is
/// invalid, the CA bundle holds no certificate, or the client cannot be built
pub async fn new(
    descriptor: &ClusterDescriptor,
    custom_user_agent: Option<&str>,
) -> KcResult<Client> {
    let mut config = config_for(descriptor).await?;
    add_user_agent_header(&mut config, custom_user_agent);
    debug!(cluster = %descriptor.id, url = %config.cluster_url, "building client");
    Ok(Client::try_from(config)?)
}

/// Resolve a descriptor to a kube `Config` without touching the network
///
/// # Errors
///
/// See [`new`]
pub async fn config_for(descriptor: &ClusterDescriptor) -> KcResult<Config> {
    let mut config = match &descriptor.credentials {
        ClusterCredentials::Kubeconfig { content, context } => {
            let kubeconfig = Kubeconfig::from_yaml(content)?;
            let options = KubeConfigOptions {
                context: context.clone(),
                ..KubeConfigOptions::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        ClusterCredentials::BearerToken { token, ca_bundle } => {
            let mut config = Config::new(parse_url(&descriptor.api_server)?);
            config.auth_info.token = Some(token.clone().into());
            if let Some(bundle) = ca_bundle {
                config.root_cert = Some(pem_to_der(bundle)?);
            }
            config
        }
    };

    if !descriptor.api_server.is_empty() {
        config.cluster_url = parse_url(&descriptor.api_server)?;
    }
    if let Some(namespace) = &descriptor.namespace {
        config.default_namespace.clone_from(namespace);
    }
    Ok(config)
}

fn parse_url(url: &str) -> KcResult<hyper::http::Uri> {
    url.parse()
        .map_err(|e| Error::Custom(format!("invalid API server URL '{url}': {e}")))
}

/// Decode every certificate in a PEM bundle into DER
fn pem_to_der(bundle: &str) -> KcResult<Vec<Vec<u8>>> {
    let certs = Pem::iter_from_buffer(bundle.as_bytes())
        .map(|pem| {
            pem.map(|pem| pem.contents)
                .map_err(|e| Error::Custom(format!("invalid CA bundle: {e}")))
        })
        .collect::<KcResult<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Custom("CA bundle contains no certificates".to_string()));
    }
    Ok(certs)
}

/// Add the user-agent header to every request made with `config`
pub fn add_user_agent_header(config: &mut Config, custom_user_agent: Option<&str>) {
    let Some(user_agent) = custom_user_agent else {
        return;
    };
    // If the header value is invalid, we'll just use the default user-agent
    match HeaderValue::from_str(user_agent) {
        Ok(header_value) => config
            .headers
            .push((HeaderName::from_static("user-agent"), header_value)),
        Err(e) => warn!("ignoring invalid user agent '{}': {}", user_agent, e),
    }
}
