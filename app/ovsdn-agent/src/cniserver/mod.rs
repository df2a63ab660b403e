//! Pod setup/teardown broker for the CNI plugin.
//!
//! The CNI plugin invoked by the container runtime gathers the standard CNI
//! environment variables and the network configuration from stdin and
//! forwards them here over a private, root-only Unix domain socket, using
//! HTTP as the transport and JSON as the protocol. Since the socket and its
//! parent directory are owned by root with 0700 permissions and are removed
//! and re-created on every start, no unprivileged process can reach the
//! server.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use data_encoding::BASE64;
use hyper::{server::conn::Http, service::service_fn, Body, Method, Request, Response, StatusCode};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UnixListener;

/// Default directory for the broker's runtime files.
pub const CNI_SERVER_RUN_DIR: &str = "/var/run/ovsdn/cniserver";
pub const CNI_SERVER_SOCKET_NAME: &str = "socket";
pub const CNI_SERVER_CONFIG_FILE_NAME: &str = "config.json";

/// Server-to-plugin configuration, read by the CNI binary the runtime
/// invokes. Field names are wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniServerConfig {
    pub mtu: u32,
    #[serde(rename = "serviceNetworkCIDR")]
    pub service_network_cidr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Update,
    Del,
}

/// A pod setup/teardown request, parsed out of the CNI plugin's submission
/// and handed to the broker's request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRequest {
    pub command: CniCommand,
    pub pod_namespace: String,
    pub pod_name: String,
    /// kubernetes container ID
    pub sandbox_id: String,
    /// kernel network namespace path
    pub netns: String,
    /// host side of the veth pair, for an ADD
    pub host_veth: String,
    /// optional already-assigned pod IP
    pub assigned_ip: Option<Ipv4Addr>,
    /// CNI network configuration as passed to the plugin on stdin
    pub config: Vec<u8>,
}

/// Wire format of a request, as the CNI plugin submits it.
#[derive(Debug, Default, Deserialize)]
struct CniRequest {
    #[serde(default)]
    env: HashMap<String, String>,
    /// base64, matching how the plugin serializes raw bytes
    #[serde(default)]
    config: Option<String>,
    #[serde(rename = "hostVeth", default)]
    host_veth: Option<String>,
}

#[derive(Debug, Error)]
pub enum CniRequestError {
    #[error("JSON unmarshal error: {}", .0)]
    InvalidJson(serde_json::Error),
    #[error("unexpected or missing CNI_COMMAND")]
    UnexpectedCommand,
    #[error("missing CNI_CONTAINERID")]
    MissingContainerId,
    #[error("missing CNI_NETNS")]
    MissingNetns,
    #[error("missing HostVeth")]
    MissingHostVeth,
    #[error("missing CNI_ARGS")]
    MissingArgs,
    #[error("invalid CNI_ARG '{}'", .0)]
    InvalidArg(String),
    #[error("missing K8S_POD_NAMESPACE")]
    MissingPodNamespace,
    #[error("missing K8S_POD_NAME")]
    MissingPodName,
    #[error("invalid IP '{}'", .0)]
    InvalidAssignedIp(String),
    #[error("invalid config encoding")]
    InvalidConfigEncoding,
}

/// Handles one parsed pod request. Returns the JSON bytes for the plugin on
/// success (possibly empty). The broker itself keeps no state between
/// requests; if requests must be serialized, that is the handler's business.
#[async_trait]
pub trait PodRequestHandler: Send + Sync {
    async fn handle(&self, request: PodRequest) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Error)]
pub enum CniServerError {
    #[error("Couldn't prepare the CNI server directory! {}", .0)]
    PrepareRunDir(std::io::Error),
    #[error("Couldn't serialize the CNI config! {}", .0)]
    SerializeConfig(serde_json::Error),
    #[error("Couldn't write the CNI config file! {}", .0)]
    WriteConfig(std::io::Error),
    #[error("Couldn't listen on the pod info socket! {}", .0)]
    Listen(std::io::Error),
    #[error("Couldn't set the pod info socket mode! {}", .0)]
    SocketPermissions(std::io::Error),
}

#[derive(Debug, Error)]
pub enum ReadConfigError {
    #[error("the SDN network process is not (yet?) available")]
    NotAvailable,
    #[error("could not read config file: {}", .0)]
    Io(std::io::Error),
    #[error("could not parse config file: {}", .0)]
    Parse(serde_json::Error),
}

/// Reads the broker's config file, from the CNI plugin's side.
pub fn read_config(config_path: &Path) -> Result<CniServerConfig, ReadConfigError> {
    let bytes = std::fs::read(config_path).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            ReadConfigError::NotAvailable
        } else {
            ReadConfigError::Io(error)
        }
    })?;
    serde_json::from_slice(&bytes).map_err(ReadConfigError::Parse)
}

pub struct CniServer<H> {
    rundir: PathBuf,
    config: CniServerConfig,
    handler: Arc<H>,
}

impl<H: PodRequestHandler + 'static> CniServer<H> {
    pub fn new(rundir: PathBuf, config: CniServerConfig, handler: Arc<H>) -> Self {
        Self {
            rundir,
            config,
            handler,
        }
    }

    /// Prepares the run directory, writes the plugin config, binds the
    /// root-only socket, and serves requests on a background task forever.
    pub fn start(&self) -> Result<(), CniServerError> {
        prepare_run_dir(&self.rundir).map_err(CniServerError::PrepareRunDir)?;

        let config_path = self.rundir.join(CNI_SERVER_CONFIG_FILE_NAME);
        let config = serde_json::to_vec(&self.config).map_err(CniServerError::SerializeConfig)?;
        std::fs::write(&config_path, config).map_err(CniServerError::WriteConfig)?;
        std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o444))
            .map_err(CniServerError::WriteConfig)?;

        // the socket is created with the directory's permissions, so the
        // 0700 directory covers the window before this chmod
        let socket_path = self.rundir.join(CNI_SERVER_SOCKET_NAME);
        let listener = UnixListener::bind(&socket_path).map_err(CniServerError::Listen)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(CniServerError::SocketPermissions)?;

        let handler = self.handler.clone();
        tokio::spawn(serve(listener, handler));
        Ok(())
    }
}

/// Leaves the run directory empty with mode 0700, whatever state it was in.
fn prepare_run_dir(rundir: &Path) -> std::io::Result<()> {
    match std::fs::metadata(rundir) {
        Ok(info) if info.is_dir() && info.permissions().mode() & 0o777 == 0o700 => {
            for name in [CNI_SERVER_SOCKET_NAME, CNI_SERVER_CONFIG_FILE_NAME] {
                match std::fs::remove_file(rundir.join(name)) {
                    Ok(()) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => return Err(error),
                }
            }
        }
        Ok(info) if info.is_dir() => std::fs::remove_dir_all(rundir)?,
        Ok(_) => std::fs::remove_file(rundir)?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }

    std::fs::create_dir_all(rundir)?;
    std::fs::set_permissions(rundir, std::fs::Permissions::from_mode(0o700))
}

async fn serve<H: PodRequestHandler + 'static>(listener: UnixListener, handler: Arc<H>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let handler = handler.clone();
                        async move {
                            Ok::<_, Infallible>(handle_cni_request(handler, request).await)
                        }
                    });
                    if let Err(error) = Http::new()
                        .http1_keep_alive(false)
                        .serve_connection(stream, service)
                        .await
                    {
                        warn!("CNI server connection error! {error}");
                    }
                });
            }
            Err(error) => error!("CNI server accept failed! {error}"),
        }
    }
}

async fn handle_cni_request<H: PodRequestHandler>(
    handler: Arc<H>,
    request: Request<Body>,
) -> Response<Body> {
    if request.method() != Method::POST {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "");
    }
    if request.uri().path() != "/" {
        return text_response(StatusCode::NOT_FOUND, "404 page not found");
    }

    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(error) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {error}"),
            )
        }
    };

    let pod_request = match cni_request_to_pod_request(&body) {
        Ok(request) => request,
        Err(error) => return text_response(StatusCode::BAD_REQUEST, &error.to_string()),
    };

    debug!(
        "Waiting for {:?} result for pod {}/{}",
        pod_request.command, pod_request.pod_namespace, pod_request.pod_name
    );
    match handler.handle(pod_request).await {
        // empty response bytes mean success with no body
        Ok(response) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(response))
            .unwrap(),
        Err(error) => text_response(StatusCode::BAD_REQUEST, &error.to_string()),
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_owned()))
        .unwrap()
}

fn cni_request_to_pod_request(body: &[u8]) -> Result<PodRequest, CniRequestError> {
    let request: CniRequest = serde_json::from_slice(body).map_err(CniRequestError::InvalidJson)?;

    let command = match request.env.get("CNI_COMMAND").map(String::as_str) {
        Some("ADD") => CniCommand::Add,
        Some("UPDATE") => CniCommand::Update,
        Some("DEL") => CniCommand::Del,
        _ => return Err(CniRequestError::UnexpectedCommand),
    };

    let sandbox_id = request
        .env
        .get("CNI_CONTAINERID")
        .ok_or(CniRequestError::MissingContainerId)?
        .clone();
    let netns = request
        .env
        .get("CNI_NETNS")
        .ok_or(CniRequestError::MissingNetns)?
        .clone();

    let host_veth = request.host_veth.unwrap_or_default();
    if host_veth.is_empty() && command == CniCommand::Add {
        return Err(CniRequestError::MissingHostVeth);
    }

    let args = gather_cni_args(&request.env)?;
    let pod_namespace = args
        .get("K8S_POD_NAMESPACE")
        .ok_or(CniRequestError::MissingPodNamespace)?
        .clone();
    let pod_name = args
        .get("K8S_POD_NAME")
        .ok_or(CniRequestError::MissingPodName)?
        .clone();
    let assigned_ip = match args.get("IP") {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| CniRequestError::InvalidAssignedIp(raw.clone()))?,
        ),
        None => None,
    };

    let config = match request.config {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|_| CniRequestError::InvalidConfigEncoding)?,
        None => Vec::new(),
    };

    Ok(PodRequest {
        command,
        pod_namespace,
        pod_name,
        sandbox_id,
        netns,
        host_veth,
        assigned_ip,
        config,
    })
}

/// Splits the CNI_ARGS variable into a map. It holds arbitrary `;`-separated
/// `KEY=value` pairs; kubernetes passes the pod namespace and name this way.
fn gather_cni_args(env: &HashMap<String, String>) -> Result<HashMap<String, String>, CniRequestError> {
    let raw = env.get("CNI_ARGS").ok_or(CniRequestError::MissingArgs)?;

    let mut args = HashMap::new();
    for arg in raw.split(';') {
        let parts: Vec<&str> = arg.split('=').collect();
        if parts.len() != 2 {
            return Err(CniRequestError::InvalidArg(arg.to_owned()));
        }
        args.insert(parts[0].trim().to_owned(), parts[1].trim().to_owned());
    }
    Ok(args)
}
