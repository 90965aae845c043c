//! IPC listener on a Unix domain socket.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    CODE_INVALID_REQUEST, CODE_METHOD_NOT_FOUND, IpcRequest, IpcResponse,
    METHOD_DATABASES_LIST, METHOD_HEALTH_CHECK, METHOD_NODES_GET, METHOD_NODES_HEARTBEAT,
    METHOD_NODES_LIST, METHOD_NODES_REGISTER, METHOD_STATUS_GET,
};
use crate::error::{CoordError, Result};
use crate::service::{Coordinator, HeartbeatRequest, NodeQuery, RegisterNodeRequest};

/// Longest request line accepted; longer input closes the connection.
pub const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct IpcServer {
    path: PathBuf,
    listening: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Removes a socket file left behind by a dead process. A socket that still
/// accepts connections belongs to a live daemon and is left alone.
fn clear_stale_socket(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(CoordError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("socket {} is already in use", path.display()),
        )));
    }
    warn!(path = %path.display(), "removing stale socket");
    std::fs::remove_file(path)?;
    Ok(())
}

/// Binds in a private (0700) staging directory, restricts the socket to the
/// owner, then moves it into place so it is never reachable with umask
/// permissions.
fn bind_private(path: &Path) -> Result<UnixListener> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staging = tempfile::Builder::new()
        .prefix(".pgcoord-")
        .tempdir_in(parent)?;
    let staged = staging.path().join("sock");
    let listener = UnixListener::bind(&staged)?;
    std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))?;
    std::fs::rename(&staged, path)?;
    Ok(listener)
}

/// Sleeps after a failed accept so a persistent error (EMFILE) does not
/// spin. Returns false when cancelled first.
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

impl IpcServer {
    /// Binds the socket (owner-only permissions) and starts accepting.
    pub async fn start(
        path: &Path,
        coordinator: Coordinator,
        default_deadline: Duration,
        listening: Arc<AtomicBool>,
    ) -> Result<Self> {
        clear_stale_socket(path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let listener = bind_private(path)?;

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let flag = listening.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!(error = %e, "IPC accept failed");
                        if accept_backoff(&accept_cancel).await {
                            continue;
                        }
                        break;
                    }
                };
                let coordinator = coordinator.clone();
                let conn_cancel = accept_cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_connection(stream, coordinator, default_deadline, conn_cancel).await
                    {
                        debug!(error = %e, "IPC connection closed with error");
                    }
                });
            }
            flag.store(false, Ordering::SeqCst);
        });

        listening.store(true, Ordering::SeqCst);
        info!(path = %path.display(), "IPC listening");

        Ok(Self {
            path: path.to_path_buf(),
            listening,
            cancel,
            task: Some(task),
        })
    }

    /// Closes the listener and open connections, removes the socket file.
    /// Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.cancel.cancel();
        let _ = task.await;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot remove socket"),
        }
        self.listening.store(false, Ordering::SeqCst);
        info!(path = %self.path.display(), "IPC stopped");
    }
}

async fn handle_connection(
    stream: UnixStream,
    coordinator: Coordinator,
    default_deadline: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_REQUEST_BYTES + 1);
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = limited.read_until(b'\n', &mut buf) => read?,
        };
        if read == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') && buf.len() as u64 > MAX_REQUEST_BYTES {
            warn!(limit = MAX_REQUEST_BYTES, "IPC request too large, closing connection");
            let response = IpcResponse::err(
                Value::Null,
                CODE_INVALID_REQUEST,
                format!("request exceeds {} bytes", MAX_REQUEST_BYTES),
            );
            write_response(&mut writer, &response).await?;
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => dispatch(&coordinator, request, default_deadline).await,
            Err(e) => IpcResponse::err(
                Value::Null,
                CODE_INVALID_REQUEST,
                format!("invalid request: {}", e),
            ),
        };
        write_response(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &IpcResponse) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    payload.push(b'\n');
    writer.write_all(&payload).await
}

fn params<T: DeserializeOwned>(value: Value) -> std::result::Result<T, String> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| format!("invalid params: {}", e))
}

fn to_result<T: serde::Serialize>(id: Value, result: Result<T>) -> IpcResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => IpcResponse::ok(id, value),
            Err(e) => IpcResponse::err(id, "INTERNAL_ERROR", e.to_string()),
        },
        Err(e) => IpcResponse::err(id, e.code(), e.to_string()),
    }
}

#[derive(Deserialize)]
struct NodeIdParams {
    node_id: String,
}

pub(crate) async fn dispatch(
    coordinator: &Coordinator,
    request: IpcRequest,
    default_deadline: Duration,
) -> IpcResponse {
    let id = request.id;
    let deadline = request
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default_deadline);
    debug!(method = %request.method, "IPC request");

    macro_rules! parse {
        ($ty:ty) => {
            match params::<$ty>(request.params) {
                Ok(p) => p,
                Err(message) => return IpcResponse::err(id, CODE_INVALID_REQUEST, message),
            }
        };
    }

    match request.method.as_str() {
        METHOD_HEALTH_CHECK => to_result(id, coordinator.health_check(deadline).await),
        METHOD_NODES_REGISTER => {
            let p = parse!(RegisterNodeRequest);
            to_result(id, coordinator.register_node(&p, deadline).await)
        }
        METHOD_NODES_HEARTBEAT => {
            let p = parse!(HeartbeatRequest);
            to_result(id, coordinator.heartbeat(&p.node_id, deadline).await)
        }
        METHOD_NODES_LIST => {
            let p = parse!(NodeQuery);
            to_result(id, coordinator.list_nodes(&p, deadline).await)
        }
        METHOD_NODES_GET => {
            let p = parse!(NodeIdParams);
            to_result(id, coordinator.get_node(&p.node_id, deadline).await)
        }
        METHOD_STATUS_GET => to_result(id, coordinator.status()),
        METHOD_DATABASES_LIST => to_result(id, coordinator.list_databases(deadline).await),
        other => IpcResponse::err(
            id,
            CODE_METHOD_NOT_FOUND,
            format!("unknown method '{}'", other),
        ),
    }
}
