use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::error::AppError;
use crate::app::rpc::agent::ConnectionContext;
use crate::app::rpc::envelope::{Action, Envelope, ResultCode};
use crate::app::rpc::frame::{read_envelope, write_envelope};

/// Produces exactly one response envelope for one request. The connection stamps the sequence number.
pub trait ActionHandler: Send + Sync {
    fn handle(
        &self,
        request: &Envelope,
        ctx: &mut ConnectionContext,
        trace_id: &str,
    ) -> Result<Envelope, AppError>;
}

struct RegisteredHandler {
    name: String,
    priority: i32,
    handler: Arc<dyn ActionHandler>,
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    entries: BTreeMap<Action, Vec<RegisteredHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(
        mut self,
        action: Action,
        name: impl Into<String>,
        priority: i32,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.entries.entry(action).or_default().push(RegisteredHandler {
            name: name.into(),
            priority,
            handler,
        });
        self
    }

    pub fn build(mut self) -> HandlerRegistry {
        for handlers in self.entries.values_mut() {
            handlers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        }
        HandlerRegistry {
            entries: self.entries,
        }
    }
}

/// Action to ordered handler list, fixed after `build()`.
pub struct HandlerRegistry {
    entries: BTreeMap<Action, Vec<RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn names(&self, action: Action) -> Vec<&str> {
        self.entries
            .get(&action)
            .map(|handlers| handlers.iter().map(|entry| entry.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Validates the sequence number, runs the action's handlers in order and returns
    /// their responses, each stamped with the connection's current sequence number.
    pub fn respond(
        &self,
        request: &Envelope,
        ctx: &mut ConnectionContext,
        last_seq: &mut u32,
        trace_id: &str,
    ) -> Vec<Envelope> {
        let expected = last_seq.wrapping_add(1);
        if request.seq != Some(expected) {
            warn!(trace_id = %trace_id, expected, got = ?request.seq, "sequence mismatch");
            return vec![Envelope::response(ResultCode::InvalidSeq).with_seq(*last_seq)];
        }
        *last_seq = expected;

        let handlers = request
            .action_kind()
            .and_then(|action| self.entries.get(&action))
            .filter(|handlers| !handlers.is_empty());
        let Some(handlers) = handlers else {
            warn!(trace_id = %trace_id, action = ?request.action, "no handler for action");
            return vec![Envelope::response(ResultCode::InvalidAction).with_seq(expected)];
        };

        handlers
            .iter()
            .map(|entry| match entry.handler.handle(request, ctx, trace_id) {
                Ok(response) => response.with_seq(expected),
                Err(err) => {
                    error!(trace_id = %trace_id, handler = %entry.name, error = %err, "handler failed");
                    Envelope::response(ResultCode::InvalidRequest).with_seq(expected)
                }
            })
            .collect()
    }
}

/// The acceptor side: one live connection at a time, each with its own sequence counter.
pub struct RpcServer {
    listener: TcpListener,
    registry: Arc<HandlerRegistry>,
    port: u16,
}

impl RpcServer {
    pub fn bind(host: &str, port: u16, registry: HandlerRegistry) -> Result<Self, AppError> {
        let listener = TcpListener::bind((host, port))
            .map_err(|err| AppError::system(format!("Failed to bind {host}:{port}: {err}"), ""))?;
        let port = listener
            .local_addr()
            .map_err(|err| AppError::system(format!("Failed to read bound address: {err}"), ""))?
            .port();
        info!("Test RPCServer started at port {port}");
        Ok(Self {
            listener,
            registry: Arc::new(registry),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accepts until `stop` is set. Each accepted connection replaces the previous one.
    pub fn serve(&self, stop: Arc<AtomicBool>) -> Result<(), AppError> {
        let trace_id = Uuid::new_v4().to_string();
        self.listener
            .set_nonblocking(true)
            .map_err(|err| AppError::system(format!("Failed to configure listener: {err}"), &trace_id))?;
        let mut current: Option<TcpStream> = None;

        while !stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(previous) = current.take() {
                        info!(trace_id = %trace_id, "replacing previous connection");
                        let _ = previous.shutdown(Shutdown::Both);
                    }
                    match self.spawn_connection(stream, peer) {
                        Ok(handle) => current = Some(handle),
                        Err(err) => warn!(trace_id = %trace_id, error = %err, "failed to start connection"),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, "accept failed");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
        if let Some(previous) = current.take() {
            let _ = previous.shutdown(Shutdown::Both);
        }
        info!(trace_id = %trace_id, port = self.port, "rpc server stopped");
        Ok(())
    }

    pub fn spawn(self, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>, AppError> {
        std::thread::Builder::new()
            .name("rpc-accept".to_string())
            .spawn(move || {
                if let Err(err) = self.serve(stop) {
                    error!(error = %err, "rpc server failed");
                }
            })
            .map_err(|err| AppError::system(format!("Failed to spawn rpc server: {err}"), ""))
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<TcpStream, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let io_err = |err: std::io::Error| AppError::system(format!("Failed to prepare connection: {err}"), &trace_id);
        stream.set_nonblocking(false).map_err(io_err)?;
        let _ = stream.set_nodelay(true);
        let handle = stream.try_clone().map_err(io_err)?;
        let registry = Arc::clone(&self.registry);
        let thread_trace = trace_id.clone();
        std::thread::Builder::new()
            .name("rpc-connection".to_string())
            .spawn(move || serve_connection(stream, registry, &thread_trace))
            .map_err(|err| AppError::system(format!("Failed to spawn connection: {err}"), &trace_id))?;
        info!(trace_id = %trace_id, peer = %peer, "connection accepted");
        Ok(handle)
    }
}

fn serve_connection(stream: TcpStream, registry: Arc<HandlerRegistry>, trace_id: &str) {
    let read_half = match stream.try_clone() {
        Ok(read_half) => read_half,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "failed to split connection");
            return;
        }
    };
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(stream);
    let mut ctx = ConnectionContext::default();
    let mut last_seq = 0u32;

    loop {
        let request = match read_envelope(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!(trace_id = %trace_id, "connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "dropping connection");
                break;
            }
        };
        debug!(trace_id = %trace_id, action = ?request.action, seq = ?request.seq, "request received");
        for response in registry.respond(&request, &mut ctx, &mut last_seq, trace_id) {
            if let Err(err) = write_envelope(&mut writer, &response) {
                warn!(trace_id = %trace_id, error = %err, "failed to write response");
                return;
            }
        }
    }
}
