use super::socket::DriverSocket;
use super::IpamDaemon;
use crate::directory::AddressDirectory;
use crate::rpc::{read_frame, write_frame, Request, Response, RpcError};
use log::{debug, error, info, warn};
use std::io::{self, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Lifecycle of the daemon process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    SocketBound,
    Serving,
}

/// Unix socket front end of an [`IpamDaemon`]
pub struct SocketServer<D: AddressDirectory> {
    daemon: Arc<IpamDaemon<D>>,
    socket: DriverSocket,
    listener: UnixListener,
    timeout: Duration,
    state: DaemonState,
}

impl<D: AddressDirectory + 'static> SocketServer<D> {
    /// Take over the socket path and bind the listener
    pub fn bind(
        daemon: Arc<IpamDaemon<D>>,
        socket: DriverSocket,
        timeout: Duration,
    ) -> io::Result<Self> {
        info!("Daemon state: {:?}", DaemonState::Starting);
        let listener = UnixListener::bind(socket.setup()?)?;

        let server = Self {
            daemon,
            socket,
            listener,
            timeout,
            state: DaemonState::SocketBound,
        };
        info!(
            "Daemon state: {:?} ({})",
            server.state,
            server.socket.socket_file().display()
        );
        Ok(server)
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn socket_file(&self) -> &Path {
        self.socket.socket_file()
    }

    /// Accept connections until the listener fails, one thread per connection
    pub fn run(mut self) -> io::Result<()> {
        self.state = DaemonState::Serving;
        info!("Daemon state: {:?}", self.state);

        for (n, stream) in self.listener.incoming().enumerate() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let daemon = Arc::clone(&self.daemon);
            let timeout = self.timeout;
            let spawned = thread::Builder::new()
                .name(format!("ipamd-conn-{}", n))
                .spawn(move || {
                    if let Err(e) = handle_connection(&daemon, stream, timeout) {
                        debug!("Connection closed: {}", e);
                    }
                });
            if let Err(e) = spawned {
                error!("Failed to spawn connection handler: {}", e);
            }
        }
        Ok(())
    }
}

/// Bind and serve until the process is terminated
pub fn serve<D: AddressDirectory + 'static>(
    daemon: Arc<IpamDaemon<D>>,
    socket: DriverSocket,
    timeout: Duration,
) -> io::Result<()> {
    SocketServer::bind(daemon, socket, timeout)?.run()
}

/// Serve sequential calls on one connection until the peer hangs up
fn handle_connection<D: AddressDirectory>(
    daemon: &IpamDaemon<D>,
    stream: UnixStream,
    timeout: Duration,
) -> Result<(), RpcError> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    loop {
        let request: Request = match read_frame(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(RpcError::Codec(e)) => {
                warn!("Malformed request: {}", e);
                write_frame(&mut writer, &Response::err(0, format!("malformed request: {}", e)))?;
                continue;
            }
            Err(e) => return Err(e),
        };
        debug!("{} (id {})", request.method, request.id);
        let response = daemon.dispatch(request);
        write_frame(&mut writer, &response)?;
    }
}
