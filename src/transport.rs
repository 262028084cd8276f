//! # Transport Pair Module
//!
//! A bridge session runs over two unidirectional Unix-domain-socket
//! streams connected as a client/server pair:
//!
//! - the **command** stream carries Call frames, manager → runner;
//! - the **response** stream carries Response, Event and Log frames,
//!   runner → manager.
//!
//! The manager is the server end. It binds both listeners *before*
//! spawning the child so the runner never races an unbound socket, and it
//! accepts in a fixed order, command first then response, which the
//! runner mirrors when connecting. Endpoint paths are derived from a
//! fresh random 8-hex-char token, making them unique per spawn and
//! discoverable by the child through its command line.
//!
//! Both ends of both streams get large (≥4 MiB) kernel socket buffers so
//! bursts of event frames are absorbed without blocking the service; a
//! runner that outpaces even that buffer blocks in its own write, which
//! is the intended backpressure.
//!
//! The server end owns the socket files: they are unlinked as soon as
//! both connections are accepted, and again best-effort on drop in case
//! startup failed partway.

use std::path::{Path, PathBuf};

use rand::Rng;
use socket2::SockRef;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::defaults::SOCKET_BUFFER_BYTES;

/// Server end of a session's two listening endpoints.
pub struct EndpointPair {
    command_path: PathBuf,
    response_path: PathBuf,
    command_listener: Option<UnixListener>,
    response_listener: Option<UnixListener>,
}

impl EndpointPair {
    /// Bind the command and response listeners under `socket_dir`.
    ///
    /// Paths follow `<dir>/<token>-cmd.sock` / `<dir>/<token>-rsp.sock`
    /// with a random 8-hex-char token per call.
    pub fn bind(socket_dir: &Path) -> std::io::Result<Self> {
        let token: u32 = rand::thread_rng().gen();
        let token = format!("{token:08x}");
        let command_path = socket_dir.join(format!("{token}-cmd.sock"));
        let response_path = socket_dir.join(format!("{token}-rsp.sock"));

        let command_listener = UnixListener::bind(&command_path)?;
        let response_listener = match UnixListener::bind(&response_path) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = std::fs::remove_file(&command_path);
                return Err(e);
            }
        };

        debug!(
            command = %command_path.display(),
            response = %response_path.display(),
            "session endpoints bound"
        );

        Ok(Self {
            command_path,
            response_path,
            command_listener: Some(command_listener),
            response_listener: Some(response_listener),
        })
    }

    /// Path of the command endpoint, for the child's command line.
    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    /// Path of the response endpoint, for the child's command line.
    pub fn response_path(&self) -> &Path {
        &self.response_path
    }

    /// Accept the runner's command-stream connection.
    ///
    /// Must be awaited before [`EndpointPair::accept_response`]; the
    /// runner connects in the same order.
    pub async fn accept_command(&mut self) -> std::io::Result<UnixStream> {
        let listener = self
            .command_listener
            .take()
            .expect("command endpoint already accepted");
        let (stream, _) = listener.accept().await?;
        tune_socket(&stream)?;
        debug!("command stream connected");
        Ok(stream)
    }

    /// Accept the runner's response-stream connection.
    pub async fn accept_response(&mut self) -> std::io::Result<UnixStream> {
        let listener = self
            .response_listener
            .take()
            .expect("response endpoint already accepted");
        let (stream, _) = listener.accept().await?;
        tune_socket(&stream)?;
        debug!("response stream connected");
        Ok(stream)
    }

    /// Unlink both socket files. Safe to call more than once.
    pub fn unlink(&self) {
        for path in [&self.command_path, &self.response_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove socket file {}: {e}", path.display());
                }
            }
        }
    }
}

impl Drop for EndpointPair {
    fn drop(&mut self) {
        self.unlink();
    }
}

/// Client-end connect used by the runner.
///
/// Connects command first, then response, mirroring the server's accept
/// order; swapping the order would deadlock the startup handshake.
pub async fn connect_runner(
    command_path: &Path,
    response_path: &Path,
) -> std::io::Result<(UnixStream, UnixStream)> {
    let command = UnixStream::connect(command_path).await?;
    tune_socket(&command)?;
    let response = UnixStream::connect(response_path).await?;
    tune_socket(&response)?;
    debug!(
        command = %command_path.display(),
        response = %response_path.display(),
        "runner connected to session endpoints"
    );
    Ok((command, response))
}

fn tune_socket(stream: &UnixStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_send_buffer_size(SOCKET_BUFFER_BYTES)?;
    sock.set_recv_buffer_size(SOCKET_BUFFER_BYTES)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Frame, ResponseStatus};

    #[tokio::test]
    async fn pair_connects_and_carries_frames_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let mut endpoints = EndpointPair::bind(dir.path()).unwrap();

        let command_path = endpoints.command_path().to_path_buf();
        let response_path = endpoints.response_path().to_path_buf();

        let client = tokio::spawn(async move {
            let (mut command, mut response) =
                connect_runner(&command_path, &response_path).await.unwrap();

            // Runner side: read one call, answer it on the other stream.
            let frame = Frame::read_from(&mut command).await.unwrap();
            match frame {
                Frame::Call { id, method, .. } => {
                    assert_eq!(method, "ping");
                    let reply = Frame::Response {
                        id,
                        status: ResponseStatus::Success,
                        payload: Vec::new(),
                    };
                    reply.write_to(&mut response).await.unwrap();
                }
                other => panic!("unexpected frame {other:?}"),
            }
        });

        let mut command = endpoints.accept_command().await.unwrap();
        let mut response = endpoints.accept_response().await.unwrap();
        endpoints.unlink();

        let call = Frame::Call {
            id: 1,
            method: "ping".to_string(),
            args: Vec::new(),
        };
        call.write_to(&mut command).await.unwrap();

        let reply = Frame::read_from(&mut response).await.unwrap();
        assert!(matches!(reply, Frame::Response { id: 1, .. }));

        client.await.unwrap();
    }

    #[tokio::test]
    async fn unlink_removes_socket_files() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointPair::bind(dir.path()).unwrap();
        let command_path = endpoints.command_path().to_path_buf();
        let response_path = endpoints.response_path().to_path_buf();
        assert!(command_path.exists());
        assert!(response_path.exists());

        endpoints.unlink();
        assert!(!command_path.exists());
        assert!(!response_path.exists());
    }

    #[tokio::test]
    async fn endpoint_names_are_unique_per_bind() {
        let dir = tempfile::tempdir().unwrap();
        let a = EndpointPair::bind(dir.path()).unwrap();
        let b = EndpointPair::bind(dir.path()).unwrap();
        assert_ne!(a.command_path(), b.command_path());
        assert_ne!(a.response_path(), b.response_path());
    }
}
