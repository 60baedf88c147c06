//! The managed application process.
//!
//! The dev server owns the application under a process handle: it can be
//! started with a load root, terminated and relaunched, or told to reload
//! its rendered view without a relaunch. The reload channel is a local
//! WebSocket: the orchestrator broadcasts a `"reload"` message and the
//! running process re-renders its current view on receipt. The port is
//! handed to the process through its environment at spawn time.

use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use camino::{Utf8Path, Utf8PathBuf};
use tungstenite::WebSocket;

use crate::error::WatchError;

/// Environment toggle selecting whether the managed application enables
/// its host-side crash reporter on startup. The variable is simply
/// inherited by the spawned process; the pipeline itself never reads it.
pub const CRASH_REPORTER_ENV: &str = "KARAKURI_CRASH_REPORTER";

/// Environment variable carrying the reload WebSocket port to the
/// managed process.
pub const RELOAD_PORT_ENV: &str = "KARAKURI_RELOAD_PORT";

/// Control surface for the managed application process.
pub trait AppProcess: Send {
    /// Launch the process with the given directory as its load root.
    fn start(&mut self, load_root: &Utf8Path) -> Result<(), WatchError>;

    /// Terminate and relaunch with the same load root.
    fn restart(&mut self) -> Result<(), WatchError>;

    /// Instruct the running process to re-render its current view.
    fn reload(&mut self) -> Result<(), WatchError>;

    /// Terminate the process.
    fn stop(&mut self) -> Result<(), WatchError>;

    /// Block until the process exits on its own.
    fn wait(&mut self) -> Result<(), WatchError>;
}

/// Real process handle spawning the application shell binary.
pub struct ShellProcess {
    program: String,
    child: Option<Child>,
    load_root: Option<Utf8PathBuf>,
    reload_tx: Option<Sender<()>>,
    port: Option<u16>,
}

impl ShellProcess {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            child: None,
            load_root: None,
            reload_tx: None,
            port: None,
        }
    }

    fn spawn(&mut self) -> Result<(), WatchError> {
        let root = self.load_root.as_ref().ok_or(WatchError::NotRunning)?;

        let mut command = Command::new(&self.program);
        command.arg(root.as_str());
        if let Some(port) = self.port {
            command.env(RELOAD_PORT_ENV, port.to_string());
        }

        tracing::info!("starting {} with load root {root}", self.program);
        self.child = Some(command.spawn()?);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), WatchError> {
        if let Some(mut child) = self.child.take() {
            child.kill()?;
            child.wait()?;
        }
        Ok(())
    }
}

impl AppProcess for ShellProcess {
    fn start(&mut self, load_root: &Utf8Path) -> Result<(), WatchError> {
        self.kill()?;
        self.load_root = Some(load_root.to_owned());

        if self.reload_tx.is_none() {
            let (tcp, port) = reserve_port()?;
            let clients = Arc::new(Mutex::new(vec![]));
            let _thread_i = new_thread_ws_incoming(tcp, clients.clone());
            let (tx_reload, _thread_o) = new_thread_ws_reload(clients);
            self.reload_tx = Some(tx_reload);
            self.port = Some(port);
        }

        self.spawn()
    }

    fn restart(&mut self) -> Result<(), WatchError> {
        self.kill()?;
        self.spawn()
    }

    fn reload(&mut self) -> Result<(), WatchError> {
        if self.child.is_none() {
            return Err(WatchError::NotRunning);
        }
        if let Some(tx) = &self.reload_tx {
            tx.send(())?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WatchError> {
        self.kill()
    }

    fn wait(&mut self) -> Result<(), WatchError> {
        if let Some(mut child) = self.child.take() {
            child.wait()?;
        }
        Ok(())
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        self.kill().ok();
    }
}

fn reserve_port() -> Result<(TcpListener, u16), WatchError> {
    let listener = match TcpListener::bind("127.0.0.1:1337") {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0")?,
    };

    let addr = listener.local_addr()?;
    let port = addr.port();
    Ok((listener, port))
}

fn new_thread_ws_incoming(
    server: TcpListener,
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let Ok(stream) = stream else { continue };
            match tungstenite::accept(stream) {
                Ok(socket) => client.lock().unwrap().push(socket),
                Err(e) => tracing::error!("websocket handshake failed: {e}"),
            }
        }
    })
}

fn new_thread_ws_reload(
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();

    let thread = std::thread::spawn(move || {
        while rx.recv().is_ok() {
            let mut clients = client.lock().unwrap();
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send("reload".into()) {
                    Ok(_) => {}
                    Err(tungstenite::error::Error::Io(e)) => {
                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            broken.push(i);
                        }
                    }
                    Err(e) => {
                        tracing::error!("reload broadcast failed: {e:?}");
                    }
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }
        }
    });

    (tx, thread)
}
