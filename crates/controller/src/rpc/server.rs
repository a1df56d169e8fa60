#![forbid(unsafe_code)]

use super::framing::{TransportMode, detect_mode_from_first_line, read_content_length_frame, read_frame, write_frame};
use super::methods::Session;
use crate::controller::NodeController;
use crate::error::ControllerError;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) type SharedWriter = Arc<Mutex<BufWriter<TcpStream>>>;

/// TCP acceptor for the controller's JSON-RPC surface. One thread per
/// connection; each connection picks its framing from its first line.
pub struct RpcServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RpcServer {
    pub fn start(
        controller: Arc<NodeController>,
        addr: impl ToSocketAddrs,
    ) -> Result<Self, ControllerError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("xt-rpc-accept".to_string())
            .spawn(move || accept_loop(listener, controller, flag))?;
        tracing::info!(%addr, "controller rpc listening");
        Ok(Self {
            addr,
            stop,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting; open connections end when their peers disconnect.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, controller: Arc<NodeController>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, controller) {
                        tracing::debug!(%peer, error = %err, "rpc connection closed with error");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                tracing::warn!(error = %err, "rpc accept failed");
            }
        }
    }
}

fn handle_connection(stream: TcpStream, controller: Arc<NodeController>) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut first = String::new();
    let mode = loop {
        first.clear();
        if reader.read_line(&mut first)? == 0 {
            return Ok(());
        }
        if let Some(mode) = detect_mode_from_first_line(&first) {
            break mode;
        }
    };
    let writer: SharedWriter = Arc::new(Mutex::new(BufWriter::new(stream)));
    let mut session = Session::new(controller, Arc::clone(&writer), mode);

    let mut next = match mode {
        TransportMode::NewlineJson => Some(first.trim().as_bytes().to_vec()),
        TransportMode::ContentLength => read_content_length_frame(&mut reader, Some(first))?,
    };
    let outcome = loop {
        let Some(body) = next.take() else {
            break Ok(());
        };
        if let Some(response) = session.handle_frame(&body)
            && let Err(err) = write_frame(&mut *writer.lock(), mode, &response)
        {
            break Err(err);
        }
        next = match read_frame(&mut reader, mode) {
            Ok(frame) => frame,
            Err(err) => break Err(err),
        };
    };
    session.close();
    outcome
}
