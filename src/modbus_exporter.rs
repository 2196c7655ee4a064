//! Modbus TCP server publishing the virtual device's register block.

use crate::bus::BusValue;
use crate::register_map::{self, BLOCK_LEN, BLOCK_START, REGISTER_MAP};
use std::{
    future,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::net::TcpListener;
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{debug, info, warn};

/// Modbus TCP view of the virtual device.
///
/// Holds the register block every published property is encoded into and
/// answers read requests from any unit id. Clones share the same block.
#[derive(Clone)]
pub struct RegisterExporter {
    block: Arc<Mutex<Vec<u16>>>,
}

impl Default for RegisterExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl tokio_modbus::server::Service for RegisterExporter {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(start, count) => {
                read_range(&self.block(), start, count).map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(start, count) => {
                read_range(&self.block(), start, count).map(Response::ReadInputRegisters)
            }
            _ => {
                debug!(?req, "Unimplemented function code");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl RegisterExporter {
    /// Creates a block with every property set to "no data". Gaps between
    /// mapped registers read as zero.
    pub fn new() -> Self {
        let mut block = vec![0u16; usize::from(BLOCK_LEN)];
        for spec in REGISTER_MAP {
            write_words(&mut block, spec.register, &spec.encode(&BusValue::Empty));
        }
        Self {
            block: Arc::new(Mutex::new(block)),
        }
    }

    fn block(&self) -> MutexGuard<'_, Vec<u16>> {
        self.block.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encodes `value` into the registers backing `path`. Returns false when
    /// the path has no register.
    pub fn set_property(&self, path: &str, value: &BusValue) -> bool {
        let Some(spec) = register_map::lookup(path) else {
            return false;
        };
        write_words(&mut self.block(), spec.register, &spec.encode(value));
        true
    }

    /// Decodes the current value of `path` from the block.
    pub fn property(&self, path: &str) -> Option<BusValue> {
        let spec = register_map::lookup(path)?;
        Some(spec.decode_block(&self.block()))
    }

/// Accepts Modbus TCP connections on `socket_addr` until the listener
    /// fails.
    pub async fn serve(self, socket_addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(socket_addr).await?;
        info!(%socket_addr, "Serving aggregate registers");
        self.serve_listener(listener).await
    }

    /// Same as [`serve`](Self::serve) on an already bound listener.
    pub async fn serve_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let server = Server::new(listener);
        let new_service = |_socket_addr| Ok(Some(self.clone()));
        let on_connected = |stream, socket_addr| async move {
            accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| {
            warn!("Modbus connection error: {err}");
        };
        server.serve(&on_connected, on_process_error).await?;
        Ok(())
    }
}

fn write_words(block: &mut [u16], register: u16, words: &[u16]) {
    let offset = usize::from(register - BLOCK_START);
    block[offset..offset + words.len()].copy_from_slice(words);
}

/// Copies `count` registers starting at `start` out of the block. A read
/// reaching outside the block fails as a whole.
fn read_range(block: &[u16], start: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
    let words = start
        .checked_sub(BLOCK_START)
        .map(usize::from)
        .and_then(|offset| block.get(offset..offset + usize::from(count)));
    match words {
        Some(words) => Ok(words.to_vec()),
        None => {
            debug!(start, count, "Read outside the register block");
            Err(ExceptionCode::IllegalDataAddress)
        }
    }
}
