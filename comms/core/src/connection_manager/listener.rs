// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::net::SocketAddr;

use log::*;
use sable_shutdown::ShutdownSignal;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use crate::connection_manager::ConnectionManagerError;

const LOG_TARGET: &str = "comms::connection_manager::listener";

/// A socket fresh off `accept`, before any admission checks or handshake.
#[derive(Debug)]
pub(crate) struct AcceptedConnection {
    pub stream: TcpStream,
    pub remote_address: SocketAddr,
    pub local_address: SocketAddr,
}

/// Bind the endpoint and stream accepted sockets to the manager. Admission policy lives in the manager, not
/// here; the listener's only job is to accept.
pub(crate) async fn bind(address: SocketAddr) -> Result<TcpListener, ConnectionManagerError> {
    let listener = TcpListener::bind(address).await?;
    info!(target: LOG_TARGET, "Listening for peers on {}", address);
    Ok(listener)
}

pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    accept_tx: mpsc::Sender<AcceptedConnection>,
    mut shutdown: ShutdownSignal,
) {
    let local_address = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            error!(target: LOG_TARGET, "Listener lost its local address: {}", err);
            return;
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            result = listener.accept() => match result {
                Ok((stream, remote_address)) => {
                    trace!(target: LOG_TARGET, "Accepted connection from {}", remote_address);
                    let accepted = AcceptedConnection {
                        stream,
                        remote_address,
                        local_address,
                    };
                    if accept_tx.send(accepted).await.is_err() {
                        break;
                    }
                },
                Err(err) => {
                    // Transient accept failures (EMFILE etc). Keep the listener alive.
                    warn!(target: LOG_TARGET, "Failed to accept a connection: {}", err);
                },
            },
        }
    }
    debug!(target: LOG_TARGET, "Accept loop for {} exited", local_address);
}
