//! Connection supervisor
//!
//! States are derived from `State`: `client` set means connected,
//! `connecting` set means a retry loop is running, neither means
//! disconnected. At most one loop runs at a time.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Service;
use crate::config::ServiceConfig;
use crate::error::{ModmasterError, Result};
use crate::runtime::reconnect::Backoff;
use crate::transport::{ModbusClient, TransportError};

enum ConnectRequest {
    AlreadyConnected,
    AlreadyConnecting,
    Started(CancellationToken, u64),
}

impl Service {
    /// Request a connection without waiting for it
    ///
    /// Starts a background retry loop on the current tokio runtime unless one
    /// is already running or a client is already held. Attempt outcomes are
    /// reported through status and log events only.
    pub fn connect(&self) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|e| ModmasterError::runtime(format!("connect needs a tokio runtime: {}", e)))?;

        let request = {
            let mut state = self.inner.state.lock();
            if state.client.is_some() {
                ConnectRequest::AlreadyConnected
            } else if state.connecting {
                ConnectRequest::AlreadyConnecting
            } else {
                let (token, generation) = state.arm_connect();
                ConnectRequest::Started(token, generation)
            }
        };

        match request {
            ConnectRequest::AlreadyConnected => {
                self.log_sys("connect requested: already connected");
            },
            ConnectRequest::AlreadyConnecting => {
                self.log_sys("connect requested: already connecting");
            },
            ConnectRequest::Started(token, generation) => {
                self.log_sys("connect requested: starting loop");
                self.emit_status();
                let service = self.clone();
                handle.spawn(async move { service.connect_loop(token, generation).await });
            },
        }
        Ok(())
    }

    /// Stop any retry loop and close the held client
    ///
    /// Idempotent. Returns the close error, if closing the client failed.
    pub async fn disconnect(&self) -> Result<()> {
        let (cancel, client) = {
            let mut state = self.inner.state.lock();
            state.connecting = false;
            state.last_connect_error = None;
            state.generation += 1;
            (state.connect_cancel.take(), state.client.take())
        };

        self.log_sys("disconnect requested");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let closed = match client {
            Some(client) => client.close().await.map_err(ModmasterError::from),
            None => Ok(()),
        };
        self.emit_status();
        closed
    }

    async fn connect_loop(self, token: CancellationToken, generation: u64) {
        let mut backoff = Backoff::new(self.inner.reconnect.clone());

        loop {
            if token.is_cancelled() {
                self.log_sys("connect stopped");
                return;
            }

            let config = self.inner.state.lock().config.clone();
            let attempt = backoff.begin_attempt();
            self.log_sys(format!(
                "connect attempt {}: {}",
                attempt,
                config.connection_summary()
            ));

            let opened = tokio::select! {
                _ = token.cancelled() => None,
                result = self.open_client(&config) => Some(result),
            };
            let Some(opened) = opened else {
                self.log_sys("connect stopped");
                return;
            };

            match opened {
                Ok(client) => {
                    self.commit_client(client, &token, generation).await;
                    return;
                },
                Err(err) => {
                    let message = err.to_string();
                    {
                        let mut state = self.inner.state.lock();
                        if state.generation == generation {
                            state.last_connect_error = Some(message.clone());
                        }
                    }
                    self.log_err(format!("connect failed: {}", message));
                    self.emit_status();

                    let delay = backoff.record_failure();
                    tokio::select! {
                        _ = token.cancelled() => {
                            self.log_sys("connect stopped");
                            return;
                        },
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }
    }

    async fn open_client(
        &self,
        config: &ServiceConfig,
    ) -> std::result::Result<Arc<dyn ModbusClient>, TransportError> {
        let client = self.inner.factory.create(config)?;
        client.open().await?;
        Ok(client)
    }

    /// Store a freshly opened client unless the loop was superseded meanwhile
    async fn commit_client(
        &self,
        client: Arc<dyn ModbusClient>,
        token: &CancellationToken,
        generation: u64,
    ) {
        let committed = {
            let mut state = self.inner.state.lock();
            if token.is_cancelled() || state.generation != generation {
                false
            } else {
                state.client = Some(Arc::clone(&client));
                state.connecting = false;
                state.connect_cancel = None;
                state.last_connect_error = None;
                true
            }
        };

        if committed {
            self.log_sys("connect succeeded");
            self.emit_status();
            return;
        }

        debug!(generation, "Discarding client opened by a superseded connect loop");
        if let Err(e) = client.close().await {
            debug!(error = %e, "Closing superseded client failed");
        }
        self.log_sys("connect stopped");
    }

    /// Tear down and reconnect after a connection-class read error
    ///
    /// `generation` is the one the failing read observed; nothing happens if
    /// the connection has changed hands since.
    pub(super) fn maybe_reconnect(&self, error: &TransportError, generation: u64) {
        if !error.is_connection_error() {
            return;
        }
        {
            let state = self.inner.state.lock();
            if state.client.is_none() || state.connecting || state.generation != generation {
                debug!(generation, "Skipping reconnect, connection already changed");
                return;
            }
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("Cannot reconnect without a tokio runtime");
            return;
        };

        self.log_sys("connection lost; reconnecting");
        let service = self.clone();
        let message = error.to_string();
        handle.spawn(async move { service.reconnect_after_loss(generation, message).await });
    }

    async fn reconnect_after_loss(self, generation: u64, message: String) {
        // Teardown and loop start happen in one critical section so a
        // concurrent disconnect either precedes both or cancels the new loop
        let armed = {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.connecting {
                None
            } else {
                match state.client.take() {
                    Some(client) => {
                        state.last_connect_error = Some(message);
                        let (token, next) = state.arm_connect();
                        Some((client, token, next))
                    },
                    None => None,
                }
            }
        };
        let Some((client, token, next)) = armed else {
            debug!(generation, "Reconnect superseded");
            return;
        };

        if let Err(e) = client.close().await {
            debug!(error = %e, "Closing lost client failed");
        }
        self.log_sys("connect requested: starting loop");
        self.emit_status();
        self.connect_loop(token, next).await;
    }
}
