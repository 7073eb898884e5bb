//! Broker connection handle with an ownership flag.
//!
//! A handle built from parameters owns its connection and closes it on
//! [`ConnectionHandle::close`]. A handle wrapping a caller-supplied connection
//! never closes it.

use std::sync::Arc;

use tracing::{error, info, warn};

use eventq_broker::{Broker, Connect, ConnectionEvent};

use crate::error::{AdapterError, AdapterResult};

/// Where the adapter gets its broker connection from.
pub enum ConnectionSource<B: Connect> {
    /// A live connection owned by the caller.
    Existing(Arc<B>),
    /// Parameters for a connection the adapter opens and owns.
    Params(B::Params),
}

#[derive(Debug)]
pub struct ConnectionHandle<B> {
    broker: Arc<B>,
    owns_connection: bool,
}

impl<B: Broker> ConnectionHandle<B> {
    /// Wrap a caller-supplied connection. `close` will leave it open.
    pub fn from_existing(broker: Arc<B>) -> Self {
        let handle = Self {
            broker,
            owns_connection: false,
        };
        handle.register_listeners();
        handle
    }

    /// Open a new connection that this handle owns.
    pub async fn open(params: B::Params) -> AdapterResult<Self>
    where
        B: Connect,
    {
        let broker = B::connect(params)
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        let handle = Self {
            broker: Arc::new(broker),
            owns_connection: true,
        };
        handle.register_listeners();
        Ok(handle)
    }

    pub async fn from_source(source: ConnectionSource<B>) -> AdapterResult<Self>
    where
        B: Connect,
    {
        match source {
            ConnectionSource::Existing(broker) => Ok(Self::from_existing(broker)),
            ConnectionSource::Params(params) => Self::open(params).await,
        }
    }

    // Transport errors and closes are logged only; operations fail on their own.
    fn register_listeners(&self) {
        self.broker.on_connection_event(Arc::new(|event: &ConnectionEvent| match event {
            ConnectionEvent::Error(err) => error!(error = %err, "broker connection error"),
            ConnectionEvent::Closed => warn!("broker connection closed"),
        }));
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn owns_connection(&self) -> bool {
        self.owns_connection
    }

    pub async fn health_check(&self) -> AdapterResult<()> {
        self.broker
            .ping()
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))
    }

    /// Close the connection if this handle owns it and it is still open.
    pub async fn close(&self) -> AdapterResult<()> {
        if !self.owns_connection {
            return Ok(());
        }
        if self.broker.status().is_terminal() {
            return Ok(());
        }

        self.broker
            .quit()
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))?;
        info!("broker connection closed by adapter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventq_broker::{ConnectionStatus, InMemoryBroker, InMemoryParams};

    #[tokio::test]
    async fn borrowed_connection_is_left_open() {
        let broker = Arc::new(InMemoryBroker::new());
        let handle = ConnectionHandle::from_existing(broker.clone());

        assert!(!handle.owns_connection());
        handle.close().await.unwrap();
        assert_eq!(broker.status(), ConnectionStatus::Ready);
    }

    #[tokio::test]
    async fn owned_connection_is_closed_once() {
        let handle = ConnectionHandle::<InMemoryBroker>::open(InMemoryParams::default())
            .await
            .unwrap();
        assert!(handle.owns_connection());
        handle.health_check().await.unwrap();

        handle.close().await.unwrap();
        assert_eq!(handle.broker().status(), ConnectionStatus::Closed);
        handle.close().await.unwrap();
        assert!(handle.health_check().await.is_err());
    }
}
