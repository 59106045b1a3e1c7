use error_stack::{Result, ResultExt};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::artnet::Transmitter;
use crate::messages::{PushEvent, ToStageManagerMessage};
use crate::push_bus;
use crate::stage::StageManager;
use crate::store::Store;

pub struct Started {}
pub struct Stopped {}

pub struct ServiceConfig {
    pub http_addr: SocketAddr,
    pub data_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Context(String),
}

pub struct Service<Status = Stopped> {
    config: ServiceConfig,

    workers: JoinSet<()>,
    cancel: CancellationToken,
    _status: PhantomData<Status>,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Service<Stopped> {
        Service {
            config,
            workers: JoinSet::new(),
            cancel: CancellationToken::new(),
            _status: PhantomData,
        }
    }
}

impl Service<Stopped> {
    pub async fn start(mut self) -> Result<Service<Started>, ServiceError> {
        // Channels between the workers
        let (to_stage_tx, to_stage_rx) = tokio::sync::mpsc::channel::<ToStageManagerMessage>(32);
        let (push_tx, push_rx) = async_channel::bounded::<PushEvent>(64);

        let transmitter = Transmitter::new(false)
            .change_context_lazy(|| ServiceError::Context(String::from("Creating Art-Net transmitter")))?;
        let store = Store::open(self.config.data_dir.clone()).change_context_lazy(|| {
            ServiceError::Context(format!(
                "Opening data directory {}",
                self.config.data_dir.display()
            ))
        })?;

        let bus = push_bus::new_bus();

        // Stage manager worker
        let cancel_instance = self.cancel.clone();
        self.workers.spawn(async move {
            let mut stage_manager = StageManager::new(transmitter, store, push_tx);

            stage_manager.load();
            stage_manager.run(cancel_instance, to_stage_rx).await;
        });

        // Push bus worker
        let cancel_instance = self.cancel.clone();
        let bus_instance = bus.clone();
        self.workers.spawn(async move {
            push_bus::run(cancel_instance, push_rx, bus_instance).await;
        });

        // HTTP worker
        let app = api::router(api::AppState {
            to_stage: to_stage_tx,
            bus,
        });
        let listener = TcpListener::bind(self.config.http_addr)
            .await
            .change_context_lazy(|| {
                ServiceError::Context(format!(
                    "Binding HTTP listener on {}",
                    self.config.http_addr
                ))
            })?;
        info!("Listening on http://{}", self.config.http_addr);

        let cancel_instance = self.cancel.clone();
        self.workers.spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                cancel_instance.cancelled().await;
            });

            if let Err(e) = server.await {
                error!("HTTP server error: {}", e);
            }
        });

        info!("Service started");
        Ok(Service {
            config: self.config,
            workers: self.workers,
            cancel: self.cancel,
            _status: PhantomData,
        })
    }
}

impl Service<Started> {
    pub async fn stop(mut self) -> Service<Stopped> {
        self.cancel.cancel();
        self.workers.shutdown().await;
        info!("Service stopped");

        Service {
            config: self.config,
            workers: self.workers,
            cancel: self.cancel,
            _status: PhantomData,
        }
    }
}
