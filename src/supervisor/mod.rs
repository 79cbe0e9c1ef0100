pub mod ack;
pub mod error;
pub mod receiver;
pub mod state_machine;
pub mod traffic;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::instance::{Instance, InstanceRegistry, ProxyConfig};
use crate::protocol::channel::{ControlChannel, PLACEHOLDER_HOST};
use crate::protocol::Command;
use ack::AckQueue;
pub use error::ManagerError;
use receiver::{dispatch_loop, receive_loop, Dispatcher, FRAME_CHANNEL_SIZE};
use state_machine::State;

/// Everything that exists only while the manager is started.
struct ManagerState {
    channel: ControlChannel,
    shutdown: CancellationToken,
    receiver: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Supervises one external proxy server process and the instances it runs.
///
/// Commands are strictly request-then-acknowledge. The state mutex is held
/// while a command's completion token is registered and its datagram sent,
/// so tokens queue in exactly the order the server sees the commands.
pub struct Manager {
    config: ManagerConfig,
    registry: InstanceRegistry,
    acks: Arc<AckQueue>,
    running: AtomicBool,
    state: Mutex<Option<ManagerState>>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            registry: InstanceRegistry::new(),
            acks: Arc::new(AckQueue::new()),
            running: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the server, connect, start the receiver and run the handshake.
    ///
    /// Any failure leaves the manager stopped with the process terminated
    /// and socket files removed.
    pub async fn start(&self) -> Result<(), ManagerError> {
        {
            let mut state = self.state.lock().await;
            if state.is_some() {
                return Err(ManagerError::AlreadyStarted);
            }

            let channel = ControlChannel::start(&self.config).await?;
            let socket = channel.socket()?;
            let shutdown = CancellationToken::new();
            let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);

            let receiver = tokio::spawn(receive_loop(socket, frames_tx, shutdown.clone()));
            let dispatcher = tokio::spawn(dispatch_loop(
                frames_rx,
                Dispatcher::new(self.registry.clone(), self.acks.clone()),
            ));

            tracing::debug!("Proxy server pid: {:?}", channel.pid());
            *state = Some(ManagerState {
                channel,
                shutdown,
                receiver,
                dispatcher,
            });
            self.running.store(true, Ordering::SeqCst);
        }

        // drain the listener the server creates by default
        if let Err(e) = self.round_trip(Command::remove_host(PLACEHOLDER_HOST)).await {
            tracing::error!("Handshake with proxy server failed: {}", e);
            self.stop().await;
            return Err(e);
        }

        tracing::info!("Manager started");
        Ok(())
    }

    /// Tear everything down. Safe to call when never started or already stopped.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(mut state) = self.state.lock().await.take() else {
            return;
        };

        state.shutdown.cancel();
        state.channel.shutdown();
        self.acks.clear();

        for task in [state.receiver, state.dispatcher] {
            if let Err(e) = task.await {
                tracing::warn!("Control task ended abnormally: {}", e);
            }
        }

        // listeners die with the server process
        match self.registry.list() {
            Ok(instances) => instances.iter().for_each(|i| i.reset()),
            Err(e) => tracing::error!("Cannot reset instances: {}", e),
        }
        tracing::info!("Manager stopped");
    }

    /// Send a command and wait for its acknowledgment.
    async fn round_trip(&self, command: Command) -> Result<(), ManagerError> {
        let frame = command.encode()?;
        let token = {
            let state = self.state.lock().await;
            let state = state.as_ref().ok_or(ManagerError::NotStarted)?;
            let token = self.acks.register(command.verb())?;
            if let Err(e) = state.channel.send(&frame).await {
                // nothing went out, so no ok will come for this slot
                self.acks.cancel(token.id());
                return Err(e);
            }
            token
        };
        token.wait(self.config.ack_timeout()).await
    }

    /// Register a new instance. Ports are unique.
    pub fn add_instance(&self, host: &str, config: ProxyConfig) -> Result<Arc<Instance>, ManagerError> {
        let port = config.server_port;
        Ok(self.registry.insert(Instance::new(host, port, config))?)
    }

    /// Stop the instance if it is running, then forget it.
    pub async fn remove_instance(&self, port: u16) -> Result<Arc<Instance>, ManagerError> {
        let instance = self.instance(port)?;
        if instance.is_running() {
            self.stop_instance(port).await?;
        }
        self.registry.remove(port)?;
        tracing::info!("Removed instance {}:{}", instance.host(), port);
        Ok(instance)
    }

    pub fn instance(&self, port: u16) -> Result<Arc<Instance>, ManagerError> {
        self.registry
            .get(port)?
            .ok_or(ManagerError::InstanceNotFound(port))
    }

    pub fn instances(&self) -> Result<Vec<Arc<Instance>>, ManagerError> {
        Ok(self.registry.list()?)
    }

    /// Cumulative traffic reported for the instance on `port`.
    pub fn traffic(&self, port: u16) -> Result<u64, ManagerError> {
        Ok(self.instance(port)?.traffic())
    }

    /// Ask the server to open the listener for `port`. Returns once the
    /// server has acknowledged the `add` command.
    pub async fn start_instance(&self, port: u16) -> Result<(), ManagerError> {
        let instance = self.instance(port)?;
        if !self.is_running() {
            return Err(ManagerError::NotStarted);
        }

        instance
            .transition(State::Starting)
            .map_err(|e| ManagerError::transition(port, e))?;
        instance.set_running(true);

        if let Err(e) = self.round_trip(Command::Add(instance.config().clone())).await {
            instance.set_running(false);
            // ChannelClosed: stop() resets every instance itself
            if !matches!(e, ManagerError::ChannelClosed) {
                if let Err(te) = instance.transition(State::Stopped) {
                    tracing::warn!("Cannot roll back instance {}: {}", port, te);
                }
            }
            return Err(e);
        }

        instance
            .transition(State::Running)
            .map_err(|e| ManagerError::transition(port, e))?;
        tracing::debug!("Proxy server at {}:{} started", instance.host(), port);
        Ok(())
    }

    /// Ask the server to close the listener for `port`. Returns once the
    /// server has acknowledged the `remove` command.
    pub async fn stop_instance(&self, port: u16) -> Result<(), ManagerError> {
        let instance = self.instance(port)?;
        if !self.is_running() {
            return Err(ManagerError::NotStarted);
        }

        instance
            .transition(State::Stopping)
            .map_err(|e| ManagerError::transition(port, e))?;
        instance.set_running(false);

        if let Err(e) = self.round_trip(Command::remove_port(port)).await {
            if !matches!(e, ManagerError::ChannelClosed) {
                match instance.transition(State::Running) {
                    Ok(()) => instance.set_running(true),
                    Err(te) => tracing::warn!("Cannot roll back instance {}: {}", port, te),
                }
            }
            return Err(e);
        }

        instance
            .transition(State::Stopped)
            .map_err(|e| ManagerError::transition(port, e))?;
        tracing::debug!("Proxy server at {}:{} stopped", instance.host(), port);
        Ok(())
    }
}
