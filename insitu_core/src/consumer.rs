//! Consumer-side pull client.
//!
//! The first pull bootstraps a group channel: the leader connects to the
//! producer's rendezvous socket, the group opens a port, the leader publishes
//! the port name and the group accepts the producer's connect. Later pulls
//! publish the same port name again so the producer reuses the channel.

use crate::collective::any_rank;
use crate::error::{InSituError, Result};
use crate::grid::{DomainGrid, GridConfig, GridDims};
use crate::particles::ParticleLayout;
use crate::pull::request_blocks;
use crate::rendezvous::{self, DEFAULT_PORT};
use insitu_env::{ChannelFabric, GroupChannel, GroupComm, PortName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Ghost width as a multiple of the particle radius.
pub const GHOST_RADIUS_FACTOR: f32 = 1.5;

/// Consumer-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub server_host: String,
    pub server_port: u16,
    pub grid: GridConfig,
    pub layout: ParticleLayout,
    /// Delay between background pulls; `None` disables polling.
    pub poll_delay: Option<Duration>,
}

impl ConsumerConfig {
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server_host = host.into();
        self.server_port = port;
        self
    }

    pub fn with_grid(mut self, grid: GridConfig) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_dims(mut self, dims: GridDims) -> Self {
        self.grid.dims = dims;
        self
    }

    /// Sets the ghost width from the particle radius.
    pub fn with_radius(mut self, radius: f32) -> Self {
        self.grid.ghost_width = GHOST_RADIUS_FACTOR * radius;
        self
    }

    pub fn with_layout(mut self, layout: ParticleLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_poll_delay(mut self, delay: Option<Duration>) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_host.trim().is_empty() {
            return Err(InSituError::config("server host is empty"));
        }
        if self.server_port == 0 {
            return Err(InSituError::config("server port must be non-zero"));
        }
        self.grid.validate()?;
        self.layout.validate()
    }

    fn target(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: DEFAULT_PORT,
            grid: GridConfig::default(),
            layout: ParticleLayout::default(),
            poll_delay: Some(Duration::from_secs(10)),
        }
    }
}

/// Pulls decomposed particle data from a producer group.
///
/// Every method is collective over the consumer group.
pub struct PullClient<F: ChannelFabric> {
    fabric: Arc<F>,
    group: F::Group,
    config: ConsumerConfig,
    endpoint: Option<PortName>,
    channel: Option<F::Channel>,
    pulls: u64,
}

impl<F: ChannelFabric> PullClient<F> {
    pub fn new(config: ConsumerConfig, fabric: Arc<F>, group: F::Group) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fabric,
            group,
            config,
            endpoint: None,
            channel: None,
            pulls: 0,
        })
    }

    /// Runs one complete pull and returns a freshly built grid.
    ///
    /// Attaches first (bootstrap or reuse). Any failure on any worker
    /// detaches the whole group, so the next pull starts a new rendezvous.
    pub async fn pull(&mut self) -> Result<DomainGrid> {
        let attached = if self.is_attached() {
            self.reattach().await
        } else {
            self.establish().await
        };
        if let Err(e) = attached {
            self.detach();
            return Err(e);
        }

        let result = match &self.channel {
            Some(channel) => request_blocks(&self.group, channel, &self.config.grid, self.config.layout).await,
            None => Err(InSituError::protocol("no group channel after attach")),
        };

        if let Err(e) = &result {
            tracing::warn!(rank = self.group.rank(), error = %e, "Pull failed");
        }
        if any_rank(&self.group, result.is_err()).await? {
            self.detach();
            return Err(match result {
                Err(e) => e,
                Ok(_) => InSituError::protocol("pull failed on another consumer worker"),
            });
        }

        let grid = result?;
        self.pulls += 1;
        if self.group.is_root() {
            tracing::info!(pull = self.pulls, world = %grid.world_bounds(), "Pull complete");
        }
        Ok(grid)
    }

    async fn establish(&mut self) -> Result<()> {
        self.group.barrier().await?;

        let mut stream = None;
        let mut local_failure = None;
        if self.group.is_root() {
            match rendezvous::connect(&self.config.server_host, self.config.server_port).await {
                Ok(s) => stream = Some(s),
                Err(e) => local_failure = Some(e),
            }
        }
        if any_rank(&self.group, local_failure.is_some()).await? {
            return Err(local_failure.unwrap_or_else(|| self.leader_failed("rendezvous connect")));
        }

        let port = self.fabric.open_port(&self.group).await?;

        let mut local_failure = None;
        if let Some(stream) = stream {
            if let Err(e) = rendezvous::publish(stream, &port).await {
                local_failure = Some(e);
            }
        }
        if any_rank(&self.group, local_failure.is_some()).await? {
            self.close_port_quietly(&port).await;
            return Err(local_failure.unwrap_or_else(|| self.leader_failed("rendezvous publish")));
        }

        let accepted = self.fabric.accept(&port, &self.group).await;
        self.close_port_quietly(&port).await;
        let channel = accepted?;

        if self.group.is_root() {
            tracing::info!(port = %port, producers = channel.remote_size(), "Attached to producer");
        }
        self.endpoint = Some(port);
        self.channel = Some(channel);
        Ok(())
    }

    async fn reattach(&mut self) -> Result<()> {
        self.group.barrier().await?;

        let mut local_failure = None;
        if self.group.is_root() {
            if let Some(endpoint) = &self.endpoint {
                if let Err(e) =
                    rendezvous::announce(&self.config.server_host, self.config.server_port, endpoint).await
                {
                    local_failure = Some(e);
                }
            }
        }
        if any_rank(&self.group, local_failure.is_some()).await? {
            return Err(local_failure.unwrap_or_else(|| self.leader_failed("rendezvous reconnect")));
        }
        Ok(())
    }

    async fn close_port_quietly(&self, port: &PortName) {
        if let Err(e) = self.fabric.close_port(port, &self.group).await {
            tracing::debug!(port = %port, error = %e, "Closing port failed");
        }
    }

    fn leader_failed(&self, step: &str) -> InSituError {
        InSituError::connect(
            self.config.target(),
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} failed on the consumer leader", step),
            ),
        )
    }

    /// Drops the channel and endpoint.
    pub fn detach(&mut self) {
        if self.channel.take().is_some() && self.group.is_root() {
            tracing::info!("Detached from producer");
        }
        self.endpoint = None;
    }

    pub fn is_attached(&self) -> bool {
        self.channel.is_some() && self.endpoint.is_some()
    }

    /// Port name published to the producer, once attached.
    pub fn endpoint(&self) -> Option<&PortName> {
        self.endpoint.as_ref()
    }

    pub fn group(&self) -> &F::Group {
        &self.group
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Completed pulls.
    pub fn pulls(&self) -> u64 {
        self.pulls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.server_host, "localhost");
        assert_eq!(config.server_port, DEFAULT_PORT);
        assert_eq!(config.grid.dims, GridDims::cube(2));
        assert_relative_eq!(config.grid.ghost_width, 0.015);
        assert_eq!(config.poll_delay, Some(Duration::from_secs(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_radius_sets_ghost_width() {
        let config = ConsumerConfig::default().with_radius(0.2);
        assert_relative_eq!(config.grid.ghost_width, 0.3);
    }

    #[test]
    fn test_validation() {
        assert!(ConsumerConfig::default().with_server("", 1).validate().is_err());
        assert!(ConsumerConfig::default().with_server("h", 0).validate().is_err());
        assert!(ConsumerConfig::default()
            .with_dims(GridDims::new(0, 1, 1))
            .validate()
            .is_err());
        assert!(ConsumerConfig::default().with_radius(-1.0).validate().is_err());
    }
}
