//! Producer session and the per-timestep gate.
//!
//! A [`ProducerSession`] is owned by the simulation's timestep loop on every
//! producer worker. The leader also owns the rendezvous listener and its
//! accept loop. Each call to [`ProducerSession::timestep`] drains the pending
//! attachments on the leader, agrees on how many there are, and serves one
//! pull round per attachment in lock-step across the group.

use crate::accept_loop::{spawn_accept_loop, AcceptLoopHandle, AcceptStats, PendingAttachments};
use crate::collective::{all_reduce_bounds, any_rank, broadcast_count, broadcast_i32};
use crate::error::{InSituError, Result};
use crate::particles::ParticleLayout;
use crate::pull::{answer_queries, AnswerStats};
use crate::registry::{ClientId, ClientRegistry, ClientResolution};
use crate::rendezvous::{self, DEFAULT_PORT};
use insitu_env::{ChannelFabric, GroupComm, PortName};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

/// Producer-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Rendezvous listen address (leader only).
    pub listen_addr: SocketAddr,
    pub layout: ParticleLayout,
}

impl ProducerConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_layout(mut self, layout: ParticleLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.layout.validate()
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            layout: ParticleLayout::default(),
        }
    }
}

/// Result of one pull round on this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Served {
        client: ClientId,
        new_client: bool,
        stats: AnswerStats,
    },
    /// The attachment was abandoned.
    Failed,
}

/// What one timestep gate did on this worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestepReport {
    pub timestep: u64,
    pub requests: usize,
    pub served: usize,
    pub failed: usize,
    pub new_clients: usize,
    pub records_sent: usize,
}

/// Per-worker producer state: group, client channels and (on the leader)
/// the rendezvous accept loop.
pub struct ProducerSession<F: ChannelFabric> {
    fabric: Arc<F>,
    group: F::Group,
    layout: ParticleLayout,
    registry: ClientRegistry<F::Channel>,
    pending: PendingAttachments,
    accept_loop: Option<AcceptLoopHandle>,
    timestep: u64,
}

impl<F: ChannelFabric> ProducerSession<F> {
    /// Starts the session on every producer worker.
    ///
    /// Collective. The leader binds the rendezvous listener and starts the
    /// accept loop; a bind failure fails the call on every worker.
    pub async fn init(config: ProducerConfig, fabric: Arc<F>, group: F::Group) -> Result<Self> {
        config.validate()?;

        let pending = PendingAttachments::new();
        let mut local_failure = None;
        let mut accept_loop = None;

        if group.is_root() {
            match rendezvous::bind_listener(config.listen_addr).and_then(|listener| {
                spawn_accept_loop(listener, pending.clone())
                    .map_err(|e| InSituError::config(format!("rendezvous listener has no address: {}", e)))
            }) {
                Ok(handle) => accept_loop = Some(handle),
                Err(e) => local_failure = Some(e),
            }
        }

        if any_rank(&group, local_failure.is_some()).await? {
            return Err(local_failure
                .unwrap_or_else(|| InSituError::config("producer leader could not start the rendezvous listener")));
        }
        group.barrier().await?;

        if let Some(handle) = &accept_loop {
            tracing::info!(
                addr = %handle.local_addr(),
                workers = group.size(),
                stride = config.layout.stride(),
                "Producer session ready"
            );
        }

        Ok(Self {
            fabric,
            group,
            layout: config.layout,
            registry: ClientRegistry::new(),
            pending,
            accept_loop,
            timestep: 0,
        })
    }

    /// Serves every attachment queued since the previous call.
    ///
    /// Collective. Per-round failures are logged and counted; only a failure
    /// of the producer group's own collectives is returned as an error.
    pub async fn timestep(&mut self, particles: &[f32]) -> Result<TimestepReport> {
        let records = self.layout.whole_records(particles);

        let names = if self.group.is_root() {
            self.pending.drain()
        } else {
            Vec::new()
        };
        let requests = broadcast_count(&self.group, 0, names.len()).await?;

        let mut report = TimestepReport {
            timestep: self.timestep,
            requests,
            ..TimestepReport::default()
        };

        for i in 0..requests {
            let name = names.get(i).cloned().unwrap_or_default();
            match self.serve_pull_request(&name, records).await? {
                RoundOutcome::Served {
                    new_client, stats, ..
                } => {
                    report.served += 1;
                    report.records_sent += stats.records_sent;
                    if new_client {
                        report.new_clients += 1;
                    }
                }
                RoundOutcome::Failed => report.failed += 1,
            }
        }

        if requests > 0 && self.group.is_root() {
            tracing::info!(
                timestep = self.timestep,
                served = report.served,
                failed = report.failed,
                "Timestep pull requests complete"
            );
        }
        self.timestep += 1;
        Ok(report)
    }

    /// One pull round for the attachment `name` (significant on the leader
    /// only).
    pub async fn serve_pull_request(&mut self, name: &PortName, records: &[f32]) -> Result<RoundOutcome> {
        let is_root = self.group.is_root();

        let local = if is_root {
            self.registry.resolve(name)
        } else {
            ClientResolution::New
        };
        let resolution = ClientResolution::from_wire(broadcast_i32(&self.group, 0, local.to_wire()).await?)?;

        let (attached, new_client) = match resolution {
            ClientResolution::Existing(id) => {
                let present = self.registry.channel(id).is_some();
                (present.then_some(id), false)
            }
            ClientResolution::New => match self.fabric.connect(name, &self.group).await {
                Ok(channel) => {
                    let id = self.registry.attach(is_root.then_some(name), channel);
                    (Some(id), true)
                }
                Err(e) => {
                    tracing::warn!(port = %name, error = %e, "Group channel handshake failed");
                    (None, true)
                }
            },
        };

        if any_rank(&self.group, attached.is_none()).await? {
            if let Some(id) = attached {
                self.registry.abandon(id);
            }
            if is_root {
                tracing::warn!(port = %name, "Dropping attachment without a usable channel");
            }
            return Ok(RoundOutcome::Failed);
        }
        let Some(client) = attached else {
            return Ok(RoundOutcome::Failed);
        };

        if new_client && is_root {
            tracing::info!(port = %name, client, "Group channel established");
        }

        let local_bounds = self.layout.bounds(records);
        let global_bounds = all_reduce_bounds(&self.group, &local_bounds).await?.or_zero();

        let exchange = match self.registry.channel(client) {
            Some(channel) => answer_queries(&self.group, channel, self.layout, records, &global_bounds).await,
            None => Err(InSituError::protocol(format!("client {} has no channel", client))),
        };

        if let Err(e) = &exchange {
            tracing::warn!(client, rank = self.group.rank(), error = %e, "Pull round failed");
        }
        if any_rank(&self.group, exchange.is_err()).await? {
            self.registry.abandon(client);
            if is_root {
                tracing::warn!(client, port = %name, "Abandoned consumer attachment");
            }
            return Ok(RoundOutcome::Failed);
        }

        let stats = exchange?;
        Ok(RoundOutcome::Served {
            client,
            new_client,
            stats,
        })
    }

    /// Rendezvous address, on the leader.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.accept_loop.as_ref().map(AcceptLoopHandle::local_addr)
    }

    pub fn pending(&self) -> &PendingAttachments {
        &self.pending
    }

    pub fn registry(&self) -> &ClientRegistry<F::Channel> {
        &self.registry
    }

    pub fn group(&self) -> &F::Group {
        &self.group
    }

    pub fn layout(&self) -> ParticleLayout {
        self.layout
    }

    /// Number of timestep gates passed.
    pub fn timesteps(&self) -> u64 {
        self.timestep
    }

    /// Stops the accept loop (leader) and synchronizes the group.
    pub async fn shutdown(mut self) -> Result<Option<AcceptStats>> {
        let stats = match self.accept_loop.take() {
            Some(handle) => Some(handle.shutdown().await),
            None => None,
        };
        self.group.barrier().await?;
        Ok(stats)
    }
}
