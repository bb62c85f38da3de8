use std::sync::Arc;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, error, info, warn};

use crate::cache::AddressCache;
use crate::retry::RetryPolicy;
use crate::types::{ExecOutput, MachineAddress, MachineRecord, MachineSpec};
use crate::{CloudProvider, Error, ProviderName, Result};

/// The machine-management surface the rest of the system uses.
///
/// Wraps a [`CloudProvider`] with the creation retry policy, the
/// name → address memo and strict deployment-prefix filtering.
pub struct Fleet {
    provider: Arc<dyn CloudProvider>,
    policy: RetryPolicy,
    addresses: AddressCache,
}

impl Fleet {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self::with_policy(provider, RetryPolicy::default())
    }

    pub fn with_policy(provider: Arc<dyn CloudProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            policy,
            addresses: AddressCache::new(),
        }
    }

    pub fn provider_name(&self) -> ProviderName {
        self.provider.name()
    }

    /// Create a machine, retrying transient failures.
    ///
    /// Every failed attempt removes whatever the provider left behind under
    /// this name before the next attempt, so a retry never duplicates a
    /// machine. Errors the provider marks as non-retryable end the loop at
    /// once.
    pub async fn create_machine(&self, spec: &MachineSpec) -> Result<MachineRecord> {
        let mut record = MachineRecord::requested(spec);
        let mut attempt = 0;

        loop {
            attempt += 1;
            record.mark_creating();
            info!(
                machine = %spec.name,
                zone = %spec.zone,
                machine_type = %spec.machine_type,
                attempt,
                "creating machine"
            );

            let result = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.provider.create_machine(spec),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout {
                    op: "create machine",
                    target: spec.name.clone(),
                    secs: self.policy.attempt_timeout.as_secs(),
                }),
            };

            let err = match result {
                Ok(address) => {
                    record.mark_ready(&address);
                    self.addresses.seed(address);
                    info!(machine = %spec.name, attempt, "machine ready");
                    return Ok(record);
                }
                Err(e) => e,
            };

            self.addresses.invalidate(&spec.name);
            if let Err(cleanup) = self.provider.remove_machine(&spec.name).await {
                warn!(machine = %spec.name, error = %cleanup, "failed to remove partial machine");
            }

            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                record.mark_failed();
                error!(
                    machine = %spec.name,
                    attempt,
                    retryable = err.is_retryable(),
                    error = %err,
                    "giving up on machine"
                );
                return Err(Error::Provision {
                    machine: spec.name.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                machine = %spec.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "machine creation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delete a machine. Absent machines are fine.
    pub async fn remove_machine(&self, name: &str) -> Result<()> {
        self.addresses.invalidate(name);
        self.provider.remove_machine(name).await?;
        info!(machine = %name, "machine removed");
        Ok(())
    }

    /// Zone and addresses, looked up once per process.
    pub async fn address(&self, name: &str) -> Result<MachineAddress> {
        self.addresses
            .get_or_lookup(name, || self.provider.describe_machine(name))
            .await
    }

    pub async fn internal_ip(&self, name: &str) -> Result<String> {
        Ok(self.address(name).await?.internal_ip)
    }

    pub async fn external_ip(&self, name: &str) -> Result<String> {
        self.address(name)
            .await?
            .external_ip
            .ok_or_else(|| Error::NotFound(format!("external address of {name}")))
    }

    pub async fn zone(&self, name: &str) -> Result<String> {
        Ok(self.address(name).await?.zone)
    }

    /// Run a command on a machine. The address lookup completes before the
    /// command is sent.
    pub async fn remote_exec(&self, name: &str, command: &str) -> Result<ExecOutput> {
        let target = self.address(name).await?;
        debug!(machine = %name, command, "remote exec");
        self.provider.remote_exec(&target, command).await
    }

    /// Run a command and fail on non-zero exit, returning stdout.
    pub async fn exec_checked(&self, name: &str, command: &str) -> Result<String> {
        let out = self.remote_exec(name, command).await?;
        if !out.success() {
            return Err(Error::RemoteExec {
                machine: name.to_string(),
                reason: format!(
                    "command {command:?} failed (exit {}): {}{}",
                    out.exit_code,
                    out.stderr.trim(),
                    out.stdout.trim(),
                ),
            });
        }
        Ok(out.stdout)
    }

    /// Running machines of `deployment`, strictly `<deployment>-` prefixed.
    pub async fn list_running_machines(&self, deployment: &str) -> Result<Vec<String>> {
        let prefix = format!("{deployment}-");
        let mut names: Vec<String> = self
            .provider
            .list_machines(deployment)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Remove every machine of `deployment`, at most `concurrency` at a time.
    /// Returns the removed names.
    pub async fn remove_deployment(&self, deployment: &str, concurrency: usize) -> Result<Vec<String>> {
        let names = self.list_running_machines(deployment).await?;
        info!(deployment, machines = names.len(), "removing deployment machines");

        stream::iter(names.iter().cloned())
            .map(|name| async move { self.remove_machine(&name).await })
            .buffer_unordered(concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;

        Ok(names)
    }
}
