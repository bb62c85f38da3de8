//! In-memory [`CloudProvider`] with failure injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::types::{ExecOutput, MachineAddress, MachineSpec};
use crate::{CloudProvider, Error, ProviderName, Result};

pub const FAKE_JOIN_TOKEN: &str = "SWMTKN-1-fake-worker-token";

/// How the next `create_machine` call for a name should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    /// Fails before anything exists.
    Transient,
    /// Registers the machine, then fails.
    PartialTransient,
    /// Quota-style failure that a retry cannot fix.
    Fatal,
}

#[derive(Default)]
struct State {
    machines: BTreeMap<String, MachineAddress>,
    create_failures: HashMap<String, VecDeque<FakeFailure>>,
    command_failures: Vec<(String, String)>,
    create_calls: HashMap<String, usize>,
    describe_calls: HashMap<String, usize>,
    exec_log: Vec<(String, String)>,
    next_host: u32,
}

#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<State>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_address(state: &mut State, name: &str, zone: &str) -> MachineAddress {
        state.next_host += 1;
        let host = state.next_host;
        MachineAddress {
            name: name.to_string(),
            zone: zone.to_string(),
            internal_ip: format!("10.0.{}.{}", host / 250, host % 250 + 2),
            external_ip: Some(format!("34.0.{}.{}", host / 250, host % 250 + 2)),
        }
    }

    /// Queue a failure for the next create of `name`.
    pub fn fail_create(&self, name: &str, failure: FakeFailure) {
        self.state()
            .create_failures
            .entry(name.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Make every command on `machine` containing `needle` exit non-zero.
    pub fn fail_command(&self, machine: &str, needle: &str) {
        self.state()
            .command_failures
            .push((machine.to_string(), needle.to_string()));
    }

    /// Make `swarm join` fail on `machine`.
    pub fn fail_join(&self, machine: &str) {
        self.fail_command(machine, "swarm join --token");
    }

    /// Add a machine that exists outside this process's control.
    pub fn insert_machine(&self, name: &str, zone: &str) {
        let mut state = self.state();
        let address = Self::allocate_address(&mut state, name, zone);
        state.machines.insert(name.to_string(), address);
    }

    pub fn machines(&self) -> Vec<String> {
        self.state().machines.keys().cloned().collect()
    }

    pub fn create_calls(&self, name: &str) -> usize {
        self.state().create_calls.get(name).copied().unwrap_or(0)
    }

    pub fn describe_calls(&self, name: &str) -> usize {
        self.state().describe_calls.get(name).copied().unwrap_or(0)
    }

    /// `(machine, command)` pairs in execution order.
    pub fn exec_log(&self) -> Vec<(String, String)> {
        self.state().exec_log.clone()
    }

    pub fn commands_containing(&self, needle: &str) -> usize {
        self.state()
            .exec_log
            .iter()
            .filter(|(_, cmd)| cmd.contains(needle))
            .count()
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn create_machine(&self, spec: &MachineSpec) -> Result<MachineAddress> {
        tokio::task::yield_now().await;

        let mut state = self.state();
        *state.create_calls.entry(spec.name.clone()).or_default() += 1;

        if state.machines.contains_key(&spec.name) {
            return Err(Error::MachineDriver(format!(
                "Host already exists: \"{}\"",
                spec.name
            )));
        }

        let failure = state
            .create_failures
            .get_mut(&spec.name)
            .and_then(|queue| queue.pop_front());

        match failure {
            Some(FakeFailure::Transient) => Err(Error::MachineDriver(
                "read tcp: connection reset by peer".into(),
            )),
            Some(FakeFailure::PartialTransient) => {
                let address = Self::allocate_address(&mut state, &spec.name, &spec.zone);
                state.machines.insert(spec.name.clone(), address);
                Err(Error::MachineDriver(
                    "timed out waiting for ssh after instance insert".into(),
                ))
            }
            Some(FakeFailure::Fatal) => Err(Error::MachineDriver(
                "Quota 'CPUS' exceeded. Limit: 24.0 in region us-east1".into(),
            )),
            None => {
                let address = Self::allocate_address(&mut state, &spec.name, &spec.zone);
                state.machines.insert(spec.name.clone(), address.clone());
                Ok(address)
            }
        }
    }

    async fn remove_machine(&self, name: &str) -> Result<()> {
        self.state().machines.remove(name);
        Ok(())
    }

    async fn describe_machine(&self, name: &str) -> Result<MachineAddress> {
        tokio::task::yield_now().await;

        let mut state = self.state();
        *state.describe_calls.entry(name.to_string()).or_default() += 1;
        state
            .machines
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn remote_exec(&self, target: &MachineAddress, command: &str) -> Result<ExecOutput> {
        let mut state = self.state();
        state
            .exec_log
            .push((target.name.clone(), command.to_string()));

        let fails = state
            .command_failures
            .iter()
            .any(|(machine, needle)| *machine == target.name && command.contains(needle.as_str()));
        if fails {
            return Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("injected failure for {command:?}"),
            });
        }

        let stdout = if command.contains("swarm join-token") {
            format!("{FAKE_JOIN_TOKEN}\n")
        } else {
            String::new()
        };

        Ok(ExecOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn list_machines(&self, deployment: &str) -> Result<Vec<String>> {
        // Loose match on purpose: callers must apply the strict prefix.
        Ok(self
            .state()
            .machines
            .keys()
            .filter(|name| name.contains(deployment))
            .cloned()
            .collect())
    }

    fn name(&self) -> ProviderName {
        ProviderName::DockerMachine
    }
}
