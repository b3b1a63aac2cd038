/*!
Scripted remote channel and liveness probe

Stand-ins for `ssh` and `ping`: replies are scripted per address, every call
is recorded, and the channel tracks how many calls were in flight at once.
*/

use async_trait::async_trait;
use fleetwatch_kernel::channel::{ChannelError, CommandOutput, LivenessProbe, RemoteChannel};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the channel answers for one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Stdout(String),
    Stderr(String),
    Timeout,
}

impl Reply {
    pub fn stdout(text: &str) -> Self {
        Reply::Stdout(text.to_string())
    }

    pub fn refused() -> Self {
        Reply::Stderr("ssh: connect to host port 22: Connection refused".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub address: String,
    pub command: String,
    pub timeout: Duration,
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    defaults: HashMap<String, Reply>,
    delays: HashMap<String, Duration>,
}

#[derive(Default)]
pub struct ScriptedChannel {
    script: Mutex<Script>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer used whenever nothing is queued for `address`.
    pub fn set_default(&self, address: &str, reply: Reply) {
        self.script.lock().defaults.insert(address.to_string(), reply);
    }

    /// One-shot answers, consumed in order before the default.
    pub fn queue(&self, address: &str, reply: Reply) {
        self.script
            .lock()
            .queued
            .entry(address.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Every call to `address` takes this long. A delay longer than the
    /// call's timeout behaves like a hung host: the call times out.
    pub fn set_delay(&self, address: &str, delay: Duration) {
        self.script.lock().delays.insert(address.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, address: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.address == address).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, address: &str) -> (Reply, Option<Duration>) {
        let mut script = self.script.lock();
        let delay = script.delays.get(address).copied();
        let queued = script.queued.get_mut(address).and_then(VecDeque::pop_front);
        let reply = queued
            .or_else(|| script.defaults.get(address).cloned())
            .unwrap_or_else(Reply::refused);
        (reply, delay)
    }
}

#[async_trait]
impl RemoteChannel for ScriptedChannel {
    async fn execute(
        &self,
        address: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ChannelError> {
        self.calls.lock().push(RecordedCall {
            address: address.to_string(),
            command: command.to_string(),
            timeout,
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let (reply, delay) = self.next_reply(address);
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(ChannelError::Timeout(timeout));
            }
            tokio::time::sleep(delay).await;
        }

        match reply {
            Reply::Stdout(stdout) => Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
            }),
            Reply::Stderr(stderr) => Ok(CommandOutput {
                stdout: String::new(),
                stderr,
                exit_code: Some(255),
            }),
            Reply::Timeout => Err(ChannelError::Timeout(timeout)),
        }
    }
}

/// Liveness answers keyed by address. Unknown addresses are unreachable.
#[derive(Default)]
pub struct ScriptedProbe {
    reachable: Mutex<HashSet<String>>,
    probes: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut set = self.reachable.lock();
        if reachable {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn is_reachable(&self, address: &str, _timeout: Duration) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.lock().contains(address)
    }
}
