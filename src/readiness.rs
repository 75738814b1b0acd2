//! Bounded readiness polling.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{debug, info};
use url::Url;

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{BootstrapError, BootstrapResult};
use crate::types::UnitName;

/// Per-attempt bound on a single TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-attempt bound on `systemctl is-active`.
const UNIT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can be asked "are you up yet?".
pub trait ReadinessProbe: Send + Sync {
    /// What is being probed, for messages.
    fn target(&self) -> String;

    /// `Ok` once ready; `Err` carries the reason it is not.
    fn check(&self) -> impl Future<Output = Result<(), String>> + Send;
}

/// How long and how often to poll.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Accepts TCP connections on a host/port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub host: String,
    pub port: u16,
}

impl TcpProbe {
    /// Probe the endpoint of an `ldap://` or `ldaps://` URL, defaulting the
    /// port from the scheme.
    pub fn from_ldap_url(url: &Url) -> BootstrapResult<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| BootstrapError::config(format!("`{url}` has no host")))?;
        let port = match (url.port(), url.scheme()) {
            (Some(port), _) => port,
            (None, "ldaps") => 636,
            (None, "ldap") => 389,
            (None, scheme) => {
                return Err(BootstrapError::config(format!(
                    "cannot infer a port for scheme `{scheme}`"
                )));
            }
        };
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }
}

impl ReadinessProbe for TcpProbe {
    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn check(&self) -> Result<(), String> {
        match tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connect timed out after {}s", CONNECT_TIMEOUT.as_secs())),
        }
    }
}

/// `systemctl is-active` reports the unit as running.
pub struct UnitActiveProbe<'a, R> {
    runner: &'a R,
    unit: UnitName,
}

impl<'a, R: CommandRunner> UnitActiveProbe<'a, R> {
    pub fn new(runner: &'a R, unit: UnitName) -> Self {
        Self { runner, unit }
    }
}

impl<R: CommandRunner> ReadinessProbe for UnitActiveProbe<'_, R> {
    fn target(&self) -> String {
        format!("unit {}", self.unit)
    }

    async fn check(&self) -> Result<(), String> {
        let spec = CommandSpec::new("systemctl")
            .args(["is-active", self.unit.as_str()])
            .timeout(UNIT_CHECK_TIMEOUT);
        match self.runner.run(&spec).await {
            Ok(output) if output.is_success() => Ok(()),
            Ok(output) => Err(format!("unit is {}", output.stdout.trim())),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Both probes must pass.
pub struct AllOf<A, B>(pub A, pub B);

impl<A: ReadinessProbe, B: ReadinessProbe> ReadinessProbe for AllOf<A, B> {
    fn target(&self) -> String {
        format!("{} and {}", self.0.target(), self.1.target())
    }

    async fn check(&self) -> Result<(), String> {
        self.0.check().await?;
        self.1.check().await
    }
}

/// Poll `probe` until it passes, the policy's timeout elapses or `cancel`
/// resolves.
pub async fn wait_until_ready<P, C>(
    probe: &P,
    policy: ReadinessPolicy,
    cancel: C,
) -> BootstrapResult<Duration>
where
    P: ReadinessProbe,
    C: Future<Output = ()>,
{
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + policy.timeout;
    let target = probe.target();
    tokio::pin!(cancel);

    info!(target = %target, timeout_secs = policy.timeout.as_secs(), "Waiting for readiness");

    let mut attempts = 0u32;
    let mut last_error;
    loop {
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = &mut cancel => return Err(BootstrapError::Cancelled),
            result = probe.check() => result,
            _ = tokio::time::sleep_until(deadline) => {
                Err("check did not complete before the deadline".to_string())
            }
        };
        match outcome {
            Ok(()) => {
                let waited = started.elapsed();
                info!(target = %target, attempts, waited_ms = waited.as_millis() as u64, "Ready");
                return Ok(waited);
            }
            Err(e) => {
                debug!(target = %target, attempts, error = %e, "Not ready yet");
                last_error = e;
            }
        }

        if tokio::time::Instant::now() + policy.interval > deadline {
            break;
        }

        tokio::select! {
            biased;
            _ = &mut cancel => return Err(BootstrapError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }

    Err(BootstrapError::NotReady {
        target,
        waited: started.elapsed(),
        last_error,
    })
}
