// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded, fire-and-forget dispatch of mirrored requests.
//!
//! Every mirrored request runs as a detached tokio task holding one permit
//! of the dispatcher's semaphore. Nothing from the primary request is
//! propagated into the task, so closing the client connection does not
//! cancel an in-flight mirror; the mirror timeout bounds it instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::core::{ProxyError, UpstreamClient};
use crate::stream::DEFAULT_PIPE_CAPACITY;
use crate::{debug_fmt, warn_fmt};

/// Settings under `proxy.mirror`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSettings {
    /// Maximum number of mirror requests in flight
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Chunks buffered between the primary body and the mirror body
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,

    /// Timeout for a whole mirror exchange, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_max_in_flight() -> usize {
    64
}

fn default_buffer_chunks() -> usize {
    DEFAULT_PIPE_CAPACITY
}

fn default_timeout() -> u64 {
    30
}

impl MirrorSettings {
    /// Largest accepted `max_in_flight` and `buffer_chunks`.
    pub fn max_bound() -> usize {
        Semaphore::MAX_PERMITS.min(u32::MAX as usize)
    }

    /// Reject values the semaphore and the tee pipe cannot hold.
    pub fn validate(&self) -> Result<(), ProxyError> {
        let bound = Self::max_bound();
        if self.max_in_flight > bound {
            return Err(ProxyError::ConfigError(format!(
                "proxy.mirror.max_in_flight must be at most {}, got {}",
                bound, self.max_in_flight
            )));
        }
        if self.buffer_chunks > bound {
            return Err(ProxyError::ConfigError(format!(
                "proxy.mirror.buffer_chunks must be at most {}, got {}",
                bound, self.buffer_chunks
            )));
        }
        Ok(())
    }

    fn permits(&self) -> usize {
        self.max_in_flight.max(1)
    }
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            buffer_chunks: default_buffer_chunks(),
            timeout: default_timeout(),
        }
    }
}

/// How a mirrored request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The mirror target answered; its body was drained and discarded.
    Completed {
        request_id: String,
        url: String,
        status: u16,
    },
    /// Connection failure, timeout or body error.
    Failed {
        request_id: String,
        url: String,
        error: String,
    },
}

impl MirrorOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            MirrorOutcome::Completed { request_id, .. }
            | MirrorOutcome::Failed { request_id, .. } => request_id,
        }
    }
}

/// Called once per dispatched mirror request, from the mirror task.
pub type MirrorHook = Arc<dyn Fn(&MirrorOutcome) + Send + Sync>;

static SHARED: OnceCell<MirrorDispatcher> = OnceCell::new();

/// Runs mirror requests on a bounded set of detached tasks.
#[derive(Clone)]
pub struct MirrorDispatcher {
    client: Arc<dyn UpstreamClient>,
    permits: Arc<Semaphore>,
    settings: MirrorSettings,
    hook: Option<MirrorHook>,
}

impl fmt::Debug for MirrorDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorDispatcher")
            .field("settings", &self.settings)
            .field("available", &self.permits.available_permits())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl MirrorDispatcher {
    /// Create a dispatcher with its own HTTP client.
    pub fn new(settings: MirrorSettings) -> Result<Self, ProxyError> {
        settings.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(ProxyError::ClientError)?;
        Self::with_client(settings, Arc::new(client))
    }

    pub fn with_client(
        settings: MirrorSettings,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<Self, ProxyError> {
        settings.validate()?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(settings.permits())),
            settings,
            hook: None,
        })
    }

    /// Observe every mirror outcome; mostly useful in tests.
    pub fn with_hook(mut self, hook: MirrorHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The process-wide dispatcher used by filters built from configuration.
    pub fn shared() -> Result<Self, ProxyError> {
        SHARED
            .get_or_try_init(|| MirrorDispatcher::new(MirrorSettings::default()))
            .cloned()
    }

    /// Install the process-wide dispatcher.
    ///
    /// Returns `false` when one already exists; the existing one is kept.
    pub fn install_shared(settings: MirrorSettings) -> Result<bool, ProxyError> {
        settings.validate()?;
        if SHARED.get().is_some() {
            return Ok(false);
        }
        Ok(SHARED.set(MirrorDispatcher::new(settings)?).is_ok())
    }

    pub fn settings(&self) -> &MirrorSettings {
        &self.settings
    }

    /// Claim a slot for one mirror request, or `None` when saturated.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    /// Number of mirror requests currently running.
    pub fn in_flight(&self) -> usize {
        self.settings.permits() - self.permits.available_permits()
    }

    /// Spawn the mirror request. The response is drained and dropped.
    pub fn dispatch(
        &self,
        permit: OwnedSemaphorePermit,
        request_id: String,
        request: reqwest::Request,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let hook = self.hook.clone();
        let limit = Duration::from_secs(self.settings.timeout);

        tokio::spawn(async move {
            let _permit = permit;
            let url = request.url().to_string();

            let outcome = match timeout(limit, exchange(client.as_ref(), request)).await {
                Ok(Ok(status)) => {
                    if !(200..300).contains(&status) {
                        warn_fmt!("Tee", "[{}] mirror {} answered {}", request_id, url, status);
                    } else {
                        debug_fmt!("Tee", "[{}] mirror {} answered {}", request_id, url, status);
                    }
                    MirrorOutcome::Completed {
                        request_id,
                        url,
                        status,
                    }
                }
                Ok(Err(e)) => failed(request_id, url, e),
                Err(_) => failed(request_id, url, ProxyError::Timeout(limit)),
            };

            if let Some(hook) = hook {
                hook(&outcome);
            }
        })
    }

    /// Wait until no mirror request is in flight.
    pub async fn wait_idle(&self) {
        let max = u32::try_from(self.settings.permits()).unwrap_or(u32::MAX);
        if self.permits.acquire_many(max).await.is_err() {
            debug_fmt!("Tee", "mirror semaphore closed while waiting for idle");
        }
    }
}

fn failed(request_id: String, url: String, err: ProxyError) -> MirrorOutcome {
    warn_fmt!("Tee", "[{}] error while tee request to {}: {}", request_id, url, err);
    MirrorOutcome::Failed {
        request_id,
        url,
        error: err.to_string(),
    }
}

/// Send the request and drain the response body.
async fn exchange(
    client: &dyn UpstreamClient,
    request: reqwest::Request,
) -> Result<u16, ProxyError> {
    let response = client.execute(request).await?;
    let status = response.status().as_u16();

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        chunk?;
    }

    Ok(status)
}
