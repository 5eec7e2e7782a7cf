//! Test doubles shared by the reconcile and supervisor tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cluster_proxy_common::Error;

use crate::config::TunnelServerConfig;
use crate::engine::{EngineRun, TunnelEngine};

/// Engine stub counting launches, stops and concurrently live instances.
///
/// `fail_next` and `hang_next` make the next starts fail or never return.
#[derive(Default)]
pub(crate) struct StubEngine {
    pub launches: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    pub configs: parking_lot::Mutex<Vec<TunnelServerConfig>>,
    pub fail_next: AtomicUsize,
    pub hang_next: AtomicUsize,
    pub last_cancel: parking_lot::Mutex<Option<CancellationToken>>,
    pub ignore_cancel: bool,
}

#[async_trait]
impl TunnelEngine for StubEngine {
    async fn start(
        &self,
        config: TunnelServerConfig,
        cancel: CancellationToken,
    ) -> Result<EngineRun, Error> {
        *self.last_cancel.lock() = Some(cancel.clone());

        if self
            .hang_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            futures::future::pending::<()>().await;
        }

        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::launch("address already in use"));
        }

        self.launches.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().push(config);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        let live = self.live.clone();
        let stops = self.stops.clone();
        let ignore_cancel = self.ignore_cancel;
        Ok(Box::pin(async move {
            if ignore_cancel {
                futures::future::pending::<()>().await;
            } else {
                cancel.cancelled().await;
                stops.fetch_add(1, Ordering::SeqCst);
            }
            live.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }))
    }
}

impl StubEngine {
    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}
