//! Reference-counted excavator resources.
//!
//! An algorithm context inside excavator must be created once, when the first
//! worker needs it, and removed once, when the last worker using it is freed.
//! [`Shared`] wraps any [`Resource`] with that create-on-first-grab /
//! destroy-on-last-release behaviour. Callers serialize access (the server
//! keeps all of them behind one lock), so the count is a plain integer.
//!
//! A failed destroy leaves the resource live with no holders: the next grab
//! reuses it instead of creating it twice, and [`Shared::destroy_idle`]
//! retries the teardown.

use super::protocol::{ExcavatorMethod, ExcavatorResult};
use super::transport::Transport;
use async_trait::async_trait;

/// Something that exists inside excavator and must be set up and torn down.
#[async_trait]
pub trait Resource: Send {
    async fn create(&mut self) -> ExcavatorResult<()>;

    async fn destroy(&mut self) -> ExcavatorResult<()>;
}

/// Holder count around a [`Resource`].
#[derive(Debug)]
pub struct Shared<R> {
    inner: R,
    holders: u32,
    /// Exists inside excavator
    live: bool,
}

impl<R: Resource> Shared<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            holders: 0,
            live: false,
        }
    }

    pub fn holders(&self) -> u32 {
        self.holders
    }

    pub fn is_held(&self) -> bool {
        self.holders > 0
    }

    /// Created and not yet destroyed, held or not.
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Take a reference, creating the resource unless it is already live.
    ///
    /// If creation fails the count is left untouched.
    pub async fn grab(&mut self) -> ExcavatorResult<()> {
        if !self.live {
            self.inner.create().await?;
            self.live = true;
        }
        self.holders += 1;
        Ok(())
    }

    /// Drop a reference, destroying the resource when none remain.
    ///
    /// Releasing an unheld resource is a no-op.
    pub async fn release(&mut self) -> ExcavatorResult<()> {
        if self.holders == 0 {
            tracing::warn!("release() on a resource with no holders");
            return Ok(());
        }
        self.holders -= 1;
        self.destroy_idle().await
    }

    /// Destroy the resource if it is live with no holders.
    pub async fn destroy_idle(&mut self) -> ExcavatorResult<()> {
        if self.holders == 0 && self.live {
            self.inner.destroy().await?;
            self.live = false;
        }
        Ok(())
    }
}

/// Excavator algorithm context, e.g. `equihash` or `benchmark-equihash`.
#[derive(Debug, Clone)]
pub struct AlgorithmContext {
    name: String,
    transport: Transport,
}

impl AlgorithmContext {
    pub fn new(name: impl Into<String>, transport: Transport) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Resource for AlgorithmContext {
    async fn create(&mut self) -> ExcavatorResult<()> {
        tracing::debug!("algorithm.add {}", self.name);
        self.transport
            .send(ExcavatorMethod::AlgorithmAdd, vec![self.name.clone()])
            .await?;
        Ok(())
    }

    async fn destroy(&mut self) -> ExcavatorResult<()> {
        tracing::debug!("algorithm.remove {}", self.name);
        self.transport
            .send(ExcavatorMethod::AlgorithmRemove, vec![self.name.clone()])
            .await?;
        Ok(())
    }
}

/// Name of the excavator context for a sub-algorithm.
pub fn context_name(algorithm: &str, benchmarking: bool) -> String {
    if benchmarking {
        format!("benchmark-{}", algorithm)
    } else {
        algorithm.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::excavator::protocol::ExcavatorError;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counting {
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_create: bool,
        failing_destroys: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl Resource for Counting {
        async fn create(&mut self) -> ExcavatorResult<()> {
            if self.fail_create {
                return Err(ExcavatorError::ConnectionError("down".to_string()));
            }
            self.log.lock().unwrap().push("create");
            Ok(())
        }

        async fn destroy(&mut self) -> ExcavatorResult<()> {
            let mut failing = self.failing_destroys.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(ExcavatorError::InvalidResponse("busy".to_string()));
            }
            self.log.lock().unwrap().push("destroy");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_and_destroy_on_transitions_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut shared = Shared::new(Counting {
            log: log.clone(),
            ..Default::default()
        });

        shared.grab().await.unwrap();
        shared.grab().await.unwrap();
        shared.grab().await.unwrap();
        assert_eq!(shared.holders(), 3);
        assert_eq!(*log.lock().unwrap(), vec!["create"]);

        shared.release().await.unwrap();
        shared.release().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["create"]);

        shared.release().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["create", "destroy"]);
        assert!(!shared.is_held());

        shared.grab().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["create", "destroy", "create"]);
    }

    #[tokio::test]
    async fn test_release_unheld_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut shared = Shared::new(Counting {
            log: log.clone(),
            ..Default::default()
        });
        shared.release().await.unwrap();
        assert_eq!(shared.holders(), 0);
        assert!(log.lock().unwrap().is_empty());

        // Counts never go negative: the next grab still creates.
        shared.grab().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["create"]);
    }

    #[tokio::test]
    async fn test_failed_create_does_not_count() {
        let mut shared = Shared::new(Counting {
            fail_create: true,
            ..Default::default()
        });
        assert!(shared.grab().await.is_err());
        assert_eq!(shared.holders(), 0);
    }

    #[tokio::test]
    async fn test_failed_destroy_is_not_created_twice() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing_destroys = Arc::new(Mutex::new(1));
        let mut shared = Shared::new(Counting {
            log: log.clone(),
            failing_destroys: failing_destroys.clone(),
            ..Default::default()
        });

        shared.grab().await.unwrap();
        assert!(shared.release().await.is_err());
        assert_eq!(shared.holders(), 0);
        assert!(shared.is_live());

        // Still live: a new holder reuses it
        shared.grab().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["create"]);

        shared.release().await.unwrap();
        assert!(!shared.is_live());
        assert_eq!(*log.lock().unwrap(), vec!["create", "destroy"]);
    }

    #[tokio::test]
    async fn test_destroy_idle_retries_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut shared = Shared::new(Counting {
            log: log.clone(),
            failing_destroys: Arc::new(Mutex::new(1)),
            ..Default::default()
        });

        shared.grab().await.unwrap();
        assert!(shared.release().await.is_err());
        shared.destroy_idle().await.unwrap();
        assert!(!shared.is_live());
        assert_eq!(*log.lock().unwrap(), vec!["create", "destroy"]);

        // Nothing left to tear down
        shared.destroy_idle().await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_context_names() {
        assert_eq!(context_name("equihash", false), "equihash");
        assert_eq!(context_name("equihash", true), "benchmark-equihash");
    }
}
