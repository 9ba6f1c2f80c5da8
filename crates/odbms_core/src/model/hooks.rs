//! Lifecycle hooks around save and delete.
//!
//! Blocking hooks run inline in the blocking API. The async API first awaits
//! the async hooks, then runs the blocking hooks on the worker's blocking
//! pool, so a hook registered in either form fires from both APIs.

use super::entity::Entity;
use crate::error::DbmsResult;
use crate::worker::Worker;
use futures::future::BoxFuture;
use log::debug;
use std::sync::Arc;

/// Blocking hook; may mutate the entity before or after persistence.
pub type Hook = Arc<dyn Fn(&mut Entity) -> DbmsResult<()> + Send + Sync>;

/// Async hook returning a boxed future borrowing the entity.
pub type AsyncHook =
    Arc<dyn for<'a> Fn(&'a mut Entity) -> BoxFuture<'a, DbmsResult<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    BeforeSave,
    AfterSave,
    BeforeDelete,
    AfterDelete,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeSave => "before_save",
            Self::AfterSave => "after_save",
            Self::BeforeDelete => "before_delete",
            Self::AfterDelete => "after_delete",
        }
    }
}

#[derive(Clone, Default)]
pub struct Hooks {
    blocking: Vec<(HookPoint, Hook)>,
    nonblocking: Vec<(HookPoint, AsyncHook)>,
}

impl Hooks {
    pub fn add(&mut self, point: HookPoint, hook: Hook) {
        self.blocking.push((point, hook));
    }

    pub fn add_async(&mut self, point: HookPoint, hook: AsyncHook) {
        self.nonblocking.push((point, hook));
    }

    pub fn is_empty(&self) -> bool {
        self.blocking.is_empty() && self.nonblocking.is_empty()
    }

    fn blocking_at(&self, point: HookPoint) -> Vec<Hook> {
        self.blocking
            .iter()
            .filter(|(at, _)| *at == point)
            .map(|(_, hook)| Arc::clone(hook))
            .collect()
    }

    /// Runs the blocking hooks for `point` in registration order.
    ///
    /// The first failing hook stops the chain.
    pub fn run(&self, point: HookPoint, entity: &mut Entity) -> DbmsResult<()> {
        for (at, hook) in &self.blocking {
            if *at == point {
                hook(entity)?;
            }
        }
        Ok(())
    }

    /// Awaits the async hooks for `point`, then runs the blocking ones on the
    /// worker's blocking pool.
    ///
    /// Blocking hooks work on a detached copy that replaces `entity` only when
    /// every hook succeeded.
    pub async fn run_async(
        &self,
        point: HookPoint,
        entity: &mut Entity,
        worker: &Worker,
    ) -> DbmsResult<()> {
        for (at, hook) in &self.nonblocking {
            if *at == point {
                hook(entity).await?;
            }
        }

        let hooks = self.blocking_at(point);
        if hooks.is_empty() {
            return Ok(());
        }
        debug!(
            "event=hooks_offload module=model status=start point={} count={}",
            point.as_str(),
            hooks.len()
        );
        let mut detached = entity.clone();
        let detached = worker
            .run_blocking(move || {
                for hook in &hooks {
                    hook(&mut detached)?;
                }
                Ok(detached)
            })
            .await?;
        *entity = detached;
        Ok(())
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("blocking", &self.blocking.len())
            .field("async", &self.nonblocking.len())
            .finish()
    }
}
