//! Append-only, copy-on-write route registry.
//!
//! Every `add` publishes a fully sorted snapshot through a compare-and-swap
//! over an immutable `Vec`, so readers never block writers and never observe
//! a half-built list. Order: priority class, then rank, then publish order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::route::{Route, RouteError};

pub type RouteSnapshot = Arc<Vec<Arc<Route>>>;

/// Public struct `RouteRegistry` used across turnstile components.
#[derive(Debug)]
pub struct RouteRegistry {
    routes: ArcSwap<Vec<Arc<Route>>>,
    disposed: AtomicBool,
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn add(&self, route: Route) -> Result<(), RouteError> {
        let route = Arc::new(route);
        let key = route.order_key();
        loop {
            self.ensure_open()?;
            let current = self.routes.load_full();
            // New routes land after every existing route with an equal or lower key.
            let position = current.partition_point(|existing| existing.order_key() <= key);
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current[..position].iter().cloned());
            next.push(Arc::clone(&route));
            next.extend(current[position..].iter().cloned());

            let previous = self.routes.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                tracing::debug!(
                    priority_class = key.0,
                    rank = key.1 .0,
                    position,
                    "route registered"
                );
                return Ok(());
            }
        }
    }

    pub fn snapshot(&self) -> Result<RouteSnapshot, RouteError> {
        self.ensure_open()?;
        Ok(self.routes.load_full())
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the registry; later `add` and `snapshot` calls fail.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.routes.store(Arc::new(Vec::new()));
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), RouteError> {
        if self.is_disposed() {
            return Err(RouteError::RegistryDisposed);
        }
        Ok(())
    }
}
