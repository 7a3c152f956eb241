//! LIFO shutdown hooks.
//!
//! Hooks run in reverse registration order, so the upstream event listener
//! (registered last) halts before the resources it uses are torn down.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

type Hook = (&'static str, Pin<Box<dyn Future<Output = ()> + Send>>);

#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<Hook>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_shutdown(
        &self,
        name: &'static str,
        hook: impl Future<Output = ()> + Send + 'static,
    ) {
        self.hooks.lock().unwrap().push((name, Box::pin(hook)));
    }

    /// Run every registered hook, last registered first.
    pub async fn run(&self) {
        let mut hooks = {
            let mut guard = self.hooks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        while let Some((name, hook)) = hooks.pop() {
            tracing::info!(hook = name, "running shutdown hook");
            hook.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_hooks_run_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let hooks = ShutdownHooks::new();
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            hooks.on_shutdown(name, async move {
                order.lock().unwrap().push(name);
            });
        }
        hooks.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_run_twice_is_harmless() {
        let count = Arc::new(AtomicUsize::new(0));
        let hooks = ShutdownHooks::new();
        let counter = Arc::clone(&count);
        hooks.on_shutdown("once", async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        hooks.run().await;
        hooks.run().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
