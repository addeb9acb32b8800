use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::RouterError;
use crate::router::Router;
use crate::session::Session;

/// Future returned by an app's entry point.
pub type AppFuture = Pin<Box<dyn Future<Output = Result<(), RouterError>> + Send>>;

/// A type-erased app entry point. It receives the app's started session and
/// runs until the app exits or notices it was interrupted.
pub type AppFn = Arc<dyn Fn(Arc<Session>) -> AppFuture + Send + Sync + 'static>;

/// Box an async closure into an [`AppFn`].
pub fn make_app<F, Fut>(f: F) -> AppFn
where
    F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RouterError>> + Send + 'static,
{
    Arc::new(move |session| Box::pin(f(session)) as AppFuture)
}

struct AppSlot {
    entry: AppFn,
    session: Arc<Session>,
    task: Option<JoinHandle<Result<(), RouterError>>>,
}

impl AppSlot {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Launches named apps on their own tasks and tracks which one is in the
/// foreground. This is what a shell uses to host apps.
pub struct Supervisor {
    router: Router,
    apps: BTreeMap<String, AppSlot>,
    active: Option<String>,
}

impl Supervisor {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            apps: BTreeMap::new(),
            active: None,
        }
    }

    /// Register an app under `name`.
    ///
    /// # Example
    /// ```ignore
    /// supervisor.register("echo", |session| async move {
    ///     while !session.is_interrupted() {
    ///         let text = session.start_dictation("stop", "Say something.").await?;
    ///         session.synthesize(&text).await?;
    ///     }
    ///     Ok(())
    /// });
    /// ```
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, entry: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RouterError>> + Send + 'static,
    {
        let name = name.into();
        let session = Arc::new(Session::new(self.router.clone(), name.clone()));
        self.apps.insert(
            name.clone(),
            AppSlot {
                entry: make_app(entry),
                session,
                task: None,
            },
        );
        info!(app = %name, "Registered app");
    }

    pub fn names(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apps.contains_key(name)
    }

    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.apps.get(name).map(|slot| Arc::clone(&slot.session))
    }

    /// Start `name` on a new task, or bring it back to the foreground if it
    /// is already running. The app becomes the active app either way.
    pub async fn launch(&mut self, name: &str) -> Result<Arc<Session>, RouterError> {
        let slot = self
            .apps
            .get_mut(name)
            .ok_or_else(|| RouterError::UnknownApp(name.to_string()))?;
        let session = Arc::clone(&slot.session);

        if slot.is_running() {
            session.foreground().await?;
        } else {
            session.start();

            let entry = Arc::clone(&slot.entry);
            let app_session = Arc::clone(&session);
            let app = name.to_string();
            slot.task = Some(tokio::spawn(async move {
                let result = entry(Arc::clone(&app_session)).await;
                if let Err(e) = &result {
                    warn!(app = %app, error = %e, "App exited with error");
                }
                app_session.cleanup();
                result
            }));
            info!(app = %name, "Launched app");
        }

        self.active = Some(name.to_string());
        Ok(session)
    }

    /// The foregrounded app, if it is still active.
    pub fn active(&mut self) -> Option<&str> {
        let still_active = self
            .active
            .as_deref()
            .and_then(|name| self.apps.get(name))
            .is_some_and(|slot| slot.session.is_active());
        if !still_active {
            self.active = None;
        }
        self.active.as_deref()
    }

    /// Send the foregrounded app to the background, returning its name.
    pub fn background_active(&mut self) -> Option<String> {
        let name = self.active()?.to_string();
        if let Some(slot) = self.apps.get(&name) {
            slot.session.background();
        }
        self.active = None;
        Some(name)
    }

    /// Stop every running app: interrupt it, wake any blocked read, and
    /// wait for its task to finish.
    pub async fn shutdown(&mut self) {
        for (name, slot) in self.apps.iter_mut() {
            let Some(task) = slot.task.take() else {
                continue;
            };

            if slot.session.is_initialized() {
                info!(app = %name, "Interrupting app");
                if let Err(e) = slot.session.interrupt() {
                    warn!(app = %name, error = %e, "Failed to wake app");
                }
            }

            match task.await {
                Ok(_) => info!(app = %name, "App joined"),
                Err(e) => warn!(app = %name, error = %e, "App task failed"),
            }
        }
        self.active = None;
    }
}
