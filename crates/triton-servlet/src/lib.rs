//! # triton-servlet: the servlet dispatch registry
//!
//! Maps request URIs to handler callbacks. An entry stays dispatchable only
//! while two things are alive: the strong [`Servlet`] handle returned at
//! registration, and (when one was supplied) the caller-owned dependency
//! token. Dropping either makes future lookups return `None` before the entry
//! is physically removed, so a module's servlets vanish exactly when the
//! module is torn down, without explicit deregistration.
//!
//! The registry is generic over the callback type: each framing protocol
//! instantiates its own registry with its own callback signature, the same
//! way the protocol layers above the socket core each define their own
//! handler shape.
//!
//! Registration is rare and takes the write lock; lookup is hot and takes the
//! read lock.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use thiserror::Error;

/// Result type for registry operations.
pub type ServletResult<T> = Result<T, ServletError>;

/// Errors raised by servlet registration.
#[derive(Debug, Error)]
pub enum ServletError {
    /// A live servlet is already registered for the URI.
    #[error("duplicate servlet for URI `{uri}`")]
    DuplicateServlet { uri: String },
}

/// A caller-owned token whose liveness gates a servlet entry.
pub type DependencyToken = Arc<dyn Any + Send + Sync>;

/// A registered handler. The `Arc<Servlet>` returned by
/// [`ServletRegistry::register`] is the entry's lifetime: drop it and lookups
/// stop finding the servlet.
pub struct Servlet<C> {
    uri: String,
    dependency: Option<Weak<dyn Any + Send + Sync>>,
    callback: C,
}

impl<C> std::fmt::Debug for Servlet<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Servlet")
            .field("uri", &self.uri)
            .field("dependency", &self.dependency)
            .finish_non_exhaustive()
    }
}

impl<C> Servlet<C> {
    fn new(uri: String, dependency: Option<&DependencyToken>, callback: C) -> Self {
        triton_log::debug!("Created servlet for URI {uri}");
        Self {
            uri,
            dependency: dependency.map(Arc::downgrade),
            callback,
        }
    }

    /// The URI this servlet serves.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Resolves the dependency gate: `None` if the servlet was registered
    /// with a token that has since been released.
    fn lock_dependency(&self) -> Option<Option<DependencyToken>> {
        match &self.dependency {
            None => Some(None),
            Some(weak) => weak.upgrade().map(Some),
        }
    }
}

impl<C> Drop for Servlet<C> {
    fn drop(&mut self) {
        triton_log::debug!("Destroyed servlet for URI {}", self.uri);
    }
}

/// A dispatchable servlet: the strong handle plus, when one gates the entry,
/// the locked dependency held for the duration of the dispatch.
pub struct ServletRef<C> {
    servlet: Arc<Servlet<C>>,
    _dependency: Option<DependencyToken>,
}

impl<C> ServletRef<C> {
    /// The handler callback.
    pub fn callback(&self) -> &C {
        &self.servlet.callback
    }

    /// The URI the servlet was registered under.
    pub fn uri(&self) -> &str {
        self.servlet.uri()
    }
}

/// URI → servlet map with weak entries.
pub struct ServletRegistry<C> {
    servlets: RwLock<HashMap<String, Weak<Servlet<C>>>>,
}

impl<C> Default for ServletRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ServletRegistry<C> {
    pub fn new() -> Self {
        Self {
            servlets: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a callback for `uri`.
    ///
    /// With `dependency: Some(token)`, the entry is dispatchable only while
    /// the token is alive; with `None` the entry has no gate beyond the
    /// returned handle. Fails with [`ServletError::DuplicateServlet`] while a
    /// previously returned handle for the same URI is still live; expired
    /// entries are replaced.
    pub fn register(
        &self,
        uri: &str,
        dependency: Option<&DependencyToken>,
        callback: C,
    ) -> ServletResult<Arc<Servlet<C>>> {
        let servlet = Arc::new(Servlet::new(uri.to_owned(), dependency, callback));

        let mut servlets = self.servlets.write().unwrap();
        let slot = servlets.entry(uri.to_owned()).or_insert_with(Weak::new);
        if slot.upgrade().is_some() {
            return Err(ServletError::DuplicateServlet {
                uri: uri.to_owned(),
            });
        }
        *slot = Arc::downgrade(&servlet);
        Ok(servlet)
    }

    /// Looks up the servlet for `uri`, upgrading the entry and its dependency
    /// gate. Returns `None` when the entry is absent, the handle has been
    /// dropped, or the dependency token has been released.
    pub fn get(&self, uri: &str) -> Option<ServletRef<C>> {
        let servlets = self.servlets.read().unwrap();
        let servlet = servlets.get(uri)?.upgrade()?;
        drop(servlets);

        let dependency = servlet.lock_dependency()?;
        Some(ServletRef {
            servlet,
            _dependency: dependency,
        })
    }

    /// Drops every entry. Outstanding strong handles keep their servlets
    /// alive, but lookups no longer find them.
    pub fn clear(&self) {
        triton_log::info!("Unloading all servlets...");
        self.servlets.write().unwrap().clear();
    }
}
