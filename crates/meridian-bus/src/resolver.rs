//! Resolution of inbound requests to local methods.
//!
//! The bus itself knows nothing about resources; the embedding process
//! supplies a [`Resolver`] that maps a resource path and method name to a
//! callable. Resolution distinguishes "no such resource" from "resource
//! exists but has no such method" so the two map to distinct 404 texts.

use std::sync::Arc;

use serde_json::Value;

use meridian_protocol::{Args, Kwargs, MethodError};

/// Invokable method. Runs on the serving bus's worker tasks, so it must
/// not block; long work belongs behind its own channel.
pub type MethodFn = Arc<dyn Fn(Args, Kwargs) -> Result<Value, MethodError> + Send + Sync>;

/// Outcome of a lookup.
pub enum Resolution {
    /// No resource lives at the requested path.
    ResourceNotFound,
    /// The resource exists but does not expose the requested method.
    MethodNotFound,
    Found(MethodFn),
}

/// Maps `(path, method)` from an inbound request to a local callable.
pub trait Resolver: Send + Sync {
    fn resolve(&self, path: &str, method: &str) -> Resolution;
}

impl<F> Resolver for F
where
    F: Fn(&str, &str) -> Resolution + Send + Sync,
{
    fn resolve(&self, path: &str, method: &str) -> Resolution {
        self(path, method)
    }
}

/// Resolver for a bus that serves nothing; every request answers 404.
pub struct NullResolver;

impl Resolver for NullResolver {
    fn resolve(&self, _path: &str, _method: &str) -> Resolution {
        Resolution::ResourceNotFound
    }
}
