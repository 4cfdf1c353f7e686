//! Sandbox policy and the backends that enforce it.

pub mod backends;
pub mod boundary;
pub mod policy;

pub use boundary::{
    select_backend, BackendKind, BoundaryGuard, BoundaryRequest, IsolationBackend,
    IsolationBoundary, LaunchSpec,
};
pub use policy::SandboxPolicy;
