//! Error taxonomy (spec.md §7).
//!
//! Every fallible call in this crate returns `anyhow::Result`, same as the
//! disk driver beneath it. `MdError` is the one thing worth a concrete type:
//! the top-level operation needs to recover *which* category failed to pick
//! an exit code and a user message, and `anyhow::Error::downcast_ref` gets it
//! there without every intermediate function having to match on variants it
//! doesn't care about.

use std::fmt;

/// The seven error categories spec.md §7 says the core must distinguish.
#[derive(Debug, Clone)]
pub enum MdError {
    /// 1. Bad user argument, bad config line, forbidden combination.
    Config(String),
    /// 2. EBUSY/EAGAIN on a device; caller should retry with backoff.
    TransientIo(String),
    /// 3. Bad sector or unreadable device; disk recorded as failed, quorum
    ///    may still hold.
    PermanentIo(String),
    /// 4. Checksum, signature, or attribute-mask violation; super rejected
    ///    as if absent.
    MetadataInvariant(String),
    /// 5. Request doesn't fit platform or disk constraints.
    Geometry(String),
    /// 6. ioctl on the `md` driver returned an error.
    KernelRpc(String),
    /// 7. Reshape aborted mid-flight (degradation or signal); last
    ///    checkpoint remains valid.
    ReshapeAbort(String),
}

impl fmt::Display for MdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MdError::Config(m) => write!(f, "configuration error: {}", m),
            MdError::TransientIo(m) => write!(f, "transient I/O error: {}", m),
            MdError::PermanentIo(m) => write!(f, "permanent I/O error: {}", m),
            MdError::MetadataInvariant(m) => write!(f, "metadata invariant violated: {}", m),
            MdError::Geometry(m) => write!(f, "geometry rejected: {}", m),
            MdError::KernelRpc(m) => write!(f, "kernel RPC failed: {}", m),
            MdError::ReshapeAbort(m) => write!(f, "reshape aborted: {}", m),
        }
    }
}

impl std::error::Error for MdError {}

impl MdError {
    /// Process exit code per spec.md §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            MdError::Config(_) => 1,
            MdError::TransientIo(_) | MdError::PermanentIo(_) | MdError::KernelRpc(_) => 2,
            MdError::MetadataInvariant(_) | MdError::Geometry(_) | MdError::ReshapeAbort(_) => 2,
        }
    }
}

/// Recover the `MdError` category from an arbitrary `anyhow::Error`, the way
/// a top-level command decides its exit code (spec.md §7 "Propagation
/// policy").
pub fn classify(err: &anyhow::Error) -> Option<&MdError> {
    err.downcast_ref::<MdError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcasts_through_anyhow_context() {
        let base: anyhow::Error = MdError::Geometry("too many devices".into()).into();
        let wrapped = base.context("validating create request");
        match classify(&wrapped) {
            Some(MdError::Geometry(m)) => assert_eq!(m, "too many devices"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(MdError::Config("x".into()).exit_code(), 1);
        assert_eq!(MdError::KernelRpc("x".into()).exit_code(), 2);
    }
}
