//! Error taxonomy for acceleration structure building and binding table layout.
//!
//! Three classes of failure exist in this crate:
//!
//! - [`Error::Configuration`]: a programming mistake on the caller's side
//!   (malformed geometry descriptor, missing ray generation group, record
//!   larger than the kind's capacity). Never retried.
//! - [`Error::ResourceExhaustion`]: device or host memory allocation failure
//!   for index storage or scratch. Fatal; no fallback beyond budgeted batching.
//! - [`Error::ProtocolViolation`]: lifecycle misuse that would be undefined
//!   behavior at the GPU level if allowed through, such as updating an index
//!   not built with `ALLOW_UPDATE` or removing a bottom-level structure still
//!   referenced by a top-level one.
//!
//! Any other device error propagates unchanged as [`Error::Vulkan`].

use ash::vk;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("device memory exhausted while allocating {what}: {result}")]
    ResourceExhaustion {
        what: &'static str,
        result: vk::Result,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl Error {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Classifies an allocation failure: the two out-of-memory codes become
    /// [`Error::ResourceExhaustion`] tagged with what was being allocated.
    pub(crate) fn allocation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Error::ResourceExhaustion { what, result }
            }
            other => Error::Vulkan(other),
        }
    }
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Error::ResourceExhaustion {
                    what: "device object",
                    result,
                }
            }
            other => Error::Vulkan(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_classified_as_exhaustion() {
        let err: Error = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(matches!(err, Error::ResourceExhaustion { .. }));
        let err: Error = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, Error::Vulkan(_)));
    }

    #[test]
    fn test_allocation_context() {
        let err = Error::allocation("scratch buffer")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        match err {
            Error::ResourceExhaustion { what, .. } => assert_eq!(what, "scratch buffer"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
