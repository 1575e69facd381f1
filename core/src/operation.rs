//! Operations flowing through the engine.
//!
//! Commands (`fetch`, `cancel`) travel from the client into the exchange
//! pipeline. Events (`buffer`, `complete`, `reject`, `dispose`) travel from
//! exchanges back to the client through the shared
//! [`Emitter`](crate::exchange::Emitter). Events are never forwarded further
//! down the command chain.

use serde_json::Value;
use std::fmt;

use crate::error::FetchError;
use crate::request::{Request, RequestId};

/// Discriminant of an [`Operation`], useful for filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Start (or join) work for a request
    Fetch,
    /// Stop tracking the work for a request
    Cancel,
    /// A stream produced a value
    Buffer,
    /// Work finished; carries the value for single-shot requests
    Complete,
    /// Work failed
    Reject,
    /// Tear the key down
    Dispose,
}

impl OperationKind {
    /// Lowercase name used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Cancel => "cancel",
            Self::Buffer => "buffer",
            Self::Complete => "complete",
            Self::Reject => "reject",
            Self::Dispose => "dispose",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged command or event for one request key.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Command: fetch `request`
    Fetch(Request),

    /// Command: cancel the task backing `request`
    Cancel(Request),

    /// Event: a stream request produced `data`
    Buffer {
        /// The request the value belongs to
        request: Request,
        /// The produced value
        data: Value,
    },

    /// Event: the task finished without error
    ///
    /// Single-shot requests carry their value here. Stream requests complete
    /// with `None`, which leaves the cached value untouched.
    Complete {
        /// The finished request
        request: Request,
        /// The final value, if any
        data: Option<Value>,
    },

    /// Event: the handler or its stream failed
    Reject {
        /// The failed request
        request: Request,
        /// The failure
        error: FetchError,
    },

    /// Tear down all state for `id`
    ///
    /// Issued by the inactivity GC. Only the id is known at that point.
    Dispose {
        /// The key to dispose
        id: RequestId,
    },
}

impl Operation {
    /// `fetch` command.
    #[must_use]
    pub const fn fetch(request: Request) -> Self {
        Self::Fetch(request)
    }

    /// `cancel` command.
    #[must_use]
    pub const fn cancel(request: Request) -> Self {
        Self::Cancel(request)
    }

    /// `buffer` event.
    #[must_use]
    pub const fn buffer(request: Request, data: Value) -> Self {
        Self::Buffer { request, data }
    }

    /// `complete` event.
    #[must_use]
    pub const fn complete(request: Request, data: Option<Value>) -> Self {
        Self::Complete { request, data }
    }

    /// `reject` event.
    #[must_use]
    pub const fn reject(request: Request, error: FetchError) -> Self {
        Self::Reject { request, error }
    }

    /// `dispose` operation.
    #[must_use]
    pub const fn dispose(id: RequestId) -> Self {
        Self::Dispose { id }
    }

    /// The request key this operation targets.
    #[must_use]
    pub fn key(&self) -> &RequestId {
        match self {
            Self::Fetch(request)
            | Self::Cancel(request)
            | Self::Buffer { request, .. }
            | Self::Complete { request, .. }
            | Self::Reject { request, .. } => request.id(),
            Self::Dispose { id } => id,
        }
    }

    /// The full request, when the operation carries one.
    #[must_use]
    pub const fn request(&self) -> Option<&Request> {
        match self {
            Self::Fetch(request)
            | Self::Cancel(request)
            | Self::Buffer { request, .. }
            | Self::Complete { request, .. }
            | Self::Reject { request, .. } => Some(request),
            Self::Dispose { .. } => None,
        }
    }

    /// The operation's discriminant.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Fetch(_) => OperationKind::Fetch,
            Self::Cancel(_) => OperationKind::Cancel,
            Self::Buffer { .. } => OperationKind::Buffer,
            Self::Complete { .. } => OperationKind::Complete,
            Self::Reject { .. } => OperationKind::Reject,
            Self::Dispose { .. } => OperationKind::Dispose,
        }
    }

    /// Lowercase operation name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Whether this is a client-issued command.
    #[must_use]
    pub const fn is_command(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Cancel(_))
    }

    /// The value this operation writes to the cache, if any.
    ///
    /// Only `buffer` and `complete` with a payload update the cache.
    #[must_use]
    pub const fn cache_update(&self) -> Option<&Value> {
        match self {
            Self::Buffer { data, .. }
            | Self::Complete {
                data: Some(data), ..
            } => Some(data),
            _ => None,
        }
    }

    /// The error carried by a `reject`.
    #[must_use]
    pub const fn error(&self) -> Option<&FetchError> {
        match self {
            Self::Reject { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.key())
    }
}
