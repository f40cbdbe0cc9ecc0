//! Route classification for frontend requests.
//!
//! A request is routed by its Host header (or the configured default name).
//! Clients that want one particular backend encode its session id at the very
//! end of the request target, after three dash-joined tokens and a dotted
//! domain, e.g. `/app-eu-1.example.com-a1b2c3d4e5f6`. External callers build
//! targets to this shape, so the pattern is kept literal.

use crate::types::SessionId;
use regex::Regex;
use std::sync::LazyLock;

static STICKY_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\w+-\w+-\w+\.\w+\.[\w.]+-(\w+)?$").expect("sticky target pattern is valid")
});

/// Where a frontend request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Any backend of the named route's group will do.
    Standard { name: String },
    /// Only the backend that announced `requested` may serve this request.
    Sticky { name: String, requested: SessionId },
    /// No Host header and no default route.
    Unroutable,
}

impl Route {
    /// Classify a request from its routing name and request target.
    pub fn classify(name: Option<&str>, uri: Option<&str>) -> Self {
        let Some(name) = name else {
            return Route::Unroutable;
        };

        match uri.and_then(sticky_id) {
            Some(requested) => Route::Sticky {
                name: name.to_string(),
                requested,
            },
            None => Route::Standard {
                name: name.to_string(),
            },
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Route::Standard { name } | Route::Sticky { name, .. } => Some(name),
            Route::Unroutable => None,
        }
    }

    pub fn is_sticky(&self) -> bool {
        matches!(self, Route::Sticky { .. })
    }
}

/// Extract the requested session id from a request target, if it carries one.
///
/// The id group is optional in the pattern: a target ending in the dash with
/// nothing after it is a standard request.
pub fn sticky_id(uri: &str) -> Option<SessionId> {
    STICKY_TARGET
        .captures(uri)?
        .get(1)
        .map(|id| SessionId::from(id.as_str()))
}
