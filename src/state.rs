//! Query/mutation state, transition metadata, and the cache directive enum.

/// Caller's preference for cache use on a given `execute` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheDirective {
    /// Always re-fetch; ignore whatever is cached.
    NoCache,
    /// Serve a fresh cache hit directly; otherwise behave like `NoCache`.
    #[default]
    Fresh,
    /// Serve a stale cache hit immediately and refresh in the background;
    /// behave like `NoCache` when nothing is cached.
    Stale,
}

/// Whether a transition was produced by this controller or received from the
/// shared provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The controller itself produced this transition.
    SelfOrigin,
    /// The transition arrived via the provider's fan-out from another
    /// controller (or from `CacheManager`).
    Provider,
}

/// What kind of operation produced a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Query,
    Cache,
    BackgroundQuery,
    Mutation,
    Initialization,
}

/// Metadata attached to every emitted transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateMetadata {
    pub origin: Origin,
    pub source: Source,
    pub directive: Option<CacheDirective>,
}

impl StateMetadata {
    pub fn new(origin: Origin, source: Source, directive: Option<CacheDirective>) -> Self {
        StateMetadata {
            origin,
            source,
            directive,
        }
    }

    /// Rewrite this metadata's origin to `Provider`, as done for every
    /// transition fanned out through the shared provider (see §4.4/§6).
    pub fn rewritten_for_fanout(mut self) -> Self {
        self.origin = Origin::Provider;
        self
    }
}

/// The cache-directive state machine's tagged union.
///
/// Invariants upheld by construction, not by runtime assertion: `Stale` and
/// `Success` always carry data; `Error` always carries an error; no variant
/// carries both.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryState<T, E> {
    Idle {
        data: Option<T>,
    },
    Loading {
        data: Option<T>,
    },
    Stale {
        data: T,
    },
    Success {
        data: T,
    },
    Error {
        error: E,
    },
}

impl<T: Clone, E> QueryState<T, E> {
    /// The `data` field, if this variant carries one.
    pub fn data(&self) -> Option<&T> {
        match self {
            QueryState::Idle { data } | QueryState::Loading { data } => data.as_ref(),
            QueryState::Stale { data } | QueryState::Success { data } => Some(data),
            QueryState::Error { .. } => None,
        }
    }

    /// The `error` field, if this variant carries one.
    pub fn error(&self) -> Option<&E> {
        match self {
            QueryState::Error { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Success { .. } | QueryState::Error { .. } | QueryState::Stale { .. }
        )
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, QueryState::Loading { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, QueryState::Error { .. })
    }

    /// Build the `Loading` transition from the current state, carrying
    /// forward prior success data and clearing any error (per the state
    /// table in the design).
    pub fn into_loading(&self) -> QueryState<T, E> {
        let carried = match self {
            QueryState::Success { data } | QueryState::Stale { data } => Some(data.clone()),
            QueryState::Loading { data } => data.clone(),
            QueryState::Idle { data } => data.clone(),
            QueryState::Error { .. } => None,
        };
        QueryState::Loading { data: carried }
    }
}

/// The write-side counterpart state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum MutationState<T, E> {
    Idle { data: Option<T> },
    Loading,
    Success { data: T },
    Error { error: E },
}

impl<T, E> MutationState<T, E> {
    pub fn data(&self) -> Option<&T> {
        match self {
            MutationState::Success { data } => Some(data),
            MutationState::Idle { data } => data.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            MutationState::Error { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MutationState::Success { .. } | MutationState::Error { .. }
        )
    }
}
