use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Provider-defined checkpoint token marking progress through a change stream.
///
/// Every connector defines its own token type (an LSN, a binlog coordinate, a
/// change-stream resume token). Tokens are totally ordered within their own
/// connector and serialize to an opaque byte blob for persistence. Tokens of
/// different types are never comparable: [`PositionToken::compare`] must
/// return [`None`] when `other` is not the same concrete type.
pub trait PositionToken: fmt::Debug + Send + Sync + 'static {
    /// Serializes the token into the opaque form persisted by a position store.
    fn to_bytes(&self) -> Vec<u8>;

    /// Compares this token against another token of the same connector.
    ///
    /// Implementations should downcast `other` via [`PositionToken::as_any`]
    /// and return [`None`] when the types differ.
    fn compare(&self, other: &dyn PositionToken) -> Option<Ordering>;

    /// Returns the token as [`Any`] for downcasting in [`PositionToken::compare`].
    fn as_any(&self) -> &dyn Any;
}

/// Opaque, cheaply-clonable position in a connector's change stream.
///
/// [`CdcPosition`] type-erases the provider token so that events from
/// different connectors can flow through the same pipeline. Positions from
/// different connectors are incomparable by construction: comparing them
/// yields [`None`].
#[derive(Debug, Clone)]
pub struct CdcPosition {
    token: Arc<dyn PositionToken>,
}

impl CdcPosition {
    /// Wraps a provider token into an erased position.
    pub fn new<T>(token: T) -> Self
    where
        T: PositionToken,
    {
        Self {
            token: Arc::new(token),
        }
    }

    /// Serializes the position into the opaque form persisted by a position store.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.token.to_bytes()
    }

    /// Returns the underlying token when it is of type `T`.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: PositionToken,
    {
        self.token.as_any().downcast_ref::<T>()
    }
}

impl PartialEq for CdcPosition {
    /// Two positions are equal when their tokens compare as equal, which
    /// requires them to be of the same concrete token type.
    fn eq(&self, other: &Self) -> bool {
        matches!(
            self.token.compare(other.token.as_ref()),
            Some(Ordering::Equal)
        )
    }
}

impl PartialOrd for CdcPosition {
    /// Orders positions within one connector; positions from different
    /// connectors yield [`None`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.token.compare(other.token.as_ref())
    }
}
