use std::fmt;
use std::hash::Hash;

/// An item held in a [`crate::cache::CollectionCache`].
///
/// Two values with the same key are the same entity; everything else about
/// the type is opaque to the sync machinery.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}
