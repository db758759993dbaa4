//! Hash collections with the Fx hasher.
//!
//! Keys in this crate are short strings (job ids, profile ids, job groups) produced by the
//! scheduler, so DoS-resistant hashing is not needed.
use fxhash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::ops::{Deref, DerefMut};

type InnerMap<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;
type InnerSet<T> = hashbrown::HashSet<T, FxBuildHasher>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Map<K: Eq + Hash, V>(InnerMap<K, V>);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Set<T: Eq + Hash>(InnerSet<T>);

macro_rules! impl_collection {
    ($name:ident<$($param:ident),+>, $inner:ty, $item:ty, $ref_item:ty, $lt:lifetime, $key:ident) => {
        impl<$($param),+> $name<$($param),+>
        where
            $key: Eq + Hash,
        {
            #[inline]
            pub fn new() -> Self {
                Self::default()
            }

            #[inline]
            pub fn with_capacity(capacity: usize) -> Self {
                Self(<$inner>::with_capacity_and_hasher(
                    capacity,
                    FxBuildHasher::default(),
                ))
            }
        }

        impl<$($param),+> Default for $name<$($param),+>
        where
            $key: Eq + Hash,
        {
            #[inline]
            fn default() -> Self {
                Self(<$inner>::default())
            }
        }

        impl<$($param),+> Deref for $name<$($param),+>
        where
            $key: Eq + Hash,
        {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl<$($param),+> DerefMut for $name<$($param),+>
        where
            $key: Eq + Hash,
        {
            #[inline]
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }

        impl<$($param),+> FromIterator<$item> for $name<$($param),+>
        where
            $key: Eq + Hash,
        {
            #[inline]
            fn from_iter<I: IntoIterator<Item = $item>>(iter: I) -> Self {
                Self(<$inner>::from_iter(iter))
            }
        }

        impl<$($param),+> Extend<$item> for $name<$($param),+>
        where
            $key: Eq + Hash,
        {
            #[inline]
            fn extend<I: IntoIterator<Item = $item>>(&mut self, iter: I) {
                self.0.extend(iter)
            }
        }

        impl<$($param),+> IntoIterator for $name<$($param),+>
        where
            $key: Eq + Hash,
        {
            type Item = $item;
            type IntoIter = <$inner as IntoIterator>::IntoIter;

            #[inline]
            fn into_iter(self) -> Self::IntoIter {
                self.0.into_iter()
            }
        }

        impl<$lt, $($param),+> IntoIterator for &$lt $name<$($param),+>
        where
            $key: Eq + Hash,
        {
            type Item = $ref_item;
            type IntoIter = <&$lt $inner as IntoIterator>::IntoIter;

            #[inline]
            fn into_iter(self) -> Self::IntoIter {
                self.0.iter()
            }
        }
    };
}

impl_collection!(Map<K, V>, InnerMap<K, V>, (K, V), (&'a K, &'a V), 'a, K);
impl_collection!(Set<T>, InnerSet<T>, T, &'a T, 'a, T);
