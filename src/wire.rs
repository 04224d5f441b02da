//! Type tags and type-erased element helpers: the per-node serialiser descriptor.
//!
//! This module provides:
//! - [`TypeTag`]: a lightweight runtime type identifier used by the planner and
//!   executor to assert element types across node boundaries without carrying
//!   generic types.
//! - [`ElementOps`]: a type-erased interface for the `Vec<T>` operations the
//!   executor needs at shuffle and bridge boundaries (length, splitting,
//!   cloning, concatenation, per-element access). Concrete implementations are
//!   produced via [`wire_format_for`].
//! - [`WireFormat`]: the pair of the two, attached to every node's output.
//!
//! The executor relies on `ElementOps` to move partitions between jobs without
//! knowing `T` at compile time. Splitting creates per-partition chunks for
//! parallel mapper execution; exploding/imploding crosses the per-element
//! `DoFn` boundary. All operations return `None` if the dynamic type does not
//! match the expected `Vec<T>`.

use std::any::{type_name, Any, TypeId};
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

/// A partition buffer carried between nodes at runtime.
///
/// The execution engine materialises intermediate results as opaque,
/// type-erased partitions. Nodes downcast these to the expected type
/// (e.g., `Vec<T>`) when applying their work.
pub type Partition = Box<dyn Any + Send + Sync>;

/// A single type-erased element, as seen by a `DoFn`.
pub type Item = Box<dyn Any + Send + Sync>;

/// A shared scalar value: the payload of an `Exp`-shaped node, typically a
/// small broadcast value handed to mappers as their environment.
pub type Env = Arc<dyn Any + Send + Sync>;

/// A lightweight runtime type tag for debugging and assertions.
///
/// `TypeTag` carries the `TypeId` and a readable type name. It is attached to
/// every node's output so the planner can reason about element types without
/// a generic parameter.
///
/// ```ignore
/// use scoobi::wire::TypeTag;
/// let tag = TypeTag::of::<u32>();
/// assert_eq!(tag.name, "u32");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeTag {
    /// Stable Rust type identifier.
    pub id: TypeId,
    /// Human-readable type name (best-effort).
    pub name: &'static str,
}

impl TypeTag {
    /// Construct a tag for `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

/// Type-erased helpers for `Vec<T>`.
///
/// The executor uses `ElementOps` to:
/// - compute the logical size of a partition (`len`, `approx_bytes`)
/// - split a partition into `n` chunks for parallel mappers (`split`)
/// - clone a partition when its output fans out to several consumers
///   (`clone_any`)
/// - merge partitions coming out of a shuffle or flatten (`concat`)
/// - cross the per-element `DoFn` boundary (`explode`, `implode`)
///
/// Implementations must return `None` when the provided data does not match
/// the concrete `Vec<T>` the implementor expects.
pub trait ElementOps: Send + Sync {
    /// Return the number of elements if `data` is a `Vec<T>`, otherwise `None`.
    fn len(&self, data: &dyn Any) -> Option<usize>;

    /// Rough in-memory byte size of the partition, used only by the
    /// reducer-count heuristic. `None` when the type does not match.
    fn approx_bytes(&self, data: &dyn Any) -> Option<u64>;

    /// Split `data` (a `Vec<T>`) into up to `n` contiguous partitions.
    ///
    /// Implementations should:
    /// - gracefully handle `n <= 1` or very small inputs by returning a single chunk
    /// - preserve element order within each returned chunk
    fn split(&self, data: &dyn Any, n: usize) -> Option<Vec<Partition>>;

    /// Clone the entire `Vec<T>` behind `data` and return it boxed as a [`Partition`].
    fn clone_any(&self, data: &dyn Any) -> Option<Partition>;

    /// Concatenate partitions (each a `Vec<T>`) into one, in the given order.
    fn concat(&self, parts: Vec<Partition>) -> Option<Partition>;

    /// Turn a partition into individually boxed elements, preserving order.
    fn explode(&self, data: Partition) -> Option<Vec<Item>>;

    /// Rebuild a partition from individually boxed elements.
    fn implode(&self, items: Vec<Item>) -> Option<Partition>;
}

/// Concrete `ElementOps` for a specific `T`.
///
/// This wraps a phantom type to bind the implementation to `T` while remaining
/// type-erased via the `ElementOps` trait object at call sites.
struct ElementOpsImpl<T: Clone + Send + Sync + 'static>(PhantomData<T>);

impl<T: Clone + Send + Sync + 'static> ElementOps for ElementOpsImpl<T> {
    fn len(&self, data: &dyn Any) -> Option<usize> {
        data.downcast_ref::<Vec<T>>().map(|v| v.len())
    }

    fn approx_bytes(&self, data: &dyn Any) -> Option<u64> {
        data.downcast_ref::<Vec<T>>()
            .map(|v| (v.len() * mem::size_of::<T>()) as u64)
    }

    fn split(&self, data: &dyn Any, n: usize) -> Option<Vec<Partition>> {
        let v = data.downcast_ref::<Vec<T>>()?;
        let len = v.len();

        // Degenerate cases: one chunk is fine.
        if n <= 1 || len <= 1 {
            return Some(vec![Box::new(v.clone())]);
        }

        // Contiguous chunks of ~len/n each (last chunk may be shorter).
        let chunk = len.div_ceil(n);
        let parts = v
            .chunks(chunk)
            .map(|c| Box::new(c.to_vec()) as Partition)
            .collect();
        Some(parts)
    }

    fn clone_any(&self, data: &dyn Any) -> Option<Partition> {
        data.downcast_ref::<Vec<T>>()
            .map(|v| Box::new(v.clone()) as Partition)
    }

    fn concat(&self, parts: Vec<Partition>) -> Option<Partition> {
        let mut out = Vec::<T>::new();
        for p in parts {
            let v = p.downcast::<Vec<T>>().ok()?;
            out.extend(*v);
        }
        Some(Box::new(out))
    }

    fn explode(&self, data: Partition) -> Option<Vec<Item>> {
        let v = data.downcast::<Vec<T>>().ok()?;
        Some(v.into_iter().map(|t| Box::new(t) as Item).collect())
    }

    fn implode(&self, items: Vec<Item>) -> Option<Partition> {
        let mut out = Vec::<T>::with_capacity(items.len());
        for it in items {
            out.push(*it.downcast::<T>().ok()?);
        }
        Some(Box::new(out))
    }
}

/// The serialiser descriptor attached to every node's output: a runtime type
/// tag plus the type-erased element operations for that element type.
///
/// The planner treats it as an opaque token; the executor uses it at shuffle
/// and bridge boundaries.
#[derive(Clone)]
pub struct WireFormat {
    /// Tag of the element type `T` (not of `Vec<T>`).
    pub tag: TypeTag,
    /// Type-erased `Vec<T>` operations.
    pub ops: Arc<dyn ElementOps>,
}

impl WireFormat {
    /// Construct the wire format for element type `T`.
    pub fn of<T: Clone + Send + Sync + 'static>() -> Self {
        Self {
            tag: TypeTag::of::<T>(),
            ops: Arc::new(ElementOpsImpl::<T>(PhantomData)),
        }
    }
}

impl std::fmt::Debug for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WireFormat({})", self.tag.name)
    }
}

/// Create a type-erased [`WireFormat`] for element type `T`.
///
/// ```ignore
/// use scoobi::wire::wire_format_for;
/// use std::any::Any;
///
/// let wire = wire_format_for::<i64>();
/// let data: Box<dyn Any + Send + Sync> = Box::new(vec![1i64, 2, 3]);
/// assert_eq!(wire.ops.len(data.as_ref()), Some(3));
/// ```
pub fn wire_format_for<T: Clone + Send + Sync + 'static>() -> WireFormat {
    WireFormat::of::<T>()
}
