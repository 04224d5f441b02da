//! Mapper functions and their lifecycle.
//!
//! A [`DoFn`] is the unit of per-element work carried by a `ParallelDo` node.
//! It is type-erased: elements cross it as boxed [`Item`]s and the broadcast
//! environment arrives as a shared [`Env`]. Typed adapters ([`MapFn`],
//! [`FlatMapFn`], [`FilterFn`], [`IdentityFn`]) build `DoFn`s from plain
//! closures, downcasting at the boundary.
//!
//! The lifecycle is `setup` once per input split, `process` per element, then
//! `cleanup` once. [`ComposedFn`] implements ParallelDo fusion: the upstream
//! function emits into an emitter that drives the downstream function, and
//! cleanup drains the upstream through the downstream before closing it.

use crate::wire::{Env, Item};
use std::marker::PhantomData;
use std::sync::Arc;

/// Receives the zero-or-more outputs of a [`DoFn`].
pub trait Emitter {
    /// Emit one output element.
    fn emit(&mut self, item: Item);
}

/// Per-element mapper logic with a `setup`/`process`/`cleanup` lifecycle.
///
/// Implementations must be stateless across elements (any per-split state
/// belongs in the environment or in values threaded through `process`), so a
/// single `DoFn` can be shared by concurrent mappers over different splits.
pub trait DoFn: Send + Sync {
    /// Called once before the first element of an input split.
    fn setup(&self, _env: &Env) {}

    /// Called for each input element; outputs go to `out`.
    fn process(&self, env: &Env, item: Item, out: &mut dyn Emitter);

    /// Called once after the last element of an input split.
    fn cleanup(&self, _env: &Env, _out: &mut dyn Emitter) {}
}

/// Collects emitted items into a vector. The workhorse emitter of the
/// in-process runtime and the reference interpreter.
#[derive(Default)]
pub struct VecEmitter(pub Vec<Item>);

impl Emitter for VecEmitter {
    fn emit(&mut self, item: Item) {
        self.0.push(item);
    }
}

// |----------------|
// | Typed adapters |
// |----------------|

/// One-to-one element transformation, ignoring the environment.
pub struct MapFn<I, O, F>(pub F, pub PhantomData<(I, O)>);

impl<I, O, F> MapFn<I, O, F>
where
    F: Fn(&I) -> O,
{
    pub fn new(f: F) -> Self {
        Self(f, PhantomData)
    }
}

impl<I, O, F> DoFn for MapFn<I, O, F>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Send + Sync + Fn(&I) -> O + 'static,
{
    fn process(&self, _env: &Env, item: Item, out: &mut dyn Emitter) {
        let i = item.downcast::<I>().expect("MapFn input type");
        out.emit(Box::new(self.0(&i)));
    }
}

/// One-to-many expansion, ignoring the environment.
pub struct FlatMapFn<I, O, F>(pub F, pub PhantomData<(I, O)>);

impl<I, O, F> FlatMapFn<I, O, F>
where
    F: Fn(&I) -> Vec<O>,
{
    pub fn new(f: F) -> Self {
        Self(f, PhantomData)
    }
}

impl<I, O, F> DoFn for FlatMapFn<I, O, F>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Send + Sync + Fn(&I) -> Vec<O> + 'static,
{
    fn process(&self, _env: &Env, item: Item, out: &mut dyn Emitter) {
        let i = item.downcast::<I>().expect("FlatMapFn input type");
        for o in self.0(&i) {
            out.emit(Box::new(o));
        }
    }
}

/// Element selection by predicate.
pub struct FilterFn<T, P>(pub P, pub PhantomData<T>);

impl<T, P> FilterFn<T, P>
where
    P: Fn(&T) -> bool,
{
    pub fn new(pred: P) -> Self {
        Self(pred, PhantomData)
    }
}

impl<T, P> DoFn for FilterFn<T, P>
where
    T: Send + Sync + 'static,
    P: Send + Sync + Fn(&T) -> bool + 'static,
{
    fn process(&self, _env: &Env, item: Item, out: &mut dyn Emitter) {
        let t = item.downcast::<T>().expect("FilterFn input type");
        if self.0(&t) {
            out.emit(t);
        }
    }
}

/// Environment-aware one-to-one transformation: the closure also receives the
/// typed broadcast value.
pub struct MapWithEnvFn<I, E, O, F>(pub F, pub PhantomData<(I, E, O)>);

impl<I, E, O, F> MapWithEnvFn<I, E, O, F>
where
    F: Fn(&I, &E) -> O,
{
    pub fn new(f: F) -> Self {
        Self(f, PhantomData)
    }
}

impl<I, E, O, F> DoFn for MapWithEnvFn<I, E, O, F>
where
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Send + Sync + Fn(&I, &E) -> O + 'static,
{
    fn process(&self, env: &Env, item: Item, out: &mut dyn Emitter) {
        let i = item.downcast::<I>().expect("MapWithEnvFn input type");
        let e = env.downcast_ref::<E>().expect("MapWithEnvFn environment type");
        out.emit(Box::new(self.0(&i, e)));
    }
}

/// Pass-through mapper. Inserted by the optimiser before a `GroupByKey` whose
/// input carries no mapper-side logic, so every shuffle has a map phase.
pub struct IdentityFn;

impl DoFn for IdentityFn {
    fn process(&self, _env: &Env, item: Item, out: &mut dyn Emitter) {
        out.emit(item);
    }
}

// |--------|
// | Fusion |
// |--------|

/// Pair two environments into the environment of a fused `ParallelDo`.
///
/// The fused node's `Op` environment applies this to the two upstream values.
pub fn pair_envs(a: &Env, b: &Env) -> Env {
    Arc::new((a.clone(), b.clone())) as Env
}

fn split_env_pair(env: &Env) -> &(Env, Env) {
    env.downcast_ref::<(Env, Env)>()
        .expect("fused DoFn: environment is not a pair")
}

/// Forwards the upstream function's output into the downstream function.
struct ChainEmitter<'a> {
    g: &'a dyn DoFn,
    env: &'a Env,
    out: &'a mut dyn Emitter,
}

impl Emitter for ChainEmitter<'_> {
    fn emit(&mut self, item: Item) {
        self.g.process(self.env, item, self.out);
    }
}

/// The composition `g ∘ f` of two fused `ParallelDo` functions.
///
/// Its environment is the pair of the two fused environments. The lifecycle
/// forwards faithfully: `f.setup` then `g.setup`; `f.process` emits into a
/// bridge emitter that invokes `g.process`; cleanup drains `f` through `g`,
/// then cleans `g`.
pub struct ComposedFn {
    pub f: Arc<dyn DoFn>,
    pub g: Arc<dyn DoFn>,
}

impl DoFn for ComposedFn {
    fn setup(&self, env: &Env) {
        let (ef, eg) = split_env_pair(env);
        self.f.setup(ef);
        self.g.setup(eg);
    }

    fn process(&self, env: &Env, item: Item, out: &mut dyn Emitter) {
        let (ef, eg) = split_env_pair(env);
        let mut chain = ChainEmitter {
            g: self.g.as_ref(),
            env: eg,
            out,
        };
        self.f.process(ef, item, &mut chain);
    }

    fn cleanup(&self, env: &Env, out: &mut dyn Emitter) {
        let (ef, eg) = split_env_pair(env);
        {
            let mut chain = ChainEmitter {
                g: self.g.as_ref(),
                env: eg,
                out,
            };
            self.f.cleanup(ef, &mut chain);
        }
        self.g.cleanup(eg, out);
    }
}

/// The unit environment carried by `ParallelDo`s that take no broadcast value.
pub fn unit_env() -> Env {
    Arc::new(()) as Env
}
