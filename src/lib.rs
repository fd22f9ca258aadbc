//! Type-specialized JSON encoding and decoding through generated machine code.
//!
//! Types describe themselves by deriving [`Facet`]. The first time a type is
//! encoded or decoded, [`plan`] turns its [`Shape`] into an
//! [`ir::Program`], [`codegen`] lowers that program to native code, and the
//! resulting [`CompiledRoutine`](routine::CompiledRoutine) is cached by
//! [`Engine`]. Later calls jump straight into the cached routine.
//!
//! ```ignore
//! #[derive(facet::Facet, Default)]
//! struct User {
//!     name: String,
//!     #[facet(jitson::omit_empty)]
//!     age: u32,
//! }
//!
//! let json = jitson::encode(&User { name: "Alice".into(), age: 30 })?;
//! assert_eq!(json, br#"{"name":"Alice","age":30}"#);
//! let user: User = jitson::decode(&json)?;
//! ```

use std::sync::{Arc, LazyLock};

// Field attributes, written `#[facet(jitson::omit_empty)]`.
facet::define_attr_grammar! {
    ns "jitson";
    crate_path ::jitson;

    /// Field attributes understood by the planner.
    pub enum Attr {
        /// Leave the field out of the output when it is zero or empty.
        OmitEmpty,
        /// Wrap a bool or number in a JSON string.
        Quoted,
    }
}

pub mod arch;
pub mod cache;
pub mod codegen;
pub mod config;
pub mod context;
pub mod error;
pub mod intrinsics;
pub mod ir;
pub mod plan;
pub mod pool;
pub mod routine;
pub mod scan;
pub mod shape;
pub mod stack;
pub mod value;

pub use cache::CacheStats;
pub use config::{Config, MismatchPolicy, Options};
pub use context::{ErrorCode, ErrorKind};
pub use error::{CompileError, DecodeError, Decoded, EncodeError, Error};
pub use shape::{Facet, Shape};
pub use value::{AnyValue, Bytes, Number, Value};

use cache::{CompilationCache, Sweeper};
use context::{DecodeContext, EncodeContext};
use ir::Direction;
use pool::{MemoryPool, PoolStats};
use routine::CompiledRoutine;
use shape::ShapeKey;
use stack::RecursionStack;

struct Shared {
    config: Config,
    pool: Arc<MemoryPool>,
    cache: Arc<CompilationCache>,
    _sweeper: Option<Sweeper>,
}

/// Compiles, caches, and runs routines. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let pool = MemoryPool::new(config.pool_max_retained);
        let cache = Arc::new(CompilationCache::new(
            config.cache_shards,
            config.cache_max_entries,
            config.cache_ttl,
        ));
        let sweeper = config
            .sweep_interval
            .and_then(|interval| match cache.start_sweeper(interval) {
                Ok(sweeper) => Some(sweeper),
                Err(e) => {
                    tracing::warn!(error = %e, "could not start cache sweeper; entries are only evicted on insert");
                    None
                }
            });
        Engine {
            shared: Arc::new(Shared {
                config,
                pool,
                cache,
                _sweeper: sweeper,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.shared.pool
    }

    pub fn cache(&self) -> &CompilationCache {
        &self.shared.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// The routine for `shape` in `direction`, compiling it on first use.
    pub fn routine(&self, shape: &'static Shape, direction: Direction) -> Result<Arc<CompiledRoutine>, CompileError> {
        let shared = &self.shared;
        shared.cache.get_or_compile(ShapeKey::new(shape), direction, || {
            CompiledRoutine::compile(shape, direction, &shared.config, &shared.pool)
        })
    }

    fn new_stack(&self) -> RecursionStack {
        let config = &self.shared.config;
        RecursionStack::new(config.initial_stack_frames, config.max_depth.saturating_mul(4))
    }

    pub fn encode<T: Facet<'static>>(&self, value: &T) -> Result<Vec<u8>, Error> {
        self.encode_with(value, self.shared.config.effective_options())
    }

    pub fn encode_with<T: Facet<'static>>(&self, value: &T, options: Options) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.encode_raw(T::SHAPE, value as *const T as *const u8, options, &mut out)?;
        Ok(out)
    }

    /// Append the encoding of `value` to `out`. On error `out` is unchanged.
    pub fn encode_into<T: Facet<'static>>(&self, value: &T, out: &mut Vec<u8>) -> Result<(), Error> {
        self.encode_raw(
            T::SHAPE,
            value as *const T as *const u8,
            self.shared.config.effective_options(),
            out,
        )
    }

    fn encode_raw(&self, shape: &'static Shape, src: *const u8, options: Options, out: &mut Vec<u8>) -> Result<(), Error> {
        let routine = self.routine(shape, Direction::Encode)?;
        let mut ctx = EncodeContext::new(self, options)?;
        let mut stack = self.new_stack();
        // SAFETY: `src` points to a live value whose shape is `shape`, and the
        // routine was compiled for that shape.
        unsafe { routine.run_encode(&mut ctx, src, &mut stack) };
        if let Some(e) = ctx.take_error() {
            tracing::debug!(shape = shape.type_identifier, code = %e.code, "encode failed");
            return Err(e.into());
        }
        let buf = ctx.into_buf();
        out.extend_from_slice(buf.as_slice());
        Ok(())
    }

    /// Decode `input` into a fresh `T`. A value that does not fit its target
    /// type is reported as an error.
    pub fn decode<T: Facet<'static> + Default>(&self, input: &[u8]) -> Result<T, Error> {
        self.decode_with(input, self.shared.config.effective_options())
    }

    pub fn decode_with<T: Facet<'static> + Default>(&self, input: &[u8], options: Options) -> Result<T, Error> {
        let decoded = self.decode_report_with::<T>(input, options)?;
        match decoded.mismatch {
            Some(mismatch) => Err(mismatch.into()),
            None => Ok(decoded.value),
        }
    }

    /// Decode `input`, skipping values that do not fit their target type.
    /// The first such value is returned alongside the result.
    pub fn decode_with_report<T: Facet<'static> + Default>(&self, input: &[u8]) -> Result<Decoded<T>, Error> {
        self.decode_report_with(input, self.shared.config.effective_options())
    }

    fn decode_report_with<T: Facet<'static> + Default>(&self, input: &[u8], options: Options) -> Result<Decoded<T>, Error> {
        let mut value = T::default();
        let mismatch = self.decode_raw(T::SHAPE, &mut value as *mut T as *mut u8, input, options)?;
        Ok(Decoded { value, mismatch })
    }

    /// Decode `input` over an existing value. Fields absent from the input
    /// keep their current contents.
    pub fn decode_into<T: Facet<'static>>(&self, input: &[u8], dst: &mut T) -> Result<(), Error> {
        let options = self.shared.config.effective_options();
        match self.decode_raw(T::SHAPE, dst as *mut T as *mut u8, input, options)? {
            Some(mismatch) => Err(mismatch.into()),
            None => Ok(()),
        }
    }

    fn decode_raw(
        &self,
        shape: &'static Shape,
        dst: *mut u8,
        input: &[u8],
        options: Options,
    ) -> Result<Option<DecodeError>, Error> {
        let routine = self.routine(shape, Direction::Decode)?;
        let mut ctx = DecodeContext::new(self, input, options);
        let mut stack = self.new_stack();
        // SAFETY: `dst` is an exclusively borrowed, initialized value whose
        // shape is `shape`.
        unsafe { routine.run_decode(&mut ctx, dst, &mut stack) };
        if let Some(e) = ctx.take_error() {
            tracing::debug!(shape = shape.type_identifier, code = %e.code, offset = e.offset, "decode failed");
            return Err(e.into());
        }
        let rest = ctx.rest();
        if let Some(pos) = rest.iter().position(|&b| !scan::is_ws(b)) {
            return Err(DecodeError {
                code: ErrorCode::TrailingCharacters,
                offset: ctx.offset() + pos,
                shape: None,
                field: None,
            }
            .into());
        }
        Ok(ctx.mismatch.take())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(Config::default())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .field("cache", &self.shared.cache.stats())
            .finish()
    }
}

static DEFAULT_ENGINE: LazyLock<Engine> = LazyLock::new(|| Engine::new(Config::from_env()));

/// The process-wide engine used by [`encode`] and [`decode`], configured from
/// `JITSON_*` environment variables on first use.
pub fn default_engine() -> &'static Engine {
    &DEFAULT_ENGINE
}

pub fn encode<T: Facet<'static>>(value: &T) -> Result<Vec<u8>, Error> {
    default_engine().encode(value)
}

pub fn decode<T: Facet<'static> + Default>(input: &[u8]) -> Result<T, Error> {
    default_engine().decode(input)
}

#[cfg(all(test, any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64")))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Default, PartialEq, Facet)]
    struct Friend {
        age: u32,
        name: String,
    }

    #[test]
    fn flat_struct() {
        let engine = Engine::default();
        let json = engine
            .encode(&Friend {
                age: 42,
                name: "Alice".into(),
            })
            .unwrap();
        assert_eq!(json, br#"{"age":42,"name":"Alice"}"#);

        let friend: Friend = engine.decode(br#" { "name" : "Bob", "age" : 7 } "#).unwrap();
        assert_eq!(
            friend,
            Friend {
                age: 7,
                name: "Bob".into()
            }
        );
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let engine = Engine::default();
        let err = engine.decode::<u32>(b"12 x").unwrap_err();
        assert_eq!(
            err,
            Error::Decode(DecodeError {
                code: ErrorCode::TrailingCharacters,
                offset: 3,
                shape: None,
                field: None,
            })
        );
    }

    #[test]
    fn decode_into_keeps_absent_fields() {
        let engine = Engine::default();
        let mut friend = Friend {
            age: 1,
            name: "Carol".into(),
        };
        engine.decode_into(br#"{"age":2}"#, &mut friend).unwrap();
        assert_eq!(friend.age, 2);
        assert_eq!(friend.name, "Carol");
    }

    #[test]
    fn encode_into_appends() {
        let engine = Engine::default();
        let mut out = b"x=".to_vec();
        engine.encode_into(&vec![1u8, 2], &mut out).unwrap();
        assert_eq!(out, b"x=[1,2]");
    }

    #[test]
    fn maps_sort_when_asked() {
        let engine = Engine::default();
        let map: HashMap<String, u8> = [("b", 2), ("a", 1), ("c", 3)]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        let json = engine.encode_with(&map, Options::SORT_MAP_KEYS).unwrap();
        assert_eq!(json, br#"{"a":1,"b":2,"c":3}"#);
    }

    #[test]
    fn routines_are_cached_per_direction() {
        let engine = Engine::default();
        let a = engine.routine(Friend::SHAPE, Direction::Encode).unwrap();
        let b = engine.routine(Friend::SHAPE, Direction::Encode).unwrap();
        let c = engine.routine(Friend::SHAPE, Direction::Decode).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(engine.cache_stats().compilations, 2);
    }

    #[test]
    fn default_engine_round_trips() {
        let json = encode(&Some(3.5f64)).unwrap();
        assert_eq!(json, b"3.5");
        assert_eq!(decode::<Option<f64>>(&json).unwrap(), Some(3.5));
        assert_eq!(decode::<Option<f64>>(b"null").unwrap(), None);
    }
}
