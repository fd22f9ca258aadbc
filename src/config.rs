use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// Per-call behavior switches. Passed to every routine as its `flags`
    /// argument and mirrored into the execution context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Options: u64 {
        /// Emit map entries in ascending key order.
        const SORT_MAP_KEYS = 1 << 0;
        /// Escape `<`, `>` and `&` as `\u003c`-style sequences.
        const ESCAPE_HTML = 1 << 1;
        /// Reject invalid UTF-8 in decoded strings instead of replacing it.
        const VALIDATE_STRING = 1 << 2;
        /// Unknown object keys are a fatal error instead of being skipped.
        const DISALLOW_UNKNOWN_FIELDS = 1 << 3;
        /// Field names match exactly; no case-insensitive fallback.
        const CASE_SENSITIVE = 1 << 4;
        /// The first type mismatch aborts decoding.
        const STOP_ON_MISMATCH = 1 << 5;
    }
}

/// What a decode does when a JSON value does not fit its target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Skip the offending value, keep going, and report the first mismatch.
    #[default]
    SkipAndRecordFirst,
    /// Abort on the first mismatch.
    Fail,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub options: Options,
    pub mismatch: MismatchPolicy,
    /// Dynamic recursion limit; also bounds the recursion stack's frame count.
    pub max_depth: usize,
    /// Frames reserved up front in every recursion stack.
    pub initial_stack_frames: usize,
    /// Nesting level past which the planner stops inlining and emits a recursive call.
    pub max_inline_depth: usize,
    /// Upper bound on instructions in one program.
    pub max_program_len: usize,
    /// Initial output buffer capacity for encoding.
    pub initial_buffer: usize,
    /// Largest output buffer encoding may grow to.
    pub max_buffer: usize,
    /// Free buffers kept per size class.
    pub pool_max_retained: usize,
    /// Cached routines kept before least-recently-used eviction. `0` disables the bound.
    pub cache_max_entries: usize,
    /// Age after which a cached routine is swept. `None` keeps entries forever.
    pub cache_ttl: Option<Duration>,
    /// How often the background sweeper runs. `None` disables the thread.
    pub sweep_interval: Option<Duration>,
    /// Number of independently locked cache shards.
    pub cache_shards: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            options: Options::VALIDATE_STRING,
            mismatch: MismatchPolicy::default(),
            max_depth: 1024,
            initial_stack_frames: 64,
            max_inline_depth: 8,
            max_program_len: 1 << 16,
            initial_buffer: 1024,
            max_buffer: 1 << 30,
            pool_max_retained: 16,
            cache_max_entries: 4096,
            cache_ttl: None,
            sweep_interval: None,
            cache_shards: 16,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Defaults overridden by `JITSON_*` environment variables.
    ///
    /// Recognized: `JITSON_MAX_DEPTH`, `JITSON_MAX_INLINE_DEPTH`,
    /// `JITSON_CACHE_MAX_ENTRIES`, `JITSON_CACHE_TTL_SECS`,
    /// `JITSON_SWEEP_INTERVAL_SECS`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(v) = env_usize("JITSON_MAX_DEPTH") {
            config.max_depth = v;
        }
        if let Some(v) = env_usize("JITSON_MAX_INLINE_DEPTH") {
            config.max_inline_depth = v;
        }
        if let Some(v) = env_usize("JITSON_CACHE_MAX_ENTRIES") {
            config.cache_max_entries = v;
        }
        if let Some(v) = env_usize("JITSON_CACHE_TTL_SECS") {
            config.cache_ttl = Some(Duration::from_secs(v as u64));
        }
        if let Some(v) = env_usize("JITSON_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Some(Duration::from_secs(v as u64));
        }
        config
    }

    /// Options in effect for a call, with the mismatch policy folded in.
    pub fn effective_options(&self) -> Options {
        match self.mismatch {
            MismatchPolicy::SkipAndRecordFirst => self.options,
            MismatchPolicy::Fail => self.options | Options::STOP_ON_MISMATCH,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn options(mut self, options: Options) -> Self {
        self.config.options = options;
        self
    }

    pub fn mismatch(mut self, policy: MismatchPolicy) -> Self {
        self.config.mismatch = policy;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth.max(1);
        self
    }

    pub fn initial_stack_frames(mut self, frames: usize) -> Self {
        self.config.initial_stack_frames = frames;
        self
    }

    pub fn max_inline_depth(mut self, depth: usize) -> Self {
        self.config.max_inline_depth = depth;
        self
    }

    pub fn max_program_len(mut self, len: usize) -> Self {
        self.config.max_program_len = len;
        self
    }

    pub fn initial_buffer(mut self, bytes: usize) -> Self {
        self.config.initial_buffer = bytes.max(16);
        self
    }

    pub fn max_buffer(mut self, bytes: usize) -> Self {
        self.config.max_buffer = bytes;
        self
    }

    pub fn pool_max_retained(mut self, n: usize) -> Self {
        self.config.pool_max_retained = n;
        self
    }

    pub fn cache_max_entries(mut self, n: usize) -> Self {
        self.config.cache_max_entries = n;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = Some(ttl);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = Some(interval);
        self
    }

    pub fn cache_shards(mut self, n: usize) -> Self {
        self.config.cache_shards = n.max(1);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
