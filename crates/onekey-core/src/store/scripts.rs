//! The fixed catalogue of atomic scripts.
//!
//! Each script exists twice: as Lua (run server-side by Redis) and as a
//! Rust equivalent in the local backend. The two must stay equivalent in
//! every observable outcome, including the exact string formats written
//! back to the store.
//!
//! Key conventions:
//!
//! - `RateLimitCheck`: KEYS\[1\] = bucket; ARGV = rate, burst, now.
//!   Returns `[allowed, used]`.
//! - Circuit-breaker scripts: KEYS = state, failures, success,
//!   last_failure, half_open_count (in that order); see each script for
//!   ARGV. Record scripts return `[prev_state, new_state]` so the caller
//!   can log transitions.

/// Identifier for one script in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// Token-bucket admission. ARGV: rate, burst, now.
    RateLimitCheck,
    /// Breaker admission, including the OPEN→HALF_OPEN probe transition.
    /// ARGV: timeout_seconds, half_open_requests, now.
    CbAllow,
    /// Record a successful outcome. ARGV: success_threshold.
    CbRecordSuccess,
    /// Record a failed outcome. ARGV: failure_threshold, now.
    CbRecordFailure,
    /// Release a half-open probe slot; no-op unless state is half_open
    /// with a positive count. No ARGV.
    CbReleaseHalfOpen,
}

impl Script {
    pub const fn name(self) -> &'static str {
        match self {
            Self::RateLimitCheck => "rate_limit_check",
            Self::CbAllow => "cb_allow",
            Self::CbRecordSuccess => "cb_record_success",
            Self::CbRecordFailure => "cb_record_failure",
            Self::CbReleaseHalfOpen => "cb_release_half_open",
        }
    }

    /// Lua source executed by the Redis backend.
    pub const fn lua(self) -> &'static str {
        match self {
            Self::RateLimitCheck => RATE_LIMIT_CHECK_LUA,
            Self::CbAllow => CB_ALLOW_LUA,
            Self::CbRecordSuccess => CB_RECORD_SUCCESS_LUA,
            Self::CbRecordFailure => CB_RECORD_FAILURE_LUA,
            Self::CbReleaseHalfOpen => CB_RELEASE_HALF_OPEN_LUA,
        }
    }
}

/// Idle buckets expire after this many seconds and re-materialize full.
pub const BUCKET_IDLE_TTL_SECS: u64 = 60;

const RATE_LIMIT_CHECK_LUA: &str = r#"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local tokens = burst
local last = now
local state = redis.call('GET', KEYS[1])
if state then
  local sep = string.find(state, ':')
  tokens = tonumber(string.sub(state, 1, sep - 1))
  last = tonumber(string.sub(state, sep + 1))
end
local elapsed = now - last
if elapsed < 0 then elapsed = 0 end
tokens = tokens + elapsed * rate
if tokens > burst then tokens = burst end
if tokens >= 1 then
  tokens = tokens - 1
  redis.call('SETEX', KEYS[1], 60, string.format('%.6f:%.6f', tokens, now))
  return {'1', string.format('%.6f', burst - tokens)}
end
return {'0', string.format('%.6f', burst)}
"#;

const CB_ALLOW_LUA: &str = r#"
local state = redis.call('GET', KEYS[1])
if not state then state = 'closed' end
if state == 'closed' then
  return {'1', 'closed'}
end
if state == 'open' then
  local last = tonumber(redis.call('GET', KEYS[4]) or '0')
  local timeout = tonumber(ARGV[1])
  local now = tonumber(ARGV[3])
  if now - last > timeout then
    redis.call('SET', KEYS[1], 'half_open')
    redis.call('SET', KEYS[3], '0')
    redis.call('SET', KEYS[5], '0')
    return {'1', 'half_open'}
  end
  return {'0', 'open'}
end
local inflight = tonumber(redis.call('GET', KEYS[5]) or '0')
local max = tonumber(ARGV[2])
if inflight < max then
  redis.call('SET', KEYS[5], tostring(inflight + 1))
  return {'1', 'half_open'}
end
return {'0', 'half_open'}
"#;

const CB_RECORD_SUCCESS_LUA: &str = r#"
local state = redis.call('GET', KEYS[1])
if not state then state = 'closed' end
if state == 'closed' then
  redis.call('SET', KEYS[2], '0')
  return {'closed', 'closed'}
end
if state == 'half_open' then
  local succ = tonumber(redis.call('GET', KEYS[3]) or '0') + 1
  if succ >= tonumber(ARGV[1]) then
    redis.call('SET', KEYS[1], 'closed')
    redis.call('SET', KEYS[2], '0')
    redis.call('SET', KEYS[3], '0')
    redis.call('SET', KEYS[5], '0')
    return {'half_open', 'closed'}
  end
  redis.call('SET', KEYS[3], tostring(succ))
  return {'half_open', 'half_open'}
end
return {'open', 'open'}
"#;

const CB_RECORD_FAILURE_LUA: &str = r#"
local state = redis.call('GET', KEYS[1])
if not state then state = 'closed' end
if state == 'half_open' then
  redis.call('SET', KEYS[1], 'open')
  redis.call('SET', KEYS[4], ARGV[2])
  redis.call('SET', KEYS[5], '0')
  return {'half_open', 'open'}
end
if state == 'closed' then
  local fails = tonumber(redis.call('GET', KEYS[2]) or '0') + 1
  redis.call('SET', KEYS[2], tostring(fails))
  if fails >= tonumber(ARGV[1]) then
    redis.call('SET', KEYS[1], 'open')
    redis.call('SET', KEYS[4], ARGV[2])
    return {'closed', 'open'}
  end
  return {'closed', 'closed'}
end
return {'open', 'open'}
"#;

const CB_RELEASE_HALF_OPEN_LUA: &str = r#"
local state = redis.call('GET', KEYS[1])
if not state then state = 'closed' end
if state == 'half_open' then
  local count = tonumber(redis.call('GET', KEYS[5]) or '0')
  if count > 0 then
    redis.call('SET', KEYS[5], tostring(count - 1))
  end
end
return {state}
"#;
