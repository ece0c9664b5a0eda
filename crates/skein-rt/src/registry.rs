//! `ScriptContext` and the callback table indexed by message `type_id`.
//!
//! Grounded on `worker.c`'s four reserved stack slots
//! (`STK_TRACEBACK`/`STK_ERROR_TABLE`/`STK_CALLBACK_TABLE`/
//! `STK_DISPATCH_WAKEUP`) and its `new_callback_table`/
//! `worker_callback_table` registry. The interpreter itself is out of
//! scope, so the four slots become four methods an embedding
//! application implements on its own context type; the
//! `CallbackRegistry` stays exactly what the original's table already
//! is — a dense `type_id -> handler` lookup, translated from a
//! Lua-registry-keyed table to a plain `Vec<Option<Callback>>` since
//! `message_register` already hands out a dense small-integer id space.

use crate::bus::Message;

/// The embedding application's hook into its own scripting state.
/// `skein-rt` never constructs or inspects one of these beyond calling
/// these four methods — everything about the interpreter lives on the
/// other side of the trait object.
pub trait ScriptContext: Send {
    /// Invoke the callback registered for `type_id` with this message's
    /// payload. Implementations are expected to look the callback up
    /// themselves (the original's `STK_CALLBACK_TABLE` slot) and push
    /// the message's fields as call arguments (the original's
    /// `unpack(L, sm)`). Returns `Err` with a formatted traceback if the
    /// call raised/panicked on the script side — the original's
    /// `STK_TRACEBACK` protected call.
    fn call(&mut self, type_id: u32, message: &dyn Message) -> Result<(), String>;

    /// Called once after a non-empty dispatch batch has fully drained.
    /// The original's `STK_DISPATCH_WAKEUP` slot.
    fn dispatch_wakeup(&mut self);

    /// One incremental garbage-collection step, run when the queue goes
    /// empty — `worker_dispatch`'s `lua_gc(L, LUA_GCSTEP, ...)` call.
    fn gc_step(&mut self);

    /// Resolve a message-bus error code (a raw errno or one of the
    /// `EX_*` semantic codes) to a human string for the script side to
    /// consume as part of a callback's arguments — the original's
    /// `STK_ERROR_TABLE` slot, which caches `strerror`/semantic-code
    /// strings the first time each code is seen.
    fn error_string(&mut self, code: i32) -> &str;
}

/// A registered handler: given the live `ScriptContext` and a message,
/// dispatch it. Stored boxed since handlers close over registration
/// state the embedding application supplied at registration time.
pub type Callback = Box<dyn Fn(&mut dyn ScriptContext, &dyn Message) -> Result<(), String> + Send + Sync>;

/// Dense `type_id -> Callback` table. A `type_id` with no registered
/// handler logs and drops the message rather than erroring — matching
/// `worker.c::callback`'s behavior for an unregistered type.
pub struct CallbackRegistry {
    callbacks: Vec<Option<Callback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn register(&mut self, type_id: u32, callback: Callback) {
        let idx = type_id as usize;
        if idx >= self.callbacks.len() {
            self.callbacks.resize_with(idx + 1, || None);
        }
        self.callbacks[idx] = Some(callback);
    }

    pub fn unregister(&mut self, type_id: u32) {
        if let Some(slot) = self.callbacks.get_mut(type_id as usize) {
            *slot = None;
        }
    }

    pub fn get(&self, type_id: u32) -> Option<&Callback> {
        self.callbacks.get(type_id as usize).and_then(|c| c.as_ref())
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A trivial `ScriptContext` used by this crate's own tests — records
/// every call it receives instead of driving a real interpreter.
#[cfg(test)]
pub(crate) struct RecordingContext {
    pub calls: Vec<u32>,
    pub wakeups: u32,
    pub gc_steps: u32,
}

#[cfg(test)]
impl RecordingContext {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            wakeups: 0,
            gc_steps: 0,
        }
    }
}

#[cfg(test)]
impl ScriptContext for RecordingContext {
    fn call(&mut self, type_id: u32, _message: &dyn Message) -> Result<(), String> {
        self.calls.push(type_id);
        Ok(())
    }

    fn dispatch_wakeup(&mut self) {
        self.wakeups += 1;
    }

    fn gc_step(&mut self) {
        self.gc_steps += 1;
    }

    fn error_string(&mut self, _code: i32) -> &str {
        "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{TimerExpire, TIMER_EXPIRE};

    #[test]
    fn unregistered_type_is_none() {
        let registry = CallbackRegistry::new();
        assert!(registry.get(TIMER_EXPIRE).is_none());
    }

    #[test]
    fn register_then_call() {
        let mut registry = CallbackRegistry::new();
        registry.register(
            TIMER_EXPIRE,
            Box::new(|ctx: &mut dyn ScriptContext, msg: &dyn Message| ctx.call(TIMER_EXPIRE, msg)),
        );

        let mut ctx = RecordingContext::new();
        let msg = TimerExpire { session: 42 };
        let callback = registry.get(TIMER_EXPIRE).unwrap();
        callback(&mut ctx, &msg).unwrap();
        assert_eq!(ctx.calls, vec![TIMER_EXPIRE]);
    }

    #[test]
    fn unregister_clears_slot() {
        let mut registry = CallbackRegistry::new();
        registry.register(TIMER_EXPIRE, Box::new(|ctx, msg| ctx.call(TIMER_EXPIRE, msg)));
        assert!(registry.get(TIMER_EXPIRE).is_some());
        registry.unregister(TIMER_EXPIRE);
        assert!(registry.get(TIMER_EXPIRE).is_none());
    }
}
