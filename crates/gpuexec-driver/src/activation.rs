//! Per-thread tracking of the current context.
//!
//! [`ScopedActivateContext`] makes a context current for the lifetime of the
//! guard and restores whatever was current before when it drops. Nested
//! activations of the same context do not touch the driver.

use std::cell::Cell;
use std::marker::PhantomData;

use tracing::{error, trace};

use gpuexec_core::handle::ContextHandle;

use crate::context::Context;
use crate::result::{self, CUDA_SUCCESS};

#[derive(Debug, Clone, Copy, Default)]
struct ActivationState {
    depth: u32,
    id: u64,
    context: ContextHandle,
}

thread_local! {
    static STATE: Cell<ActivationState> = const {
        Cell::new(ActivationState { depth: 0, id: 0, context: ContextHandle::null() })
    };
}

/// ID of the context this thread activated most recently, 0 if none.
pub fn current_context_id() -> u64 {
    STATE.with(|s| s.get().id)
}

/// Nesting depth of live activation guards on this thread.
pub fn activation_depth() -> u32 {
    STATE.with(|s| s.get().depth)
}

/// Log and terminate. Continuing after the current context went out of sync
/// would run later driver calls against the wrong context.
#[cold]
pub(crate) fn fatal(message: &str) -> ! {
    error!("fatal: {}", message);
    std::process::abort()
}

/// Guard that keeps a context current on this thread.
///
/// Guards must be dropped in reverse order of creation and cannot leave the
/// thread that created them.
#[must_use = "the context is only current while the guard is alive"]
pub struct ScopedActivateContext<'a> {
    context: &'a Context,
    to_restore: Option<(u64, ContextHandle)>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ScopedActivateContext<'a> {
    pub fn new(context: &'a Context) -> Self {
        let driver = context.driver();
        let mut state = STATE.with(|s| s.get());

        if context.sync_around_driver_calls() {
            // At depth 0 the tracked state is empty, so ask the driver.
            let current = if state.depth > 0 {
                state.context
            } else {
                match driver.ctx_get_current() {
                    Ok(current) => current,
                    Err(res) => fatal(&format!(
                        "failed to query current context: {}",
                        result::to_string(res)
                    )),
                }
            };
            if !current.is_null() {
                let res = driver.ctx_synchronize();
                if res != CUDA_SUCCESS {
                    fatal(&format!(
                        "failed to synchronize context {} before activation: {}",
                        current,
                        result::to_string(res)
                    ));
                }
            }
        }

        if state.depth == 0 {
            trace!("activating context {} (id {})", context.handle(), context.id());
            set_current(context, context.handle());
            STATE.with(|s| {
                s.set(ActivationState {
                    depth: 1,
                    id: context.id(),
                    context: context.handle(),
                })
            });
            return Self {
                context,
                to_restore: None,
                _not_send: PhantomData,
            };
        }

        state.depth += 1;
        if state.id == context.id() {
            if cfg!(debug_assertions) {
                match driver.ctx_get_current() {
                    Ok(current) if current == context.handle() => {}
                    Ok(current) => fatal(&format!(
                        "current context {} does not match tracked context {} (id {})",
                        current,
                        context.handle(),
                        context.id()
                    )),
                    Err(res) => fatal(&format!(
                        "failed to query current context: {}",
                        result::to_string(res)
                    )),
                }
            }
            STATE.with(|s| s.set(state));
            return Self {
                context,
                to_restore: None,
                _not_send: PhantomData,
            };
        }

        trace!(
            "switching context {} (id {}) -> {} (id {})",
            state.context,
            state.id,
            context.handle(),
            context.id()
        );
        let to_restore = Some((state.id, state.context));
        set_current(context, context.handle());
        state.id = context.id();
        state.context = context.handle();
        STATE.with(|s| s.set(state));

        Self {
            context,
            to_restore,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedActivateContext<'_> {
    fn drop(&mut self) {
        let driver = self.context.driver();
        let mut state = STATE.with(|s| s.get());

        if self.context.sync_around_driver_calls() {
            let res = driver.ctx_synchronize();
            if res != CUDA_SUCCESS {
                fatal(&format!(
                    "failed to synchronize context {} on deactivation: {}",
                    state.context,
                    result::to_string(res)
                ));
            }
        }

        if state.depth == 0 {
            fatal("context activation depth went negative");
        }
        state.depth -= 1;

        if let Some((id, handle)) = self.to_restore {
            trace!("restoring context {} (id {})", handle, id);
            set_current(self.context, handle);
            state.id = id;
            state.context = handle;
        }
        STATE.with(|s| s.set(state));
    }
}

fn set_current(context: &Context, handle: ContextHandle) {
    let res = context.driver().ctx_set_current(handle);
    if res != CUDA_SUCCESS {
        fatal(&format!(
            "failed setting context {}: {}",
            handle,
            result::to_string(res)
        ));
    }
}
