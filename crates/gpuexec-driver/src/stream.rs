use tracing::{debug, error};

use gpuexec_core::handle::{EventHandle, GraphHandle, StreamHandle};
use gpuexec_core::Result;

use crate::activation::ScopedActivateContext;
use crate::context::Context;
use crate::driver::{CaptureMode, HostCallback, CU_STREAM_NON_BLOCKING};
use crate::gpu_driver::GpuDriver;
use crate::result::{self, check, status_from_result, CuResultExt, CUDA_ERROR_NOT_READY, CUDA_SUCCESS};

/// Requested scheduling priority of a new stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamPriority {
    #[default]
    Default,
    Lowest,
    Highest,
}

impl GpuDriver {
    /// Native priority value for `priority` in `context`.
    ///
    /// Falls back to 0 when the context cannot report its priority range.
    pub fn stream_priority(&self, context: &Context, priority: StreamPriority) -> i32 {
        if priority == StreamPriority::Default {
            return 0;
        }
        let _activation = ScopedActivateContext::new(context);
        match self.driver().ctx_get_stream_priority_range() {
            Ok((least, greatest)) => match priority {
                StreamPriority::Highest => greatest,
                _ => least,
            },
            Err(res) => {
                error!(
                    "could not query stream priority range: {}",
                    result::to_string(res)
                );
                0
            }
        }
    }

    /// Create a non-blocking stream. Priority 0 means the driver default.
    pub fn create_stream(&self, context: &Context, priority: i32) -> Result<StreamHandle> {
        let _activation = ScopedActivateContext::new(context);
        let driver = self.driver();
        let stream = if priority == 0 {
            driver.stream_create(CU_STREAM_NON_BLOCKING)
        } else {
            driver.stream_create_with_priority(CU_STREAM_NON_BLOCKING, priority)
        }
        .or_status(format!(
            "could not allocate stream for context {}",
            context.handle()
        ))?;

        debug!(
            "successfully created stream {} for context {}",
            stream,
            context.handle()
        );
        Ok(stream)
    }

    /// Destroying the null stream is a no-op.
    pub fn destroy_stream(&self, context: &Context, stream: StreamHandle) -> Result<()> {
        if stream.is_null() {
            return Ok(());
        }
        let _activation = ScopedActivateContext::new(context);
        let res = self.driver().stream_destroy(stream);
        if res != CUDA_SUCCESS {
            error!(
                "failed to destroy stream {}; leaking: {}",
                stream,
                result::to_string(res)
            );
            return Err(status_from_result(res, format!("failed to destroy stream {}", stream)));
        }
        debug!("successfully destroyed stream {} for context {}", stream, context.handle());
        Ok(())
    }

    pub fn synchronize_stream(&self, context: &Context, stream: StreamHandle) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().stream_synchronize(stream),
            format!("could not synchronize stream {}", stream),
        )
        .inspect_err(|e| error!("{}", e))
    }

    /// `true` when all work queued on `stream` has completed.
    pub fn is_stream_idle(&self, context: &Context, stream: StreamHandle) -> Result<bool> {
        let _activation = ScopedActivateContext::new(context);
        match self.driver().stream_query(stream) {
            CUDA_SUCCESS => Ok(true),
            CUDA_ERROR_NOT_READY => Ok(false),
            res => Err(status_from_result(res, format!("stream in bad state on status query {}", stream))),
        }
    }

    /// Make `stream` wait until `event` has been reached.
    pub fn wait_stream_on_event(&self, context: &Context, stream: StreamHandle, event: EventHandle) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().stream_wait_event(stream, event, 0),
            format!("could not wait stream {} on event {}", stream, event),
        )
    }

    /// Run `callback` on a driver thread once prior work on `stream` is done.
    pub fn add_stream_callback<F>(&self, context: &Context, stream: StreamHandle, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let _activation = ScopedActivateContext::new(context);
        let callback: HostCallback = Box::new(callback);
        check(
            self.driver().launch_host_func(stream, callback),
            format!("unable to add host callback to stream {}", stream),
        )
    }

    pub fn stream_begin_capture(&self, context: &Context, stream: StreamHandle, mode: CaptureMode) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        debug!("beginning stream {} capture in {} mode", stream, mode.as_str());
        check(
            self.driver().stream_begin_capture(stream, mode),
            format!("failed to begin stream capture on stream {}", stream),
        )
    }

    /// Finish capturing and return the recorded graph.
    pub fn stream_end_capture(&self, context: &Context, stream: StreamHandle) -> Result<GraphHandle> {
        let _activation = ScopedActivateContext::new(context);
        let graph = self
            .driver()
            .stream_end_capture(stream)
            .or_status(format!("failed to end stream capture on stream {}", stream))?;
        debug!("ended stream {} capture into graph {}", stream, graph);
        Ok(graph)
    }

    pub fn stream_is_capturing(&self, context: &Context, stream: StreamHandle) -> Result<bool> {
        let _activation = ScopedActivateContext::new(context);
        self.driver()
            .stream_is_capturing(stream)
            .or_status(format!("failed to get stream {} capture status", stream))
    }
}
