use tracing::error;

use gpuexec_core::handle::{EventHandle, StreamHandle};
use gpuexec_core::{DriverError, Result};

use crate::activation::ScopedActivateContext;
use crate::context::Context;
use crate::driver::EventFlags;
use crate::gpu_driver::GpuDriver;
use crate::result::{
    self, check, status_from_result, CuResultExt, CUDA_ERROR_NOT_READY, CUDA_ERROR_OUT_OF_MEMORY,
    CUDA_SUCCESS,
};

/// Whether the work preceding an event has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Complete,
    Pending,
}

impl GpuDriver {
    pub fn init_event(&self, context: &Context, flags: EventFlags) -> Result<EventHandle> {
        let _activation = ScopedActivateContext::new(context);
        match self.driver().event_create(flags.to_bits()) {
            Ok(event) => Ok(event),
            Err(CUDA_ERROR_OUT_OF_MEMORY) => Err(DriverError::ResourceExhausted(
                "could not create CUDA event: out of device memory".to_string(),
            )),
            Err(res) => Err(DriverError::FailedPrecondition(format!(
                "could not create CUDA event: {}",
                result::to_string(res)
            ))),
        }
    }

    /// Rejects the null event without calling the driver.
    pub fn destroy_event(&self, context: &Context, event: EventHandle) -> Result<()> {
        if event.is_null() {
            return Err(DriverError::InvalidArgument(
                "input event cannot be null".to_string(),
            ));
        }

        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().event_destroy(event),
            format!("error destroying CUDA event in context {}", context.handle()),
        )
    }

    pub fn record_event(&self, context: &Context, event: EventHandle, stream: StreamHandle) -> Result<()> {
        let _activation = ScopedActivateContext::new(context);
        check(
            self.driver().event_record(event, stream),
            format!("error recording CUDA event on stream {}", stream),
        )
    }

    pub fn query_event(&self, context: &Context, event: EventHandle) -> Result<EventStatus> {
        let _activation = ScopedActivateContext::new(context);
        match self.driver().event_query(event) {
            CUDA_SUCCESS => Ok(EventStatus::Complete),
            CUDA_ERROR_NOT_READY => Ok(EventStatus::Pending),
            res => Err(DriverError::Internal(format!(
                "failed to query event: {}",
                result::to_string(res)
            ))),
        }
    }

    /// Milliseconds between `start` and `stop`. Waits for `stop` first.
    pub fn event_elapsed_time(&self, context: &Context, start: EventHandle, stop: EventHandle) -> Result<f32> {
        let _activation = ScopedActivateContext::new(context);
        let driver = self.driver();

        let res = driver.event_synchronize(stop);
        if res != CUDA_SUCCESS {
            error!(
                "failed to synchronize the stop event: {}",
                result::to_string(res)
            );
            return Err(status_from_result(res, "failed to synchronize the stop event"));
        }

        driver
            .event_elapsed_time(start, stop)
            .or_status("failed to get elapsed time between events")
            .inspect_err(|e| error!("{}", e))
    }
}
